//! Local document model: a fixed list of pages, each an ordered item list.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::{Item, Point};

#[derive(Debug, Error, PartialEq)]
pub enum DocumentError {
    #[error("page {page} out of range (document has {pages} pages)")]
    PageOutOfRange { page: usize, pages: usize },
}

/// One page's annotations, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Item>,
}

impl Page {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: Item) {
        self.items.push(item);
    }

    /// Remove the first item whose geometry equals `coords`.
    pub fn remove_with_coords(&mut self, coords: &[Point]) -> Option<Item> {
        let idx = self.items.iter().position(|item| item.matches(coords))?;
        Some(self.items.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A document as seen by one client.
///
/// The page count is fixed by the underlying page source when the document
/// is opened; annotations never grow it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub pages: Vec<Page>,
}

impl Document {
    /// Create a document with `count` empty pages.
    pub fn with_pages(count: usize) -> Self {
        Self {
            pages: vec![Page::new(); count],
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, page: usize) -> Option<&Page> {
        self.pages.get(page)
    }

    /// Append an item to a page.
    pub fn add_item(&mut self, page: usize, item: Item) -> Result<(), DocumentError> {
        let pages = self.pages.len();
        let target = self
            .pages
            .get_mut(page)
            .ok_or(DocumentError::PageOutOfRange { page, pages })?;
        target.push(item);
        Ok(())
    }

    /// Remove the first item on `page` matching `coords`.
    ///
    /// Returns `None` when nothing matches or the page does not exist.
    pub fn remove_item_with_coords(&mut self, page: usize, coords: &[Point]) -> Option<Item> {
        self.pages.get_mut(page)?.remove_with_coords(coords)
    }

    /// Remove every item, keeping the pages.
    pub fn clear_pages(&mut self) {
        for page in &mut self.pages {
            page.items.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(Page::is_empty)
    }

    pub fn item_count(&self) -> usize {
        self.pages.iter().map(Page::len).sum()
    }
}

/// A document shared between the editor and the network session.
pub type SharedDocument = Arc<RwLock<Document>>;

/// Wrap a document for sharing.
pub fn shared(document: Document) -> SharedDocument {
    Arc::new(RwLock::new(document))
}

/// Lock a shared document for reading, recovering from poisoning.
pub fn read(document: &SharedDocument) -> RwLockReadGuard<'_, Document> {
    document.read().unwrap_or_else(PoisonError::into_inner)
}

/// Lock a shared document for writing, recovering from poisoning.
pub fn write(document: &SharedDocument) -> RwLockWriteGuard<'_, Document> {
    document.write().unwrap_or_else(PoisonError::into_inner)
}
