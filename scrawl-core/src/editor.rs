//! Local editing facade.
//!
//! Every user edit is applied to the local document first, then registered
//! in the history, then replicated. Remote edits never pass through here.

use std::sync::Arc;

use crate::document::{self, Document, DocumentError, SharedDocument};
use crate::history::{Command, History, HistorySignal};
use crate::item::{Item, Point};
use crate::replicate::Replicator;

pub struct Editor {
    document: SharedDocument,
    history: History,
    replicator: Arc<dyn Replicator>,
}

impl Editor {
    pub fn new(document: SharedDocument, replicator: Arc<dyn Replicator>) -> Self {
        Self {
            document,
            history: History::new(),
            replicator,
        }
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Draw an item on a page.
    pub fn draw(&mut self, page: usize, item: Item) -> Result<(), DocumentError> {
        document::write(&self.document).add_item(page, item.clone())?;
        self.replicator.send_new_item(page, &item);
        self.history.register(Command::Draw { page, item });
        Ok(())
    }

    /// Erase the first item on `page` whose geometry is `coords`.
    ///
    /// Returns the erased item; erasing nothing is not an edit.
    pub fn erase(&mut self, page: usize, coords: &[Point]) -> Option<Item> {
        let item = document::write(&self.document).remove_item_with_coords(page, coords)?;
        self.replicator.send_delete_item(page, coords);
        self.history.register(Command::Delete {
            page,
            item: item.clone(),
        });
        Some(item)
    }

    pub fn undo(&mut self) -> Option<Command> {
        let mut doc = document::write(&self.document);
        self.history.undo(&mut doc, self.replicator.as_ref())
    }

    pub fn redo(&mut self) -> Option<Command> {
        let mut doc = document::write(&self.document);
        self.history.redo(&mut doc, self.replicator.as_ref())
    }

    /// Remove every item locally and reset history. Not replicated.
    pub fn clear(&mut self) {
        document::write(&self.document).clear_pages();
        self.history.clear();
    }

    /// Swap in a freshly opened document and reset history.
    pub fn replace_document(&mut self, replacement: Document) {
        *document::write(&self.document) = replacement;
        self.history.clear();
    }

    /// Forget undo and redo after the document was changed underneath the
    /// editor, such as when a shared session replaces the local copy.
    pub fn reset_history(&mut self) {
        self.history.clear();
    }

    pub fn drain_signals(&mut self) -> Vec<HistorySignal> {
        self.history.drain_signals()
    }
}
