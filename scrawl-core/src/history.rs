//! Bounded undo/redo over local edits.
//!
//! ```text
//!  user edit ──► register() ──► undo stack (max 20, oldest evicted)
//!                                   │ undo()            ▲
//!                                   ▼                   │ redo()
//!                               redo stack (unbounded) ─┘
//! ```
//!
//! Replaying a command in either direction is replicated to the network
//! exactly like a fresh edit, but never registered again.

use std::collections::VecDeque;

use crate::document::Document;
use crate::item::Item;
use crate::replicate::Replicator;

/// Maximum depth of the undo stack.
pub const UNDO_LIMIT: usize = 20;

/// A reversible local edit.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// An item was drawn on a page.
    Draw { page: usize, item: Item },
    /// An item was erased from a page.
    Delete { page: usize, item: Item },
}

impl Command {
    /// Apply the edit this command describes.
    fn forward(&self, doc: &mut Document, replicator: &dyn Replicator) {
        match self {
            Command::Draw { page, item } => insert(doc, replicator, *page, item),
            Command::Delete { page, item } => erase(doc, replicator, *page, item),
        }
    }

    /// Apply the inverse of the edit this command describes.
    fn inverse(&self, doc: &mut Document, replicator: &dyn Replicator) {
        match self {
            Command::Draw { page, item } => erase(doc, replicator, *page, item),
            Command::Delete { page, item } => insert(doc, replicator, *page, item),
        }
    }
}

fn insert(doc: &mut Document, replicator: &dyn Replicator, page: usize, item: &Item) {
    match doc.add_item(page, item.clone()) {
        Ok(()) => replicator.send_new_item(page, item),
        Err(e) => log::warn!("Skipping history replay: {e}"),
    }
}

fn erase(doc: &mut Document, replicator: &dyn Replicator, page: usize, item: &Item) {
    if doc.remove_item_with_coords(page, &item.coords).is_none() {
        log::debug!("History replay found no item to erase on page {page}");
    }
    replicator.send_delete_item(page, &item.coords);
}

/// Availability changes for the UI's undo/redo controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySignal {
    UndoAvailable(bool),
    RedoAvailable(bool),
}

#[derive(Debug, Default)]
pub struct History {
    undo: VecDeque<Command>,
    redo: Vec<Command>,
    signals: Vec<HistorySignal>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a user edit that has already been applied.
    ///
    /// Clears the redo stack.
    pub fn register(&mut self, command: Command) {
        self.push_undo(command);
        if !self.redo.is_empty() {
            self.redo.clear();
            self.signals.push(HistorySignal::RedoAvailable(false));
        }
    }

    /// Revert the most recent command. Returns it, or `None` if there was
    /// nothing to undo.
    pub fn undo(&mut self, doc: &mut Document, replicator: &dyn Replicator) -> Option<Command> {
        let command = self.undo.pop_back()?;
        command.inverse(doc, replicator);
        if self.undo.is_empty() {
            self.signals.push(HistorySignal::UndoAvailable(false));
        }
        self.redo.push(command.clone());
        if self.redo.len() == 1 {
            self.signals.push(HistorySignal::RedoAvailable(true));
        }
        Some(command)
    }

    /// Re-apply the most recently undone command.
    pub fn redo(&mut self, doc: &mut Document, replicator: &dyn Replicator) -> Option<Command> {
        let command = self.redo.pop()?;
        command.forward(doc, replicator);
        if self.redo.is_empty() {
            self.signals.push(HistorySignal::RedoAvailable(false));
        }
        self.push_undo(command.clone());
        Some(command)
    }

    /// Forget everything, e.g. when another document is loaded.
    pub fn clear(&mut self) {
        if !self.undo.is_empty() {
            self.undo.clear();
            self.signals.push(HistorySignal::UndoAvailable(false));
        }
        if !self.redo.is_empty() {
            self.redo.clear();
            self.signals.push(HistorySignal::RedoAvailable(false));
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    /// Consume the availability changes since the last call.
    pub fn drain_signals(&mut self) -> Vec<HistorySignal> {
        std::mem::take(&mut self.signals)
    }

    fn push_undo(&mut self, command: Command) {
        self.undo.push_back(command);
        if self.undo.len() > UNDO_LIMIT {
            self.undo.pop_front();
        }
        if self.undo.len() == 1 {
            self.signals.push(HistorySignal::UndoAvailable(true));
        }
    }
}
