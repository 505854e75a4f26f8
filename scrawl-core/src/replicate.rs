//! The seam between local editing and the network.

use std::sync::Mutex;

use crate::item::{Item, Point};

/// Forwards local edits to collaborators.
///
/// Implementations must not block; sends are fire-and-forget.
pub trait Replicator: Send + Sync {
    fn send_new_item(&self, page: usize, item: &Item);

    fn send_delete_item(&self, page: usize, coords: &[Point]);
}

/// Offline editing: nothing leaves the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReplication;

impl Replicator for NoReplication {
    fn send_new_item(&self, _page: usize, _item: &Item) {}

    fn send_delete_item(&self, _page: usize, _coords: &[Point]) {}
}

/// A replicated operation, as recorded by [`RecordingReplicator`].
#[derive(Debug, Clone, PartialEq)]
pub enum Replicated {
    NewItem { page: usize, item: Item },
    DeleteItem { page: usize, coords: Vec<Point> },
}

/// Keeps every outgoing operation in memory. Used by tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingReplicator {
    sent: Mutex<Vec<Replicated>>,
}

impl RecordingReplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything sent so far.
    pub fn take(&self) -> Vec<Replicated> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn record(&self, op: Replicated) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(op);
    }
}

impl Replicator for RecordingReplicator {
    fn send_new_item(&self, page: usize, item: &Item) {
        self.record(Replicated::NewItem {
            page,
            item: item.clone(),
        });
    }

    fn send_delete_item(&self, page: usize, coords: &[Point]) {
        self.record(Replicated::DeleteItem {
            page,
            coords: coords.to_vec(),
        });
    }
}
