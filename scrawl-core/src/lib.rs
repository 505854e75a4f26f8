//! # scrawl-core: annotation model for shared PDF markup
//!
//! Owns everything a client needs to edit a document offline:
//!
//! ```text
//! ┌──────────┐  draw/erase   ┌──────────┐   send_*    ┌────────────┐
//! │  Editor  │ ────────────► │ Document │             │ Replicator │
//! │          │ ──register──► │  History │ ──replay──► │ (network)  │
//! └──────────┘               └──────────┘             └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`item`]: strokes and shapes, keyed by their geometry
//! - [`document`]: pages and the local document
//! - [`history`]: bounded undo/redo
//! - [`editor`]: the facade UI code drives
//! - [`replicate`]: the seam to the network layer
//! - [`format`]: versioned on-disk encoding of a page list

pub mod document;
pub mod editor;
pub mod format;
pub mod history;
pub mod item;
pub mod replicate;

pub use document::{Document, DocumentError, Page, SharedDocument};
pub use editor::Editor;
pub use format::{FormatError, FORMAT_VERSION};
pub use history::{Command, History, HistorySignal, UNDO_LIMIT};
pub use item::{Color, Item, ItemKind, Point};
pub use replicate::{NoReplication, RecordingReplicator, Replicated, Replicator};
