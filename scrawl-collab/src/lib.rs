//! # scrawl-collab: shared annotation sessions over WebSocket
//!
//! Clients edit a local copy of a document and replicate every change to a
//! central server, which keeps the authoritative copy and relays it to the
//! other members.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌──────────────┐
//! │ ClientSession │ ◄────────────────► │  connection  │ (one task each)
//! │  (per user)   │   bincode frames   │     task     │
//! └──────┬────────┘                    └──────┬───────┘
//!        │ applies remote edits               │ HubCommand
//!        ▼                                    ▼
//! ┌───────────────┐                    ┌──────────────┐   autosave   ┌─────────┐
//! │ SharedDocument│                    │     Hub      │ ───────────► │ storage │
//! │   (local)     │                    │ sessions and │              │ doc-*.json
//! └───────────────┘                    │   avatars    │              └─────────┘
//!                                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: the closed set of messages and their binary encoding
//! - [`auth`]: username/password checks at login
//! - [`avatar`]: server-side user identities and their outboxes
//! - [`session`]: one shared document and its members
//! - [`store`]: the session registry and save passes
//! - [`hub`]: the task that owns all server state
//! - [`server`]: listener and per-connection tasks
//! - [`client`]: connection state machine for the UI side
//! - [`storage`]: document files, the directory lock and legacy migration

pub mod auth;
pub mod avatar;
pub mod client;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;

pub use auth::{AllowAnyone, Authenticator, CredentialTable};
pub use avatar::{Avatar, AvatarId, Avatars};
pub use client::{
    ClientConfig, ClientError, ClientSession, ConnectionState, DocumentHandle, SyncEvent,
};
pub use hub::{Hub, HubCommand};
pub use protocol::{
    ClientMessage, ProtocolError, Reply, Request, RequestId, ServerMessage, SessionId,
};
pub use server::{ServerConfig, ServerError, SyncServer, DEFAULT_AUTOSAVE_INTERVAL, DEFAULT_PORT};
pub use session::{DocumentSession, EditError, MAX_PAGES};
pub use storage::{
    migrate_legacy, MigrationReport, Persistence, PersistenceError, StorageConfig,
};
pub use store::{SaveReport, SessionError, SessionStore};
