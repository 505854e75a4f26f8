//! Wire protocol between annotation clients and the server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message:
//! ```text
//! client ──► Login{username,password}
//!        ◄── LoginAccepted | LoginRejected
//! client ──► Request{id, ListDocuments | JoinDocument | ListMembers |
//!                        Ping | NewItem | DeleteItem}
//!        ◄── Reply{id, ...}
//!        ◄── ItemAdded | ItemDeleted | UserList     (pushed at any time)
//! ```
//!
//! Replies are correlated with requests by [`RequestId`]; pushed
//! notifications carry the [`SessionId`] they belong to.

use std::fmt;

use scrawl_core::{Item, Point};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Correlates a [`Reply`] with the [`Request`] that caused it.
pub type RequestId = u64;

/// Opaque handle for a joined document session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Remote calls a client may make once logged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    ListDocuments,
    JoinDocument { name: String },
    ListMembers { session: SessionId },
    Ping,
    NewItem { session: SessionId, page: usize, item: Item },
    DeleteItem { session: SessionId, page: usize, coords: Vec<Point> },
}

impl Request {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::ListDocuments => "list_documents",
            Request::JoinDocument { .. } => "join_document",
            Request::ListMembers { .. } => "list_members",
            Request::Ping => "ping",
            Request::NewItem { .. } => "new_item",
            Request::DeleteItem { .. } => "delete_item",
        }
    }
}

/// Result of a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Documents(Vec<String>),
    Joined { session: SessionId, name: String },
    Members(Vec<String>),
    Pong(bool),
    /// Completion of a fire-and-forget call.
    Done,
    Failure(String),
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Must be the first frame on a connection.
    Login { username: String, password: String },
    Request { id: RequestId, request: Request },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    LoginAccepted,
    LoginRejected { reason: String },
    Reply { id: RequestId, reply: Reply },
    ItemAdded { session: SessionId, page: usize, item: Item },
    ItemDeleted { session: SessionId, page: usize, coords: Vec<Point> },
    UserList { session: SessionId, names: Vec<String> },
}

impl ServerMessage {
    pub fn reply(id: RequestId, reply: Reply) -> Self {
        ServerMessage::Reply { id, reply }
    }

    pub fn failure(id: RequestId, reason: impl Into<String>) -> Self {
        ServerMessage::Reply {
            id,
            reply: Reply::Failure(reason.into()),
        }
    }
}

/// Encode a message with the standard bincode configuration.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decode a message produced by [`encode`].
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),
    #[error("Connection closed")]
    ConnectionClosed,
}
