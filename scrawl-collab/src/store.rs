//! Registry of document sessions, optionally backed by storage.

use std::collections::HashMap;

use scrawl_core::Page;
use thiserror::Error;

use crate::protocol::SessionId;
use crate::session::DocumentSession;
use crate::storage::{Persistence, PersistenceError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot create document {name:?}: {source}")]
    Create {
        name: String,
        source: PersistenceError,
    },
    #[error("too many documents")]
    Exhausted,
}

/// Counts from one save pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub saved: usize,
    pub failed: usize,
}

/// Owns every session and, when persistence is on, the storage directory.
///
/// Sessions are never destroyed, so a [`SessionId`] stays valid for the
/// lifetime of the store.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Vec<DocumentSession>,
    by_name: HashMap<String, SessionId>,
    persistence: Option<Persistence>,
}

impl SessionStore {
    /// In-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by `persistence`, preloaded with everything it holds.
    pub fn with_persistence(persistence: Persistence) -> Result<Self, PersistenceError> {
        let documents = persistence.load_all()?;
        let mut store = Self {
            persistence: Some(persistence),
            ..Self::default()
        };
        for (name, pages) in documents {
            if store.insert(name, pages).is_none() {
                log::error!("Session table full; remaining documents were not loaded");
                break;
            }
        }
        Ok(store)
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    /// Look up `name`, creating an empty session if it does not exist.
    ///
    /// With persistence on, the empty document is written before the
    /// session is registered; if that fails nothing is registered.
    pub fn get_or_create(&mut self, name: &str) -> Result<SessionId, SessionError> {
        if let Some(id) = self.by_name.get(name) {
            return Ok(*id);
        }
        if let Some(persistence) = &self.persistence {
            persistence
                .save(name, &[])
                .map_err(|source| SessionError::Create {
                    name: name.to_string(),
                    source,
                })?;
        }
        let id = self
            .insert(name.to_string(), Vec::new())
            .ok_or(SessionError::Exhausted)?;
        log::info!("Created document {name:?} as {id}");
        Ok(id)
    }

    fn insert(&mut self, name: String, pages: Vec<Page>) -> Option<SessionId> {
        let id = SessionId(u32::try_from(self.sessions.len()).ok()?);
        self.sessions.push(DocumentSession::with_pages(id, name.clone(), pages));
        self.by_name.insert(name, id);
        Some(id)
    }

    pub fn get(&self, id: SessionId) -> Option<&DocumentSession> {
        self.sessions.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut DocumentSession> {
        self.sessions.get_mut(id.0 as usize)
    }

    pub fn find(&self, name: &str) -> Option<SessionId> {
        self.by_name.get(name).copied()
    }

    /// Document names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Write every dirty session. Failures are logged and stay dirty.
    pub fn save_dirty(&mut self) -> SaveReport {
        let mut report = SaveReport::default();
        let Some(persistence) = &self.persistence else {
            return report;
        };
        for session in self.sessions.iter_mut().filter(|s| s.is_dirty()) {
            match persistence.save(session.name(), session.pages()) {
                Ok(()) => {
                    session.mark_clean();
                    report.saved += 1;
                }
                Err(e) => {
                    log::error!("Failed to save {:?}: {e}", session.name());
                    report.failed += 1;
                }
            }
        }
        if report.saved > 0 || report.failed > 0 {
            log::debug!("Save pass: {} saved, {} failed", report.saved, report.failed);
        }
        report
    }

    /// Final save, then give up the storage directory.
    pub fn shutdown(&mut self) -> SaveReport {
        let report = self.save_dirty();
        if let Some(persistence) = self.persistence.take() {
            if let Err(e) = persistence.release() {
                log::error!("Failed to release storage lock: {e}");
            }
        }
        report
    }
}
