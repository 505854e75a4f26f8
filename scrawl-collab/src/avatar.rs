//! Server-side principals, one per authenticated connection.
//!
//! An avatar outlives nothing: it is created on login and dropped when its
//! connection goes away. While detached it silently discards messages.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ServerMessage, SessionId};

/// Channel to one connection's writer task.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AvatarId(Uuid);

impl AvatarId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AvatarId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AvatarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct Avatar {
    id: AvatarId,
    name: String,
    outbox: Option<Outbox>,
    /// Sessions this avatar is a member of; mirrors each session's member list.
    pub(crate) joined: BTreeSet<SessionId>,
}

impl Avatar {
    pub fn new(id: AvatarId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            outbox: None,
            joined: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> AvatarId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attach(&mut self, outbox: Outbox) {
        self.outbox = Some(outbox);
    }

    /// Drop the transport. Returns the sessions the avatar still has to leave.
    pub(crate) fn detach(&mut self) -> BTreeSet<SessionId> {
        self.outbox = None;
        std::mem::take(&mut self.joined)
    }

    pub fn is_attached(&self) -> bool {
        self.outbox.is_some()
    }

    pub fn joined(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.joined.iter().copied()
    }

    /// Queue a message for the client. Dropped while detached.
    pub fn send(&self, msg: ServerMessage) {
        match &self.outbox {
            Some(outbox) => {
                if outbox.send(msg).is_err() {
                    log::debug!("Avatar {} ({}) outbox closed", self.name, self.id);
                }
            }
            None => log::trace!("Dropping message for detached avatar {}", self.id),
        }
    }

    pub fn ping(&self) -> bool {
        true
    }
}

/// All avatars known to the server.
#[derive(Debug, Default)]
pub struct Avatars {
    by_id: HashMap<AvatarId, Avatar>,
}

impl Avatars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, avatar: Avatar) {
        self.by_id.insert(avatar.id(), avatar);
    }

    pub fn remove(&mut self, id: AvatarId) -> Option<Avatar> {
        self.by_id.remove(&id)
    }

    pub fn get(&self, id: AvatarId) -> Option<&Avatar> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: AvatarId) -> Option<&mut Avatar> {
        self.by_id.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn send(&self, to: AvatarId, msg: ServerMessage) {
        if let Some(avatar) = self.by_id.get(&to) {
            avatar.send(msg);
        }
    }

    /// Send `msg` to each of `members`, skipping `without`.
    pub fn broadcast(&self, members: &[AvatarId], msg: &ServerMessage, without: Option<AvatarId>) {
        for id in members.iter().filter(|id| Some(**id) != without) {
            self.send(*id, msg.clone());
        }
    }

    /// Display names of `members`, in the given order.
    pub fn names(&self, members: &[AvatarId]) -> Vec<String> {
        members
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .map(|a| a.name.clone())
            .collect()
    }
}
