//! Authoritative state of one shared document.
//!
//! ```text
//!            add_member ──► replay every item to the joiner
//!                      └──► user_list to all members
//!  new_item(from) ──► pages[page].push ──► item_added to members except `from`
//!  delete(from)   ──► first geometry match removed ──► item_deleted to others
//! ```
//!
//! Membership is kept on both sides: the session lists avatar IDs and each
//! avatar lists the sessions it joined. Both are updated together here.

use scrawl_core::{Item, Page, Point};
use thiserror::Error;

use crate::avatar::{AvatarId, Avatars};
use crate::protocol::{ServerMessage, SessionId};

/// Highest page count a document may grow to.
pub const MAX_PAGES: usize = 10_000;

/// An edit the session refuses to apply.
#[derive(Debug, Error, PartialEq)]
pub enum EditError {
    #[error("page {page} is beyond the limit of {MAX_PAGES} pages")]
    PageLimit { page: usize },
    #[error("coordinates and width must be finite numbers")]
    NonFinite,
}

#[derive(Debug)]
pub struct DocumentSession {
    id: SessionId,
    name: String,
    pages: Vec<Page>,
    members: Vec<AvatarId>,
    dirty: bool,
}

impl DocumentSession {
    /// A new, empty document.
    pub fn new(id: SessionId, name: impl Into<String>) -> Self {
        Self::with_pages(id, name, Vec::new())
    }

    /// A document restored from storage.
    pub fn with_pages(id: SessionId, name: impl Into<String>, pages: Vec<Page>) -> Self {
        Self {
            id,
            name: name.into(),
            pages,
            members: Vec::new(),
            dirty: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn members(&self) -> &[AvatarId] {
        &self.members
    }

    pub fn is_member(&self, avatar: AvatarId) -> bool {
        self.members.contains(&avatar)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn item_count(&self) -> usize {
        self.pages.iter().map(Page::len).sum()
    }

    /// Add `who`, replay the document to them and announce the new member list.
    ///
    /// Joining twice keeps a single membership and replays nothing.
    pub fn add_member(&mut self, who: AvatarId, avatars: &mut Avatars) {
        if self.is_member(who) {
            return;
        }
        let Some(avatar) = avatars.get_mut(who) else {
            log::warn!("Unknown avatar {who} tried to join {}", self.name);
            return;
        };
        avatar.joined.insert(self.id);
        self.members.push(who);

        for (page, items) in self.pages.iter().enumerate() {
            for item in &items.items {
                avatar.send(ServerMessage::ItemAdded {
                    session: self.id,
                    page,
                    item: item.clone(),
                });
            }
        }
        log::info!(
            "{} joined {:?} ({} items replayed)",
            avatar.name(),
            self.name,
            self.item_count()
        );
        self.broadcast_user_list(avatars);
    }

    /// Remove `who` and announce the remaining members.
    pub fn remove_member(&mut self, who: AvatarId, avatars: &mut Avatars) {
        let Some(pos) = self.members.iter().position(|m| *m == who) else {
            return;
        };
        self.members.remove(pos);
        if let Some(avatar) = avatars.get_mut(who) {
            avatar.joined.remove(&self.id);
        }
        self.broadcast_user_list(avatars);
    }

    /// Append `item` to `page`, growing the page list as needed.
    ///
    /// Refused before anything changes when the page is past [`MAX_PAGES`]
    /// or the item has non-finite numbers, which could not be saved.
    pub fn apply_new_item(
        &mut self,
        from: AvatarId,
        page: usize,
        item: Item,
        avatars: &Avatars,
    ) -> Result<(), EditError> {
        if page >= MAX_PAGES {
            return Err(EditError::PageLimit { page });
        }
        if !item.is_finite() {
            return Err(EditError::NonFinite);
        }
        if self.pages.len() <= page {
            self.pages.resize_with(page + 1, Page::new);
        }
        self.pages[page].push(item.clone());
        self.dirty = true;
        avatars.broadcast(
            &self.members,
            &ServerMessage::ItemAdded {
                session: self.id,
                page,
                item,
            },
            Some(from),
        );
        Ok(())
    }

    /// Remove the first item on `page` whose geometry is `coords`.
    ///
    /// Returns whether something was removed; nothing is sent otherwise.
    pub fn apply_delete_item(
        &mut self,
        from: AvatarId,
        page: usize,
        coords: Vec<Point>,
        avatars: &Avatars,
    ) -> Result<bool, EditError> {
        if !coords.iter().all(Point::is_finite) {
            return Err(EditError::NonFinite);
        }
        let removed = self
            .pages
            .get_mut(page)
            .and_then(|p| p.remove_with_coords(&coords))
            .is_some();
        if !removed {
            log::debug!("Delete on {:?} page {page} matched nothing", self.name);
            return Ok(false);
        }
        self.dirty = true;
        avatars.broadcast(
            &self.members,
            &ServerMessage::ItemDeleted {
                session: self.id,
                page,
                coords,
            },
            Some(from),
        );
        Ok(true)
    }

    /// Member display names in join order.
    pub fn list_members(&self, avatars: &Avatars) -> Vec<String> {
        avatars.names(&self.members)
    }

    fn broadcast_user_list(&self, avatars: &Avatars) {
        let msg = ServerMessage::UserList {
            session: self.id,
            names: self.list_members(avatars),
        };
        avatars.broadcast(&self.members, &msg, None);
    }
}
