//! The server's single event loop.
//!
//! Connection tasks only move bytes. Everything that touches sessions,
//! avatars or storage happens here, one command at a time, which is what
//! keeps broadcasts for a session in the order the session accepted them.
//!
//! ```text
//! conn task ──┐                    ┌── SessionStore ── Persistence
//! conn task ──┼─► mpsc<HubCommand> ─► Hub
//! conn task ──┘        ▲           └── Avatars ──► per-connection Outbox
//!                      │
//!               autosave interval
//! ```

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::avatar::{Avatar, AvatarId, Avatars, Outbox};
use crate::protocol::{Reply, Request, RequestId, ServerMessage};
use crate::store::{SaveReport, SessionStore};

pub enum HubCommand {
    /// A connection finished logging in.
    Attach {
        avatar: AvatarId,
        name: String,
        outbox: Outbox,
    },
    /// A connection went away.
    Detach { avatar: AvatarId },
    Request {
        avatar: AvatarId,
        id: RequestId,
        request: Request,
    },
    /// Save everything, release storage and stop.
    Shutdown { done: oneshot::Sender<SaveReport> },
}

pub type HubTx = mpsc::UnboundedSender<HubCommand>;

pub struct Hub {
    store: SessionStore,
    avatars: Avatars,
}

impl Hub {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            avatars: Avatars::new(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn avatars(&self) -> &Avatars {
        &self.avatars
    }

    /// Handle one command. Breaks once `Shutdown` has saved everything.
    pub fn handle(&mut self, command: HubCommand) -> ControlFlow<()> {
        match command {
            HubCommand::Attach {
                avatar,
                name,
                outbox,
            } => self.attach(avatar, name, outbox),
            HubCommand::Detach { avatar } => self.detach(avatar),
            HubCommand::Request {
                avatar,
                id,
                request,
            } => self.handle_request(avatar, id, request),
            HubCommand::Shutdown { done } => {
                let report = self.store.shutdown();
                log::info!("Shutdown save: {} saved, {} failed", report.saved, report.failed);
                let _ = done.send(report);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn attach(&mut self, id: AvatarId, name: String, outbox: Outbox) {
        log::info!("Avatar {name} ({id}) attached");
        let mut avatar = Avatar::new(id, name);
        avatar.attach(outbox);
        self.avatars.insert(avatar);
    }

    /// Drop the avatar's transport and take it out of every session it joined.
    fn detach(&mut self, id: AvatarId) {
        let Some(avatar) = self.avatars.get_mut(id) else {
            return;
        };
        let joined = avatar.detach();
        for session in joined {
            if let Some(session) = self.store.get_mut(session) {
                session.remove_member(id, &mut self.avatars);
            }
        }
        if let Some(avatar) = self.avatars.remove(id) {
            log::info!("Avatar {} ({id}) detached", avatar.name());
        }
    }

    fn handle_request(&mut self, from: AvatarId, id: RequestId, request: Request) {
        log::trace!("{from} -> {}", request.name());
        let reply = match request {
            Request::ListDocuments => Reply::Documents(self.store.list_names()),

            Request::JoinDocument { name } => match self.store.get_or_create(&name) {
                Ok(session) => {
                    // The handle goes out before the replay so the client
                    // knows which session the replayed items belong to.
                    self.avatars
                        .send(from, ServerMessage::reply(id, Reply::Joined { session, name }));
                    if let Some(session) = self.store.get_mut(session) {
                        session.add_member(from, &mut self.avatars);
                    }
                    return;
                }
                Err(e) => {
                    log::warn!("Join failed: {e}");
                    Reply::Failure(e.to_string())
                }
            },

            Request::ListMembers { session } => match self.store.get(session) {
                Some(s) if s.is_member(from) => Reply::Members(s.list_members(&self.avatars)),
                _ => Reply::Failure("not a member".into()),
            },

            Request::Ping => Reply::Pong(self.avatars.get(from).is_some_and(|a| a.ping())),

            Request::NewItem {
                session,
                page,
                item,
            } => match self.store.get_mut(session) {
                Some(s) if s.is_member(from) => {
                    match s.apply_new_item(from, page, item, &self.avatars) {
                        Ok(()) => Reply::Done,
                        Err(e) => {
                            log::debug!("Refused new item from {from}: {e}");
                            Reply::Failure(e.to_string())
                        }
                    }
                }
                _ => Reply::Failure("not a member".into()),
            },

            Request::DeleteItem {
                session,
                page,
                coords,
            } => match self.store.get_mut(session) {
                Some(s) if s.is_member(from) => {
                    match s.apply_delete_item(from, page, coords, &self.avatars) {
                        Ok(_) => Reply::Done,
                        Err(e) => Reply::Failure(e.to_string()),
                    }
                }
                _ => Reply::Failure("not a member".into()),
            },
        };
        self.avatars.send(from, ServerMessage::reply(id, reply));
    }
}

/// Run `hub` on its own task.
///
/// A zero `autosave` interval disables periodic saving.
pub fn spawn(hub: Hub, autosave: Duration) -> (HubTx, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(hub, rx, autosave));
    (tx, task)
}

async fn run(mut hub: Hub, mut rx: mpsc::UnboundedReceiver<HubCommand>, autosave: Duration) {
    let mut ticker = (!autosave.is_zero() && hub.store.is_persistent()).then(|| {
        let mut t = time::interval_at(Instant::now() + autosave, autosave);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => {
                    if hub.handle(command).is_break() {
                        return;
                    }
                }
                None => {
                    hub.store.shutdown();
                    return;
                }
            },

            _ = async {
                match ticker.as_mut() {
                    Some(t) => t.tick().await,
                    None => std::future::pending().await,
                }
            } => {
                hub.store.save_dirty();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionId;
    use crate::storage::{Persistence, StorageConfig};
    use scrawl_core::{Item, Point};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn stroke() -> Item {
        Item::stroke([Point::new(2.0, 2.0), Point::new(8.0, 8.0)])
    }

    fn attach(hub: &mut Hub, name: &str) -> (AvatarId, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let avatar = AvatarId::new();
        assert!(hub
            .handle(HubCommand::Attach {
                avatar,
                name: name.into(),
                outbox: tx,
            })
            .is_continue());
        (avatar, rx)
    }

    fn request(hub: &mut Hub, avatar: AvatarId, id: RequestId, request: Request) {
        assert!(hub
            .handle(HubCommand::Request {
                avatar,
                id,
                request,
            })
            .is_continue());
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_join_reply_then_replay_then_user_list() {
        let mut hub = Hub::new(SessionStore::new());
        let (a, mut rx_a) = attach(&mut hub, "ann");
        request(&mut hub, a, 1, Request::JoinDocument { name: "doc1".into() });
        drain(&mut rx_a);
        request(
            &mut hub,
            a,
            2,
            Request::NewItem {
                session: SessionId(0),
                page: 0,
                item: stroke(),
            },
        );
        assert_eq!(drain(&mut rx_a), vec![ServerMessage::reply(2, Reply::Done)]);

        let (b, mut rx_b) = attach(&mut hub, "bob");
        request(&mut hub, b, 1, Request::JoinDocument { name: "doc1".into() });
        assert_eq!(
            drain(&mut rx_b),
            vec![
                ServerMessage::reply(
                    1,
                    Reply::Joined {
                        session: SessionId(0),
                        name: "doc1".into()
                    }
                ),
                ServerMessage::ItemAdded {
                    session: SessionId(0),
                    page: 0,
                    item: stroke()
                },
                ServerMessage::UserList {
                    session: SessionId(0),
                    names: vec!["ann".into(), "bob".into()]
                },
            ]
        );
    }

    #[test]
    fn test_requests_need_membership() {
        let mut hub = Hub::new(SessionStore::new());
        let (a, mut rx_a) = attach(&mut hub, "ann");
        let (b, mut rx_b) = attach(&mut hub, "bob");
        request(&mut hub, a, 1, Request::JoinDocument { name: "doc".into() });
        drain(&mut rx_a);

        request(
            &mut hub,
            b,
            7,
            Request::NewItem {
                session: SessionId(0),
                page: 0,
                item: stroke(),
            },
        );
        request(&mut hub, b, 8, Request::ListMembers { session: SessionId(0) });
        request(&mut hub, b, 9, Request::ListMembers { session: SessionId(5) });
        let replies = drain(&mut rx_b);
        assert_eq!(replies.len(), 3);
        assert!(replies
            .iter()
            .all(|m| matches!(m, ServerMessage::Reply { reply: Reply::Failure(_), .. })));
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(hub.store().get(SessionId(0)).unwrap().item_count(), 0);
    }

    #[test]
    fn test_list_documents_and_members_and_ping() {
        let mut hub = Hub::new(SessionStore::new());
        let (a, mut rx) = attach(&mut hub, "ann");
        request(&mut hub, a, 1, Request::JoinDocument { name: "b".into() });
        request(&mut hub, a, 2, Request::JoinDocument { name: "a".into() });
        drain(&mut rx);

        request(&mut hub, a, 3, Request::ListDocuments);
        request(&mut hub, a, 4, Request::ListMembers { session: SessionId(1) });
        request(&mut hub, a, 5, Request::Ping);
        assert_eq!(
            drain(&mut rx),
            vec![
                ServerMessage::reply(3, Reply::Documents(vec!["a".into(), "b".into()])),
                ServerMessage::reply(4, Reply::Members(vec!["ann".into()])),
                ServerMessage::reply(5, Reply::Pong(true)),
            ]
        );
    }

    #[test]
    fn test_detach_leaves_all_sessions() {
        let mut hub = Hub::new(SessionStore::new());
        let (a, _rx_a) = attach(&mut hub, "ann");
        let (b, mut rx_b) = attach(&mut hub, "bob");
        for (avatar, id) in [(a, 1), (b, 2)] {
            request(&mut hub, avatar, id, Request::JoinDocument { name: "x".into() });
            request(&mut hub, avatar, id + 10, Request::JoinDocument { name: "y".into() });
        }
        drain(&mut rx_b);

        assert!(hub.handle(HubCommand::Detach { avatar: a }).is_continue());
        assert!(hub.avatars().get(a).is_none());
        for sid in [SessionId(0), SessionId(1)] {
            assert_eq!(hub.store().get(sid).unwrap().members(), &[b]);
        }
        let updates = drain(&mut rx_b);
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(
            |m| matches!(m, ServerMessage::UserList { names, .. } if names == &["bob".to_string()])
        ));
    }

    #[test]
    fn test_join_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("store");
        std::fs::create_dir(&sub).unwrap();
        let store =
            SessionStore::with_persistence(Persistence::open(&StorageConfig::new(&sub)).unwrap())
                .unwrap();
        let mut hub = Hub::new(store);
        std::fs::remove_dir_all(&sub).unwrap();

        let (a, mut rx) = attach(&mut hub, "ann");
        request(&mut hub, a, 1, Request::JoinDocument { name: "doc".into() });
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::Reply { id: 1, reply: Reply::Failure(_) }]
        ));
        assert!(hub.store().is_empty());
    }

    #[test]
    fn test_refused_edits_leave_session_untouched() {
        let mut hub = Hub::new(SessionStore::new());
        let (a, mut rx_a) = attach(&mut hub, "ann");
        let (b, mut rx_b) = attach(&mut hub, "bob");
        for (avatar, id) in [(a, 1), (b, 1)] {
            request(&mut hub, avatar, id, Request::JoinDocument { name: "doc".into() });
        }
        drain(&mut rx_a);
        drain(&mut rx_b);

        let edits = [
            Request::NewItem {
                session: SessionId(0),
                page: usize::MAX,
                item: stroke(),
            },
            Request::NewItem {
                session: SessionId(0),
                page: 1 << 40,
                item: stroke(),
            },
            Request::NewItem {
                session: SessionId(0),
                page: 0,
                item: Item::stroke([Point::new(f64::INFINITY, 1.0)]),
            },
            Request::NewItem {
                session: SessionId(0),
                page: 0,
                item: stroke().with_width(f64::NAN),
            },
            Request::DeleteItem {
                session: SessionId(0),
                page: 0,
                coords: vec![Point::new(f64::NAN, 0.0)],
            },
        ];
        for (id, edit) in (10..).zip(edits) {
            request(&mut hub, a, id, edit);
        }

        let replies = drain(&mut rx_a);
        assert_eq!(replies.len(), 5);
        assert!(replies
            .iter()
            .all(|m| matches!(m, ServerMessage::Reply { reply: Reply::Failure(_), .. })));
        assert!(drain(&mut rx_b).is_empty());
        let session = hub.store().get(SessionId(0)).unwrap();
        assert!(session.pages().is_empty());
        assert!(!session.is_dirty());
    }

    #[test]
    fn test_shutdown_command_saves_and_breaks() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SessionStore::with_persistence(Persistence::open(&StorageConfig::new(dir.path())).unwrap())
                .unwrap();
        let mut hub = Hub::new(store);
        let (a, mut rx) = attach(&mut hub, "ann");
        request(&mut hub, a, 1, Request::JoinDocument { name: "doc".into() });
        let edit = Request::NewItem {
            session: SessionId(0),
            page: 0,
            item: stroke(),
        };
        assert!(hub
            .handle(HubCommand::Request { avatar: a, id: 2, request: edit })
            .is_continue());
        drain(&mut rx);

        let (done, mut report) = oneshot::channel();
        assert!(hub.handle(HubCommand::Shutdown { done }).is_break());
        assert_eq!(report.try_recv().unwrap(), SaveReport { saved: 1, failed: 0 });
        let saved = std::fs::read_to_string(dir.path().join("doc-doc.json")).unwrap();
        assert!(saved.contains("Stroke"), "shutdown save missing: {saved}");
        assert!(!dir.path().join(crate::storage::LOCK_FILE_NAME).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SessionStore::with_persistence(Persistence::open(&StorageConfig::new(dir.path())).unwrap())
                .unwrap();
        let (tx, task) = spawn(Hub::new(store), Duration::from_secs(60));

        let (out, mut rx) = mpsc::unbounded_channel();
        let avatar = AvatarId::new();
        tx.send(HubCommand::Attach {
            avatar,
            name: "ann".into(),
            outbox: out,
        })
        .unwrap();
        tx.send(HubCommand::Request {
            avatar,
            id: 1,
            request: Request::JoinDocument { name: "doc".into() },
        })
        .unwrap();
        tx.send(HubCommand::Request {
            avatar,
            id: 2,
            request: Request::NewItem {
                session: SessionId(0),
                page: 0,
                item: stroke(),
            },
        })
        .unwrap();
        // Join reply, user list, then the new_item completion.
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        let path = dir.path().join("doc-doc.json");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "2\n[]");

        time::sleep(Duration::from_secs(61)).await;
        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("Stroke"), "autosave missing: {saved}");

        let (done, report) = oneshot::channel();
        tx.send(HubCommand::Shutdown { done }).unwrap();
        assert_eq!(report.await.unwrap(), SaveReport::default());
        task.await.unwrap();
        assert!(!dir.path().join(crate::storage::LOCK_FILE_NAME).exists());
    }
}
