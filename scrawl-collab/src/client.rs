//! Client side of a shared annotation session.
//!
//! ```text
//!              connect()              login accepted
//! Disconnected ─────────► Connecting ───────────────► Connected ◄──┐
//!      ▲                      │                          │ no data for       │ data
//!      │   failure/cancel     │                          ▼ interval+timeout  │ resumes
//!      ├──────────────────────┘                        Stalled ──────────────┘
//!      │            transport closed / disconnect()      │
//!      └─────────────────────────────────────────────────┘
//! ```
//!
//! Every connection attempt gets a new epoch. Background tasks, reply
//! waiters and timers carry the epoch they were started under and do nothing
//! once it is no longer current, so a late completion after `disconnect()`
//! is harmless.
//!
//! Remote edits are applied straight to the bound [`SharedDocument`] and
//! never enter local undo history. Only notifications for the joined
//! session are applied. Joining empties the local copy first, since the
//! server replays every item the session holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use scrawl_core::document::{self, SharedDocument};
use scrawl_core::{Item, Point, Replicator};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::protocol::{
    ClientMessage, ProtocolError, Reply, Request, RequestId, ServerMessage, SessionId,
};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Client timing.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Pause between a ping reply and the next ping
    pub ping_interval: Duration,
    /// Grace period on top of the interval before the link counts as stalled
    pub ping_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Short timings for tests against a local server.
    pub fn for_testing() -> Self {
        Self {
            ping_interval: Duration::from_millis(200),
            ping_timeout: Duration::from_millis(200),
        }
    }

    /// Silence after which the connection is considered stalled.
    pub fn watchdog(&self) -> Duration {
        self.ping_interval + self.ping_timeout
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but nothing heard for longer than the watchdog allows.
    Stalled,
}

/// Events for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    /// The watchdog fired. Sent once per stall.
    ConnectionProblems,
    /// Data arrived again after a stall.
    ConnectionRestored,
    Disconnected,
    /// A join emptied the local document ahead of the server's replay.
    /// Local undo history no longer matches it.
    DocumentReset,
    UserList(Vec<String>),
    /// A collaborator's item was added to the local document.
    ItemAdded { page: usize, item: Item },
    /// A collaborator's delete removed an item from the local document.
    ItemDeleted { page: usize, coords: Vec<Point> },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no document is open")]
    NoDocument,
    #[error("already connecting or connected")]
    AlreadyActive,
    #[error("not connected")]
    NotConnected,
    #[error("no document session joined")]
    NotJoined,
    #[error("connection attempt was cancelled")]
    Cancelled,
    #[error("connection failed: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("no response from server within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server refused: {0}")]
    Failure(String),
    #[error("connection lost before the server replied")]
    LinkLost,
}

/// A joined document session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHandle {
    pub session: SessionId,
    pub name: String,
}

/// A connection to the annotation server, owned by the UI layer.
///
/// Cheap to clone; clones share the connection. Also serves as the
/// [`Replicator`] for an [`Editor`](scrawl_core::Editor).
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    events: mpsc::UnboundedSender<SyncEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    shared: Mutex<Shared>,
}

/// Mutable connection state.
///
/// Lock order: the document before `shared`. An [`Editor`](scrawl_core::Editor)
/// replicates while holding the document lock, so `shared` is always
/// released before the document is locked.
struct Shared {
    state: ConnectionState,
    epoch: u64,
    document: Option<SharedDocument>,
    link: Option<Link>,
    joined: Option<DocumentHandle>,
    next_request: RequestId,
    pending: HashMap<RequestId, oneshot::Sender<Reply>>,
    last_data: Instant,
}

/// Everything that lives exactly as long as one connection.
struct Link {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    activity: Arc<Notify>,
    runtime: Handle,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                event_rx: Mutex::new(Some(event_rx)),
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    epoch: 0,
                    document: None,
                    link: None,
                    joined: None,
                    next_request: 1,
                    pending: HashMap::new(),
                    last_data: Instant::now(),
                }),
            }),
        }
    }

    /// Take the event receiver (can only be called once).
    ///
    /// Dropping it tells the session nobody is watching: a stall then
    /// disconnects instead of waiting for the user to decide.
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        lock(&self.inner.event_rx).take()
    }

    /// Set the local document remote edits are applied to.
    pub fn bind_document(&self, document: SharedDocument) {
        self.inner.shared().document = Some(document);
    }

    pub fn document(&self) -> Option<SharedDocument> {
        self.inner.shared().document.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.shared().state
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.connection_state(),
            ConnectionState::Connected | ConnectionState::Stalled
        )
    }

    /// The session joined on the current connection, if any.
    pub fn joined(&self) -> Option<DocumentHandle> {
        self.inner.shared().joined.clone()
    }

    /// Connect and log in.
    ///
    /// Requires a bound document and a disconnected session.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        let epoch = self.inner.begin_connect()?;
        let url = format!("ws://{host}:{port}/");
        log::info!("Connecting to {url} as {username}");

        let limit = self.inner.config.watchdog();
        let ws = match time::timeout(limit, handshake(&url, username, password)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                self.inner.abandon_connect(epoch);
                return Err(e);
            }
            Err(_) => {
                self.inner.abandon_connect(epoch);
                return Err(ClientError::Timeout(limit));
            }
        };

        let (mut ws_writer, mut ws_reader) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerMessage>();

        // Writer task: forward outgoing channel to WebSocket, then close.
        // Not aborted on disconnect so the close frame still goes out.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let bytes = match msg.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Dropping unencodable message: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
            let _ = ws_writer.close().await;
        });

        // Reader task: decode frames; dropping `in_tx` signals closure.
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(msg) => {
                            if in_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::info!("WebSocket error: {e}");
                        break;
                    }
                }
            }
        });

        self.inner.establish(epoch, out_tx, in_rx, vec![reader])
    }

    /// Drop the connection. Pending calls fail, late replies are ignored.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Names of all documents on the server.
    pub async fn list_documents(&self) -> Result<Vec<String>, ClientError> {
        match self.inner.call(Request::ListDocuments).await? {
            Reply::Documents(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    /// Join (creating if needed) the named document session.
    ///
    /// Only valid while connected. The bound document is emptied and
    /// [`SyncEvent::DocumentReset`] sent, then the server's replay of the
    /// session's items is applied to it. Notifications for any previously
    /// joined session are ignored from then on.
    pub async fn join_document_session(&self, name: &str) -> Result<DocumentHandle, ClientError> {
        let epoch = {
            let s = self.inner.shared();
            if s.state != ConnectionState::Connected {
                return Err(ClientError::NotConnected);
            }
            s.epoch
        };
        let reply = self
            .inner
            .call(Request::JoinDocument {
                name: name.to_string(),
            })
            .await?;
        match reply {
            Reply::Joined { session, name } => {
                // Already recorded by the dispatcher, ahead of the replay.
                if self.inner.shared().epoch != epoch {
                    return Err(ClientError::Cancelled);
                }
                Ok(DocumentHandle { session, name })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Members of the joined session, in join order.
    pub async fn list_members(&self) -> Result<Vec<String>, ClientError> {
        let session = self.joined().ok_or(ClientError::NotJoined)?.session;
        match self.inner.call(Request::ListMembers { session }).await? {
            Reply::Members(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    /// Send an item drawn locally. Dropped when not joined.
    pub fn send_new_item(&self, page: usize, item: &Item) {
        self.inner.send_to_session(|session| Request::NewItem {
            session,
            page,
            item: item.clone(),
        });
    }

    /// Send a local delete. Dropped when not joined.
    pub fn send_delete_item(&self, page: usize, coords: &[Point]) {
        self.inner.send_to_session(|session| Request::DeleteItem {
            session,
            page,
            coords: coords.to_vec(),
        });
    }
}

impl Replicator for ClientSession {
    fn send_new_item(&self, page: usize, item: &Item) {
        ClientSession::send_new_item(self, page, item);
    }

    fn send_delete_item(&self, page: usize, coords: &[Point]) {
        ClientSession::send_delete_item(self, page, coords);
    }
}

fn unexpected(reply: Reply) -> ClientError {
    match reply {
        Reply::Failure(reason) => ClientError::Failure(reason),
        other => ClientError::Protocol(ProtocolError::UnexpectedFrame(format!("{other:?}"))),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type ClientWs =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Open the socket and log in.
async fn handshake(url: &str, username: &str, password: &str) -> Result<ClientWs, ClientError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;
    let login = ClientMessage::Login {
        username: username.to_string(),
        password: password.to_string(),
    };
    ws.send(Message::Binary(login.encode()?.into())).await?;

    while let Some(frame) = ws.next().await {
        match frame? {
            Message::Binary(data) => {
                return match ServerMessage::decode(&data)? {
                    ServerMessage::LoginAccepted => Ok(ws),
                    ServerMessage::LoginRejected { reason } => Err(ClientError::LoginRejected(reason)),
                    other => Err(ProtocolError::UnexpectedFrame(format!("{other:?}")).into()),
                };
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ProtocolError::ConnectionClosed.into())
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn begin_connect(&self) -> Result<u64, ClientError> {
        let mut s = self.shared();
        if s.document.is_none() {
            return Err(ClientError::NoDocument);
        }
        if s.state != ConnectionState::Disconnected {
            return Err(ClientError::AlreadyActive);
        }
        s.state = ConnectionState::Connecting;
        s.epoch += 1;
        Ok(s.epoch)
    }

    fn abandon_connect(&self, epoch: u64) {
        let mut s = self.shared();
        if s.epoch == epoch && s.state == ConnectionState::Connecting {
            s.state = ConnectionState::Disconnected;
        }
    }

    /// Finish a connection attempt: start the background tasks and go live.
    fn establish(
        self: &Arc<Self>,
        epoch: u64,
        outgoing: mpsc::UnboundedSender<ClientMessage>,
        inbound: mpsc::UnboundedReceiver<ServerMessage>,
        mut tasks: Vec<JoinHandle<()>>,
    ) -> Result<(), ClientError> {
        let mut s = self.shared();
        if s.epoch != epoch || s.state != ConnectionState::Connecting {
            for task in tasks {
                task.abort();
            }
            return Err(ClientError::Cancelled);
        }

        let activity = Arc::new(Notify::new());
        tasks.push(tokio::spawn(dispatch(self.clone(), epoch, inbound)));
        tasks.push(tokio::spawn(watchdog(self.clone(), epoch, activity.clone())));
        tasks.push(tokio::spawn(pinger(self.clone(), epoch)));

        s.link = Some(Link {
            outgoing,
            activity,
            runtime: Handle::current(),
            tasks,
        });
        s.state = ConnectionState::Connected;
        s.last_data = Instant::now();
        self.emit(SyncEvent::Connected);
        log::info!("Connected");
        Ok(())
    }

    fn disconnect(&self) {
        let mut s = self.shared();
        let was_live = match s.state {
            ConnectionState::Disconnected => return,
            ConnectionState::Connecting => false,
            ConnectionState::Connected | ConnectionState::Stalled => true,
        };
        Self::tear_down(&mut s);
        drop(s);
        if was_live {
            log::info!("Disconnected");
            self.emit(SyncEvent::Disconnected);
        }
    }

    /// The transport went away underneath us.
    fn transport_closed(&self, epoch: u64) {
        let mut s = self.shared();
        if s.epoch != epoch || s.link.is_none() {
            return;
        }
        Self::tear_down(&mut s);
        drop(s);
        log::info!("Connection lost");
        self.emit(SyncEvent::Disconnected);
    }

    fn tear_down(s: &mut Shared) {
        s.epoch += 1;
        s.state = ConnectionState::Disconnected;
        s.link = None;
        s.joined = None;
        s.pending.clear();
    }

    /// Liveness is in doubt: stall once, or disconnect if nobody is listening.
    fn connection_problems(&self, epoch: u64) {
        let mut s = self.shared();
        if s.epoch != epoch || s.state != ConnectionState::Connected {
            return;
        }
        if self.events.is_closed() {
            drop(s);
            log::warn!("Connection problems and no UI listening; disconnecting");
            self.disconnect();
            return;
        }
        s.state = ConnectionState::Stalled;
        drop(s);
        log::warn!("Connection problems: no data from server");
        self.emit(SyncEvent::ConnectionProblems);
    }

    /// Register a call and send it. Returns the epoch it belongs to.
    fn start_call(&self, request: Request) -> Result<(u64, oneshot::Receiver<Reply>), ClientError> {
        let mut s = self.shared();
        let epoch = s.epoch;
        let id = s.next_request;
        let Some(link) = &s.link else {
            return Err(ClientError::NotConnected);
        };
        log::trace!("Request {id}: {}", request.name());
        if link.outgoing.send(ClientMessage::Request { id, request }).is_err() {
            return Err(ClientError::LinkLost);
        }
        let (tx, rx) = oneshot::channel();
        s.next_request += 1;
        s.pending.insert(id, tx);
        Ok((epoch, rx))
    }

    /// Call and wait for the reply. A lost reply counts as a liveness problem.
    async fn call(&self, request: Request) -> Result<Reply, ClientError> {
        let (epoch, rx) = self.start_call(request)?;
        match rx.await {
            Ok(reply) => Ok(reply),
            Err(_) => {
                self.connection_problems(epoch);
                Err(ClientError::LinkLost)
            }
        }
    }

    /// Fire-and-forget call on the joined session.
    fn send_to_session(self: &Arc<Self>, build: impl FnOnce(SessionId) -> Request) {
        let session = match &self.shared().joined {
            Some(handle) => handle.session,
            None => {
                log::debug!("Not joined; local edit not sent");
                return;
            }
        };
        let (epoch, rx) = match self.start_call(build(session)) {
            Ok(started) => started,
            Err(e) => {
                log::debug!("Local edit not sent: {e}");
                return;
            }
        };
        let Some(runtime) = self.shared().link.as_ref().map(|l| l.runtime.clone()) else {
            return;
        };
        let inner = self.clone();
        runtime.spawn(async move {
            match rx.await {
                Ok(Reply::Failure(reason)) => log::warn!("Server refused edit: {reason}"),
                Ok(_) => {}
                Err(_) => inner.connection_problems(epoch),
            }
        });
    }

    /// Handle one inbound message. Returns false once the epoch is stale.
    fn on_message(&self, epoch: u64, msg: ServerMessage) -> bool {
        let mut s = self.shared();
        if s.epoch != epoch {
            return false;
        }
        s.last_data = Instant::now();
        if let Some(link) = &s.link {
            link.activity.notify_one();
        }
        if s.state == ConnectionState::Stalled {
            s.state = ConnectionState::Connected;
            log::info!("Connection restored");
            self.emit(SyncEvent::ConnectionRestored);
        }

        match msg {
            ServerMessage::Reply { id, reply } => {
                let waiter = s.pending.remove(&id);
                if let Reply::Joined { session, name } = &reply {
                    let handle = DocumentHandle {
                        session: *session,
                        name: name.clone(),
                    };
                    log::info!("Joined {:?} as {}", handle.name, handle.session);
                    s.joined = Some(handle);
                    let doc = s.document.clone();
                    drop(s);
                    if let Some(doc) = doc {
                        document::write(&doc).clear_pages();
                        self.emit(SyncEvent::DocumentReset);
                    }
                }
                if let Some(waiter) = waiter {
                    let _ = waiter.send(reply);
                }
            }
            ServerMessage::UserList { session, names } => {
                if Self::is_joined(&s, session) {
                    self.emit(SyncEvent::UserList(names));
                }
            }
            ServerMessage::ItemAdded {
                session,
                page,
                item,
            } => {
                if !Self::is_joined(&s, session) {
                    return true;
                }
                let Some(doc) = s.document.clone() else {
                    return true;
                };
                drop(s);
                if document::write(&doc).add_item(page, item.clone()).is_ok() {
                    self.emit(SyncEvent::ItemAdded { page, item });
                } else {
                    log::debug!("Ignoring item for page {page}, which does not exist locally");
                }
            }
            ServerMessage::ItemDeleted {
                session,
                page,
                coords,
            } => {
                if !Self::is_joined(&s, session) {
                    return true;
                }
                let Some(doc) = s.document.clone() else {
                    return true;
                };
                drop(s);
                if document::write(&doc)
                    .remove_item_with_coords(page, &coords)
                    .is_some()
                {
                    self.emit(SyncEvent::ItemDeleted { page, coords });
                }
            }
            ServerMessage::LoginAccepted | ServerMessage::LoginRejected { .. } => {
                log::warn!("Unexpected login frame after handshake");
            }
        }
        true
    }

    fn is_joined(s: &Shared, session: SessionId) -> bool {
        let joined = s.joined.as_ref().is_some_and(|h| h.session == session);
        if !joined {
            log::debug!("Ignoring notification for {session}, which is not joined");
        }
        joined
    }
}

/// Apply inbound messages until the transport closes.
async fn dispatch(inner: Arc<Inner>, epoch: u64, mut inbound: mpsc::UnboundedReceiver<ServerMessage>) {
    while let Some(msg) = inbound.recv().await {
        if !inner.on_message(epoch, msg) {
            return;
        }
    }
    inner.transport_closed(epoch);
}

/// Report a stall when nothing arrives for `ping_interval + ping_timeout`.
async fn watchdog(inner: Arc<Inner>, epoch: u64, activity: Arc<Notify>) {
    let period = inner.config.watchdog();
    loop {
        let deadline = {
            let s = inner.shared();
            if s.epoch != epoch {
                return;
            }
            s.last_data + period
        };
        time::sleep_until(deadline).await;

        let silent = {
            let s = inner.shared();
            if s.epoch != epoch {
                return;
            }
            s.last_data + period <= Instant::now()
        };
        if silent {
            inner.connection_problems(epoch);
            // Stay quiet until something arrives.
            activity.notified().await;
        }
    }
}

/// Ping, wait for the answer, pause, repeat.
async fn pinger(inner: Arc<Inner>, epoch: u64) {
    loop {
        match inner.start_call(Request::Ping) {
            Ok((started, rx)) if started == epoch => match rx.await {
                Ok(Reply::Pong(_)) => {}
                Ok(other) => log::warn!("Unexpected ping reply: {other:?}"),
                Err(_) => {
                    inner.connection_problems(epoch);
                    return;
                }
            },
            _ => return,
        }
        time::sleep(inner.config.ping_interval).await;
    }
}

#[cfg(test)]
impl ClientSession {
    /// Go live over in-memory channels instead of a socket.
    ///
    /// Returns what the client sends and a sender for what it receives.
    fn connect_in_memory(
        &self,
    ) -> Result<
        (
            mpsc::UnboundedReceiver<ClientMessage>,
            mpsc::UnboundedSender<ServerMessage>,
        ),
        ClientError,
    > {
        let epoch = self.inner.begin_connect()?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.inner.establish(epoch, out_tx, in_rx, Vec::new())?;
        Ok((out_rx, in_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrawl_core::{Document, Editor};

    fn stroke(x: f64) -> Item {
        Item::stroke([Point::new(x, 0.0), Point::new(x, 5.0)])
    }

    fn session_with_doc(pages: usize) -> (ClientSession, SharedDocument) {
        let session = ClientSession::new(ClientConfig::default());
        let doc = document::shared(Document::with_pages(pages));
        session.bind_document(doc.clone());
        (session, doc)
    }

    /// Answer the next request with `reply`, skipping pings.
    async fn answer(
        out: &mut mpsc::UnboundedReceiver<ClientMessage>,
        inbound: &mpsc::UnboundedSender<ServerMessage>,
        reply: Reply,
    ) -> Request {
        loop {
            match out.recv().await.unwrap() {
                ClientMessage::Request { request: Request::Ping, .. } => continue,
                ClientMessage::Request { id, request } => {
                    inbound.send(ServerMessage::reply(id, reply)).unwrap();
                    return request;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    async fn join_as(
        session: &ClientSession,
        out: &mut mpsc::UnboundedReceiver<ClientMessage>,
        inbound: &mpsc::UnboundedSender<ServerMessage>,
        name: &str,
        sid: SessionId,
    ) -> DocumentHandle {
        let joining = tokio::spawn({
            let session = session.clone();
            let name = name.to_string();
            async move { session.join_document_session(&name).await }
        });
        let request = answer(
            out,
            inbound,
            Reply::Joined {
                session: sid,
                name: name.into(),
            },
        )
        .await;
        assert_eq!(request, Request::JoinDocument { name: name.into() });
        joining.await.unwrap().unwrap()
    }

    async fn join(
        session: &ClientSession,
        out: &mut mpsc::UnboundedReceiver<ClientMessage>,
        inbound: &mpsc::UnboundedSender<ServerMessage>,
    ) -> DocumentHandle {
        join_as(session, out, inbound, "doc1", SessionId(4)).await
    }

    #[tokio::test]
    async fn test_connect_requires_document() {
        let session = ClientSession::default();
        assert!(matches!(
            session.connect("127.0.0.1", 1, "u", "p").await,
            Err(ClientError::NoDocument)
        ));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_one_connection_at_a_time() {
        let (session, _doc) = session_with_doc(1);
        let _link = session.connect_in_memory().unwrap();
        assert!(matches!(
            session.connect_in_memory(),
            Err(ClientError::AlreadyActive)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (session, _doc) = session_with_doc(1);
        assert!(session.connect("127.0.0.1", port, "u", "p").await.is_err());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_stalls_once_and_recovers() {
        let (session, _doc) = session_with_doc(1);
        let mut events = session.take_event_rx().unwrap();
        let (_out, inbound) = session.connect_in_memory().unwrap();
        assert_eq!(events.recv().await.unwrap(), SyncEvent::Connected);

        time::sleep(Duration::from_secs(9)).await;
        assert_eq!(session.connection_state(), ConnectionState::Connected);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(session.connection_state(), ConnectionState::Stalled);
        assert_eq!(events.try_recv().unwrap(), SyncEvent::ConnectionProblems);

        time::sleep(Duration::from_secs(60)).await;
        assert!(events.try_recv().is_err());

        // Any frame counts as data, even a reply nobody waits for.
        inbound.send(ServerMessage::reply(99, Reply::Pong(true))).unwrap();
        assert_eq!(events.recv().await.unwrap(), SyncEvent::ConnectionRestored);
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());

        // A second silence is a new episode.
        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(events.try_recv().unwrap(), SyncEvent::ConnectionProblems);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_keep_connection_alive() {
        let (session, _doc) = session_with_doc(1);
        let mut events = session.take_event_rx().unwrap();
        let (mut out, inbound) = session.connect_in_memory().unwrap();
        events.recv().await.unwrap();

        let start = Instant::now();
        for round in 0..4 {
            match out.recv().await.unwrap() {
                ClientMessage::Request { id, request: Request::Ping } => {
                    inbound.send(ServerMessage::reply(id, Reply::Pong(true))).unwrap();
                }
                other => panic!("round {round}: unexpected {other:?}"),
            }
        }
        // Three pauses between four pings.
        assert!(Instant::now() - start >= DEFAULT_PING_INTERVAL * 3);
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_without_listener_disconnects() {
        let (session, _doc) = session_with_doc(1);
        drop(session.take_event_rx());
        let _link = session.connect_in_memory().unwrap();

        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_remote_edits_apply_to_document() {
        let (session, doc) = session_with_doc(2);
        let mut events = session.take_event_rx().unwrap();
        let (mut out, inbound) = session.connect_in_memory().unwrap();
        assert_eq!(events.recv().await.unwrap(), SyncEvent::Connected);
        let sid = join(&session, &mut out, &inbound).await.session;
        assert_eq!(events.recv().await.unwrap(), SyncEvent::DocumentReset);

        inbound.send(ServerMessage::ItemAdded { session: sid, page: 1, item: stroke(1.0) }).unwrap();
        inbound.send(ServerMessage::ItemAdded { session: sid, page: 7, item: stroke(2.0) }).unwrap();
        inbound
            .send(ServerMessage::ItemDeleted { session: sid, page: 0, coords: stroke(1.0).coords })
            .unwrap();
        inbound
            .send(ServerMessage::ItemDeleted { session: sid, page: 1, coords: stroke(1.0).coords })
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::ItemAdded { page: 1, item: stroke(1.0) }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::ItemDeleted { page: 1, coords: stroke(1.0).coords }
        );
        assert!(document::read(&doc).is_empty());
    }

    #[tokio::test]
    async fn test_notifications_for_other_sessions_ignored() {
        let (session, doc) = session_with_doc(1);
        let mut events = session.take_event_rx().unwrap();
        let (mut out, inbound) = session.connect_in_memory().unwrap();

        // Nothing joined yet.
        inbound
            .send(ServerMessage::ItemAdded { session: SessionId(4), page: 0, item: stroke(0.0) })
            .unwrap();
        join_as(&session, &mut out, &inbound, "doc1", SessionId(4)).await;
        join_as(&session, &mut out, &inbound, "doc2", SessionId(5)).await;
        assert_eq!(session.joined().unwrap().session, SessionId(5));

        let old = SessionId(4);
        inbound.send(ServerMessage::ItemAdded { session: old, page: 0, item: stroke(1.0) }).unwrap();
        inbound
            .send(ServerMessage::UserList { session: old, names: vec!["ann".into()] })
            .unwrap();
        inbound
            .send(ServerMessage::UserList { session: SessionId(5), names: vec!["bob".into()] })
            .unwrap();

        assert_eq!(events.recv().await.unwrap(), SyncEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), SyncEvent::DocumentReset);
        assert_eq!(events.recv().await.unwrap(), SyncEvent::DocumentReset);
        assert_eq!(events.recv().await.unwrap(), SyncEvent::UserList(vec!["bob".into()]));
        assert!(document::read(&doc).is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_replaces_local_copy() {
        let (session, doc) = session_with_doc(1);
        let mut events = session.take_event_rx().unwrap();
        let mut editor = Editor::new(doc.clone(), Arc::new(session.clone()));

        for _ in 0..2 {
            let (mut out, inbound) = session.connect_in_memory().unwrap();
            assert_eq!(events.recv().await.unwrap(), SyncEvent::Connected);
            let sid = join(&session, &mut out, &inbound).await.session;
            assert_eq!(events.recv().await.unwrap(), SyncEvent::DocumentReset);
            editor.reset_history();

            inbound.send(ServerMessage::ItemAdded { session: sid, page: 0, item: stroke(1.0) }).unwrap();
            assert_eq!(
                events.recv().await.unwrap(),
                SyncEvent::ItemAdded { page: 0, item: stroke(1.0) }
            );
            assert_eq!(document::read(&doc).item_count(), 1);
            assert!(!editor.history().can_undo());

            session.disconnect();
            assert_eq!(events.recv().await.unwrap(), SyncEvent::Disconnected);
        }
        assert_eq!(document::read(&doc).page(0).unwrap().items, vec![stroke(1.0)]);
    }

    #[tokio::test]
    async fn test_edits_replicate_after_join() {
        let (session, doc) = session_with_doc(1);
        let (mut out, inbound) = session.connect_in_memory().unwrap();

        // Not joined yet: nothing leaves.
        session.send_new_item(0, &stroke(1.0));

        let handle = join(&session, &mut out, &inbound).await;
        assert_eq!(handle.session, SessionId(4));
        assert_eq!(session.joined(), Some(handle));

        let mut editor = Editor::new(doc.clone(), Arc::new(session.clone()));
        editor.draw(0, stroke(2.0)).unwrap();
        let sent = answer(&mut out, &inbound, Reply::Done).await;
        assert_eq!(
            sent,
            Request::NewItem { session: SessionId(4), page: 0, item: stroke(2.0) }
        );

        editor.undo().unwrap();
        let sent = answer(&mut out, &inbound, Reply::Done).await;
        assert_eq!(
            sent,
            Request::DeleteItem { session: SessionId(4), page: 0, coords: stroke(2.0).coords }
        );
        assert!(document::read(&doc).is_empty());
    }

    #[tokio::test]
    async fn test_join_failure_surfaces() {
        let (session, _doc) = session_with_doc(1);
        let (mut out, inbound) = session.connect_in_memory().unwrap();
        let joining = tokio::spawn({
            let session = session.clone();
            async move { session.join_document_session("doc1").await }
        });
        answer(&mut out, &inbound, Reply::Failure("disk full".into())).await;
        assert!(matches!(
            joining.await.unwrap(),
            Err(ClientError::Failure(reason)) if reason == "disk full"
        ));
        assert!(session.joined().is_none());
    }

    #[tokio::test]
    async fn test_transport_close_disconnects() {
        let (session, _doc) = session_with_doc(1);
        let mut events = session.take_event_rx().unwrap();
        let (_out, inbound) = session.connect_in_memory().unwrap();
        assert_eq!(events.recv().await.unwrap(), SyncEvent::Connected);

        drop(inbound);
        assert_eq!(events.recv().await.unwrap(), SyncEvent::Disconnected);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_late_messages_after_disconnect_are_ignored() {
        let (session, doc) = session_with_doc(1);
        let mut events = session.take_event_rx().unwrap();
        let (_out, inbound) = session.connect_in_memory().unwrap();
        events.recv().await.unwrap();

        session.disconnect();
        assert_eq!(events.recv().await.unwrap(), SyncEvent::Disconnected);
        let _ = inbound.send(ServerMessage::ItemAdded {
            session: SessionId(0),
            page: 0,
            item: stroke(1.0),
        });
        tokio::task::yield_now().await;
        assert!(document::read(&doc).is_empty());
        assert!(events.try_recv().is_err());

        // Disconnecting again is a no-op.
        session.disconnect();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_call_fails_on_disconnect() {
        let (session, _doc) = session_with_doc(1);
        let (_out, _inbound) = session.connect_in_memory().unwrap();
        let listing = tokio::spawn({
            let session = session.clone();
            async move { session.list_documents().await }
        });
        tokio::task::yield_now().await;
        session.disconnect();
        assert!(matches!(listing.await.unwrap(), Err(ClientError::LinkLost)));
    }

    #[tokio::test]
    async fn test_calls_need_connection() {
        let (session, _doc) = session_with_doc(1);
        assert!(matches!(
            session.list_documents().await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            session.join_document_session("x").await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(session.list_members().await, Err(ClientError::NotJoined)));
    }
}
