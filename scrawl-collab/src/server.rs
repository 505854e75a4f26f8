//! WebSocket server for shared annotation sessions.
//!
//! Architecture:
//! ```text
//! Client A ──┐   login    ┌──────────────┐
//!             ├──────────► │ conn task    │──┐
//! Client B ──┘             │ (per socket) │  │ HubCommand
//!                          └──────▲───────┘  ▼
//!                                 │       ┌──────┐    ┌─────────────┐
//!                         Outbox  └────── │ Hub  │ ── │ Persistence │
//!                                         └──────┘    └─────────────┘
//! ```
//!
//! Startup order: lock storage, load every document, bind. Shutdown order:
//! stop accepting, final save, release the lock.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::auth::{Authenticator, CredentialTable};
use crate::avatar::AvatarId;
use crate::hub::{self, Hub, HubCommand, HubTx};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::storage::{Persistence, PersistenceError, StorageConfig};
use crate::store::{SaveReport, SessionStore};

pub const DEFAULT_PORT: u16 = 6524;
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(60);

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Document storage (None = in-memory only)
    pub storage: Option<StorageConfig>,
    /// How often dirty documents are saved. Zero disables persistence.
    pub autosave_interval: Duration,
    /// How long a new connection may take to log in
    pub login_timeout: Duration,
    pub authenticator: Arc<dyn Authenticator>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            storage: None,
            autosave_interval: DEFAULT_AUTOSAVE_INTERVAL,
            login_timeout: Duration::from_secs(10),
            authenticator: Arc::new(CredentialTable::new().with_account("test", "testpw")),
        }
    }
}

impl ServerConfig {
    /// Loopback on an ephemeral port, no storage.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }

    pub fn with_storage(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage = Some(StorageConfig::new(dir));
        self
    }

    fn persistence_enabled(&self) -> bool {
        self.storage.is_some() && !self.autosave_interval.is_zero()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("storage", &self.storage)
            .field("autosave_interval", &self.autosave_interval)
            .field("login_timeout", &self.login_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("cannot listen on {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no login within {0:?}")]
    LoginTimeout(Duration),
    #[error("server is shutting down")]
    HubGone,
}

/// A bound server, ready to run.
pub struct SyncServer {
    config: ServerConfig,
    listener: TcpListener,
    store: SessionStore,
}

impl SyncServer {
    /// Lock storage, load documents and bind the listener.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let store = match &config.storage {
            Some(storage) if config.persistence_enabled() => {
                SessionStore::with_persistence(Persistence::open(storage)?)?
            }
            Some(storage) => {
                log::warn!(
                    "Autosave disabled; {} will not be read or written",
                    storage.dir.display()
                );
                SessionStore::new()
            }
            None => SessionStore::new(),
        };

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        log::info!("Sync server listening on {}", listener.local_addr()?);

        Ok(Self {
            config,
            listener,
            store,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Names of the documents loaded at startup.
    pub fn document_names(&self) -> Vec<String> {
        self.store.list_names()
    }

    /// Serve until ctrl-c.
    pub async fn run(self) -> Result<SaveReport, ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
            log::info!("Interrupted, shutting down");
        })
        .await
    }

    /// Serve until `shutdown` completes, then save and release storage.
    pub async fn run_until<F>(self, shutdown: F) -> Result<SaveReport, ServerError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            config,
            listener,
            store,
        } = self;
        let autosave = if config.persistence_enabled() {
            config.autosave_interval
        } else {
            Duration::ZERO
        };
        let (hub_tx, hub_task) = hub::spawn(Hub::new(store), autosave);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let hub_tx = hub_tx.clone();
                        let auth = config.authenticator.clone();
                        let login_timeout = config.login_timeout;
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, addr, hub_tx, auth, login_timeout).await
                            {
                                log::warn!("Connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("Accept failed: {e}"),
                },
            }
        }

        let (done, report) = oneshot::channel();
        let report = if hub_tx.send(HubCommand::Shutdown { done }).is_ok() {
            report.await.unwrap_or_default()
        } else {
            SaveReport::default()
        };
        if let Err(e) = hub_task.await {
            log::error!("Hub task failed: {e}");
        }
        Ok(report)
    }
}

type ServerWs = WebSocketStream<TcpStream>;

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: HubTx,
    auth: Arc<dyn Authenticator>,
    login_timeout: Duration,
) -> Result<(), ConnectionError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (username, password) = tokio::time::timeout(login_timeout, read_login(&mut ws_receiver))
        .await
        .map_err(|_| ConnectionError::LoginTimeout(login_timeout))??;

    if !auth.authenticate(&username, &password) {
        log::info!("Rejected login for {username:?} from {addr}");
        let reject = ServerMessage::LoginRejected {
            reason: "invalid username or password".into(),
        };
        ws_sender.send(Message::Binary(reject.encode()?.into())).await?;
        ws_sender.send(Message::Close(None)).await?;
        return Ok(());
    }
    ws_sender
        .send(Message::Binary(ServerMessage::LoginAccepted.encode()?.into()))
        .await?;

    let avatar = AvatarId::new();
    let (outbox, outbox_rx) = mpsc::unbounded_channel::<ServerMessage>();
    hub.send(HubCommand::Attach {
        avatar,
        name: username,
        outbox,
    })
    .map_err(|_| ConnectionError::HubGone)?;
    log::info!("Avatar {avatar} logged in from {addr}");

    let result = serve_avatar(avatar, addr, &hub, &mut ws_sender, &mut ws_receiver, outbox_rx).await;
    let _ = hub.send(HubCommand::Detach { avatar });
    result
}

/// Wait for the first binary frame, which must be a login.
async fn read_login(
    ws_receiver: &mut SplitStream<ServerWs>,
) -> Result<(String, String), ConnectionError> {
    while let Some(frame) = ws_receiver.next().await {
        match frame? {
            Message::Binary(data) => {
                return match ClientMessage::decode(&data)? {
                    ClientMessage::Login { username, password } => Ok((username, password)),
                    other => Err(ProtocolError::UnexpectedFrame(format!("{other:?}")).into()),
                };
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ProtocolError::ConnectionClosed.into())
}

/// Pump frames between the socket and the hub until either side closes.
async fn serve_avatar(
    avatar: AvatarId,
    addr: SocketAddr,
    hub: &HubTx,
    ws_sender: &mut SplitSink<ServerWs, Message>,
    ws_receiver: &mut SplitStream<ServerWs>,
    mut outbox_rx: mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<(), ConnectionError> {
    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Binary(data))) => match ClientMessage::decode(&data) {
                    Ok(ClientMessage::Request { id, request }) => {
                        hub.send(HubCommand::Request { avatar, id, request })
                            .map_err(|_| ConnectionError::HubGone)?;
                    }
                    Ok(ClientMessage::Login { .. }) => {
                        log::warn!("Ignoring repeated login from {addr}");
                    }
                    Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                },
                Some(Ok(Message::Ping(data))) => {
                    ws_sender.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection closed from {addr}");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },

            msg = outbox_rx.recv() => match msg {
                Some(msg) => {
                    ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                }
                None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
        }
    }
}
