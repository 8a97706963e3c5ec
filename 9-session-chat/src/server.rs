use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select,
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    message::Message,
    registry::ClientRegistry,
    session::{Role, Session, SessionConfig, SessionHandler, SessionId},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerConfig {
    /// Applied to every accepted session.
    pub session: SessionConfig,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already listening")]
    AlreadyListening,
    #[error("server has shut down")]
    ShutDown,
    #[error("failed to bind listener")]
    Bind(#[source] io::Error),
}

/// One entry of the server's diagnostic trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Listening {
        addr: SocketAddr,
    },
    Accepted {
        session: SessionId,
        peer: SocketAddr,
        live: usize,
    },
    /// `name` is the session's name before removal, `live` the count after.
    Closed {
        session: SessionId,
        name: String,
        live: usize,
    },
    AcceptFailed {
        error: String,
    },
    ShuttingDown,
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEvent::Listening { addr } => write!(f, "listening on {addr}"),
            ServerEvent::Accepted {
                session,
                peer,
                live,
            } => write!(f, "accepted session {session} from {peer}, live={live}"),
            ServerEvent::Closed {
                session,
                name,
                live,
            } => write!(f, "closed session {session} ({name}), live={live}"),
            ServerEvent::AcceptFailed { error } => write!(f, "accept failed: {error}"),
            ServerEvent::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

/// Accepts TCP connections and relays chat lines between them.
pub struct ChatServer {
    state: Arc<ServerState>,
    listening: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(ServerState::new(config)),
            listening: AtomicBool::new(false),
            local_addr: OnceLock::new(),
            accept_task: Mutex::new(None),
        }
    }

    /// Binds the listener and starts accepting. Only the first call binds.
    ///
    /// Returns the bound address, so `127.0.0.1:0` picks an ephemeral port.
    pub async fn listen<A>(&self, addr: A) -> Result<SocketAddr, ServerError>
    where
        A: ToSocketAddrs,
    {
        if self.state.is_stopping() {
            return Err(ServerError::ShutDown);
        }
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ServerError::AlreadyListening);
        }

        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        let addr = listener.local_addr().map_err(ServerError::Bind)?;
        let _ = self.local_addr.set(addr);
        self.state.record(ServerEvent::Listening { addr });

        let task = tokio::spawn(accept_loop(listener, Arc::clone(&self.state)));
        *self.accept_task.lock() = Some(task);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Queues `message` on every connected session.
    pub fn broadcast(&self, message: &Message) -> usize {
        self.state.registry.broadcast(message)
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.state.registry
    }

    /// Everything the server has logged so far, oldest first.
    pub fn logs(&self) -> Vec<ServerEvent> {
        self.state.events.lock().clone()
    }

    /// Stops accepting, closes every session and waits for them to deregister.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.state.begin_shutdown();

        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(err) = task.await {
                warn!(error = ?err, "accept loop ended abnormally");
            }
        }

        self.state.registry.drained().await;
        debug!("all sessions drained");
    }

    /// Runs until `signal` resolves or the server stops on its own, then shuts
    /// down.
    pub async fn run_until<F>(&self, signal: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut stopping = self.state.stopping.subscribe();
        select! {
            _ = signal => {}
            _ = stopped(&mut stopping) => {}
        }
        self.shutdown().await;
    }

    pub async fn run_until_ctrl_c(&self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

impl Drop for ChatServer {
    /// Stops accepting and closes every session. Does not wait for them.
    fn drop(&mut self) {
        self.state.begin_shutdown();
    }
}

struct ServerState {
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    events: Mutex<Vec<ServerEvent>>,
    stopping: watch::Sender<bool>,
}

impl ServerState {
    fn new(config: ServerConfig) -> Self {
        let (stopping, _) = watch::channel(false);
        Self {
            config,
            registry: Arc::new(ClientRegistry::new()),
            events: Mutex::new(Vec::new()),
            stopping,
        }
    }

    fn record(&self, event: ServerEvent) {
        info!("{event}");
        self.events.lock().push(event);
    }

    fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    fn begin_shutdown(&self) {
        let first = self.stopping.send_if_modified(|stopping| {
            let changed = !*stopping;
            *stopping = true;
            changed
        });
        if !first {
            return;
        }

        self.record(ServerEvent::ShuttingDown);
        self.registry.close_all();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    let mut stopping = state.stopping.subscribe();

    loop {
        select! {
            _ = stopped(&mut stopping) => break,
            accept_result = listener.accept() => {
                if !handle_accept_result(accept_result, &state) {
                    break;
                }
            }
        }
    }

    debug!("accept loop stopped");
}

async fn stopped(stopping: &mut watch::Receiver<bool>) {
    while !*stopping.borrow_and_update() {
        if stopping.changed().await.is_err() {
            return;
        }
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) -> bool {
    match result {
        Ok((stream, peer)) => {
            handle_incoming(stream, peer, state);
            true
        }
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            state.record(ServerEvent::AcceptFailed {
                error: err.to_string(),
            });
            state.begin_shutdown();
            false
        }
    }
}

fn handle_incoming(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let session = Session::with_config(Role::Server, state.config.session);

    // Register before opening so a session that dies at once still finds
    // itself in the registry when its close handler runs.
    let Some(live) = state.registry.add(session.clone()) else {
        return;
    };
    state.record(ServerEvent::Accepted {
        session: session.id(),
        peer,
        live,
    });

    let router = Arc::new(Router {
        state: Arc::clone(state),
    });
    if !session.open_tcp(stream, router) {
        state.registry.remove(session.id());
        return;
    }

    // Shutdown may have snapshotted the registry before this session joined.
    if state.is_stopping() {
        session.close();
    }
}

/// Server-side message routing installed on every accepted session.
struct Router {
    state: Arc<ServerState>,
}

impl SessionHandler for Router {
    fn on_message(&self, session: &Session, message: Message) {
        match message {
            Message::Name { .. } => {
                let name = message.display_name();
                debug!(session = %session.id(), old = %session.name(), new = %name, "renamed");
                session.set_name(name);
            }
            Message::Chat { .. } => {
                self.state.registry.broadcast(&message);
            }
        }
    }

    fn on_close(&self, session: &Session) {
        let name = session.name();
        if let Some((_, live)) = self.state.registry.remove(session.id()) {
            self.state.record(ServerEvent::Closed {
                session: session.id(),
                name,
                live,
            });
        }
    }
}
