//! One live connection and the two tasks that pump it.
//!
//! A [`Session`] owns its transport. [`Session::open`] splits the stream and
//! spawns a read pump and a write pump:
//!
//! - the read pump decodes one line at a time and hands every message to the
//!   session's [`SessionHandler`]; malformed lines are dropped and the session
//!   keeps going;
//! - the write pump is the only consumer of the bounded outbound queue. It also
//!   owns teardown: when the close signal arrives it stops the reader, shuts the
//!   writer down, marks the session `Closed` and fires `on_close`.
//!
//! [`Session::send`] and [`Session::close`] never await, so they are safe to
//! call from inside handler callbacks and while holding synchronous locks.

use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::{Notify, mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::message::{Message, read_message, write_message};

/// Default capacity of a session's outbound queue.
pub const MAX_PENDING: usize = 100;

/// Default gap allowed between write pump events before the session is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_NAME: &str = "anonymous";

/// Dropped messages retained per session. Older drops are only counted.
pub const DROP_LOG_CAPACITY: usize = 64;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side of the connection this session lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by a [`ChatServer`](crate::server::ChatServer).
    Server,
    /// Dialed with [`Session::dial`].
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotOpened,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Outbound queue capacity. Values below 1 are treated as 1.
    pub max_pending: usize,
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending: MAX_PENDING,
            idle_timeout: IDLE_TIMEOUT,
        }
    }
}

/// Diagnostic counters. Not used for any protocol decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub pending: usize,
    pub sent: u64,
    pub received: u64,
    pub dropped: usize,
}

/// Observer for a session's inbound traffic and its end of life.
///
/// Installed once by [`Session::open`] and released when the session reaches
/// [`SessionState::Closed`]. Callbacks run on the session's own tasks and must
/// not block.
pub trait SessionHandler: Send + Sync + 'static {
    fn on_message(&self, _session: &Session, _message: Message) {}

    /// Called exactly once, after the connection has been torn down.
    fn on_close(&self, _session: &Session) {}
}

impl SessionHandler for () {}

/// Cloneable handle to one connection. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Shared>,
}

struct Shared {
    id: SessionId,
    role: Role,
    config: SessionConfig,
    peer: OnceLock<SocketAddr>,
    name: Mutex<String>,
    opened: AtomicBool,
    state: AtomicU8,
    close_signal: Notify,
    closed: watch::Sender<bool>,
    outbound: mpsc::Sender<Message>,
    inbox: Mutex<Option<mpsc::Receiver<Message>>>,
    handler: Mutex<Option<Arc<dyn SessionHandler>>>,
    pending: AtomicUsize,
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicUsize,
    drop_log: Mutex<VecDeque<Message>>,
}

impl Session {
    pub fn new(role: Role) -> Self {
        Self::with_config(role, SessionConfig::default())
    }

    pub fn with_config(role: Role, config: SessionConfig) -> Self {
        let (outbound, inbox) = mpsc::channel(config.max_pending.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Shared {
                id: SessionId::next(),
                role,
                config,
                peer: OnceLock::new(),
                name: Mutex::new(DEFAULT_NAME.to_string()),
                opened: AtomicBool::new(false),
                state: AtomicU8::new(OPEN),
                close_signal: Notify::new(),
                closed,
                outbound,
                inbox: Mutex::new(Some(inbox)),
                handler: Mutex::new(None),
                pending: AtomicUsize::new(0),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                dropped: AtomicUsize::new(0),
                drop_log: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Connects to a chat server and opens a client-role session on it.
    pub async fn dial(
        addr: SocketAddr,
        config: SessionConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Session> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;

        let session = Session::with_config(Role::Client, config);
        session.open_tcp(stream, handler);
        info!(session = %session.id(), %addr, "connected to chat server");
        Ok(session)
    }

    /// Starts the read and write pumps over `stream`.
    ///
    /// Returns `false` and drops `stream` and `handler` when the session was
    /// already opened or has started closing.
    pub fn open<S>(&self, stream: S, handler: Arc<dyn SessionHandler>) -> bool
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self
            .inner
            .opened
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(session = %self.id(), "session already opened");
            return false;
        }

        // A close that raced ahead of us saw `opened == false` or will signal
        // a write pump that now never starts. Either way finish it here.
        if self.inner.state.load(Ordering::SeqCst) != OPEN {
            self.finish_close();
            return false;
        }

        let Some(inbox) = self.inner.inbox.lock().take() else {
            return false;
        };
        *self.inner.handler.lock() = Some(handler);

        let (reader, writer) = tokio::io::split(stream);
        let read_task = tokio::spawn(read_pump(self.clone(), BufReader::new(reader)));
        tokio::spawn(write_pump(self.clone(), writer, inbox, read_task));

        debug!(session = %self.id(), role = ?self.inner.role, "session opened");
        true
    }

    /// [`open`](Self::open) for TCP streams, recording the peer address.
    pub fn open_tcp(&self, stream: TcpStream, handler: Arc<dyn SessionHandler>) -> bool {
        if let Ok(peer) = stream.peer_addr() {
            let _ = self.inner.peer.set(peer);
        }
        self.open(stream, handler)
    }

    /// Queues `message` for the write pump without waiting.
    ///
    /// Closing or closed sessions discard the message. A full queue counts it
    /// as dropped and keeps it in the drop log instead of enqueueing it.
    pub fn send(&self, message: Message) {
        if self.inner.state.load(Ordering::SeqCst) != OPEN {
            return;
        }

        // Count before the item becomes visible so the writer never underflows.
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        match self.inner.outbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.inner.pending.fetch_sub(1, Ordering::AcqRel);
                warn!(
                    session = %self.id(),
                    name = %self.name(),
                    "outbound queue full, dropping message"
                );
                self.record_drop(message);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Begins shutting the session down. Only the first call has any effect.
    pub fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        debug!(session = %self.id(), "session closing");
        if self.inner.opened.load(Ordering::SeqCst) {
            self.inner.close_signal.notify_one();
        } else {
            self.finish_close();
        }
    }

    /// Resolves once the session is closed and `on_close` has returned.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer.get().copied()
    }

    pub fn name(&self) -> String {
        self.inner.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.inner.name.lock() = name.into();
    }

    pub fn state(&self) -> SessionState {
        match self.inner.state.load(Ordering::SeqCst) {
            CLOSED => SessionState::Closed,
            CLOSING => SessionState::Closing,
            _ if !self.inner.opened.load(Ordering::SeqCst) => SessionState::NotOpened,
            _ => SessionState::Open,
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            pending: self.inner.pending.load(Ordering::Acquire),
            sent: self.inner.sent.load(Ordering::Relaxed),
            received: self.inner.received.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// The most recent messages rejected because the outbound queue was full,
    /// oldest first. At most [`DROP_LOG_CAPACITY`] are kept; `stats().dropped`
    /// still counts every drop.
    pub fn dropped_messages(&self) -> Vec<Message> {
        self.inner.drop_log.lock().iter().cloned().collect()
    }

    fn record_drop(&self, message: Message) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        let mut log = self.inner.drop_log.lock();
        if log.len() == DROP_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(message);
    }

    fn deliver(&self, message: Message) {
        self.inner.received.fetch_add(1, Ordering::Relaxed);
        let handler = self.inner.handler.lock().clone();
        if let Some(handler) = handler {
            handler.on_message(self, message);
        }
    }

    fn finish_close(&self) {
        if self
            .inner
            .state
            .compare_exchange(CLOSING, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let handler = self.inner.handler.lock().take();
        info!(
            session = %self.id(),
            role = ?self.inner.role,
            name = %self.name(),
            "session closed"
        );
        if let Some(handler) = handler {
            handler.on_close(self);
        }
        self.inner.closed.send_replace(true);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("name", &self.name())
            .finish()
    }
}

async fn read_pump<R>(session: Session, mut reader: R)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_message(&mut reader).await {
            Ok(Some(Ok(message))) => session.deliver(message),
            Ok(Some(Err(err))) => {
                debug!(session = %session.id(), error = %err, "discarding malformed line");
            }
            Ok(None) => {
                debug!(session = %session.id(), "peer closed the connection");
                break;
            }
            Err(err) => {
                debug!(session = %session.id(), error = ?err, "read failed");
                break;
            }
        }
    }
    session.close();
}

async fn write_pump<W>(
    session: Session,
    mut writer: W,
    mut inbox: mpsc::Receiver<Message>,
    read_task: JoinHandle<()>,
) where
    W: AsyncWrite + Unpin,
{
    let idle_timeout = session.inner.config.idle_timeout;

    loop {
        // A fresh timer each pass: the timeout measures the gap since the last event.
        select! {
            biased;
            _ = session.inner.close_signal.notified() => break,
            queued = inbox.recv() => match queued {
                Some(message) => {
                    session.inner.pending.fetch_sub(1, Ordering::AcqRel);
                    deliver_to_peer(&session, &mut writer, &message, idle_timeout).await;
                }
                None => session.close(),
            },
            _ = sleep(idle_timeout) => {
                info!(
                    session = %session.id(),
                    name = %session.name(),
                    timeout = ?idle_timeout,
                    "session idle, closing"
                );
                session.close();
            }
        }
    }

    read_task.abort();
    let _ = read_task.await;
    if let Err(err) = writer.shutdown().await {
        debug!(session = %session.id(), error = ?err, "failed to shut down writer");
    }
    drop(writer);

    session.finish_close();
}

async fn deliver_to_peer<W>(session: &Session, writer: &mut W, message: &Message, limit: Duration)
where
    W: AsyncWrite + Unpin,
{
    match timeout(limit, write_message(writer, message)).await {
        Ok(Ok(())) => {
            session.inner.sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(err)) => {
            warn!(session = %session.id(), error = ?err, "write failed, closing session");
            session.close();
        }
        Err(_) => {
            warn!(session = %session.id(), "write stalled, closing session");
            session.close();
        }
    }
}
