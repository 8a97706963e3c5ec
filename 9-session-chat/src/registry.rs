use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use crate::{
    message::Message,
    session::{Session, SessionId},
};

/// The set of live sessions a server broadcasts to.
///
/// Keyed by [`SessionId`], so removal never depends on slot positions. Add and
/// remove take the write lock; broadcast and lookups take the read lock. The
/// lock is never held across an await, and [`Session::send`] never blocks.
pub struct ClientRegistry {
    sessions: RwLock<HashMap<SessionId, Session>>,
    live: watch::Sender<usize>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (live, _) = watch::channel(0);
        Self {
            sessions: RwLock::new(HashMap::new()),
            live,
        }
    }

    /// Registers `session` and returns the new live count, or `None` if it is
    /// already present.
    pub fn add(&self, session: Session) -> Option<usize> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id()) {
            return None;
        }
        sessions.insert(session.id(), session);
        let live = sessions.len();
        self.live.send_replace(live);
        Some(live)
    }

    /// Removes the session with `id`, returning it with the remaining live count.
    pub fn remove(&self, id: SessionId) -> Option<(Session, usize)> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(&id)?;
        let live = sessions.len();
        self.live.send_replace(live);
        Some((removed, live))
    }

    /// Queues `message` on every live session and returns how many were tried.
    ///
    /// Each recipient applies its own backpressure, so one slow session only
    /// loses its own copy.
    pub fn broadcast(&self, message: &Message) -> usize {
        let sessions = self.sessions.read();
        for session in sessions.values() {
            session.send(message.clone());
        }
        debug!(recipients = sessions.len(), "broadcast message");
        sessions.len()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of the live sessions, in no particular order.
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    /// Watches the number of live sessions.
    pub fn live_count(&self) -> watch::Receiver<usize> {
        self.live.subscribe()
    }

    /// Resolves once no sessions are registered.
    pub async fn drained(&self) {
        let mut live = self.live.subscribe();
        while *live.borrow_and_update() != 0 {
            if live.changed().await.is_err() {
                return;
            }
        }
    }

    /// Asks every live session to close. Sessions leave the registry through
    /// their own close handling.
    pub fn close_all(&self) {
        // Snapshot first: closing an unopened session runs its close path inline.
        for session in self.sessions() {
            session.close();
        }
    }
}
