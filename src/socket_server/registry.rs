//! Session registry and its coordinating loop
//!
//! The registry task is the only owner of the session table. Everything that
//! changes the table arrives as a [`RegistryEvent`] on one unbounded queue, so
//! mutations are serialized and submitters never wait on the loop:
//!
//! ```text
//!   accept loop ──Join──┐
//!                       ├──► events queue ──► Registry::run ──► table
//!   handler tasks ──Error/Leave──┘                  │
//!                                                   └── spawns handler per admitted session
//!   RegistryHandle ──Snapshot/Shutdown──► control queue ──┘
//! ```
//!
//! A handler holds its session's stream until it submits `Leave`, which hands
//! the session back so the loop can unregister and close it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::SessionError;
use crate::socket_server::handler::ProtocolHandler;
use crate::socket_server::protocol::capacity_message;
use crate::socket_server::session::{PeerAddr, Session, SessionId};

/// Upper bound on notifying and closing a rejected connection, together
const REJECT_GRACE: Duration = Duration::from_millis(200);

/// Event submitted to the coordinating loop
pub enum RegistryEvent {
    /// Newly accepted connection asking for admission
    Join(Session),
    /// Handler finished; the session is handed back to be closed
    Leave(Session),
    /// Failure to log. `session` is `None` for accept-loop errors.
    Error {
        session: Option<SessionId>,
        cause: SessionError,
    },
    /// Handler task died without handing its session back
    Abandoned(SessionId),
}

impl RegistryEvent {
    fn kind(&self) -> &'static str {
        match self {
            RegistryEvent::Join(_) => "join",
            RegistryEvent::Leave(_) => "leave",
            RegistryEvent::Error { .. } => "error",
            RegistryEvent::Abandoned(_) => "abandoned",
        }
    }
}

impl fmt::Debug for RegistryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryEvent::Join(s) => f.debug_tuple("Join").field(&s.id()).finish(),
            RegistryEvent::Leave(s) => f.debug_tuple("Leave").field(&s.id()).finish(),
            RegistryEvent::Error { session, cause } => f
                .debug_struct("Error")
                .field("session", session)
                .field("cause", cause)
                .finish(),
            RegistryEvent::Abandoned(id) => f.debug_tuple("Abandoned").field(id).finish(),
        }
    }
}

/// Cloneable, non-blocking submission side of the events queue
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<RegistryEvent>,
}

impl EventSender {
    /// Create a sender and the receiver the coordinating loop drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event. Returns `false` if the registry has stopped, in which
    /// case the event is dropped (closing any session it carried).
    pub fn submit(&self, event: RegistryEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                tracing::warn!("Registry stopped, dropping {} event", event.kind());
                false
            }
        }
    }

    pub fn join(&self, session: Session) -> bool {
        self.submit(RegistryEvent::Join(session))
    }

    pub fn leave(&self, session: Session) -> bool {
        self.submit(RegistryEvent::Leave(session))
    }

    pub fn error(&self, session: Option<SessionId>, cause: SessionError) -> bool {
        self.submit(RegistryEvent::Error { session, cause })
    }
}

/// Lifetime counters kept by the coordinating loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub admitted: u64,
    pub rejected: u64,
    pub left: u64,
    pub errors: u64,
    pub abandoned: u64,
    /// Largest table size observed
    pub peak: usize,
}

/// A live table entry as seen from outside the loop
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub peer: PeerAddr,
    pub age: Duration,
}

/// Point-in-time view of the registry
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Live sessions, ordered by id
    pub sessions: Vec<SessionSummary>,
    pub stats: RegistryStats,
    pub max_sessions: usize,
}

impl RegistrySnapshot {
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.iter().any(|s| s.id == id)
    }
}

enum Control {
    Snapshot(oneshot::Sender<RegistrySnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle for submitting events to and controlling a running registry
#[derive(Clone)]
pub struct RegistryHandle {
    events: EventSender,
    control: mpsc::Sender<Control>,
}

impl RegistryHandle {
    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn submit(&self, event: RegistryEvent) -> bool {
        self.events.submit(event)
    }

    /// Current table contents and counters, or `None` once stopped
    pub async fn snapshot(&self) -> Option<RegistrySnapshot> {
        let (reply, rx) = oneshot::channel();
        self.control.send(Control::Snapshot(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Stop processing events and close every live session.
    ///
    /// Waits until the loop has finished closing. Calling it on a stopped
    /// registry is a no-op.
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self.control.send(Control::Shutdown(ack)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct SessionEntry {
    peer: PeerAddr,
    admitted_at: Instant,
    /// Handler task, aborted on shutdown
    handler: AbortHandle,
    /// Supervisor that reports a handler dying without a leave
    supervisor: JoinHandle<()>,
}

/// Owner of the session table; runs as a single task
pub struct Registry {
    table: HashMap<SessionId, SessionEntry>,
    max_sessions: usize,
    handler: Arc<ProtocolHandler>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<RegistryEvent>,
    control_rx: mpsc::Receiver<Control>,
    stats: RegistryStats,
}

impl Registry {
    /// Start the coordinating loop on the current runtime
    pub fn spawn(
        max_sessions: usize,
        handler: Arc<ProtocolHandler>,
    ) -> (RegistryHandle, JoinHandle<()>) {
        let (events_tx, events_rx) = EventSender::channel();
        let (control_tx, control_rx) = mpsc::channel(16);

        let registry = Self {
            table: HashMap::new(),
            max_sessions,
            handler,
            events_tx: events_tx.clone(),
            events_rx,
            control_rx,
            stats: RegistryStats::default(),
        };
        let task = tokio::spawn(registry.run());

        let handle = RegistryHandle {
            events: events_tx,
            control: control_tx,
        };
        (handle, task)
    }

    async fn run(mut self) {
        tracing::debug!(
            "Registry started (max {} sessions, {} handler)",
            self.max_sessions,
            self.handler.computation_name()
        );

        loop {
            tokio::select! {
                biased;

                control = self.control_rx.recv() => match control {
                    Some(Control::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Control::Shutdown(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    // Every handle dropped: nobody can shut us down later
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },

                Some(event) = self.events_rx.recv() => self.handle(event).await,
            }
        }
    }

    async fn handle(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Join(session) => self.join(session).await,
            RegistryEvent::Leave(session) => self.leave(session).await,
            RegistryEvent::Error { session, cause } => self.record_error(session, &cause),
            RegistryEvent::Abandoned(id) => self.abandon(id),
        }
    }

    async fn join(&mut self, mut session: Session) {
        let active = self.table.len();
        if active >= self.max_sessions {
            self.stats.rejected += 1;
            tracing::warn!(
                "Rejecting session {} from {}: at capacity ({} clients)",
                session.id(),
                session.peer(),
                active
            );
            let message = capacity_message(active);
            let notice = tokio::time::timeout(REJECT_GRACE, async {
                session.write_line(message.as_bytes()).await?;
                session.shutdown().await
            })
            .await;
            match notice {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("Capacity notice to {} failed: {}", session.id(), e),
                Err(_) => tracing::debug!("Capacity notice to {} timed out", session.id()),
            }
            // Dropping the session closes the stream
            return;
        }

        let id = session.id();
        let peer = session.peer().clone();

        let handler = Arc::clone(&self.handler);
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move { handler.run(session, events).await });
        let abort = task.abort_handle();

        let events = self.events_tx.clone();
        let supervisor = tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    events.submit(RegistryEvent::Abandoned(id));
                }
            }
        });

        self.table.insert(
            id,
            SessionEntry {
                peer: peer.clone(),
                admitted_at: Instant::now(),
                handler: abort,
                supervisor,
            },
        );
        self.stats.admitted += 1;
        self.stats.peak = self.stats.peak.max(self.table.len());

        tracing::info!(
            "Session {} joined from {} ({}/{} active)",
            id,
            peer,
            self.table.len(),
            self.max_sessions
        );
    }

    async fn leave(&mut self, session: Session) {
        let id = session.id();
        match self.table.remove(&id) {
            Some(entry) => {
                self.stats.left += 1;
                tracing::info!(
                    "Session {} left after {:?} ({} active)",
                    id,
                    entry.admitted_at.elapsed(),
                    self.table.len()
                );
            }
            None => tracing::debug!("Session {} left but was not registered", id),
        }
        session.close().await;
    }

    fn record_error(&mut self, session: Option<SessionId>, cause: &SessionError) {
        self.stats.errors += 1;
        match session {
            Some(id) => tracing::warn!("Session {} error: {}", id, cause),
            None => tracing::warn!("Listener error: {}", cause),
        }
    }

    fn abandon(&mut self, id: SessionId) {
        if self.table.remove(&id).is_some() {
            self.stats.abandoned += 1;
            tracing::error!(
                "Session {} handler panicked; removed ({} active)",
                id,
                self.table.len()
            );
        }
    }

    fn snapshot(&self) -> RegistrySnapshot {
        let mut sessions: Vec<SessionSummary> = self
            .table
            .iter()
            .map(|(id, entry)| SessionSummary {
                id: *id,
                peer: entry.peer.clone(),
                age: entry.admitted_at.elapsed(),
            })
            .collect();
        sessions.sort_by_key(|s| s.id);

        RegistrySnapshot {
            sessions,
            stats: self.stats,
            max_sessions: self.max_sessions,
        }
    }

    /// Stop taking events, abort live handlers (dropping their streams), and
    /// close any sessions still queued.
    async fn shutdown(&mut self) {
        self.events_rx.close();

        let live: Vec<(SessionId, SessionEntry)> = self.table.drain().collect();
        if !live.is_empty() {
            tracing::info!("Closing {} active sessions", live.len());
        }
        for (_, entry) in &live {
            entry.handler.abort();
        }
        for (id, entry) in live {
            if let Err(e) = entry.supervisor.await {
                tracing::warn!("Session {} supervisor failed: {}", id, e);
            }
        }

        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                RegistryEvent::Join(session) | RegistryEvent::Leave(session) => {
                    session.close().await
                }
                RegistryEvent::Error { session, cause } => self.record_error(session, &cause),
                RegistryEvent::Abandoned(_) => {}
            }
        }

        tracing::info!(
            "Registry stopped: {} admitted, {} rejected, {} errors",
            self.stats.admitted,
            self.stats.rejected,
            self.stats.errors
        );
    }
}
