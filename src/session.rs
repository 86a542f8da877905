//! Session lifecycle state and the concurrent session store
//!
//! A session exists from the moment `initialize` is processed until explicit
//! deletion or expiry. It tracks the initialize handshake flag, the optional
//! attached push stream, and the FIFO queue of notifications awaiting delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::{JsonRpcNotification, LogLevel};

/// Default session expiry threshold: 24 hours.
pub const DEFAULT_SESSION_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// A single event pushed over a session's SSE channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    /// SSE event name (`connected`, `notification`, `heartbeat`)
    pub event: String,
    /// SSE data payload
    pub data: String,
}

impl PushEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a session's live push channel: the sending half of the SSE
/// stream plus the token that tears down its heartbeat task. Each handle
/// carries a process-unique id so a stale stream can tell whether it is
/// still the one attached.
#[derive(Debug)]
pub struct StreamHandle {
    pub(crate) id: u64,
    pub(crate) tx: mpsc::UnboundedSender<PushEvent>,
    pub(crate) cancel: CancellationToken,
}

impl StreamHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PushEvent>, cancel: CancellationToken) -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            cancel,
        }
    }
}

/// Stream handle and pending queue behind one lock. Attach (ack + backlog
/// drain) and delivery both take it, so a delivery racing an attach either
/// lands in the queue before the drain or on the channel after it; it can
/// never jump ahead of older queued notifications.
#[derive(Debug, Default)]
struct PushState {
    /// At most one attached stream at a time
    stream: Option<StreamHandle>,
    /// Notifications awaiting delivery, FIFO. Retention is tied to session
    /// expiry: the queue lives and dies with the session.
    pending: VecDeque<JsonRpcNotification>,
}

/// Server-side state for one client conversation.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: Instant,
    initialized: AtomicBool,
    /// Mirrors `push.stream.is_some()`, for lock-free connectivity checks
    connected: AtomicBool,
    push: Mutex<PushState>,
    /// Minimum level requested via `logging/setLevel`
    log_level: Mutex<LogLevel>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            initialized: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            push: Mutex::new(PushState::default()),
            log_level: Mutex::new(LogLevel::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Transition Pending -> Ready. Returns false if already Ready; the
    /// transition happens exactly once.
    pub fn mark_initialized(&self) -> bool {
        self.initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn log_level(&self) -> LogLevel {
        *self.log_level.lock().unwrap()
    }

    pub fn set_log_level(&self, level: LogLevel) {
        *self.log_level.lock().unwrap() = level;
    }

    /// Attach a live push channel, cancelling any previously attached one.
    /// Under the lock: send the acknowledgement event, drain the pending
    /// queue through `frame` in FIFO order, then install the handle. Returns
    /// the number of backlog notifications drained.
    pub(crate) fn attach_stream<F>(&self, handle: StreamHandle, ack: PushEvent, frame: F) -> usize
    where
        F: Fn(&JsonRpcNotification) -> Option<PushEvent>,
    {
        let mut push = self.push.lock().unwrap();
        if let Some(old) = push.stream.take() {
            tracing::debug!(session_id = %self.id, "Replacing existing stream");
            old.cancel.cancel();
        }
        let _ = handle.tx.send(ack);

        let mut drained = 0;
        while let Some(notification) = push.pending.pop_front() {
            if let Some(event) = frame(&notification) {
                let _ = handle.tx.send(event);
            }
            drained += 1;
        }

        push.stream = Some(handle);
        self.connected.store(true, Ordering::Release);
        drained
    }

    /// Detach the push channel: cancel its heartbeat, clear the handle, and
    /// revert to queue-on-deliver mode. Pending notifications are preserved.
    pub(crate) fn detach_stream(&self) {
        let mut push = self.push.lock().unwrap();
        if let Some(handle) = push.stream.take() {
            handle.cancel.cancel();
        }
        self.connected.store(false, Ordering::Release);
    }

    /// Detach only if the attached stream is the one identified by
    /// `stream_id`. Lets a finished stream clean up after itself without
    /// clobbering a replacement that attached in the meantime.
    pub(crate) fn detach_stream_matching(&self, stream_id: u64) -> bool {
        let mut push = self.push.lock().unwrap();
        match push.stream.as_ref() {
            Some(handle) if handle.id == stream_id => {
                if let Some(handle) = push.stream.take() {
                    handle.cancel.cancel();
                }
                self.connected.store(false, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Deliver over the attached stream, or queue when there is none (or the
    /// write fails, which also detaches). Returns true when sent live.
    pub(crate) fn push_or_enqueue(
        &self,
        event: PushEvent,
        notification: JsonRpcNotification,
    ) -> bool {
        let mut push = self.push.lock().unwrap();
        if let Some(handle) = push.stream.as_ref() {
            if handle.tx.send(event).is_ok() {
                return true;
            }
            // Receiver dropped: broken pipe. Treat as disconnect.
            tracing::warn!(session_id = %self.id, "Stream write failed, detaching");
            if let Some(handle) = push.stream.take() {
                handle.cancel.cancel();
            }
            self.connected.store(false, Ordering::Release);
        }
        tracing::debug!(
            session_id = %self.id,
            method = %notification.method,
            "Queued notification"
        );
        push.pending.push_back(notification);
        false
    }

    /// Push an event over the attached stream. Returns false if no stream is
    /// attached or the write fails; a failed write detaches the stream.
    pub(crate) fn try_push(&self, event: PushEvent) -> bool {
        let mut push = self.push.lock().unwrap();
        let Some(handle) = push.stream.as_ref() else {
            return false;
        };
        if handle.tx.send(event).is_ok() {
            return true;
        }
        tracing::warn!(session_id = %self.id, "Stream write failed, detaching");
        if let Some(handle) = push.stream.take() {
            handle.cancel.cancel();
        }
        self.connected.store(false, Ordering::Release);
        false
    }

    /// Append a notification to the pending queue.
    pub(crate) fn enqueue(&self, notification: JsonRpcNotification) {
        self.push.lock().unwrap().pending.push_back(notification);
    }

    /// Drain the pending queue in enqueue order.
    pub(crate) fn drain_pending(&self) -> Vec<JsonRpcNotification> {
        self.push.lock().unwrap().pending.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.push.lock().unwrap().pending.len()
    }
}

/// Concurrent map of session id to session state.
///
/// This is the single shared-mutable-state boundary of the engine; every
/// operation is safe to call from any request-handling task. Per-session
/// mutation goes through the `Arc<Session>` handles it returns.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session under a caller-generated id (UUIDv4 in
    /// practice). Fails if the id is already present.
    pub fn create(&self, id: impl Into<String>) -> Result<Arc<Session>> {
        let id = id.into();
        let mut sessions = self.sessions.write().unwrap();
        if sessions.contains_key(&id) {
            return Err(Error::Session(format!("Session {id} already exists")));
        }
        let session = Arc::new(Session::new(id.clone()));
        sessions.insert(id.clone(), session.clone());
        tracing::debug!(session_id = %id, total = sessions.len(), "Created session");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    /// Mark a session Ready. Logs a warning and returns false if the session
    /// is absent or was already Ready.
    pub fn mark_initialized(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                let transitioned = session.mark_initialized();
                if transitioned {
                    tracing::info!(session_id = %id, "Session initialized");
                }
                transitioned
            }
            None => {
                tracing::warn!(session_id = %id, "Unknown session in initialized notification");
                false
            }
        }
    }

    pub fn is_initialized(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => session.is_initialized(),
            None => {
                tracing::warn!(session_id = %id, "Initialization check for unknown session");
                false
            }
        }
    }

    /// Remove a session, cancelling any attached stream. Returns false if the
    /// id was unknown; removal is idempotent.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().unwrap().remove(id);
        match removed {
            Some(session) => {
                session.detach_stream();
                tracing::info!(session_id = %id, "Removed session");
                true
            }
            None => false,
        }
    }

    /// Remove and cancel every session older than `max_age`. Returns the
    /// number of sessions removed.
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().unwrap();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.age() > max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &expired {
            session.detach_stream();
            tracing::info!(session_id = %session.id(), "Removed expired session");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }

    /// Snapshot of all sessions, for broadcast fan-out.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }
}
