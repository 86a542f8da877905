//! Server-to-client notification delivery
//!
//! The [`NotificationHub`] owns the push side of the protocol: immediate
//! delivery over an attached SSE stream when a session is connected, FIFO
//! queueing when it is not, backlog drain on attach, and periodic heartbeats
//! that keep the connection alive and surface broken pipes.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::protocol::{notifications, JsonRpcNotification};
use crate::session::{PushEvent, Session, SessionStore, StreamHandle};

/// Default interval between heartbeat events on an attached stream.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// SSE event names used on the push stream.
pub mod events {
    pub const CONNECTED: &str = "connected";
    pub const NOTIFICATION: &str = "notification";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Fan-out point for server-initiated notifications.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    store: Arc<SessionStore>,
    heartbeat_interval: Duration,
}

impl NotificationHub {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Deliver a notification to one session: push immediately if a stream is
    /// attached, queue otherwise. An unknown session id is logged and dropped.
    pub fn notify_session(&self, session_id: &str, notification: JsonRpcNotification) {
        let Some(session) = self.store.get(session_id) else {
            tracing::warn!(
                session_id = %session_id,
                method = %notification.method,
                "Dropping notification for unknown session"
            );
            return;
        };
        self.dispatch_to(&session, notification);
    }

    fn dispatch_to(&self, session: &Session, notification: JsonRpcNotification) {
        match notification_event(&notification) {
            // One call under the session lock: send live, or queue when no
            // stream is attached or the write fails.
            Some(event) => {
                session.push_or_enqueue(event, notification);
            }
            None => session.enqueue(notification),
        }
    }

    /// Deliver a notification to every connected session. Sessions without an
    /// attached stream are skipped, not queued. Returns the delivery count.
    pub fn broadcast(&self, notification: JsonRpcNotification) -> usize {
        let Some(event) = notification_event(&notification) else {
            return 0;
        };
        let mut delivered = 0;
        for session in self.store.all() {
            if !session.is_connected() {
                continue;
            }
            if session.try_push(event.clone()) {
                delivered += 1;
            }
        }
        tracing::debug!(
            method = %notification.method,
            delivered,
            "Broadcast notification"
        );
        delivered
    }

    /// Route a notification to one session or to all connected ones.
    fn emit(&self, target: Option<&str>, notification: JsonRpcNotification) {
        match target {
            Some(session_id) => self.notify_session(session_id, notification),
            None => {
                self.broadcast(notification);
            }
        }
    }

    pub fn tools_list_changed(&self, target: Option<&str>) {
        self.emit(
            target,
            JsonRpcNotification::new(notifications::TOOLS_LIST_CHANGED),
        );
    }

    pub fn resources_list_changed(&self, target: Option<&str>) {
        self.emit(
            target,
            JsonRpcNotification::new(notifications::RESOURCES_LIST_CHANGED),
        );
    }

    pub fn prompts_list_changed(&self, target: Option<&str>) {
        self.emit(
            target,
            JsonRpcNotification::new(notifications::PROMPTS_LIST_CHANGED),
        );
    }

    pub fn resource_updated(&self, target: Option<&str>, uri: &str) {
        self.emit(
            target,
            JsonRpcNotification::new(notifications::RESOURCE_UPDATED)
                .with_params(json!({ "uri": uri })),
        );
    }

    pub fn progress(
        &self,
        target: Option<&str>,
        token: serde_json::Value,
        progress: f64,
        total: Option<f64>,
    ) {
        let mut params = json!({ "progressToken": token, "progress": progress });
        if let Some(total) = total {
            params["total"] = json!(total);
        }
        self.emit(
            target,
            JsonRpcNotification::new(notifications::PROGRESS).with_params(params),
        );
    }

    /// Attach a push stream to a session, replacing any previous one.
    ///
    /// The returned stream yields, in order: a `connected` acknowledgement,
    /// the session's queued backlog (FIFO), then live notifications
    /// interleaved with heartbeats. Dropping the stream detaches the session.
    pub fn attach(&self, session: &Arc<Session>) -> SessionEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = StreamHandle::new(tx.clone(), cancel.clone());
        let stream_id = handle.id;

        // Ack and backlog drain happen inside the session's push lock, so a
        // delivery racing this attach cannot overtake older queued entries.
        let ack = PushEvent::new(
            events::CONNECTED,
            json!({ "sessionId": session.id() }).to_string(),
        );
        let drained = session.attach_stream(handle, ack, notification_event);
        if drained > 0 {
            tracing::info!(
                session_id = %session.id(),
                count = drained,
                "Drained queued notifications"
            );
        }

        let interval = self.heartbeat_interval;
        let heartbeat_session = session.id().to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if tx.send(PushEvent::new(events::HEARTBEAT, unix_timestamp())).is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(session_id = %heartbeat_session, "Heartbeat task stopped");
        });

        SessionEventStream {
            session: session.clone(),
            stream_id,
            rx: UnboundedReceiverStream::new(rx),
        }
    }
}

fn unix_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .to_string()
}

/// Serialize a notification into its SSE frame. Serialization of these types
/// cannot realistically fail; if it does, the notification is logged and
/// dropped rather than poisoning the stream.
fn notification_event(notification: &JsonRpcNotification) -> Option<PushEvent> {
    match serde_json::to_string(notification) {
        Ok(data) => Some(PushEvent::new(events::NOTIFICATION, data)),
        Err(e) => {
            tracing::error!(
                method = %notification.method,
                error = %e,
                "Failed to serialize notification"
            );
            None
        }
    }
}

/// Push stream handed to the transport layer. Detaches its session on drop,
/// unless a newer stream has already replaced it.
pub struct SessionEventStream {
    session: Arc<Session>,
    stream_id: u64,
    rx: UnboundedReceiverStream<PushEvent>,
}

impl Stream for SessionEventStream {
    type Item = PushEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for SessionEventStream {
    fn drop(&mut self) {
        if self.session.detach_stream_matching(self.stream_id) {
            tracing::debug!(session_id = %self.session.id(), "Client stream closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn hub() -> (NotificationHub, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::new());
        (NotificationHub::new(store.clone()), store)
    }

    async fn next_event(stream: &mut SessionEventStream) -> PushEvent {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_attach_sends_connected_ack_first() {
        let (hub, store) = hub();
        let session = store.create("s1").unwrap();

        let mut stream = hub.attach(&session);
        let ack = next_event(&mut stream).await;
        assert_eq!(ack.event, events::CONNECTED);
        assert!(ack.data.contains("s1"));
    }

    #[tokio::test]
    async fn test_attach_drains_backlog_in_order() {
        let (hub, store) = hub();
        let session = store.create("s1").unwrap();
        hub.notify_session("s1", JsonRpcNotification::new("first"));
        hub.notify_session("s1", JsonRpcNotification::new("second"));
        assert_eq!(session.pending_len(), 2);

        let mut stream = hub.attach(&session);
        let _ack = next_event(&mut stream).await;
        let a = next_event(&mut stream).await;
        let b = next_event(&mut stream).await;
        assert_eq!(a.event, events::NOTIFICATION);
        assert!(a.data.contains("first"));
        assert!(b.data.contains("second"));
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delivery_racing_attach_never_overtakes_backlog() {
        // A notification arriving while a stream attaches must come out after
        // the drained backlog, whichever side wins the race.
        for _ in 0..50 {
            let (hub, store) = hub();
            let session = store.create("s1").unwrap();
            hub.notify_session("s1", JsonRpcNotification::new("older"));

            let racing_hub = hub.clone();
            let racer = tokio::spawn(async move {
                racing_hub.notify_session("s1", JsonRpcNotification::new("newer"));
            });
            let mut stream = hub.attach(&session);
            racer.await.unwrap();

            let mut order = Vec::new();
            while order.len() < 2 {
                let event = next_event(&mut stream).await;
                if event.event == events::NOTIFICATION {
                    order.push(event.data);
                }
            }
            assert!(order[0].contains("older"), "got {order:?}");
            assert!(order[1].contains("newer"), "got {order:?}");
        }
    }

    #[tokio::test]
    async fn test_notify_connected_session_is_immediate() {
        let (hub, store) = hub();
        let session = store.create("s1").unwrap();
        let mut stream = hub.attach(&session);
        let _ack = next_event(&mut stream).await;

        hub.notify_session("s1", JsonRpcNotification::new("live"));
        let event = next_event(&mut stream).await;
        assert_eq!(event.event, events::NOTIFICATION);
        assert!(event.data.contains("live"));
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_notify_disconnected_session_queues() {
        let (hub, store) = hub();
        let session = store.create("s1").unwrap();

        hub.notify_session("s1", JsonRpcNotification::new("queued"));
        assert_eq!(session.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_notify_unknown_session_is_dropped() {
        let (hub, store) = hub();
        hub.notify_session("ghost", JsonRpcNotification::new("lost"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skips_disconnected() {
        let (hub, store) = hub();
        let connected = store.create("on").unwrap();
        let offline = store.create("off").unwrap();
        let mut stream = hub.attach(&connected);
        let _ack = next_event(&mut stream).await;

        let delivered = hub.broadcast(JsonRpcNotification::new("fanout"));
        assert_eq!(delivered, 1);

        let event = next_event(&mut stream).await;
        assert!(event.data.contains("fanout"));
        // Broadcast never queues for offline sessions.
        assert_eq!(offline.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_arrives_on_idle_stream() {
        let (hub, store) = hub();
        let hub = hub.with_heartbeat_interval(Duration::from_millis(20));
        let session = store.create("s1").unwrap();

        let mut stream = hub.attach(&session);
        let _ack = next_event(&mut stream).await;
        let beat = next_event(&mut stream).await;
        assert_eq!(beat.event, events::HEARTBEAT);
        // Data is a unix timestamp in seconds.
        assert!(beat.data.parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn test_drop_detaches_session() {
        let (hub, store) = hub();
        let session = store.create("s1").unwrap();

        let stream = hub.attach(&session);
        assert!(session.is_connected());
        drop(stream);
        assert!(!session.is_connected());

        // Post-disconnect notifications go back to the queue.
        hub.notify_session("s1", JsonRpcNotification::new("later"));
        assert_eq!(session.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_replacement_stream_survives_old_drop() {
        let (hub, store) = hub();
        let session = store.create("s1").unwrap();

        let old = hub.attach(&session);
        let mut new = hub.attach(&session);
        drop(old);

        assert!(session.is_connected());
        let ack = next_event(&mut new).await;
        assert_eq!(ack.event, events::CONNECTED);
    }

    #[tokio::test]
    async fn test_progress_emitter_includes_total_when_given() {
        let (hub, store) = hub();
        let session = store.create("s1").unwrap();

        hub.progress(Some("s1"), json!("op-1"), 0.5, Some(1.0));
        let pending = session.drain_pending();
        assert_eq!(pending.len(), 1);
        let params = pending[0].params.clone().unwrap();
        assert_eq!(params["progressToken"], "op-1");
        assert_eq!(params["total"], 1.0);
    }
}
