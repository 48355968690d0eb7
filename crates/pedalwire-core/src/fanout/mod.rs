// ── Event fan-out ──
//
// Per-client topic subscriptions over the aggregator's unified event
// stream, plus the message-based control surface. Subscription sets never
// leave this module.

pub mod protocol;

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::error::CoreError;
use crate::model::{Topic, UnifiedEvent};

pub use protocol::{ClientMessage, ErrorBody, RequestId, ServerMessage};

/// Default per-client outbound queue depth.
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Identifies one connected client.
pub type ClientId = Uuid;

struct ClientSlot {
    topics: BTreeSet<Topic>,
    tx: mpsc::Sender<ServerMessage>,
}

/// Delivers unified events to subscribed clients and answers their
/// control messages.
///
/// Cheaply cloneable. A client whose queue is full misses events rather
/// than stalling delivery to everyone else.
#[derive(Clone)]
pub struct Fanout {
    inner: Arc<FanoutInner>,
}

struct FanoutInner {
    aggregator: Aggregator,
    clients: DashMap<ClientId, ClientSlot>,
    client_buffer: usize,
    cancel: CancellationToken,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl Fanout {
    pub fn new(aggregator: Aggregator, client_buffer: usize) -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                aggregator,
                clients: DashMap::new(),
                client_buffer: client_buffer.max(1),
                cancel: CancellationToken::new(),
                delivery: Mutex::new(None),
            }),
        }
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.inner.aggregator
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Spawn the delivery task. Idempotent.
    pub async fn start(&self) {
        let mut slot = self.inner.delivery.lock().await;
        if slot.is_some() {
            return;
        }
        let rx = self.inner.aggregator.events();
        let fanout = self.clone();
        let cancel = self.inner.cancel.clone();
        *slot = Some(tokio::spawn(delivery_task(fanout, rx, cancel)));
    }

    /// Stop delivery and drop every client queue.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.delivery.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.clients.clear();
    }

    // ── Clients ──────────────────────────────────────────────────

    /// Register a client with no subscriptions. Messages for it arrive on
    /// the returned receiver.
    pub fn register_client(&self) -> (ClientId, mpsc::Receiver<ServerMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.client_buffer);
        self.inner.clients.insert(
            id,
            ClientSlot {
                topics: BTreeSet::new(),
                tx,
            },
        );
        debug!(client_id = %id, "client registered");
        (id, rx)
    }

    pub fn remove_client(&self, id: ClientId) {
        if self.inner.clients.remove(&id).is_some() {
            debug!(client_id = %id, "client removed");
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Topics a client is subscribed to.
    pub fn topics(&self, id: ClientId) -> Option<Vec<Topic>> {
        self.inner
            .clients
            .get(&id)
            .map(|slot| slot.topics.iter().copied().collect())
    }

    // ── Control surface ──────────────────────────────────────────

    /// Parse and handle one text frame. Unparsable input yields an error
    /// response.
    pub async fn handle_text(&self, client: ClientId, text: &str) -> ServerMessage {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(client, msg).await,
            Err(e) => {
                debug!(client_id = %client, error = %e, "unparsable client message");
                ServerMessage::failure(
                    None,
                    &CoreError::InvalidRequest {
                        message: e.to_string(),
                    },
                )
            }
        }
    }

    /// Handle one control message. Awaits the underlying aggregator or
    /// session call before returning its structured outcome.
    pub async fn handle(&self, client: ClientId, msg: ClientMessage) -> ServerMessage {
        let request_id = msg.request_id().cloned();
        match msg {
            ClientMessage::Subscribe { topic, .. } => {
                self.set_subscription(client, topic, true, request_id)
            }
            ClientMessage::Unsubscribe { topic, .. } => {
                self.set_subscription(client, topic, false, request_id)
            }
            other => {
                let Some(cmd) = other.command() else {
                    return ServerMessage::failure(
                        request_id,
                        &CoreError::Internal("message has no command".into()),
                    );
                };
                let result = self.inner.aggregator.execute(cmd).await;
                ServerMessage::from_result(request_id, result)
            }
        }
    }

    fn set_subscription(
        &self,
        client: ClientId,
        topic: Topic,
        subscribe: bool,
        request_id: Option<RequestId>,
    ) -> ServerMessage {
        let Some(mut slot) = self.inner.clients.get_mut(&client) else {
            return ServerMessage::failure(
                request_id,
                &CoreError::InvalidRequest {
                    message: format!("unknown client {client}"),
                },
            );
        };
        if subscribe {
            slot.topics.insert(topic);
            ServerMessage::ok(request_id, format!("subscribed to {topic}"))
        } else {
            slot.topics.remove(&topic);
            ServerMessage::ok(request_id, format!("unsubscribed from {topic}"))
        }
    }

    // ── Delivery ─────────────────────────────────────────────────

    /// Deliver one event to every client subscribed to its topic. Returns
    /// how many clients received it.
    fn deliver(&self, event: &Arc<UnifiedEvent>) -> usize {
        let topic = event.topic();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in &self.inner.clients {
            if !entry.topics.contains(&topic) {
                continue;
            }
            let msg = ServerMessage::Event {
                topic,
                event: Arc::clone(event),
            };
            match entry.tx.try_send(msg) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client_id = %entry.key(), %topic, "client queue full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        for id in closed {
            self.remove_client(id);
        }
        delivered
    }
}

async fn delivery_task(
    fanout: Fanout,
    mut rx: broadcast::Receiver<Arc<UnifiedEvent>>,
    cancel: CancellationToken,
) {
    info!("fanout delivery started");
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = rx.recv() => match result {
                Ok(event) => {
                    fanout.deliver(&event);
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "fanout lagged behind the event stream");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
    debug!("fanout delivery stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::AggregatorConfig;
    use crate::persistence::MemoryStore;

    fn fanout(buffer: usize) -> Fanout {
        let agg = Aggregator::new(AggregatorConfig::default(), Vec::new(), Arc::new(MemoryStore::new()));
        Fanout::new(agg, buffer)
    }

    fn transport_event() -> Arc<UnifiedEvent> {
        Arc::new(UnifiedEvent::TransportStatus {
            transport: pedalwire_radio::Transport::Ant,
            available: true,
            reason: None,
        })
    }

    #[tokio::test]
    async fn delivers_only_to_matching_topics() {
        let f = fanout(8);
        let (a, mut rx_a) = f.register_client();
        let (b, mut rx_b) = f.register_client();
        f.handle_text(a, r#"{"type":"subscribe","topic":"device-events"}"#).await;
        f.handle_text(b, r#"{"type":"subscribe","topic":"sensor-data"}"#).await;

        assert_eq!(f.deliver(&transport_event()), 1);
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerMessage::Event { topic: Topic::DeviceEvents, .. }
        ));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let f = fanout(8);
        let (a, mut rx) = f.register_client();
        f.handle_text(a, r#"{"type":"subscribe","topic":"device-events"}"#).await;
        f.handle_text(a, r#"{"type":"unsubscribe","topic":"device-events"}"#).await;
        assert_eq!(f.deliver(&transport_event()), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(f.topics(a).unwrap(), Vec::<Topic>::new());
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let f = fanout(1);
        let (a, _rx) = f.register_client();
        f.handle_text(a, r#"{"type":"subscribe","topic":"device-events"}"#).await;
        assert_eq!(f.deliver(&transport_event()), 1);
        assert_eq!(f.deliver(&transport_event()), 0);
        assert_eq!(f.client_count(), 1);
    }

    #[tokio::test]
    async fn closed_clients_are_pruned() {
        let f = fanout(4);
        let (a, rx) = f.register_client();
        f.handle_text(a, r#"{"type":"subscribe","topic":"device-events"}"#).await;
        drop(rx);
        f.deliver(&transport_event());
        assert_eq!(f.client_count(), 0);
    }

    #[tokio::test]
    async fn garbage_gets_an_error_response() {
        let f = fanout(4);
        let (a, _rx) = f.register_client();
        let reply = f.handle_text(a, "not json").await;
        assert!(matches!(
            reply,
            ServerMessage::Response { success: false, error: Some(ErrorBody { ref code, .. }), .. }
                if code == "invalid_request"
        ));
    }

    #[tokio::test]
    async fn request_id_is_echoed() {
        let f = fanout(4);
        let (a, _rx) = f.register_client();
        let reply = f
            .handle_text(a, r#"{"type":"stop-session","request_id":"r-1"}"#)
            .await;
        assert!(matches!(
            reply,
            ServerMessage::Response { request_id: Some(ref id), success: false, .. } if id == "r-1"
        ));
    }
}
