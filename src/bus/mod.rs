//! Topic-based publish/subscribe bus connecting dispatcher, nodes and clients.
//!
//! Every participant holds a [`BusConnection`] identified by a connection id
//! handed out at connect time. Delivery is fire-and-forget and at most once:
//! a message goes to whoever is subscribed to the topic at send time and is
//! dropped when nobody is. Closing a connection (explicitly or through
//! [`MessageBus::drop_connection`]) ends all of its subscription streams,
//! which is how peers notice they have to reconnect.
//!
//! Connection lifecycle is observable through [`MessageBus::watch`].

pub mod message;
pub mod topic;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::error::{GridError, Result};

pub use message::{GridMessage, NodeReady, TaskDescriptor, TaskResult, TaskStarted};

pub type ConnectionId = String;

const EVENT_CAPACITY: usize = 256;

/// A message as received by a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub from: ConnectionId,
    pub topic: String,
    pub body: GridMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub topics: Vec<String>,
}

struct SubscriptionEntry {
    topic: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

struct ConnectionEntry {
    connected_at: DateTime<Utc>,
    subscriptions: HashMap<String, SubscriptionEntry>,
}

#[derive(Default)]
struct BusState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

#[derive(Clone)]
pub struct MessageBus {
    state: Arc<Mutex<BusState>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new connection with a fresh id
    pub fn connect(&self) -> BusConnection {
        let id = Uuid::new_v4().to_string();
        self.lock().connections.insert(
            id.clone(),
            ConnectionEntry {
                connected_at: Utc::now(),
                subscriptions: HashMap::new(),
            },
        );
        tracing::debug!(conn_id = %id, "Bus connection opened");
        let _ = self.events.send(ConnectionEvent::Connected(id.clone()));
        BusConnection {
            id,
            bus: self.clone(),
        }
    }

    /// Close a connection from the bus side. Its subscription streams end.
    pub fn drop_connection(&self, id: &str) -> bool {
        let removed = self.lock().connections.remove(id).is_some();
        if removed {
            tracing::debug!(conn_id = %id, "Bus connection closed");
            let _ = self.events.send(ConnectionEvent::Disconnected(id.to_string()));
        }
        removed
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.lock().connections.contains_key(id)
    }

    pub fn watch(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.lock();
        let mut infos: Vec<ConnectionInfo> = state
            .connections
            .iter()
            .map(|(id, conn)| {
                let mut topics: Vec<String> =
                    conn.subscriptions.values().map(|s| s.topic.clone()).collect();
                topics.sort();
                ConnectionInfo {
                    id: id.clone(),
                    connected_at: conn.connected_at,
                    topics,
                }
            })
            .collect();
        infos.sort_by_key(|c| c.connected_at);
        infos
    }

    fn subscribe(&self, conn_id: &str, topic: &str) -> Result<Subscription> {
        let mut state = self.lock();
        let conn = state
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| GridError::Bus(format!("connection {} is closed", conn_id)))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = Uuid::new_v4().to_string();
        conn.subscriptions.insert(
            sub_id.clone(),
            SubscriptionEntry {
                topic: topic.to_string(),
                tx,
            },
        );
        Ok(Subscription {
            id: sub_id,
            topic: topic.to_string(),
            rx,
        })
    }

    fn unsubscribe(&self, conn_id: &str, sub_id: &str) -> bool {
        self.lock()
            .connections
            .get_mut(conn_id)
            .and_then(|c| c.subscriptions.remove(sub_id))
            .is_some()
    }

    /// Deliver to every current subscriber of `topic`. Returns the number of
    /// subscribers reached.
    fn publish(&self, from: &str, topic: &str, body: GridMessage) -> Result<usize> {
        let state = self.lock();
        if !state.connections.contains_key(from) {
            return Err(GridError::Bus(format!(
                "cannot send {} on closed connection {}",
                body.kind(),
                from
            )));
        }
        let mut delivered = 0;
        for sub in state
            .connections
            .values()
            .flat_map(|c| c.subscriptions.values())
            .filter(|s| s.topic == topic)
        {
            let msg = BusMessage {
                from: from.to_string(),
                topic: topic.to_string(),
                body: body.clone(),
            };
            if sub.tx.send(msg).is_ok() {
                delivered += 1;
            }
        }
        tracing::trace!(topic, kind = body.kind(), delivered, "Message published");
        Ok(delivered)
    }
}

/// One participant's handle on the bus. Cheap to clone; all clones share the
/// same connection id.
#[derive(Clone)]
pub struct BusConnection {
    id: ConnectionId,
    bus: MessageBus,
}

impl BusConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_connected(&self.id)
    }

    pub fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.bus.subscribe(&self.id, topic)
    }

    pub fn unsubscribe(&self, sub_id: &str) -> bool {
        self.bus.unsubscribe(&self.id, sub_id)
    }

    pub fn send(&self, topic: &str, msg: GridMessage) -> Result<()> {
        self.bus.publish(&self.id, topic, msg).map(|_| ())
    }

    pub fn disconnect(&self) {
        self.bus.drop_connection(&self.id);
    }
}

impl std::fmt::Debug for BusConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConnection").field("id", &self.id).finish()
    }
}

/// Stream of messages for one topic subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub topic: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    /// Next message, or `None` once the owning connection is closed
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<BusMessage> {
        UnboundedReceiverStream::new(self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_reaches_topic_subscribers_only() {
        let bus = MessageBus::new();
        let a = bus.connect();
        let b = bus.connect();
        let mut on_topic = a.subscribe("/topic/x").unwrap();
        let mut elsewhere = b.subscribe("/topic/y").unwrap();

        b.send("/topic/x", GridMessage::TrackingChanged).unwrap();

        let msg = on_topic.recv().await.unwrap();
        assert_eq!(msg.from, b.id());
        assert_eq!(msg.body, GridMessage::TrackingChanged);
        assert!(elsewhere.try_recv().is_none());
    }

    #[test]
    fn send_without_subscribers_is_dropped() {
        let bus = MessageBus::new();
        let a = bus.connect();
        assert!(a.send("/topic/nobody", GridMessage::TrackingChanged).is_ok());
    }

    #[tokio::test]
    async fn dropping_connection_ends_streams_and_rejects_sends() {
        let bus = MessageBus::new();
        let mut watch = bus.watch();
        let a = bus.connect();
        let mut sub = a.subscribe("/topic/x").unwrap();

        assert!(bus.drop_connection(a.id()));
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            a.send("/topic/x", GridMessage::TrackingChanged),
            Err(GridError::Bus(_))
        ));
        assert!(a.subscribe("/topic/x").is_err());

        assert_eq!(
            watch.recv().await.unwrap(),
            ConnectionEvent::Connected(a.id().to_string())
        );
        assert_eq!(
            watch.recv().await.unwrap(),
            ConnectionEvent::Disconnected(a.id().to_string())
        );
    }

    #[test]
    fn reconnect_gets_new_id() {
        let bus = MessageBus::new();
        let first = bus.connect();
        first.disconnect();
        let second = bus.connect();
        assert_ne!(first.id(), second.id());
        assert!(!first.is_connected());
        assert!(second.is_connected());
    }

    #[test]
    fn connections_list_topics() {
        let bus = MessageBus::new();
        let a = bus.connect();
        let sub = a.subscribe("/topic/b").unwrap();
        a.subscribe("/topic/a").unwrap();

        let infos = bus.connections();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].topics, vec!["/topic/a", "/topic/b"]);

        assert!(a.unsubscribe(&sub.id));
        assert_eq!(bus.connections()[0].topics, vec!["/topic/a"]);
    }
}
