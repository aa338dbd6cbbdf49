//! Client notification fan-out.
//!
//! Turns dispatcher events into bus broadcasts. Queue and node-usage churn
//! only marks a [`Coalescer`]; when it fires, fresh snapshots are read from
//! the dispatcher and published, so clients see current state rather than a
//! replay of every intermediate step. Node topology, control flags, job
//! tracking and per-job progress are published as they happen.

pub mod coalesce;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::autoscaler::AutoScaler;
use crate::bus::topic::{job_notification_topic, AUTOSCALER_TOPIC, DISPATCHER_STATE_TOPIC};
use crate::bus::{BusConnection, ConnectionEvent, GridMessage, MessageBus};
use crate::config::FanoutConfig;
use crate::dispatcher::{Dispatcher, DispatcherEvent};

pub use coalesce::Coalescer;

/// Publishes on its own bus connection, replacing it if it gets dropped.
struct Publisher {
    bus: MessageBus,
    conn: Mutex<BusConnection>,
}

impl Publisher {
    fn new(bus: MessageBus) -> Self {
        let conn = bus.connect();
        Self {
            bus,
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusConnection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn id(&self) -> String {
        self.lock().id().to_string()
    }

    fn publish(&self, topic: &str, msg: GridMessage) {
        let mut conn = self.lock();
        if !conn.is_connected() {
            tracing::warn!(old_conn = %conn.id(), "Fan-out bus connection lost, reconnecting");
            *conn = self.bus.connect();
        }
        let kind = msg.kind();
        if let Err(e) = conn.send(topic, msg) {
            tracing::warn!(topic, kind, error = %e, "Broadcast failed");
        }
    }
}

/// Shared by the event loop and the coalesced broadcast task.
struct Broadcaster {
    dispatcher: Arc<Dispatcher>,
    bus: MessageBus,
    publisher: Arc<Publisher>,
    coalescer: Arc<Coalescer>,
    autoscaler: Option<Arc<dyn AutoScaler>>,
}

/// Subscribes to dispatcher and bus connection events when constructed, so
/// nothing emitted between construction and [`run`](EventFanout::run) is lost.
pub struct EventFanout {
    broadcaster: Broadcaster,
    events: broadcast::Receiver<DispatcherEvent>,
    connections: broadcast::Receiver<ConnectionEvent>,
}

impl EventFanout {
    pub fn new(dispatcher: Arc<Dispatcher>, bus: MessageBus, config: &FanoutConfig) -> Self {
        let events = dispatcher.subscribe_events();
        let connections = bus.watch();
        Self {
            broadcaster: Broadcaster {
                dispatcher,
                publisher: Arc::new(Publisher::new(bus.clone())),
                bus,
                coalescer: Arc::new(Coalescer::new(config.coalesce_interval())),
                autoscaler: None,
            },
            events,
            connections,
        }
    }

    pub fn with_autoscaler(mut self, autoscaler: Arc<dyn AutoScaler>) -> Self {
        self.broadcaster.autoscaler = Some(autoscaler);
        self
    }

    /// Connection id the broadcasts are sent from
    pub fn connection_id(&self) -> String {
        self.broadcaster.publisher.id()
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let EventFanout {
            broadcaster,
            mut events,
            mut connections,
        } = self;

        let coalesced = {
            let coalescer = Arc::clone(&broadcaster.coalescer);
            let dispatcher = Arc::clone(&broadcaster.dispatcher);
            let publisher = Arc::clone(&broadcaster.publisher);
            let autoscaler = broadcaster.autoscaler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                coalescer
                    .run(shutdown, move || {
                        let dispatcher = Arc::clone(&dispatcher);
                        let publisher = Arc::clone(&publisher);
                        let autoscaler = autoscaler.clone();
                        async move {
                            publish_usage(&dispatcher, &publisher, autoscaler.as_deref()).await;
                        }
                    })
                    .await;
            })
        };

        tracing::info!(conn_id = %broadcaster.publisher.id(), "Event fan-out started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                event = events.recv() => match event {
                    Ok(event) => broadcaster.on_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Fan-out lagged behind dispatcher events, resyncing");
                        broadcaster.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                event = connections.recv() => match event {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        broadcaster.publisher.publish(
                            DISPATCHER_STATE_TOPIC,
                            GridMessage::ConnectionsChanged(broadcaster.bus.connections()),
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        let _ = coalesced.await;
        broadcaster.publisher.lock().disconnect();
        tracing::info!("Event fan-out stopped");
    }
}

impl Broadcaster {
    async fn on_event(&self, event: DispatcherEvent) {
        match event {
            DispatcherEvent::QueueChanged | DispatcherEvent::NodesUsageChanged => {
                self.coalescer.mark();
            }
            e if e.is_topology() => {
                let nodes = self.dispatcher.nodes().await;
                self.publisher
                    .publish(DISPATCHER_STATE_TOPIC, GridMessage::NodesChanged(nodes));
            }
            DispatcherEvent::CtrlChanged(control) => {
                self.publisher
                    .publish(DISPATCHER_STATE_TOPIC, GridMessage::CtrlChanged(control));
            }
            DispatcherEvent::JobsTrackingChanged => {
                self.publisher
                    .publish(DISPATCHER_STATE_TOPIC, GridMessage::TrackingChanged);
            }
            DispatcherEvent::JobStatusChanged(progress) => {
                if let Some(cookie) = self.dispatcher.notification_cookie(progress.job_id).await {
                    self.publisher.publish(
                        &job_notification_topic(&cookie),
                        GridMessage::StatusChanged(progress),
                    );
                }
            }
            DispatcherEvent::Error(error) => {
                tracing::debug!(error = %error, "Dispatcher reported an error");
            }
            _ => {}
        }
    }

    /// Publish everything after missing events
    async fn resync(&self) {
        self.coalescer.mark();
        let json = self.dispatcher.get_json().await;
        self.publisher
            .publish(DISPATCHER_STATE_TOPIC, GridMessage::NodesChanged(json.nodes));
        self.publisher.publish(
            DISPATCHER_STATE_TOPIC,
            GridMessage::CtrlChanged(json.disp_control),
        );
        self.publisher
            .publish(DISPATCHER_STATE_TOPIC, GridMessage::TrackingChanged);
    }
}

async fn publish_usage(
    dispatcher: &Dispatcher,
    publisher: &Publisher,
    autoscaler: Option<&dyn AutoScaler>,
) {
    let json = dispatcher.get_json().await;
    publisher.publish(DISPATCHER_STATE_TOPIC, GridMessage::QueueChanged(json.queue));
    if let Some(autoscaler) = autoscaler {
        if autoscaler.on_nodes_usage(&json.nodes) {
            publisher.publish(
                AUTOSCALER_TOPIC,
                GridMessage::AutoscalerChanged(autoscaler.to_json()),
            );
        }
    }
    publisher.publish(DISPATCHER_STATE_TOPIC, GridMessage::NodesChanged(json.nodes));
}
