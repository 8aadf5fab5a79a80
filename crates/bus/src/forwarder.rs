//! Cluster fan-out — rebroadcast local alerts on a cluster-wide topic.
//!
//! The forwarder is a pure observer: it watches the local telemetry bus for
//! `alert_fired` events, rebroadcasts locally-originated notifications on a
//! pluggable transport, and ingests remote envelopes into the local alert
//! bus. Envelopes are tagged with the source node; a node ignores its own
//! envelopes, which prevents forwarding loops. The core is correct without
//! any forwarder configured.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use beamlens_core::telemetry::{TelemetryBus, TelemetryEvent};
use beamlens_core::{Error, Notification};

use crate::AlertBus;

/// A cluster-wide pub/sub transport. Implementations are external
/// collaborators (message broker, distribution layer); `LoopbackTransport`
/// serves single-process tests.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Broadcast a payload on a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error>;

    /// Subscribe to a topic.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Vec<u8>>;
}

/// In-process transport: every topic is a broadcast channel.
pub struct LoopbackTransport {
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterTransport for LoopbackTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error> {
        // No receivers on the topic is fine
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Vec<u8>> {
        self.sender(topic).subscribe()
    }
}

/// Wire format for cluster-forwarded notifications.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    node: String,
    notification: Notification,
}

/// Bridges the local alert bus onto a cluster topic.
pub struct ClusterForwarder {
    node: String,
    topic: String,
    transport: Arc<dyn ClusterTransport>,
}

impl ClusterForwarder {
    pub fn new(
        node: impl Into<String>,
        topic: impl Into<String>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Self {
        Self {
            node: node.into(),
            topic: topic.into(),
            transport,
        }
    }

    /// Run the forwarder until cancelled.
    pub fn spawn(
        self,
        telemetry: Arc<TelemetryBus>,
        bus: Arc<AlertBus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        // Subscribe before spawning so no alert published between spawn and
        // first poll is missed.
        let mut local = telemetry.subscribe();
        let mut remote = self.transport.subscribe(&self.topic);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    event = local.recv() => match event {
                        Ok(event) => {
                            if let TelemetryEvent::AlertFired { notification } = event.as_ref() {
                                // Only locally-originated alerts go out
                                if notification.node != self.node {
                                    continue;
                                }
                                let envelope = Envelope {
                                    node: self.node.clone(),
                                    notification: notification.clone(),
                                };
                                match serde_json::to_vec(&envelope) {
                                    Ok(payload) => {
                                        if let Err(e) =
                                            self.transport.publish(&self.topic, payload).await
                                        {
                                            warn!(error = %e, "Cluster publish failed");
                                        }
                                    }
                                    Err(e) => warn!(error = %e, "Envelope encoding failed"),
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "Forwarder lagged on telemetry bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },

                    payload = remote.recv() => match payload {
                        Ok(payload) => match serde_json::from_slice::<Envelope>(&payload) {
                            Ok(envelope) if envelope.node != self.node => {
                                debug!(
                                    from = %envelope.node,
                                    id = %envelope.notification.id,
                                    "Ingesting remote alert"
                                );
                                bus.push(envelope.notification);
                            }
                            Ok(_) => {} // our own envelope echoed back
                            Err(e) => warn!(error = %e, "Undecodable cluster envelope"),
                        },
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "Forwarder lagged on cluster topic");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}
