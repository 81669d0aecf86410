//! Delivery of result events to peers.
//!
//! A result addressed to a connection is unicast to it; anything else is
//! broadcast to every live connection in the registry. Peers the transport
//! reports as gone are pruned from the registry on the spot.

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, info, warn};
use shared::events::CONNECTION_ID_KEY;
use shared::{Envelope, ServerPush, SyncError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::bus::Processor;
use crate::client_manager::ConnectionRegistry;

pub const SENDER: &str = "sender";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The peer will never accept another message.
    #[error("peer is gone")]
    Gone,
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Posts a push to one connected peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn post(&self, connection_id: &str, push: &ServerPush) -> Result<(), DeliveryError>;
}

/// Outbound queues of the sockets attached to this process.
#[derive(Default)]
pub struct SocketHub {
    peers: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl SocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a socket and returns the queue its writer task drains.
    pub async fn attach(&self, connection_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.write().await.insert(connection_id.to_string(), tx);
        rx
    }

    pub async fn detach(&self, connection_id: &str) {
        self.peers.write().await.remove(connection_id);
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[async_trait]
impl PeerTransport for SocketHub {
    async fn post(&self, connection_id: &str, push: &ServerPush) -> Result<(), DeliveryError> {
        let peers = self.peers.read().await;
        let tx = peers.get(connection_id).ok_or(DeliveryError::Gone)?;
        tx.send(push.to_json()).map_err(|_| DeliveryError::Gone)
    }
}

/// Outcome of one delivery, by connection id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub pruned: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Sender {
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn PeerTransport>,
}

impl Sender {
    pub fn new(registry: Arc<ConnectionRegistry>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    /// The push a peer receives for a result envelope. The routing key is
    /// stripped and the game id is lifted to the top level.
    pub fn to_push(envelope: &Envelope) -> ServerPush {
        let mut data = envelope.payload.clone();
        data.remove(CONNECTION_ID_KEY);
        let game_id = data.get("gameId").and_then(Value::as_str).map(str::to_string);
        ServerPush::event(envelope.event_type, Value::Object(data), game_id)
    }

    pub async fn deliver(&self, envelope: &Envelope) -> Result<DeliveryReport, SyncError> {
        let push = Self::to_push(envelope);

        let recipients: Vec<String> = match envelope.target() {
            Some(id) => vec![id.to_string()],
            None => self
                .registry
                .live_connections()
                .await?
                .into_iter()
                .map(|connection| connection.id)
                .collect(),
        };

        let results = join_all(recipients.iter().map(|id| self.transport.post(id, &push))).await;

        let mut report = DeliveryReport::default();
        for (id, result) in recipients.into_iter().zip(results) {
            match result {
                Ok(()) => report.delivered.push(id),
                Err(DeliveryError::Gone) => {
                    self.registry.prune(&id).await;
                    report.pruned.push(id);
                }
                Err(DeliveryError::Failed(reason)) => {
                    warn!("Failed to deliver {} to {}: {}", push.kind, id, reason);
                    report.failed.push(id);
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl Processor for Sender {
    fn name(&self) -> &'static str {
        SENDER
    }

    async fn process(&self, envelope: &Envelope) -> Result<Vec<Envelope>, SyncError> {
        let report = self.deliver(envelope).await?;
        if report.pruned.is_empty() && report.failed.is_empty() {
            debug!(
                "{} delivered to {} peer(s)",
                envelope.event_type,
                report.delivered.len()
            );
        } else {
            info!(
                "{} delivered to {}, pruned {:?}, failed {:?}",
                envelope.event_type,
                report.delivered.len(),
                report.pruned,
                report.failed
            );
        }
        Ok(Vec::new())
    }
}
