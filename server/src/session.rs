use log::{error, info, warn};
use serde_json::{Map, Value};
use shared::{Envelope, EventType, ServerPush, SyncError};
use std::sync::Arc;

use crate::bus::{BusHandle, SOURCE_SESSION};
use crate::client_manager::{Connection, ConnectionRegistry};
use crate::dispatcher::ActionDispatcher;

/// Connect, disconnect and message entry points of the socket edge.
#[derive(Clone)]
pub struct SessionHandlers {
    registry: Arc<ConnectionRegistry>,
    dispatcher: ActionDispatcher,
    bus: BusHandle,
}

impl SessionHandlers {
    pub fn new(registry: Arc<ConnectionRegistry>, bus: BusHandle) -> Self {
        Self {
            registry,
            dispatcher: ActionDispatcher::new(bus.clone()),
            bus,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn announce(&self, event_type: EventType, connection_id: &str) {
        let mut payload = Map::new();
        payload.insert("connectionId".to_string(), Value::String(connection_id.to_string()));
        let envelope = Envelope::new(SOURCE_SESSION, event_type, payload, None);
        if let Err(e) = self.bus.publish(envelope) {
            warn!("Could not publish {} for {}: {}", event_type, connection_id, e);
        }
    }

    /// Registers the peer and announces it. The announcement goes out even
    /// when registration fails, since the socket stays open and the peer is
    /// connected either way. The storage failure is still returned.
    pub async fn on_connect(&self, connection_id: &str) -> Result<Connection, SyncError> {
        let registered = self.registry.register(connection_id).await;
        if let Err(e) = &registered {
            error!("Failed to register connection {}: {}", connection_id, e);
        }
        self.announce(EventType::ClientConnected, connection_id);
        registered
    }

    /// Safe to call for a peer that was never registered or already removed.
    pub async fn on_disconnect(&self, connection_id: &str) -> Result<bool, SyncError> {
        let removed = self.registry.remove(connection_id).await?;
        info!("Client {} disconnected", connection_id);
        self.announce(EventType::ClientDisconnected, connection_id);
        Ok(removed)
    }

    /// Dispatches one inbound message and returns the synchronous
    /// acknowledgment for it.
    pub fn on_message(&self, connection_id: &str, raw: &str) -> ServerPush {
        match self.dispatcher.dispatch(connection_id, raw) {
            Ok(dispatched) if dispatched.event_type == EventType::UnknownAction => {
                ServerPush::error(SyncError::UnknownAction(dispatched.action).to_string())
            }
            Ok(dispatched) => ServerPush::ack(&dispatched.action, dispatched.event_type),
            Err(e) => ServerPush::error(e.to_string()),
        }
    }
}
