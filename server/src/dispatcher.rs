use log::{debug, warn};
use serde_json::Value;
use shared::{ClientMessage, Envelope, EventType, SyncError};

use crate::bus::{BusHandle, SOURCE_DISPATCHER};

/// Payload key carrying the raw action name of an unrecognized action.
pub const ACTION_KEY: &str = "action";

/// What an inbound message was published as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub action: String,
    pub event_type: EventType,
}

/// Turns inbound socket messages into bus envelopes.
///
/// The action name is looked up in the shared action table; anything not in
/// it is still published, as `UnknownAction`, so it shows up downstream.
#[derive(Clone)]
pub struct ActionDispatcher {
    bus: BusHandle,
}

impl ActionDispatcher {
    pub fn new(bus: BusHandle) -> Self {
        Self { bus }
    }

    /// Publishes the message on behalf of `connection_id`. Malformed input is
    /// never published.
    pub fn dispatch(&self, connection_id: &str, raw: &str) -> Result<Dispatched, SyncError> {
        let message = ClientMessage::parse(raw).map_err(|e| {
            warn!("Malformed message from {}: {}", connection_id, e);
            e
        })?;

        let event_type = EventType::for_action(&message.action);
        let mut payload = message.data;
        if event_type == EventType::UnknownAction {
            payload.insert(ACTION_KEY.to_string(), Value::String(message.action.clone()));
        }

        debug!(
            "{} from {} dispatched as {}",
            message.action, connection_id, event_type
        );
        self.bus.publish(Envelope::new(
            SOURCE_DISPATCHER,
            event_type,
            payload,
            Some(connection_id.to_string()),
        ))?;
        Ok(Dispatched {
            action: message.action,
            event_type,
        })
    }
}
