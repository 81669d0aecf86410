//! Canonical event types, the action table and the bus envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Inbound requests, produced by the action dispatcher.
    CreateGameRequest,
    UpdateGameRequest,
    GetGameRequest,
    GameDeleteRequest,
    ShipPlaced,
    AttackInitiated,
    EventRecordSaved,
    GameUpdatedWithEvent,
    UnknownAction,

    // Session lifecycle.
    ClientConnected,
    ClientDisconnected,

    // Processor results, delivered to peers by the sender.
    GameCreated,
    GameFound,
    GameNotFound,
    GameUpdated,
    GameDeleted,
    EventRecorded,
    ActionFailed,
}

impl EventType {
    pub const ALL: [EventType; 18] = [
        EventType::CreateGameRequest,
        EventType::UpdateGameRequest,
        EventType::GetGameRequest,
        EventType::GameDeleteRequest,
        EventType::ShipPlaced,
        EventType::AttackInitiated,
        EventType::EventRecordSaved,
        EventType::GameUpdatedWithEvent,
        EventType::UnknownAction,
        EventType::ClientConnected,
        EventType::ClientDisconnected,
        EventType::GameCreated,
        EventType::GameFound,
        EventType::GameNotFound,
        EventType::GameUpdated,
        EventType::GameDeleted,
        EventType::EventRecorded,
        EventType::ActionFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::CreateGameRequest => "CreateGameRequest",
            EventType::UpdateGameRequest => "UpdateGameRequest",
            EventType::GetGameRequest => "GetGameRequest",
            EventType::GameDeleteRequest => "GameDeleteRequest",
            EventType::ShipPlaced => "ShipPlaced",
            EventType::AttackInitiated => "AttackInitiated",
            EventType::EventRecordSaved => "EventRecordSaved",
            EventType::GameUpdatedWithEvent => "GameUpdatedWithEvent",
            EventType::UnknownAction => "UnknownAction",
            EventType::ClientConnected => "ClientConnected",
            EventType::ClientDisconnected => "ClientDisconnected",
            EventType::GameCreated => "GameCreated",
            EventType::GameFound => "GameFound",
            EventType::GameNotFound => "GameNotFound",
            EventType::GameUpdated => "GameUpdated",
            EventType::GameDeleted => "GameDeleted",
            EventType::EventRecorded => "EventRecorded",
            EventType::ActionFailed => "ActionFailed",
        }
    }

    /// Looks up the canonical event for a client action name. Anything
    /// outside the table maps to `UnknownAction`.
    pub fn for_action(action: &str) -> EventType {
        ACTION_TABLE
            .iter()
            .find(|(name, _)| *name == action)
            .map(|(_, event_type)| *event_type)
            .unwrap_or(EventType::UnknownAction)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|event_type| event_type.as_str() == s)
            .ok_or(())
    }
}

/// The one action table. The dispatcher and the test harnesses both read it.
pub const ACTION_TABLE: &[(&str, EventType)] = &[
    ("create", EventType::CreateGameRequest),
    ("createGame", EventType::CreateGameRequest),
    ("update", EventType::UpdateGameRequest),
    ("updateGame", EventType::UpdateGameRequest),
    ("get", EventType::GetGameRequest),
    ("getGame", EventType::GetGameRequest),
    ("delete", EventType::GameDeleteRequest),
    ("deleteGame", EventType::GameDeleteRequest),
    ("placeShip", EventType::ShipPlaced),
    ("attack", EventType::AttackInitiated),
    ("saveRecord", EventType::EventRecordSaved),
    ("updateWithEvent", EventType::GameUpdatedWithEvent),
];

/// Payload key under which processors carry the peer a result is meant for.
pub const CONNECTION_ID_KEY: &str = "connectionId";

/// Unit of publication on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Map<String, Value>,
    /// Originating connection. `None` means the result is broadcast.
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(
        source: impl Into<String>,
        event_type: EventType,
        payload: Map<String, Value>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            source: source.into(),
            event_type,
            payload,
            correlation_id,
        }
    }

    /// Builds a result envelope addressed back to whoever sent `self`. The
    /// target peer is embedded in the payload for the sender to find.
    pub fn reply(
        &self,
        source: impl Into<String>,
        event_type: EventType,
        mut payload: Map<String, Value>,
    ) -> Envelope {
        if let Some(id) = &self.correlation_id {
            payload.insert(CONNECTION_ID_KEY.to_string(), Value::String(id.clone()));
        }
        Envelope::new(source, event_type, payload, self.correlation_id.clone())
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Peer id embedded in the payload, if it is usable (a non-empty string).
    pub fn target(&self) -> Option<&str> {
        self.str_field(CONNECTION_ID_KEY)
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}
