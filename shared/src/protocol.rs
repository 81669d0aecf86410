//! Socket wire format: inbound `{action, data}` and outbound
//! `{type, data, gameId?, timestamp}`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::SyncError;
use crate::events::EventType;

pub const ACK_TYPE: &str = "Ack";
pub const ERROR_TYPE: &str = "Error";

/// Client→server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub action: String,
    pub data: Map<String, Value>,
}

impl ClientMessage {
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            action: action.into(),
            data,
        }
    }

    /// Parses raw socket text. Anything that is not `{action: string, data:
    /// object}` is malformed.
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        serde_json::from_str(raw).map_err(|e| SyncError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // A struct of a string and a JSON map always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Server→client push, also used for synchronous acknowledgments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPush {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    pub timestamp: String,
}

/// What a push is, as seen by the client reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushKind {
    Event(EventType),
    Ack,
    Error,
    Other(String),
}

impl ServerPush {
    pub fn new(kind: impl Into<String>, data: Value, game_id: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            data,
            game_id,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn event(event_type: EventType, data: Value, game_id: Option<String>) -> Self {
        Self::new(event_type.as_str(), data, game_id)
    }

    pub fn ack(action: &str, event_type: EventType) -> Self {
        Self::new(
            ACK_TYPE,
            json!({ "action": action, "eventType": event_type.as_str() }),
            None,
        )
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ERROR_TYPE, json!({ "message": message.into() }), None)
    }

    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        serde_json::from_str(raw).map_err(|e| SyncError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn push_kind(&self) -> PushKind {
        match self.kind.as_str() {
            ACK_TYPE => PushKind::Ack,
            ERROR_TYPE => PushKind::Error,
            other => match other.parse::<EventType>() {
                Ok(event_type) => PushKind::Event(event_type),
                Err(()) => PushKind::Other(other.to_string()),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        self.push_kind() == PushKind::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_message() {
        let message = ClientMessage::parse(r#"{"action":"createGame","data":{}}"#).unwrap();
        assert_eq!(message.action, "createGame");
        assert!(message.data.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_conforming_shapes() {
        let bad = [
            "not json",
            r#"{"data":{}}"#,
            r#"{"action":"get"}"#,
            r#"{"action":42,"data":{}}"#,
            r#"{"action":"get","data":[1,2]}"#,
            r#"["get", {}]"#,
        ];
        for raw in bad {
            assert!(
                matches!(ClientMessage::parse(raw), Err(SyncError::Malformed(_))),
                "accepted {}",
                raw
            );
        }
    }

    #[test]
    fn test_push_shape() {
        let push = ServerPush::event(
            EventType::GameCreated,
            json!({ "gameId": "abc" }),
            Some("abc".to_string()),
        );
        let value: Value = serde_json::from_str(&push.to_json()).unwrap();
        assert_eq!(value["type"], "GameCreated");
        assert_eq!(value["data"]["gameId"], "abc");
        assert_eq!(value["gameId"], "abc");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_push_without_game_id_omits_it() {
        let value: Value = serde_json::from_str(&ServerPush::error("boom").to_json()).unwrap();
        assert!(value.get("gameId").is_none());
        assert_eq!(value["data"]["message"], "boom");
    }

    #[test]
    fn test_push_kind() {
        assert_eq!(
            ServerPush::ack("get", EventType::GetGameRequest).push_kind(),
            PushKind::Ack
        );
        assert!(ServerPush::error("x").is_error());
        assert_eq!(
            ServerPush::event(EventType::GameUpdated, Value::Null, None).push_kind(),
            PushKind::Event(EventType::GameUpdated)
        );
        assert_eq!(
            ServerPush::new("Mystery", Value::Null, None).push_kind(),
            PushKind::Other("Mystery".to_string())
        );
    }
}
