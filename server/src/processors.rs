//! Bus processors that own the durable game state.
//!
//! Each processor reads its input from the envelope payload, touches one
//! record and replies with a result envelope addressed to the originating
//! peer. All of them are safe to run twice on the same envelope.

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use shared::{Envelope, EventType, GameRecord, GameUpdate, SyncError};
use std::sync::Arc;
use uuid::Uuid;

use crate::bus::{Processor, SOURCE_GAME};
use crate::game::{AttackRequest, AttackResult, EventLog, EventRecord, GameService};

pub const GAME_PROCESSOR: &str = "game-processor";
pub const EVENT_LOG_PROCESSOR: &str = "event-log-processor";

/// Result payload for a record: the full document plus its id as a string.
pub fn record_payload(record: &GameRecord) -> Result<Map<String, Value>, SyncError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(SyncError::Malformed("record did not serialize to an object".to_string())),
        Err(e) => Err(SyncError::Malformed(e.to_string())),
    }
}

fn field<T: DeserializeOwned>(envelope: &Envelope, key: &str) -> Result<T, SyncError> {
    let value = envelope
        .payload
        .get(key)
        .cloned()
        .ok_or_else(|| SyncError::Malformed(format!("missing field '{}'", key)))?;
    serde_json::from_value(value)
        .map_err(|e| SyncError::Malformed(format!("invalid field '{}': {}", key, e)))
}

fn whole<T: DeserializeOwned>(payload: &Map<String, Value>) -> Result<T, SyncError> {
    serde_json::from_value(Value::Object(payload.clone()))
        .map_err(|e| SyncError::Malformed(e.to_string()))
}

fn game_id(envelope: &Envelope) -> Result<Uuid, SyncError> {
    field(envelope, "gameId")
}

/// Builds a log entry from a client-supplied event object. Entries without
/// an `eventId` get a fresh one, which makes them append-once per delivery
/// rather than per logical event.
fn event_record(event: &Map<String, Value>, game_id: Option<Uuid>) -> Result<EventRecord, SyncError> {
    let event_id = match event.get("eventId") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| SyncError::Malformed(format!("invalid field 'eventId': {}", e)))?,
        None => Uuid::new_v4(),
    };
    let event_type = event
        .get("eventType")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| SyncError::Malformed("missing field 'eventType'".to_string()))?;

    Ok(EventRecord {
        event_id,
        game_id,
        event_type: event_type.to_string(),
        payload: event
            .get("payload")
            .cloned()
            .unwrap_or(Value::Null)
            .to_string(),
        recorded_at: Utc::now(),
    })
}

/// Handles every game-scoped request.
pub struct GameProcessor {
    games: GameService,
    log: Arc<EventLog>,
}

impl GameProcessor {
    pub fn new(games: GameService, log: Arc<EventLog>) -> Self {
        Self { games, log }
    }

    fn updated(envelope: &Envelope, record: &GameRecord) -> Result<Vec<Envelope>, SyncError> {
        Ok(vec![envelope.reply(
            SOURCE_GAME,
            EventType::GameUpdated,
            record_payload(record)?,
        )])
    }

    async fn create(&self, envelope: &Envelope) -> Result<Vec<Envelope>, SyncError> {
        let record = self.games.create().await?;
        Ok(vec![envelope.reply(
            SOURCE_GAME,
            EventType::GameCreated,
            record_payload(&record)?,
        )])
    }

    async fn get(&self, envelope: &Envelope) -> Result<Vec<Envelope>, SyncError> {
        let id = game_id(envelope)?;
        let reply = match self.games.get(id).await? {
            Some(record) => {
                envelope.reply(SOURCE_GAME, EventType::GameFound, record_payload(&record)?)
            }
            None => {
                let mut payload = Map::new();
                payload.insert("gameId".to_string(), Value::String(id.to_string()));
                envelope.reply(SOURCE_GAME, EventType::GameNotFound, payload)
            }
        };
        Ok(vec![reply])
    }

    async fn update(&self, envelope: &Envelope) -> Result<Vec<Envelope>, SyncError> {
        let id = game_id(envelope)?;
        let update: GameUpdate = whole(&envelope.payload)?;
        let record = self.games.update(id, &update).await?;
        Self::updated(envelope, &record)
    }

    async fn delete(&self, envelope: &Envelope) -> Result<Vec<Envelope>, SyncError> {
        let id = game_id(envelope)?;
        let deleted = self.games.delete(id).await?;
        let payload = json!({ "gameId": id.to_string(), "deleted": deleted });
        Ok(vec![envelope.reply(
            SOURCE_GAME,
            EventType::GameDeleted,
            payload.as_object().cloned().unwrap_or_default(),
        )])
    }

    async fn place_ship(&self, envelope: &Envelope) -> Result<Vec<Envelope>, SyncError> {
        let id = game_id(envelope)?;
        let row: usize = field(envelope, "row")?;
        let col: usize = field(envelope, "col")?;
        let record = self.games.place_ship(id, row, col).await?;
        Self::updated(envelope, &record)
    }

    async fn attack(&self, envelope: &Envelope) -> Result<Vec<Envelope>, SyncError> {
        let request: AttackRequest = whole(&envelope.payload)?;
        let result = self.games.attack(&request).await?;
        let mut payload = record_payload(result.record())?;
        payload.insert(
            "replayed".to_string(),
            Value::Bool(matches!(result, AttackResult::Replayed(_))),
        );
        Ok(vec![envelope.reply(SOURCE_GAME, EventType::GameUpdated, payload)])
    }

    /// Update plus event-log append. A failure in either half fails the whole
    /// request; a redelivery re-applies the update and skips the logged event.
    async fn update_with_event(&self, envelope: &Envelope) -> Result<Vec<Envelope>, SyncError> {
        let id = game_id(envelope)?;
        let update: GameUpdate = whole(&envelope.payload)?;
        let event: Map<String, Value> = field(envelope, "event")?;
        let entry = event_record(&event, Some(id))?;
        let event_id = entry.event_id;

        let record = self.games.update(id, &update).await?;
        self.log.append(entry).await?;

        let mut payload = record_payload(&record)?;
        payload.insert("eventId".to_string(), Value::String(event_id.to_string()));
        Ok(vec![envelope.reply(SOURCE_GAME, EventType::GameUpdated, payload)])
    }
}

#[async_trait]
impl Processor for GameProcessor {
    fn name(&self) -> &'static str {
        GAME_PROCESSOR
    }

    async fn process(&self, envelope: &Envelope) -> Result<Vec<Envelope>, SyncError> {
        match envelope.event_type {
            EventType::CreateGameRequest => self.create(envelope).await,
            EventType::GetGameRequest => self.get(envelope).await,
            EventType::UpdateGameRequest => self.update(envelope).await,
            EventType::GameDeleteRequest => self.delete(envelope).await,
            EventType::ShipPlaced => self.place_ship(envelope).await,
            EventType::AttackInitiated => self.attack(envelope).await,
            EventType::GameUpdatedWithEvent => self.update_with_event(envelope).await,
            other => {
                debug!("{} ignoring {}", GAME_PROCESSOR, other);
                Ok(Vec::new())
            }
        }
    }
}

/// Appends client-reported events to the log.
pub struct EventLogProcessor {
    log: Arc<EventLog>,
}

impl EventLogProcessor {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Processor for EventLogProcessor {
    fn name(&self) -> &'static str {
        EVENT_LOG_PROCESSOR
    }

    async fn process(&self, envelope: &Envelope) -> Result<Vec<Envelope>, SyncError> {
        if envelope.event_type != EventType::EventRecordSaved {
            debug!("{} ignoring {}", EVENT_LOG_PROCESSOR, envelope.event_type);
            return Ok(Vec::new());
        }

        let game_id = match envelope.payload.get("gameId") {
            Some(_) => Some(game_id(envelope)?),
            None => None,
        };
        let entry = event_record(&envelope.payload, game_id)?;
        let event_id = entry.event_id;
        let written = self.log.append(entry).await?;

        let mut payload = Map::new();
        payload.insert("eventId".to_string(), Value::String(event_id.to_string()));
        payload.insert("written".to_string(), Value::Bool(written));
        if let Some(id) = game_id {
            payload.insert("gameId".to_string(), Value::String(id.to_string()));
        }
        Ok(vec![envelope.reply(SOURCE_GAME, EventType::EventRecorded, payload)])
    }
}
