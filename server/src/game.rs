use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::{GameRecord, GameUpdate, Side, SyncError};
use std::sync::Arc;
use uuid::Uuid;

use crate::store::Store;

/// An attack as carried by an `AttackInitiated` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackRequest {
    pub game_id: Uuid,
    pub side: Side,
    pub row: usize,
    pub col: usize,
    /// The record's `turnSeq` as the attacker last saw it.
    pub turn_seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttackResult {
    Applied(GameRecord),
    /// The attack was already applied; nothing changed.
    Replayed(GameRecord),
}

impl AttackResult {
    pub fn record(&self) -> &GameRecord {
        match self {
            AttackResult::Applied(record) | AttackResult::Replayed(record) => record,
        }
    }
}

/// CRUD over the durable game records. Every method touches exactly one key.
#[derive(Clone)]
pub struct GameService {
    games: Arc<dyn Store<Uuid, GameRecord>>,
}

impl GameService {
    pub fn new(games: Arc<dyn Store<Uuid, GameRecord>>) -> Self {
        Self { games }
    }

    pub async fn create(&self) -> Result<GameRecord, SyncError> {
        let record = GameRecord::new(Uuid::new_v4());
        if !self.games.insert_new(record.game_id, record.clone()).await? {
            return Err(SyncError::Rejected(format!(
                "game id {} already exists",
                record.game_id
            )));
        }
        info!("Created game {}", record.game_id);
        Ok(record)
    }

    pub async fn get(&self, game_id: Uuid) -> Result<Option<GameRecord>, SyncError> {
        self.games.get(&game_id).await
    }

    /// Runs `change` against the stored record under the table's lock and
    /// refreshes `updatedAt` when it writes.
    async fn modify<F>(&self, game_id: Uuid, change: F) -> Result<(GameRecord, bool), SyncError>
    where
        F: FnOnce(&mut GameRecord) -> Result<bool, SyncError> + Send + 'static,
    {
        self.games
            .modify(
                &game_id,
                Box::new(move |record: &mut GameRecord| {
                    let written = change(record)?;
                    if written {
                        record.touch();
                    }
                    Ok(written)
                }),
            )
            .await?
            .ok_or(SyncError::NotFound(game_id))
    }

    /// Merges the supplied fields into the stored record.
    pub async fn update(&self, game_id: Uuid, update: &GameUpdate) -> Result<GameRecord, SyncError> {
        let fields = update.clone();
        let (record, _) = self
            .modify(game_id, move |record| {
                record.apply_update(&fields)?;
                Ok(true)
            })
            .await?;
        debug!("Updated game {}: {:?}", game_id, update);
        Ok(record)
    }

    pub async fn delete(&self, game_id: Uuid) -> Result<bool, SyncError> {
        let removed = self.games.remove(&game_id).await?.is_some();
        if removed {
            info!("Deleted game {}", game_id);
        }
        Ok(removed)
    }

    pub async fn place_ship(&self, game_id: Uuid, row: usize, col: usize) -> Result<GameRecord, SyncError> {
        let (record, placed) = self
            .modify(game_id, move |record| Ok(record.place_ship(row, col)?))
            .await?;
        if !placed {
            debug!("Ship at ({}, {}) already placed in game {}", row, col, game_id);
        }
        Ok(record)
    }

    /// Applies an attack guarded by the turn sequence number. A sequence
    /// number behind the record's is a replay and is answered with the
    /// current state. One ahead of it has overtaken an earlier move and
    /// fails transiently so the bus redelivers it.
    pub async fn attack(&self, request: &AttackRequest) -> Result<AttackResult, SyncError> {
        let request = *request;
        let (record, applied) = self
            .modify(request.game_id, move |record| {
                if request.turn_seq < record.turn_seq {
                    return Ok(false);
                }
                if request.turn_seq > record.turn_seq {
                    return Err(SyncError::OutOfOrder(format!(
                        "turn sequence {} is ahead of {}",
                        request.turn_seq, record.turn_seq
                    )));
                }
                let outcome = record.apply_attack(request.side, request.row, request.col)?;
                debug!(
                    "Game {}: {:?} attacked ({}, {}) -> {:?}",
                    request.game_id, request.side, request.row, request.col, outcome.cell
                );
                if outcome.game_over {
                    info!("Game {} won by {:?}", request.game_id, request.side);
                }
                Ok(true)
            })
            .await?;

        if applied {
            Ok(AttackResult::Applied(record))
        } else {
            debug!(
                "Replayed attack seq {} on game {} (now at {})",
                request.turn_seq, request.game_id, record.turn_seq
            );
            Ok(AttackResult::Replayed(record))
        }
    }
}

/// Immutable event-log entry. The payload is kept as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event_id: Uuid,
    pub game_id: Option<Uuid>,
    pub event_type: String,
    pub payload: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only log of client-reported game events.
pub struct EventLog {
    events: Arc<dyn Store<Uuid, EventRecord>>,
}

impl EventLog {
    pub fn new(events: Arc<dyn Store<Uuid, EventRecord>>) -> Self {
        Self { events }
    }

    /// Appends the entry unless one with the same id exists. Returns whether
    /// it was written.
    pub async fn append(&self, record: EventRecord) -> Result<bool, SyncError> {
        let written = self.events.insert_new(record.event_id, record.clone()).await?;
        if written {
            debug!("Recorded event {} ({})", record.event_id, record.event_type);
        }
        Ok(written)
    }

    pub async fn for_game(&self, game_id: Uuid) -> Result<Vec<EventRecord>, SyncError> {
        let mut events: Vec<EventRecord> = self
            .events
            .scan()
            .await?
            .into_iter()
            .filter(|event| event.game_id == Some(game_id))
            .collect();
        events.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(events)
    }
}
