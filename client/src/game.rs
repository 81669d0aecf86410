use log::{debug, info, warn};
use serde_json::{json, Value};
use shared::{
    ClientMessage, EventType, GameRecord, GameStatus, GameUpdate, PushKind, ServerPush,
    Side, SyncError, FLEET_SIZE,
};
use uuid::Uuid;

use crate::error::ClientError;
use crate::guard::{CreationGuard, OpenStep};
use crate::opponent::MoveSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Placement,
    Battle,
    Ended,
}

impl ClientState {
    pub fn of(record: &GameRecord) -> Self {
        if record.status == GameStatus::Completed {
            ClientState::Ended
        } else if record.ships_placed >= FLEET_SIZE {
            ClientState::Battle
        } else if record.ships_placed > 0 {
            ClientState::Placement
        } else {
            ClientState::Init
        }
    }
}

/// Local mirror of one game plus everything needed to keep it in sync.
///
/// Local moves are applied optimistically and return the messages that
/// carry them to the server. Pushes from the server overwrite only the
/// fields they contain.
pub struct ClientSession {
    state: ClientState,
    record: Option<GameRecord>,
    guard: CreationGuard,
    opponent: Box<dyn MoveSource>,
}

impl ClientSession {
    pub fn new(guard: CreationGuard, opponent: Box<dyn MoveSource>) -> Self {
        Self {
            state: ClientState::Init,
            record: None,
            guard,
            opponent,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn record(&self) -> Option<&GameRecord> {
        self.record.as_ref()
    }

    pub fn game_id(&self) -> Option<Uuid> {
        self.record
            .as_ref()
            .map(|record| record.game_id)
            .or_else(|| self.guard.game_id())
    }

    pub fn guard(&self) -> &CreationGuard {
        &self.guard
    }

    fn set_record(&mut self, record: GameRecord) {
        let next = ClientState::of(&record);
        if next != self.state {
            info!("Game {}: {:?} -> {:?}", record.game_id, self.state, next);
        }
        self.state = next;
        self.record = Some(record);
    }

    fn record_mut(&mut self) -> Result<&mut GameRecord, ClientError> {
        self.record.as_mut().ok_or(ClientError::NoGame)
    }

    /// First request on a newly established transport.
    pub fn on_transport_open(&mut self) -> Result<Vec<ClientMessage>, ClientError> {
        Ok(match self.guard.on_open()? {
            Some(OpenStep::Fetch(id)) => vec![get_game(id)],
            Some(OpenStep::Create) => vec![ClientMessage::new("createGame", json!({}))],
            None => Vec::new(),
        })
    }

    /// Drops the current game and asks for a fresh one.
    pub fn new_game(&mut self) -> Result<Vec<ClientMessage>, ClientError> {
        self.guard.forget()?;
        self.record = None;
        self.state = ClientState::Init;
        self.on_transport_open()
    }

    /// Mints a local game with no server behind it.
    pub fn start_offline(&mut self) {
        let mut record = GameRecord::new(Uuid::new_v4());
        record.enemy_board = self.opponent.place_fleet();
        info!("Started offline game {}", record.game_id);
        self.set_record(record);
    }

    pub fn place_ship(&mut self, row: usize, col: usize) -> Result<Vec<ClientMessage>, ClientError> {
        let record = self.record_mut()?;
        if !record.place_ship(row, col)? {
            return Ok(Vec::new());
        }
        let message = update_game(
            record.game_id,
            json!({
                "playerBoard": record.player_board,
                "shipsPlaced": record.ships_placed,
            }),
        );
        let record = record.clone();
        self.set_record(record);
        Ok(vec![message])
    }

    pub fn attack(&mut self, row: usize, col: usize) -> Result<Vec<ClientMessage>, ClientError> {
        self.resolve(Side::Player, row, col)
    }

    /// True when the automated opponent is due to move.
    pub fn opponent_due(&self) -> bool {
        self.state == ClientState::Battle
            && self
                .record
                .as_ref()
                .map_or(false, |record| record.is_player_turn == Some(false))
    }

    /// Lets the opponent fire once, if it is its turn in a live game.
    pub fn opponent_move(&mut self) -> Result<Vec<ClientMessage>, ClientError> {
        if !self.opponent_due() {
            return Ok(Vec::new());
        }
        let board = self.record_mut()?.player_board;
        match self.opponent.next_target(&board) {
            Some((row, col)) => self.resolve(Side::Opponent, row, col),
            None => Ok(Vec::new()),
        }
    }

    fn resolve(&mut self, side: Side, row: usize, col: usize) -> Result<Vec<ClientMessage>, ClientError> {
        let record = self.record_mut()?;
        let turn_seq = record.turn_seq;
        let outcome = record.apply_attack(side, row, col)?;
        debug!("{:?} fired at ({}, {}): {:?}", side, row, col, outcome.cell);

        let message = ClientMessage::new(
            "attack",
            json!({
                "gameId": record.game_id,
                "side": side,
                "row": row,
                "col": col,
                "turnSeq": turn_seq,
            }),
        );
        let record = record.clone();
        self.set_record(record);
        Ok(vec![message])
    }

    /// Reconciles one server push. Returns any follow-up messages.
    pub fn apply_push(&mut self, push: &ServerPush) -> Result<Vec<ClientMessage>, ClientError> {
        match push.push_kind() {
            PushKind::Event(EventType::GameCreated) => self.on_created(push),
            PushKind::Event(EventType::GameFound) | PushKind::Event(EventType::GameUpdated) => {
                self.on_state(push)
            }
            PushKind::Event(EventType::GameNotFound) | PushKind::Event(EventType::GameDeleted) => {
                if !self.concerns_us(push) {
                    return Ok(Vec::new());
                }
                info!("Game {:?} is gone on the server, creating a new one", self.game_id());
                self.new_game()
            }
            PushKind::Event(EventType::ActionFailed) => {
                warn!("Server could not apply an action: {}", push.data);
                Ok(self.game_id().map(get_game).into_iter().collect())
            }
            PushKind::Error => {
                warn!("Server rejected a message: {}", push.data);
                Ok(Vec::new())
            }
            other => {
                debug!("Ignoring push {:?}", other);
                Ok(Vec::new())
            }
        }
    }

    fn push_game_id(push: &ServerPush) -> Option<Uuid> {
        push.game_id
            .as_deref()
            .or_else(|| push.data.get("gameId").and_then(Value::as_str))
            .and_then(|id| id.parse().ok())
    }

    fn concerns_us(&self, push: &ServerPush) -> bool {
        match (Self::push_game_id(push), self.game_id()) {
            (Some(theirs), Some(ours)) => theirs == ours,
            _ => false,
        }
    }

    fn on_created(&mut self, push: &ServerPush) -> Result<Vec<ClientMessage>, ClientError> {
        if self.record.is_some() {
            debug!("Ignoring GameCreated while a game is loaded");
            return Ok(Vec::new());
        }
        let mut record: GameRecord = parse(&push.data)?;
        self.guard.record_created(record.game_id)?;

        record.enemy_board = self.opponent.place_fleet();
        let message = update_game(record.game_id, json!({ "enemyBoard": record.enemy_board }));
        info!("Created game {}", record.game_id);
        self.set_record(record);
        Ok(vec![message])
    }

    fn on_state(&mut self, push: &ServerPush) -> Result<Vec<ClientMessage>, ClientError> {
        if !self.concerns_us(push) {
            return Ok(Vec::new());
        }
        if self.state == ClientState::Ended {
            debug!("Game over, ignoring further state");
            return Ok(Vec::new());
        }

        let record = match self.record.clone() {
            Some(mut record) => {
                let update: GameUpdate = parse(&push.data)?;
                // Pushes can arrive after later local moves. One from an older
                // turn would hand the turn back and replay moves already made.
                if let Some(seq) = update.turn_seq.filter(|&seq| seq < record.turn_seq) {
                    debug!(
                        "Ignoring stale state at turn {} (local turn {})",
                        seq, record.turn_seq
                    );
                    return Ok(Vec::new());
                }
                record.merge(&update);
                record
            }
            None => parse(&push.data)?,
        };
        self.set_record(record);
        Ok(Vec::new())
    }
}

fn parse<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, ClientError> {
    serde_json::from_value(data.clone())
        .map_err(|e| ClientError::Sync(SyncError::Malformed(e.to_string())))
}

fn get_game(game_id: Uuid) -> ClientMessage {
    ClientMessage::new("getGame", json!({ "gameId": game_id }))
}

fn update_game(game_id: Uuid, fields: Value) -> ClientMessage {
    let mut data = match fields {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    data.insert("gameId".to_string(), json!(game_id));
    ClientMessage {
        action: "updateGame".to_string(),
        data,
    }
}
