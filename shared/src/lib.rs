use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod error;
pub mod events;
pub mod protocol;

pub use error::{BoardError, SyncError};
pub use events::{Envelope, EventType, ACTION_TABLE};
pub use protocol::{ClientMessage, PushKind, ServerPush};

pub const BOARD_SIZE: usize = 4;
pub const FLEET_SIZE: u32 = BOARD_SIZE as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CellState {
    #[default]
    Empty,
    Ship,
    Hit,
    Miss,
}

impl CellState {
    pub fn is_marked(self) -> bool {
        matches!(self, CellState::Hit | CellState::Miss)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Player,
    Opponent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    #[default]
    Setup,
    InProgress,
    Completed,
}

/// Fixed-size grid of cells. The dimensions are part of the type, so a board
/// of any other shape fails to deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Board {
    cells: [[CellState; BOARD_SIZE]; BOARD_SIZE],
}

impl Board {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<CellState> {
        self.cells.get(row).and_then(|r| r.get(col)).copied()
    }

    pub fn set(&mut self, row: usize, col: usize, state: CellState) -> Result<(), BoardError> {
        let cell = self
            .cells
            .get_mut(row)
            .and_then(|r| r.get_mut(col))
            .ok_or(BoardError::OutOfBounds { row, col })?;
        *cell = state;
        Ok(())
    }

    pub fn count(&self, state: CellState) -> usize {
        self.cells
            .iter()
            .flatten()
            .filter(|cell| **cell == state)
            .count()
    }

    /// Coordinates that have not been attacked yet.
    pub fn unmarked_cells(&self) -> Vec<(usize, usize)> {
        let mut cells = Vec::new();
        for (row, line) in self.cells.iter().enumerate() {
            for (col, cell) in line.iter().enumerate() {
                if !cell.is_marked() {
                    cells.push((row, col));
                }
            }
        }
        cells
    }

    /// True once at least one ship was hit and none are left standing.
    pub fn all_ships_sunk(&self) -> bool {
        self.count(CellState::Ship) == 0 && self.count(CellState::Hit) > 0
    }

    /// Marks the cell as HIT or MISS and returns the new state.
    pub fn resolve_attack(&mut self, row: usize, col: usize) -> Result<CellState, BoardError> {
        let outcome = match self.get(row, col) {
            None => return Err(BoardError::OutOfBounds { row, col }),
            Some(CellState::Ship) => CellState::Hit,
            Some(CellState::Empty) => CellState::Miss,
            Some(_) => return Err(BoardError::AlreadyMarked { row, col }),
        };
        self.set(row, col, outcome)?;
        Ok(outcome)
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  ")?;
        for col in 0..BOARD_SIZE {
            write!(f, " {}", col)?;
        }
        writeln!(f)?;
        for (row, line) in self.cells.iter().enumerate() {
            write!(f, "{} ", row)?;
            for cell in line {
                let glyph = match cell {
                    CellState::Empty => '.',
                    CellState::Ship => '#',
                    CellState::Hit => 'X',
                    CellState::Miss => 'o',
                };
                write!(f, " {}", glyph)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Result of a resolved attack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttackOutcome {
    pub cell: CellState,
    pub game_over: bool,
}

/// Durable per-game document. One per match, keyed by `game_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub game_id: Uuid,
    pub player_board: Board,
    pub enemy_board: Board,
    pub ships_placed: u32,
    pub is_player_turn: Option<bool>,
    pub status: GameStatus,
    pub winner: Option<Side>,
    pub wins: u32,
    pub losses: u32,
    /// Number of attacks resolved so far. Attack events must carry the
    /// current value, which keeps a replayed attack from flipping the turn
    /// twice.
    pub turn_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GameRecord {
    pub fn new(game_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            game_id,
            player_board: Board::new(),
            enemy_board: Board::new(),
            ships_placed: 0,
            is_player_turn: None,
            status: GameStatus::Setup,
            winner: None,
            wins: 0,
            losses: 0,
            turn_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_over(&self) -> bool {
        self.status == GameStatus::Completed
    }

    /// Copies every field present in `update` onto the record. Absent fields
    /// are left untouched.
    pub fn merge(&mut self, update: &GameUpdate) {
        if let Some(board) = update.player_board {
            self.player_board = board;
        }
        if let Some(board) = update.enemy_board {
            self.enemy_board = board;
        }
        if let Some(ships) = update.ships_placed {
            self.ships_placed = ships;
        }
        if let Some(turn) = update.is_player_turn {
            self.is_player_turn = turn;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(winner) = update.winner {
            self.winner = winner;
        }
        if let Some(wins) = update.wins {
            self.wins = wins;
        }
        if let Some(losses) = update.losses {
            self.losses = losses;
        }
        if let Some(seq) = update.turn_seq {
            self.turn_seq = seq;
        }
    }

    /// Validating merge used by the authoritative side.
    pub fn apply_update(&mut self, update: &GameUpdate) -> Result<(), SyncError> {
        if let Some(ships) = update.ships_placed {
            if ships > FLEET_SIZE {
                return Err(SyncError::Rejected(format!(
                    "shipsPlaced {} exceeds fleet size {}",
                    ships, FLEET_SIZE
                )));
            }
        }
        self.merge(update);
        self.enforce_turn_invariant();
        Ok(())
    }

    /// The turn flag is null exactly while ships are still being placed.
    pub fn enforce_turn_invariant(&mut self) {
        if self.ships_placed < FLEET_SIZE {
            self.is_player_turn = None;
        } else {
            if self.is_player_turn.is_none() {
                self.is_player_turn = Some(true);
            }
            if self.status == GameStatus::Setup {
                self.status = GameStatus::InProgress;
            }
        }
    }

    /// Places one ship on the player's board. Placing on a cell that already
    /// holds a ship is a no-op and returns `Ok(false)`.
    pub fn place_ship(&mut self, row: usize, col: usize) -> Result<bool, BoardError> {
        match self.player_board.get(row, col) {
            None => return Err(BoardError::OutOfBounds { row, col }),
            Some(CellState::Ship) => return Ok(false),
            Some(CellState::Empty) => {}
            Some(_) => return Err(BoardError::AlreadyMarked { row, col }),
        }
        if self.ships_placed >= FLEET_SIZE {
            return Err(BoardError::FleetComplete);
        }
        self.player_board.set(row, col, CellState::Ship)?;
        self.ships_placed += 1;
        self.enforce_turn_invariant();
        Ok(true)
    }

    /// Resolves an attack by `side`, flips the turn flag exactly once and
    /// advances `turn_seq`. The player attacks the enemy board and the
    /// opponent attacks the player board.
    pub fn apply_attack(
        &mut self,
        side: Side,
        row: usize,
        col: usize,
    ) -> Result<AttackOutcome, BoardError> {
        if self.is_over() {
            return Err(BoardError::GameOver);
        }
        if self.ships_placed < FLEET_SIZE {
            return Err(BoardError::PlacementIncomplete);
        }
        let expected = Some(side == Side::Player);
        if self.is_player_turn != expected {
            return Err(BoardError::NotYourTurn);
        }

        let board = match side {
            Side::Player => &mut self.enemy_board,
            Side::Opponent => &mut self.player_board,
        };
        let cell = board.resolve_attack(row, col)?;
        let game_over = board.all_ships_sunk();

        self.is_player_turn = Some(side == Side::Opponent);
        self.turn_seq += 1;

        if game_over {
            self.status = GameStatus::Completed;
            self.winner = Some(side);
            match side {
                Side::Player => self.wins += 1,
                Side::Opponent => self.losses += 1,
            }
        }

        Ok(AttackOutcome { cell, game_over })
    }
}

/// Partial set of record fields. Used both as the Update processor input and
/// as the client's view of an inbound push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_board: Option<Board>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enemy_board: Option<Board>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ships_placed: Option<u32>,
    // Outer `None` = field absent, `Some(None)` = explicit null.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub is_player_turn: Option<Option<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<GameStatus>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub winner: Option<Option<Side>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wins: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub losses: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_seq: Option<u64>,
}

impl GameUpdate {
    pub fn is_empty(&self) -> bool {
        *self == GameUpdate::default()
    }
}

impl From<&GameRecord> for GameUpdate {
    fn from(record: &GameRecord) -> Self {
        Self {
            player_board: Some(record.player_board),
            enemy_board: Some(record.enemy_board),
            ships_placed: Some(record.ships_placed),
            is_player_turn: Some(record.is_player_turn),
            status: Some(record.status),
            winner: Some(record.winner),
            wins: Some(record.wins),
            losses: Some(record.losses),
            turn_seq: Some(record.turn_seq),
        }
    }
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
