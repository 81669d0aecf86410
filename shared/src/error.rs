use thiserror::Error;
use uuid::Uuid;

/// Failure taxonomy shared by every component of the sync subsystem.
///
/// `Malformed` and `Store` always surface to the caller. `OutOfOrder` is
/// retried by the bus and surfaces only once retries run out. `NotFound` and
/// `Gone` are absorbed where they occur (client fallback and registry
/// pruning respectively). `UnknownAction` is observable but never acted on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("game {0} not found")]
    NotFound(Uuid),

    #[error("peer {0} is gone")]
    Gone(String),

    #[error("store failure: {0}")]
    Store(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("rejected: {0}")]
    Rejected(String),

    /// The request depends on a change that has not landed yet.
    #[error("out of order: {0}")]
    OutOfOrder(String),

    #[error("event bus is closed")]
    BusClosed,
}

impl SyncError {
    /// Transient failures are worth redelivering; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Store(_) | SyncError::BusClosed | SyncError::OutOfOrder(_)
        )
    }
}

/// Reasons a board mutation is refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BoardError {
    #[error("cell ({row}, {col}) is outside the board")]
    OutOfBounds { row: usize, col: usize },

    #[error("cell ({row}, {col}) is already marked")]
    AlreadyMarked { row: usize, col: usize },

    #[error("all ships are already placed")]
    FleetComplete,

    #[error("it is not this side's turn")]
    NotYourTurn,

    #[error("the game is over")]
    GameOver,

    #[error("ships are still being placed")]
    PlacementIncomplete,
}

impl From<BoardError> for SyncError {
    fn from(err: BoardError) -> Self {
        SyncError::Rejected(err.to_string())
    }
}
