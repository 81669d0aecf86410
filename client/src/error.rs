use shared::{BoardError, SyncError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),
    /// Raised once the single reconnect attempt after a loss has failed.
    #[error("connection lost and reconnect failed: {0}")]
    ConnectionLost(String),
    #[error("could not persist client state: {0}")]
    Persist(String),
    #[error("no game loaded")]
    NoGame,
    #[error("invalid command: {0}")]
    Input(String),
    #[error(transparent)]
    Board(#[from] BoardError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}
