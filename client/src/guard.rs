//! Durable flags that keep a reconnecting client from creating duplicate
//! games.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::ClientError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardState {
    pub game_id: Option<Uuid>,
    pub creation_attempted: bool,
}

/// What to ask the server for once a transport is (re-)established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStep {
    Fetch(Uuid),
    Create,
}

pub struct CreationGuard {
    state: GuardState,
    path: Option<PathBuf>,
}

impl CreationGuard {
    pub fn in_memory() -> Self {
        Self {
            state: GuardState::default(),
            path: None,
        }
    }

    /// Loads flags from a JSON file. A missing or unreadable file starts
    /// from a clean slate.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring corrupt state file {}: {}", path.display(), e);
                GuardState::default()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => GuardState::default(),
            Err(e) => {
                warn!("Could not read state file {}: {}", path.display(), e);
                GuardState::default()
            }
        };
        debug!("Loaded creation guard {:?}", state);
        Self {
            state,
            path: Some(path),
        }
    }

    pub fn state(&self) -> &GuardState {
        &self.state
    }

    pub fn game_id(&self) -> Option<Uuid> {
        self.state.game_id
    }

    /// Decides the first request on a fresh transport. A known id is always
    /// fetched; a create is issued only when none is outstanding.
    pub fn on_open(&mut self) -> Result<Option<OpenStep>, ClientError> {
        if let Some(id) = self.state.game_id {
            return Ok(Some(OpenStep::Fetch(id)));
        }
        if self.state.creation_attempted {
            debug!("Creation already outstanding, not creating again");
            return Ok(None);
        }
        self.state.creation_attempted = true;
        self.persist()?;
        Ok(Some(OpenStep::Create))
    }

    pub fn record_created(&mut self, game_id: Uuid) -> Result<(), ClientError> {
        self.state = GuardState {
            game_id: Some(game_id),
            creation_attempted: false,
        };
        self.persist()
    }

    /// Drops the known id, e.g. after the server reported it missing.
    pub fn forget(&mut self) -> Result<(), ClientError> {
        self.state = GuardState::default();
        self.persist()
    }

    fn persist(&self) -> Result<(), ClientError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&self.state)
            .map_err(|e| ClientError::Persist(e.to_string()))?;
        std::fs::write(path, bytes).map_err(|e| ClientError::Persist(e.to_string()))
    }
}
