//! Connection registry for the sync server
//!
//! This module tracks which peers are currently reachable, including:
//! - Connection lifecycle (connect, disconnect, expiry)
//! - Liveness scans used by the broadcast sender
//! - Pruning of peers the transport reports as permanently gone
//!
//! Rows live in a durable [`Store`] rather than in the socket tasks, so every
//! cross-peer decision is made by reading the registry, never by sharing
//! in-process state between connections.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use shared::SyncError;
use std::sync::Arc;

use crate::store::Store;

/// Default lifetime of a connection row before it is considered stale.
pub const DEFAULT_CONNECTION_TTL: std::time::Duration = std::time::Duration::from_secs(2 * 60 * 60);

/// Represents one live peer
///
/// A row exists from the moment the socket handshake completes until the peer
/// disconnects, is pruned after a permanently-gone delivery, or expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Opaque identifier assigned at handshake
    pub id: String,
    /// When the handshake completed
    pub established_at: DateTime<Utc>,
    /// After this instant the row no longer counts as live
    pub expires_at: DateTime<Utc>,
}

impl Connection {
    /// Creates a connection row established now with the given lifetime
    pub fn new(id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            established_at: now,
            expires_at: now + ttl,
        }
    }

    /// Checks whether the row has outlived its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Manages every known connection row
///
/// The registry enforces at most one row per peer (rows are keyed by id, so
/// a re-registration refreshes the existing row) and filters out expired
/// rows on every scan, even before the periodic sweep deletes them.
pub struct ConnectionRegistry {
    /// Backing table keyed by connection id
    store: Arc<dyn Store<String, Connection>>,
    /// Lifetime given to newly registered rows
    ttl: Duration,
}

impl ConnectionRegistry {
    /// Creates a registry over the given store
    ///
    /// A TTL that does not fit chrono's range falls back to the default.
    pub fn new(store: Arc<dyn Store<String, Connection>>, ttl: std::time::Duration) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| {
            Duration::from_std(DEFAULT_CONNECTION_TTL).unwrap_or(Duration::hours(2))
        });
        Self { store, ttl }
    }

    /// Inserts a row for a newly connected peer
    ///
    /// Returns the stored row. Storage failures are returned to the caller,
    /// which logs them and lets the handshake complete anyway.
    pub async fn register(&self, id: &str) -> Result<Connection, SyncError> {
        let connection = Connection::new(id, self.ttl);
        self.store.put(id.to_string(), connection.clone()).await?;
        info!("Connection {} registered until {}", id, connection.expires_at);
        Ok(connection)
    }

    /// Removes a connection row
    ///
    /// Returns true if a row was found and deleted, false if it was already
    /// gone. Removing twice is not an error.
    pub async fn remove(&self, id: &str) -> Result<bool, SyncError> {
        let removed = self.store.remove(&id.to_string()).await?.is_some();
        if removed {
            info!("Connection {} removed", id);
        }
        Ok(removed)
    }

    /// Deletes the row of a peer the transport reported as permanently gone
    ///
    /// Failures are logged rather than returned; a stale row that survives
    /// here is retried on the next failed delivery or expires on its own.
    pub async fn prune(&self, id: &str) -> bool {
        match self.store.remove(&id.to_string()).await {
            Ok(Some(_)) => {
                warn!("Pruned stale connection {}", id);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to prune stale connection {}: {}", id, e);
                false
            }
        }
    }

    /// Returns whether a live (unexpired) row exists for the id
    pub async fn is_live(&self, id: &str) -> Result<bool, SyncError> {
        let now = Utc::now();
        Ok(self
            .store
            .get(&id.to_string())
            .await?
            .map(|connection| !connection.is_expired(now))
            .unwrap_or(false))
    }

    /// Gets every live connection
    ///
    /// Used by the sender to fan a broadcast out to all peers.
    pub async fn live_connections(&self) -> Result<Vec<Connection>, SyncError> {
        let now = Utc::now();
        let mut live: Vec<Connection> = self
            .store
            .scan()
            .await?
            .into_iter()
            .filter(|connection| !connection.is_expired(now))
            .collect();
        live.sort_by(|a, b| a.established_at.cmp(&b.established_at));
        Ok(live)
    }

    /// Checks for and removes expired rows
    ///
    /// Returns the ids that were deleted so the caller can log or close them.
    pub async fn purge_expired(&self) -> Result<Vec<String>, SyncError> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .store
            .scan()
            .await?
            .into_iter()
            .filter(|connection| connection.is_expired(now))
            .map(|connection| connection.id)
            .collect();

        for id in &expired {
            self.store.remove(id).await?;
            info!("Connection {} expired", id);
        }

        Ok(expired)
    }

    /// Returns the number of stored rows, live or not
    pub async fn len(&self) -> Result<usize, SyncError> {
        Ok(self.store.scan().await?.len())
    }
}
