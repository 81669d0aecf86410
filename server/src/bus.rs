//! Event bus: fans published envelopes out to processors by
//! `(source, event type)`.
//!
//! Publication is at-least-once. A processor that fails transiently gets the
//! same envelope again, up to the configured attempt count, and nothing is
//! deduplicated, so every processor must tolerate replay. Envelopes are
//! handled concurrently and in no particular order.

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, error, warn};
use serde_json::{Map, Value};
use shared::{Envelope, EventType, SyncError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const SOURCE_SESSION: &str = "battleship.session";
pub const SOURCE_DISPATCHER: &str = "battleship.dispatcher";
pub const SOURCE_GAME: &str = "battleship.game";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Pause before a redelivery, multiplied by the attempt number.
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(25);

/// A routing target. Returns follow-up envelopes to publish.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, envelope: &Envelope) -> Result<Vec<Envelope>, SyncError>;
}

pub struct RoutingRule {
    source: String,
    event_types: Vec<EventType>,
    target: Arc<dyn Processor>,
}

impl RoutingRule {
    fn matches(&self, envelope: &Envelope) -> bool {
        self.source == envelope.source && self.event_types.contains(&envelope.event_type)
    }
}

pub struct EventBus {
    rules: Vec<RoutingRule>,
    max_attempts: u32,
}

impl EventBus {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            rules: Vec::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn route(
        mut self,
        source: &str,
        event_types: &[EventType],
        target: Arc<dyn Processor>,
    ) -> Self {
        self.rules.push(RoutingRule {
            source: source.to_string(),
            event_types: event_types.to_vec(),
            target,
        });
        self
    }

    /// Names of the processors an envelope would be delivered to.
    pub fn targets(&self, envelope: &Envelope) -> Vec<&'static str> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(envelope))
            .map(|rule| rule.target.name())
            .collect()
    }

    /// Delivers one envelope to every matching processor and collects their
    /// follow-ups.
    pub async fn deliver(&self, envelope: &Envelope) -> Vec<Envelope> {
        let targets: Vec<&Arc<dyn Processor>> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(envelope))
            .map(|rule| &rule.target)
            .collect();

        if targets.is_empty() {
            debug!(
                "No route for {} from {}",
                envelope.event_type, envelope.source
            );
            return Vec::new();
        }

        join_all(
            targets
                .into_iter()
                .map(|target| self.deliver_to(target, envelope)),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    async fn deliver_to(&self, target: &Arc<dyn Processor>, envelope: &Envelope) -> Vec<Envelope> {
        let mut attempt = 1;
        loop {
            match target.process(envelope).await {
                Ok(follow_ups) => return follow_ups,
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "{} failed on {} (attempt {}/{}), redelivering: {}",
                        target.name(),
                        envelope.event_type,
                        attempt,
                        self.max_attempts,
                        e
                    );
                    tokio::time::sleep(REDELIVERY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("{} failed on {}: {}", target.name(), envelope.event_type, e);
                    return failure_envelope(envelope, &e).into_iter().collect();
                }
            }
        }
    }

    /// Handles an envelope and everything it transitively produces, in
    /// breadth-first order. Returns every envelope handled, the first one
    /// included.
    pub async fn run_to_completion(&self, envelope: Envelope) -> Vec<Envelope> {
        let mut handled = Vec::new();
        let mut queue = VecDeque::from([envelope]);
        while let Some(next) = queue.pop_front() {
            queue.extend(self.deliver(&next).await);
            handled.push(next);
        }
        handled
    }
}

/// The failed acknowledgment sent back to the originating peer. Broadcasts
/// and failures of failure pushes have nobody to tell and are only logged.
fn failure_envelope(envelope: &Envelope, err: &SyncError) -> Option<Envelope> {
    if envelope.correlation_id.is_none() || envelope.event_type == EventType::ActionFailed {
        return None;
    }

    let mut payload = Map::new();
    payload.insert(
        "eventType".to_string(),
        Value::String(envelope.event_type.as_str().to_string()),
    );
    payload.insert("reason".to_string(), Value::String(err.to_string()));
    if let Some(game_id) = envelope.payload.get("gameId") {
        payload.insert("gameId".to_string(), game_id.clone());
    }
    Some(envelope.reply(SOURCE_GAME, EventType::ActionFailed, payload))
}

/// Publishing side of the bus.
#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl BusHandle {
    /// A handle plus the receiving end, for callers that drive delivery
    /// themselves.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, envelope: Envelope) -> Result<(), SyncError> {
        debug!("Publishing {} from {}", envelope.event_type, envelope.source);
        self.tx.send(envelope).map_err(|_| SyncError::BusClosed)
    }
}

/// Spawns the delivery worker. Each envelope is handled on its own task and
/// its follow-ups are published back onto the bus.
pub fn spawn(bus: Arc<EventBus>) -> (BusHandle, JoinHandle<()>) {
    let (handle, mut rx) = BusHandle::channel();
    let republish = handle.clone();

    let worker = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let bus = Arc::clone(&bus);
            let republish = republish.clone();
            tokio::spawn(async move {
                for follow_up in bus.deliver(&envelope).await {
                    if let Err(e) = republish.publish(follow_up) {
                        error!("Failed to republish follow-up: {}", e);
                    }
                }
            });
        }
    });

    (handle, worker)
}
