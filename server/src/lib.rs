//! # Battleship Sync Server Library
//!
//! This library provides the authoritative backend for the game-session
//! synchronization subsystem. It keeps one durable record per game, tracks
//! which peers are connected, and pushes every state change back out to them.
//!
//! ## Core Responsibilities
//!
//! ### Durable Game Records
//! Every match has exactly one record keyed by its game id. Records are
//! mutated field by field, never replaced, and every mutator is safe to run
//! twice on the same input.
//!
//! ### Connection Tracking
//! Handles the lifecycle of peer connections:
//! - Registration at handshake with a bounded expiry
//! - Idempotent removal on disconnect
//! - Pruning of peers the transport reports as permanently gone
//!
//! ### Result Delivery
//! Results addressed to a peer are unicast to it; everything else is
//! broadcast to all live peers. One failed peer never blocks the others.
//!
//! ## Architecture Design
//!
//! ### Event-Driven Pipeline
//! Inbound socket messages flow through a fixed chain:
//!
//! ```text
//! session -> dispatcher -> event bus -> processors -> event bus -> sender
//! ```
//!
//! Publication is at-least-once. No ordering is assumed between independently
//! triggered envelopes, so cross-peer coordination happens only through the
//! stores.
//!
//! ## Module Organization
//!
//! ### Store Module (`store`)
//! Keyed tables with optional bincode snapshots.
//!
//! ### Client Manager Module (`client_manager`)
//! The connection registry.
//!
//! ### Game Module (`game`)
//! Game record CRUD, attacks guarded by turn sequence numbers, and the event
//! log.
//!
//! ### Bus, Dispatcher and Processors (`bus`, `dispatcher`, `processors`)
//! Action table lookup, routing by `(source, event type)`, redelivery of
//! transient failures, and the processors that own the records.
//!
//! ### Sender and Session Modules (`sender`, `session`)
//! Peer delivery and the connect/disconnect/message entry points.
//!
//! ### Network Module (`network`)
//! The axum router (WebSocket plus REST), component wiring and the expiry
//! sweeper.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{run, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         port: 9000,
//!         ..ServerConfig::default()
//!     };
//!
//!     // Serves /ws and /games until Ctrl+C
//!     run(config).await
//! }
//! ```

pub mod bus;
pub mod client_manager;
pub mod dispatcher;
pub mod game;
pub mod network;
pub mod processors;
pub mod sender;
pub mod session;
pub mod store;
