//! # Battleship Client Library
//!
//! This library provides the client side of the game-session sync system. It
//! keeps a local copy of one game, plays moves against it immediately and
//! forwards them to the server, which answers with pushes that are merged
//! back in.
//!
//! ## Architecture Overview
//!
//! ### Optimistic Moves
//! Ship placements and attacks are applied to the local record first. The
//! outgoing message only reports what already happened, so the terminal never
//! waits on the network.
//!
//! ### Push Reconciliation
//! Server pushes overwrite only the fields they carry. Pushes for other games
//! are ignored, and a finished game takes no further state.
//!
//! ### Creation Guard
//! A small JSON file remembers the current game id and whether a create is
//! outstanding. Reconnects and restarts fetch the known game instead of
//! creating another one.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! The client state machine (`Init -> Placement -> Battle -> Ended`) and push
//! handling.
//!
//! ### Guard Module (`guard`)
//! Durable creation flags.
//!
//! ### Opponent Module (`opponent`)
//! Move sources for the automated opponent, random or scripted.
//!
//! ### Input Module (`input`)
//! Terminal command parsing and the stdin reader task.
//!
//! ### Network Module (`network`)
//! WebSocket transport, the offline transport and the top-level run loop with
//! a single reconnect attempt per lost connection.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::guard::CreationGuard;
//! use client::input::spawn_stdin_reader;
//! use client::network::{Client, LiveTransport, DEFAULT_RECONNECT_DELAY};
//! use client::game::ClientSession;
//! use client::opponent::OpponentKind;
//!
//! # async fn demo() -> Result<(), client::error::ClientError> {
//! let session = ClientSession::new(
//!     CreationGuard::load("battleship.json"),
//!     OpponentKind::Random.build(None),
//! );
//! let transport = Box::new(LiveTransport::new("ws://127.0.0.1:8080/ws"));
//! let mut client = Client::new(session, transport, DEFAULT_RECONNECT_DELAY);
//! client.run(spawn_stdin_reader()).await
//! # }
//! ```

pub mod error;
pub mod game;
pub mod guard;
pub mod input;
pub mod network;
pub mod opponent;
