//! Integration tests for the battleship sync pipeline
//!
//! These tests wire the server components to the client state machine through
//! the in-memory socket hub and drive whole game flows end to end.

use client::game::{ClientSession, ClientState};
use client::guard::CreationGuard;
use client::opponent::ScriptedMoves;
use serde_json::{json, Map, Value};
use server::bus::{BusHandle, SOURCE_GAME};
use server::network::Components;
use server::session::SessionHandlers;
use shared::{
    CellState, ClientMessage, Envelope, EventType, GameStatus, PushKind, ServerPush, Side,
    BOARD_SIZE,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::assert_ok;
use uuid::Uuid;

/// Server components plus the queue the session edge publishes into.
struct Harness {
    components: Components,
    sessions: SessionHandlers,
    published: UnboundedReceiver<Envelope>,
}

/// One attached socket, seen from the server side.
struct Peer {
    id: String,
    outbox: UnboundedReceiver<String>,
}

impl Peer {
    fn drain(&mut self) -> Vec<ServerPush> {
        let mut pushes = Vec::new();
        while let Ok(raw) = self.outbox.try_recv() {
            pushes.push(ServerPush::parse(&raw).unwrap());
        }
        pushes
    }
}

impl Harness {
    fn new() -> Self {
        let components = Components::in_memory();
        let (bus, published) = BusHandle::channel();
        let sessions = SessionHandlers::new(components.registry.clone(), bus);
        Self {
            components,
            sessions,
            published,
        }
    }

    async fn connect(&mut self, id: &str) -> Peer {
        let outbox = self.components.hub.attach(id).await;
        assert_ok!(self.sessions.on_connect(id).await);
        self.pump().await;
        Peer {
            id: id.to_string(),
            outbox,
        }
    }

    /// Runs everything published so far through the bus.
    async fn pump(&mut self) {
        while let Ok(envelope) = self.published.try_recv() {
            self.components.bus.run_to_completion(envelope).await;
        }
    }

    async fn send(&mut self, peer: &Peer, message: &ClientMessage) -> ServerPush {
        let ack = self.sessions.on_message(&peer.id, &message.to_json());
        self.pump().await;
        ack
    }

    /// Sends `messages`, feeds every push back into `session` and keeps going
    /// until the session has nothing more to say. Returns every push seen.
    async fn exchange(
        &mut self,
        peer: &mut Peer,
        session: &mut ClientSession,
        messages: Vec<ClientMessage>,
    ) -> Vec<ServerPush> {
        let mut seen = Vec::new();
        let mut pending = messages;
        while !pending.is_empty() {
            for message in std::mem::take(&mut pending) {
                let ack = self.send(peer, &message).await;
                assert_eq!(ack.push_kind(), PushKind::Ack, "{:?}", ack);
            }
            for push in peer.drain() {
                pending.extend(session.apply_push(&push).unwrap());
                seen.push(push);
            }
        }
        seen
    }

    /// Broadcasts a result the way the REST edge does.
    async fn broadcast(&self, event_type: EventType, payload: Value) {
        let payload: Map<String, Value> = payload.as_object().cloned().unwrap();
        let envelope = Envelope::new(SOURCE_GAME, event_type, payload, None);
        self.components.bus.run_to_completion(envelope).await;
    }
}

fn session(moves: Vec<(usize, usize)>, fleet: Vec<(usize, usize)>) -> ClientSession {
    ClientSession::new(
        CreationGuard::in_memory(),
        Box::new(ScriptedMoves::new(moves, fleet)),
    )
}

/// Connects a client and lets it create its game.
async fn started(
    harness: &mut Harness,
    id: &str,
    fleet: Vec<(usize, usize)>,
) -> (Peer, ClientSession, Uuid) {
    let mut peer = harness.connect(id).await;
    let mut session = session(vec![(3, 3), (3, 2), (3, 1)], fleet);
    let open = session.on_transport_open().unwrap();
    harness.exchange(&mut peer, &mut session, open).await;
    let game_id = session.game_id().unwrap();
    (peer, session, game_id)
}

async fn placed(harness: &mut Harness, peer: &mut Peer, session: &mut ClientSession) {
    for col in 0..BOARD_SIZE {
        let out = session.place_ship(0, col).unwrap();
        harness.exchange(peer, session, out).await;
    }
}

/// GAME FLOW SCENARIOS
mod scenario_tests {
    use super::*;

    /// A create request persists a record and pushes it back to the requester
    #[tokio::test]
    async fn create_game_persists_and_pushes() {
        let mut harness = Harness::new();
        let mut peer = harness.connect("conn-a").await;
        let mut session = session(Vec::new(), vec![(2, 2)]);

        let open = session.on_transport_open().unwrap();
        assert_eq!(open[0].action, "createGame");
        let pushes = harness.exchange(&mut peer, &mut session, open).await;

        let created = &pushes[0];
        assert_eq!(created.push_kind(), PushKind::Event(EventType::GameCreated));
        let game_id: Uuid = created.data["gameId"].as_str().unwrap().parse().unwrap();
        assert_eq!(created.game_id.as_deref(), Some(game_id.to_string().as_str()));
        assert!(created.data.get("connectionId").is_none());

        let stored = harness.components.games.get(game_id).await.unwrap().unwrap();
        assert_eq!(stored.ships_placed, 0);
        assert_eq!(stored.is_player_turn, None);
        // The client laid out the enemy fleet right after creation.
        assert_eq!(stored.enemy_board.get(2, 2), Some(CellState::Ship));
        assert_eq!(session.game_id(), Some(game_id));
    }

    /// Four placements, one update each; the turn flag appears with the fourth
    #[tokio::test]
    async fn placement_reaches_battle() {
        let mut harness = Harness::new();
        let (mut peer, mut session, game_id) = started(&mut harness, "conn-a", vec![(2, 2)]).await;

        for col in 0..BOARD_SIZE {
            let out = session.place_ship(1, col).unwrap();
            harness.exchange(&mut peer, &mut session, out).await;

            let stored = harness.components.games.get(game_id).await.unwrap().unwrap();
            assert_eq!(stored.ships_placed, col as u32 + 1);
            if col + 1 < BOARD_SIZE {
                assert_eq!(stored.is_player_turn, None);
                assert_eq!(session.state(), ClientState::Placement);
            }
        }

        let stored = harness.components.games.get(game_id).await.unwrap().unwrap();
        assert_eq!(stored.is_player_turn, Some(true));
        assert_eq!(stored.status, GameStatus::InProgress);
        assert_eq!(session.state(), ClientState::Battle);
        let local = session.record().unwrap();
        assert_eq!(local.player_board, stored.player_board);
        assert_eq!(local.is_player_turn, stored.is_player_turn);
    }

    /// Hits flip the turn and sinking the last ship completes the game
    #[tokio::test]
    async fn attacks_until_victory() {
        let mut harness = Harness::new();
        let (mut peer, mut session, game_id) =
            started(&mut harness, "conn-a", vec![(2, 2), (1, 3)]).await;
        placed(&mut harness, &mut peer, &mut session).await;

        let out = session.attack(2, 2).unwrap();
        harness.exchange(&mut peer, &mut session, out).await;

        let stored = harness.components.games.get(game_id).await.unwrap().unwrap();
        assert_eq!(stored.enemy_board.get(2, 2), Some(CellState::Hit));
        assert_eq!(stored.is_player_turn, Some(false));
        assert_eq!(stored.turn_seq, 1);

        let out = session.opponent_move().unwrap();
        harness.exchange(&mut peer, &mut session, out).await;
        let stored = harness.components.games.get(game_id).await.unwrap().unwrap();
        assert_eq!(stored.player_board.get(3, 3), Some(CellState::Miss));
        assert_eq!(stored.is_player_turn, Some(true));

        let out = session.attack(1, 3).unwrap();
        harness.exchange(&mut peer, &mut session, out).await;

        let stored = harness.components.games.get(game_id).await.unwrap().unwrap();
        assert_eq!(stored.status, GameStatus::Completed);
        assert_eq!(stored.winner, Some(Side::Player));
        assert_eq!(stored.wins, 1);
        assert_eq!(stored.turn_seq, 3);
        assert_eq!(session.state(), ClientState::Ended);
    }

    /// Fetching a deleted game is answered, not failed, and the client
    /// falls back to creating a fresh one
    #[tokio::test]
    async fn deleted_game_falls_back_to_create() {
        let mut harness = Harness::new();
        let (mut peer, mut session, game_id) = started(&mut harness, "conn-a", vec![(2, 2)]).await;

        assert!(harness.components.games.delete(game_id).await.unwrap());

        // Reconnect: the guard knows the id and fetches it.
        let open = session.on_transport_open().unwrap();
        assert_eq!(open[0].action, "getGame");
        let pushes = harness.exchange(&mut peer, &mut session, open).await;

        let kinds: Vec<PushKind> = pushes.iter().map(ServerPush::push_kind).collect();
        assert_eq!(kinds[0], PushKind::Event(EventType::GameNotFound));
        assert!(kinds.contains(&PushKind::Event(EventType::GameCreated)));
        assert!(!kinds.contains(&PushKind::Event(EventType::ActionFailed)));

        let fresh = session.game_id().unwrap();
        assert_ne!(fresh, game_id);
        assert!(harness.components.games.get(fresh).await.unwrap().is_some());
        assert_eq!(session.guard().game_id(), Some(fresh));
    }
}

/// REPLAY AND FAILURE HANDLING
mod delivery_tests {
    use super::*;

    /// A redelivered attack is answered with current state and changes nothing
    #[tokio::test]
    async fn replayed_attack_does_not_flip_twice() {
        let mut harness = Harness::new();
        let (mut peer, mut session, game_id) = started(&mut harness, "conn-a", vec![(2, 2)]).await;
        placed(&mut harness, &mut peer, &mut session).await;

        let out = session.attack(0, 0).unwrap();
        harness.send(&peer, &out[0]).await;
        harness.send(&peer, &out[0]).await;

        let stored = harness.components.games.get(game_id).await.unwrap().unwrap();
        assert_eq!(stored.turn_seq, 1);
        assert_eq!(stored.is_player_turn, Some(false));

        let pushes = peer.drain();
        let replays: Vec<bool> = pushes
            .iter()
            .filter(|push| push.push_kind() == PushKind::Event(EventType::GameUpdated))
            .map(|push| push.data["replayed"].as_bool().unwrap())
            .collect();
        assert_eq!(replays, vec![false, true]);
    }

    /// Requests the server cannot apply come back as ActionFailed
    #[tokio::test]
    async fn rejected_request_reports_failure() {
        let mut harness = Harness::new();
        let (mut peer, mut session, game_id) = started(&mut harness, "conn-a", vec![(2, 2)]).await;

        // Attack before any ship is placed.
        let attack = ClientMessage::new(
            "attack",
            json!({ "gameId": game_id, "side": "player", "row": 0, "col": 0, "turnSeq": 0 }),
        );
        harness.send(&peer, &attack).await;

        let pushes = peer.drain();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].push_kind(), PushKind::Event(EventType::ActionFailed));
        assert_eq!(pushes[0].data["eventType"], "AttackInitiated");

        // The client answers a failure by resyncing.
        let out = session.apply_push(&pushes[0]).unwrap();
        assert_eq!(out[0].action, "getGame");
    }

    /// Unknown actions are acknowledged with an error; malformed input too
    #[tokio::test]
    async fn bad_messages_get_error_acks() {
        let mut harness = Harness::new();
        let mut peer = harness.connect("conn-a").await;

        let ack = harness
            .send(&peer, &ClientMessage::new("selfDestruct", json!({})))
            .await;
        assert!(ack.is_error());

        let ack = harness.sessions.on_message(&peer.id, "{not json");
        assert!(ack.is_error());
        harness.pump().await;
        assert!(peer.drain().is_empty());
    }
}

/// UNICAST AND BROADCAST DELIVERY
mod sender_tests {
    use super::*;

    /// A reply to a socket that went away prunes it from the registry
    #[tokio::test]
    async fn unicast_to_gone_peer_prunes_it() {
        let mut harness = Harness::new();
        let peer = harness.connect("conn-a").await;
        harness.components.hub.detach(&peer.id).await;

        harness
            .send(&peer, &ClientMessage::new("createGame", json!({})))
            .await;

        assert!(!harness.components.registry.is_live("conn-a").await.unwrap());
        assert_eq!(harness.components.registry.len().await.unwrap(), 0);
    }

    /// One gone peer does not keep the others from receiving a broadcast
    #[tokio::test]
    async fn broadcast_skips_and_prunes_gone_peer() {
        let mut harness = Harness::new();
        let mut a = harness.connect("conn-a").await;
        let b = harness.connect("conn-b").await;
        let mut c = harness.connect("conn-c").await;
        harness.components.hub.detach(&b.id).await;

        let game_id = Uuid::new_v4().to_string();
        harness
            .broadcast(EventType::GameUpdated, json!({ "gameId": game_id, "wins": 2 }))
            .await;

        for peer in [&mut a, &mut c] {
            let pushes = peer.drain();
            assert_eq!(pushes.len(), 1);
            assert_eq!(pushes[0].game_id.as_deref(), Some(game_id.as_str()));
        }
        let registry = &harness.components.registry;
        assert!(registry.is_live("conn-a").await.unwrap());
        assert!(!registry.is_live("conn-b").await.unwrap());
        assert!(registry.is_live("conn-c").await.unwrap());
    }

    /// Every peer receives a broadcast, but only the owner of the game merges it
    #[tokio::test]
    async fn broadcast_only_changes_matching_game() {
        let mut harness = Harness::new();
        let (mut peer_x, mut session_x, game_x) =
            started(&mut harness, "conn-x", vec![(2, 2)]).await;
        let (mut peer_y, mut session_y, game_y) =
            started(&mut harness, "conn-y", vec![(2, 2)]).await;
        assert_ne!(game_x, game_y);

        harness
            .broadcast(
                EventType::GameUpdated,
                json!({ "gameId": game_x.to_string(), "wins": 5 }),
            )
            .await;

        for push in peer_x.drain() {
            assert!(session_x.apply_push(&push).unwrap().is_empty());
        }
        let pushes_y = peer_y.drain();
        assert_eq!(pushes_y.len(), 1);
        for push in pushes_y {
            assert!(session_y.apply_push(&push).unwrap().is_empty());
        }

        assert_eq!(session_x.record().unwrap().wins, 5);
        assert_eq!(session_y.record().unwrap().wins, 0);
    }

    /// A disconnected peer no longer receives broadcasts
    #[tokio::test]
    async fn disconnected_peer_is_left_out() {
        let mut harness = Harness::new();
        let mut a = harness.connect("conn-a").await;
        let mut b = harness.connect("conn-b").await;

        assert!(harness.sessions.on_disconnect(&b.id).await.unwrap());
        assert!(!harness.sessions.on_disconnect(&b.id).await.unwrap());

        harness
            .broadcast(
                EventType::GameDeleted,
                json!({ "gameId": Uuid::new_v4().to_string(), "deleted": true }),
            )
            .await;

        assert_eq!(a.drain().len(), 1);
        assert!(b.drain().is_empty());
    }
}

/// REQUESTS HANDLED CONCURRENTLY BY THE SPAWNED BUS WORKER
mod concurrency_tests {
    use super::*;
    use server::bus;
    use shared::{Board, GameRecord, GameUpdate};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    /// A peer connected to the live bus worker.
    async fn live(components: &Components, id: &str) -> (SessionHandlers, Peer, JoinHandle<()>) {
        let (handle, worker) = bus::spawn(components.bus.clone());
        let sessions = SessionHandlers::new(components.registry.clone(), handle);
        let outbox = components.hub.attach(id).await;
        assert_ok!(sessions.on_connect(id).await);
        let peer = Peer {
            id: id.to_string(),
            outbox,
        };
        (sessions, peer, worker)
    }

    /// Polls the stored record until `done` holds for it.
    async fn settled(
        components: &Components,
        game_id: Uuid,
        done: impl Fn(&GameRecord) -> bool,
    ) -> GameRecord {
        for _ in 0..200 {
            if let Some(record) = components.games.get(game_id).await.unwrap() {
                if done(&record) {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("game {} never settled", game_id);
    }

    /// Collects pushes until `count` of `event_type` have arrived.
    async fn pushes_of(peer: &mut Peer, event_type: EventType, count: usize) -> Vec<ServerPush> {
        let mut seen = Vec::new();
        for _ in 0..200 {
            seen.extend(peer.drain());
            let matching = seen
                .iter()
                .filter(|push| push.push_kind() == PushKind::Event(event_type))
                .count();
            if matching >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("only saw {:?}", seen);
    }

    async fn battle_ready(components: &Components) -> Uuid {
        let record = components.games.create().await.unwrap();
        for col in 0..BOARD_SIZE {
            components.games.place_ship(record.game_id, 0, col).await.unwrap();
        }
        let mut enemy = Board::new();
        enemy.set(2, 2, CellState::Ship).unwrap();
        let update = GameUpdate {
            enemy_board: Some(enemy),
            ..GameUpdate::default()
        };
        components.games.update(record.game_id, &update).await.unwrap();
        record.game_id
    }

    /// Two updates to different fields of one game both land
    #[tokio::test]
    async fn concurrent_updates_keep_both_fields() {
        let components = Components::in_memory();
        let (sessions, mut peer, worker) = live(&components, "conn-a").await;
        let game_id = components.games.create().await.unwrap().game_id;

        let wins = ClientMessage::new("updateGame", json!({ "gameId": game_id, "wins": 3 }));
        let losses = ClientMessage::new("updateGame", json!({ "gameId": game_id, "losses": 2 }));
        assert_eq!(sessions.on_message(&peer.id, &wins.to_json()).push_kind(), PushKind::Ack);
        assert_eq!(sessions.on_message(&peer.id, &losses.to_json()).push_kind(), PushKind::Ack);

        let pushes = pushes_of(&mut peer, EventType::GameUpdated, 2).await;
        let stored = settled(&components, game_id, |record| record.wins == 3 && record.losses == 2).await;
        assert_eq!(stored.wins, 3);
        assert_eq!(stored.losses, 2);
        assert!(pushes
            .iter()
            .all(|push| push.push_kind() != PushKind::Event(EventType::ActionFailed)));
        worker.abort();
    }

    /// An opponent move published ahead of the player's move it follows is
    /// redelivered until the player's move has landed
    #[tokio::test]
    async fn overtaking_attack_waits_for_its_turn() {
        let components = Components::in_memory();
        let (sessions, mut peer, worker) = live(&components, "conn-a").await;
        let game_id = battle_ready(&components).await;

        let opponent = ClientMessage::new(
            "attack",
            json!({ "gameId": game_id, "side": "opponent", "row": 3, "col": 3, "turnSeq": 1 }),
        );
        let player = ClientMessage::new(
            "attack",
            json!({ "gameId": game_id, "side": "player", "row": 1, "col": 1, "turnSeq": 0 }),
        );
        sessions.on_message(&peer.id, &opponent.to_json());
        sessions.on_message(&peer.id, &player.to_json());

        let stored = settled(&components, game_id, |record| record.turn_seq == 2).await;
        assert_eq!(stored.is_player_turn, Some(true));
        assert_eq!(stored.enemy_board.get(1, 1), Some(CellState::Miss));
        assert_eq!(stored.player_board.get(3, 3), Some(CellState::Miss));

        let pushes = pushes_of(&mut peer, EventType::GameUpdated, 2).await;
        let replays: Vec<bool> = pushes
            .iter()
            .filter(|push| push.push_kind() == PushKind::Event(EventType::GameUpdated))
            .map(|push| push.data["replayed"].as_bool().unwrap())
            .collect();
        assert_eq!(replays, vec![false, false]);
        assert!(pushes
            .iter()
            .all(|push| push.push_kind() != PushKind::Event(EventType::ActionFailed)));
        worker.abort();
    }
}
