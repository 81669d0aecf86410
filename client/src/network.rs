use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{ClientMessage, ServerPush};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ClientError;
use crate::game::ClientSession;
use crate::input::{Command, HELP};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Connection to the sync server
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), ClientError>;

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError>;

    /// Next push from the server. `Ok(None)` means the connection closed.
    async fn recv(&mut self) -> Result<Option<ServerPush>, ClientError>;

    async fn close(&mut self);

    /// False for transports that never reach a server.
    fn is_live(&self) -> bool {
        true
    }
}

/// WebSocket transport to a running server
pub struct LiveTransport {
    url: String,
    socket: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl LiveTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            socket: None,
        }
    }
}

#[async_trait]
impl Transport for LiveTransport {
    async fn connect(&mut self) -> Result<(), ClientError> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        info!("Connected to {}", self.url);
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| ClientError::Transport("not connected".to_string()))?;
        socket
            .send(Message::Text(message.to_json()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<ServerPush>, ClientError> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(None);
        };
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => match ServerPush::parse(&text) {
                    Ok(push) => return Ok(Some(push)),
                    Err(e) => warn!("Ignoring unreadable push: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    self.socket = None;
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.socket = None;
                    return Err(ClientError::Transport(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
    }
}

/// Transport for offline play. Sends go nowhere and nothing ever arrives.
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn connect(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        debug!("Offline, dropping {}", message.action);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ServerPush>, ClientError> {
        std::future::pending().await
    }

    async fn close(&mut self) {}

    fn is_live(&self) -> bool {
        false
    }
}

/// Top-level controller owning the session and its transport
pub struct Client {
    session: ClientSession,
    transport: Box<dyn Transport>,
    reconnect_delay: Duration,
}

impl Client {
    pub fn new(
        session: ClientSession,
        transport: Box<dyn Transport>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            session,
            transport,
            reconnect_delay,
        }
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Sends best-effort. A failed send is logged; the next push or
    /// reconnect brings the session back in line.
    async fn send_all(&mut self, messages: Vec<ClientMessage>) {
        for message in messages {
            if let Err(e) = self.transport.send(&message).await {
                warn!("Failed to send {}: {}", message.action, e);
            }
        }
    }

    async fn open(&mut self) -> Result<(), ClientError> {
        self.transport.connect().await?;
        if self.transport.is_live() {
            let messages = self.session.on_transport_open()?;
            self.send_all(messages).await;
        } else {
            self.session.start_offline();
        }
        Ok(())
    }

    /// One reconnect attempt after the fixed delay.
    async fn reconnect(&mut self) -> Result<(), ClientError> {
        warn!("Connection lost, reconnecting in {:?}", self.reconnect_delay);
        sleep(self.reconnect_delay).await;
        self.transport
            .connect()
            .await
            .map_err(|e| ClientError::ConnectionLost(e.to_string()))?;
        let messages = self.session.on_transport_open()?;
        self.send_all(messages).await;
        Ok(())
    }

    async fn after_local_change(&mut self) -> Result<(), ClientError> {
        while self.session.opponent_due() {
            let messages = self.session.opponent_move()?;
            if messages.is_empty() {
                break;
            }
            self.send_all(messages).await;
        }
        Ok(())
    }

    pub async fn handle_push(&mut self, push: ServerPush) -> Result<(), ClientError> {
        let messages = self.session.apply_push(&push)?;
        self.send_all(messages).await;
        self.after_local_change().await
    }

    /// Applies one command. Returns false once the user asked to quit.
    pub async fn handle_command(&mut self, command: Command) -> Result<bool, ClientError> {
        let result = match command {
            Command::Quit => return Ok(false),
            Command::Show => {
                self.show();
                return Ok(true);
            }
            Command::Place { row, col } => self.session.place_ship(row, col),
            Command::Attack { row, col } => self.session.attack(row, col),
            Command::New => self.session.new_game(),
        };

        match result {
            Ok(messages) => {
                self.send_all(messages).await;
                self.after_local_change().await?;
                self.show();
            }
            Err(ClientError::Board(e)) => println!("{}", e),
            Err(ClientError::NoGame) => println!("No game loaded yet"),
            Err(e) => return Err(e),
        }
        Ok(true)
    }

    fn show(&self) {
        match self.session.record() {
            Some(record) => {
                println!("Game {} ({:?})", record.game_id, self.session.state());
                println!("Your fleet:\n{}", record.player_board);
                println!("Enemy waters:\n{}", record.enemy_board);
                match record.winner {
                    Some(winner) => println!("Winner: {:?}", winner),
                    None => println!(
                        "Ships placed: {}  Your turn: {:?}",
                        record.ships_placed, record.is_player_turn
                    ),
                }
            }
            None => println!("Waiting for the server..."),
        }
    }

    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> Result<(), ClientError> {
        self.open().await?;
        println!("{}", HELP);

        loop {
            tokio::select! {
                push = self.transport.recv() => {
                    match push {
                        Ok(Some(push)) => {
                            if let Err(e) = self.handle_push(push).await {
                                error!("Failed to apply push: {}", e);
                            }
                        }
                        Ok(None) => self.reconnect().await?,
                        Err(e) => {
                            warn!("Transport failed: {}", e);
                            self.reconnect().await?;
                        }
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await? {
                        break;
                    }
                }
            }
        }

        self.transport.close().await;
        info!("Client stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::CreationGuard;
    use crate::opponent::ScriptedMoves;
    use serde_json::json;
    use shared::{EventType, GameRecord};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    /// Scripted transport: accepts the first `accept` connects, refuses the
    /// rest, and replays `inbox` until it runs dry.
    #[derive(Clone, Default)]
    struct FakeTransport {
        sent: Arc<Mutex<Vec<ClientMessage>>>,
        inbox: Arc<Mutex<VecDeque<ServerPush>>>,
        connects: Arc<Mutex<u32>>,
        accept: u32,
    }

    impl FakeTransport {
        fn accepting(accept: u32) -> Self {
            Self {
                accept,
                ..Self::default()
            }
        }

        fn actions(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|m| m.action.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&mut self) -> Result<(), ClientError> {
            let mut connects = self.connects.lock().unwrap();
            *connects += 1;
            if *connects > self.accept {
                return Err(ClientError::Transport("refused".to_string()));
            }
            Ok(())
        }

        async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<ServerPush>, ClientError> {
            Ok(self.inbox.lock().unwrap().pop_front())
        }

        async fn close(&mut self) {}
    }

    fn client(transport: FakeTransport) -> Client {
        let session = ClientSession::new(
            CreationGuard::in_memory(),
            Box::new(ScriptedMoves::row_major()),
        );
        Client::new(session, Box::new(transport), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_open_sends_create() {
        let transport = FakeTransport::accepting(1);
        let mut client = client(transport.clone());

        assert_ok!(client.open().await);
        assert_eq!(transport.actions(), vec!["createGame"]);
    }

    #[tokio::test]
    async fn test_reconnect_fetches_instead_of_creating() {
        let transport = FakeTransport::accepting(2);
        let mut client = client(transport.clone());
        client.open().await.unwrap();

        let record = GameRecord::new(Uuid::new_v4());
        client
            .handle_push(ServerPush::event(
                EventType::GameCreated,
                serde_json::to_value(&record).unwrap(),
                Some(record.game_id.to_string()),
            ))
            .await
            .unwrap();

        client.reconnect().await.unwrap();

        assert_eq!(transport.actions(), vec!["createGame", "updateGame", "getGame"]);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[2].data["gameId"], json!(record.game_id));
    }

    #[tokio::test]
    async fn test_failed_reconnect_is_not_retried() {
        let transport = FakeTransport::accepting(1);
        let mut client = client(transport.clone());
        assert_ok!(client.open().await);

        let err = assert_err!(client.reconnect().await);
        assert!(matches!(err, ClientError::ConnectionLost(_)));
        assert_eq!(*transport.connects.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_one_reconnect() {
        // Empty inbox: the connection reads as closed straight away.
        let transport = FakeTransport::accepting(1);
        let mut client = client(transport.clone());
        let (_tx, rx) = mpsc::unbounded_channel();

        let result = client.run(rx).await;
        assert!(matches!(result, Err(ClientError::ConnectionLost(_))));
        assert_eq!(*transport.connects.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_quit() {
        let transport = FakeTransport::accepting(1);
        transport.inbox.lock().unwrap().extend(
            std::iter::repeat_with(|| ServerPush::ack("getGame", EventType::GetGameRequest)).take(64),
        );
        let mut client = client(transport.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Command::Quit).unwrap();

        client.run(rx).await.unwrap();
        assert_eq!(transport.actions(), vec!["createGame"]);
    }

    #[tokio::test]
    async fn test_offline_play_against_opponent() {
        let session = ClientSession::new(
            CreationGuard::in_memory(),
            Box::new(ScriptedMoves::new(vec![(3, 3)], vec![(1, 1)])),
        );
        let mut client = Client::new(session, Box::new(NoopTransport), Duration::from_millis(1));
        client.open().await.unwrap();

        for col in 0..shared::BOARD_SIZE {
            assert!(client
                .handle_command(Command::Place { row: 0, col })
                .await
                .unwrap());
        }
        client
            .handle_command(Command::Attack { row: 2, col: 2 })
            .await
            .unwrap();

        // The opponent answered straight away.
        let record = client.session().record().unwrap();
        assert_eq!(record.turn_seq, 2);
        assert_eq!(record.is_player_turn, Some(true));
        assert_eq!(
            record.player_board.get(3, 3),
            Some(shared::CellState::Miss)
        );

        client
            .handle_command(Command::Attack { row: 1, col: 1 })
            .await
            .unwrap();
        assert_eq!(client.session().record().unwrap().winner, Some(shared::Side::Player));
        assert!(!client.handle_command(Command::Quit).await.unwrap());
    }
}
