//! Server network edge: one axum router serving the game socket and the REST
//! surface, plus the wiring of stores, processors and the event bus.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::json;
use shared::{Envelope, EventType, GameRecord, GameUpdate, SyncError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{self, BusHandle, EventBus, DEFAULT_MAX_ATTEMPTS, SOURCE_DISPATCHER, SOURCE_GAME};
use crate::client_manager::{Connection, ConnectionRegistry, DEFAULT_CONNECTION_TTL};
use crate::game::{EventLog, EventRecord, GameService};
use crate::processors::{record_payload, EventLogProcessor, GameProcessor};
use crate::sender::{PeerTransport, Sender, SocketHub};
use crate::session::SessionHandlers;
use crate::store::{Store, Table};

pub const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
pub const ALLOWED_HEADERS: &str = "Content-Type, Authorization";

/// Runtime settings for the sync server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Lifetime of a connection row
    pub connection_ttl: Duration,
    /// Directory for table snapshots. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Deliveries per processor before a transient failure is reported
    pub max_attempts: u32,
    /// How often expired connection rows are purged
    pub sweep_interval: Duration,
    /// Bearer token required at the edge, if any
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            connection_ttl: DEFAULT_CONNECTION_TTL,
            data_dir: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            sweep_interval: Duration::from_secs(60),
            auth_token: None,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Every server-side component, wired together but not yet running.
pub struct Components {
    pub registry: Arc<ConnectionRegistry>,
    pub games: GameService,
    pub events: Arc<EventLog>,
    pub hub: Arc<SocketHub>,
    pub bus: Arc<EventBus>,
}

impl Components {
    pub fn new(
        connections: Arc<dyn Store<String, Connection>>,
        games: Arc<dyn Store<Uuid, GameRecord>>,
        events: Arc<dyn Store<Uuid, EventRecord>>,
        connection_ttl: Duration,
        max_attempts: u32,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(connections, connection_ttl));
        let games = GameService::new(games);
        let events = Arc::new(EventLog::new(events));
        let hub = Arc::new(SocketHub::new());

        let sender = Arc::new(Sender::new(registry.clone(), hub.clone()));
        let bus = Arc::new(routing_table(
            EventBus::new(max_attempts),
            Arc::new(GameProcessor::new(games.clone(), events.clone())),
            Arc::new(EventLogProcessor::new(events.clone())),
            sender,
        ));

        Self {
            registry,
            games,
            events,
            hub,
            bus,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(Table::in_memory("connections")),
            Arc::new(Table::in_memory("games")),
            Arc::new(Table::in_memory("events")),
            DEFAULT_CONNECTION_TTL,
            DEFAULT_MAX_ATTEMPTS,
        )
    }

    /// Opens the tables named by the config, from disk when a data directory
    /// is set.
    pub async fn open(config: &ServerConfig) -> Result<Self, SyncError> {
        let Some(dir) = &config.data_dir else {
            return Ok(Self::new(
                Arc::new(Table::in_memory("connections")),
                Arc::new(Table::in_memory("games")),
                Arc::new(Table::in_memory("events")),
                config.connection_ttl,
                config.max_attempts,
            ));
        };

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SyncError::Store(format!("{}: {}", dir.display(), e)))?;

        Ok(Self::new(
            Arc::new(Table::open("connections", dir.join("connections.bin")).await?),
            Arc::new(Table::open("games", dir.join("games.bin")).await?),
            Arc::new(Table::open("events", dir.join("events.bin")).await?),
            config.connection_ttl,
            config.max_attempts,
        ))
    }
}

/// Routes requests to the processors and results to the sender.
/// Session lifecycle events have no route and are only logged.
pub fn routing_table(
    bus: EventBus,
    games: Arc<GameProcessor>,
    events: Arc<EventLogProcessor>,
    sender: Arc<Sender>,
) -> EventBus {
    bus.route(
        SOURCE_DISPATCHER,
        &[
            EventType::CreateGameRequest,
            EventType::GetGameRequest,
            EventType::UpdateGameRequest,
            EventType::GameDeleteRequest,
            EventType::ShipPlaced,
            EventType::AttackInitiated,
            EventType::GameUpdatedWithEvent,
            EventType::UnknownAction,
        ],
        games,
    )
    .route(
        SOURCE_DISPATCHER,
        &[EventType::EventRecordSaved, EventType::UnknownAction],
        events,
    )
    .route(
        SOURCE_GAME,
        &[
            EventType::GameCreated,
            EventType::GameFound,
            EventType::GameNotFound,
            EventType::GameUpdated,
            EventType::GameDeleted,
            EventType::EventRecorded,
            EventType::ActionFailed,
        ],
        sender,
    )
}

/// State shared by every request handler
#[derive(Clone)]
pub struct AppState {
    sessions: SessionHandlers,
    games: GameService,
    events: Arc<EventLog>,
    hub: Arc<SocketHub>,
    bus: BusHandle,
    auth_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(components: &Components, bus: BusHandle, auth_token: Option<String>) -> Self {
        Self {
            sessions: SessionHandlers::new(components.registry.clone(), bus.clone()),
            games: components.games.clone(),
            events: components.events.clone(),
            hub: components.hub.clone(),
            bus,
            auth_token: auth_token.map(Arc::from),
        }
    }

    fn authorized(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        let Some(expected) = self.auth_token.as_deref() else {
            return true;
        };
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        bearer == Some(expected) || query_token == Some(expected)
    }

    /// Announces a REST-side change to every live peer.
    fn broadcast(&self, event_type: EventType, payload: serde_json::Map<String, serde_json::Value>) {
        let envelope = Envelope::new(SOURCE_GAME, event_type, payload, None);
        if let Err(e) = self.bus.publish(envelope) {
            warn!("Could not broadcast {}: {}", event_type, e);
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// Maps the error taxonomy onto HTTP statuses.
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::Malformed(_) | SyncError::UnknownAction(_) => StatusCode::BAD_REQUEST,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::Rejected(_) | SyncError::OutOfOrder(_) => StatusCode::CONFLICT,
            SyncError::Gone(_) => StatusCode::GONE,
            SyncError::Store(_) | SyncError::BusClosed => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "message": self.0.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/games", post(create_game).options(preflight))
        .route(
            "/games/:id",
            get(get_game)
                .patch(update_game)
                .put(update_game)
                .delete(delete_game)
                .options(preflight),
        )
        .route("/games/:id/events", get(game_events).options(preflight))
        .layer(middleware::map_response(allow_origin))
        .with_state(state)
}

async fn allow_origin(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// Answered without authentication and without touching any record.
async fn preflight() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_METHODS, ALLOWED_METHODS),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOWED_HEADERS),
        ],
    )
}

fn parse_game_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(SyncError::Malformed(format!("invalid game id '{}'", raw))))
}

fn require_auth(state: &AppState, headers: &HeaderMap, query: &TokenQuery) -> Result<(), Response> {
    if state.authorized(headers, query.token.as_deref()) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, Json(json!({ "message": "unauthorized" }))).into_response())
    }
}

async fn create_game(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    require_auth(&state, &headers, &query)?;
    let record = state.games.create().await.map_err(|e| ApiError(e).into_response())?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

async fn get_game(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    require_auth(&state, &headers, &query)?;
    let id = parse_game_id(&id).map_err(IntoResponse::into_response)?;
    match state.games.get(id).await {
        Ok(Some(record)) => Ok(Json(record).into_response()),
        Ok(None) => Err(ApiError(SyncError::NotFound(id)).into_response()),
        Err(e) => Err(ApiError(e).into_response()),
    }
}

async fn update_game(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(update): Json<GameUpdate>,
) -> Result<Response, Response> {
    require_auth(&state, &headers, &query)?;
    let id = parse_game_id(&id).map_err(IntoResponse::into_response)?;
    let record = state
        .games
        .update(id, &update)
        .await
        .map_err(|e| ApiError(e).into_response())?;

    match record_payload(&record) {
        Ok(payload) => state.broadcast(EventType::GameUpdated, payload),
        Err(e) => warn!("Could not build broadcast for {}: {}", id, e),
    }
    Ok(Json(record).into_response())
}

async fn delete_game(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    require_auth(&state, &headers, &query)?;
    let id = parse_game_id(&id).map_err(IntoResponse::into_response)?;
    let deleted = state
        .games
        .delete(id)
        .await
        .map_err(|e| ApiError(e).into_response())?;

    let body = json!({ "gameId": id.to_string(), "deleted": deleted });
    if deleted {
        if let Some(payload) = body.as_object() {
            state.broadcast(EventType::GameDeleted, payload.clone());
        }
    }
    Ok(Json(body).into_response())
}

/// The game's event log, oldest first.
async fn game_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    require_auth(&state, &headers, &query)?;
    let id = parse_game_id(&id).map_err(IntoResponse::into_response)?;
    let events = state
        .events
        .for_game(id)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(events).into_response())
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = require_auth(&state, &headers, &query) {
        return rejection;
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drives one socket from handshake to close
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    let mut outbound = state.hub.attach(&connection_id).await;

    if let Err(e) = state.sessions.on_connect(&connection_id).await {
        warn!("Connection {} is open but unregistered: {}", connection_id, e);
    }

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let ack = state.sessions.on_message(&connection_id, &text);
                if let Err(e) = state.hub.post(&connection_id, &ack).await {
                    debug!("Could not acknowledge {}: {}", connection_id, e);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Socket {} errored: {}", connection_id, e);
                break;
            }
        }
    }

    state.hub.detach(&connection_id).await;
    writer.abort();
    if let Err(e) = state.sessions.on_disconnect(&connection_id).await {
        warn!("Failed to remove connection {}: {}", connection_id, e);
    }
}

/// Spawns task that purges expired connection rows
pub fn spawn_expiry_sweeper(
    registry: Arc<ConnectionRegistry>,
    hub: Arc<SocketHub>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            match registry.purge_expired().await {
                Ok(expired) => {
                    for id in expired {
                        hub.detach(&id).await;
                    }
                }
                Err(e) => warn!("Expiry sweep failed: {}", e),
            }
        }
    })
}

/// Opens the stores, starts the bus and the sweeper, and serves until Ctrl+C.
pub async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let components = Components::open(&config).await?;
    let (bus, worker) = bus::spawn(components.bus.clone());
    let sweeper = spawn_expiry_sweeper(
        components.registry.clone(),
        components.hub.clone(),
        config.sweep_interval,
    );

    let state = AppState::new(&components, bus, config.auth_token.clone());
    let listener = tokio::net::TcpListener::bind(config.address()).await?;
    info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
            }
        })
        .await?;

    worker.abort();
    sweeper.abort();
    Ok(())
}
