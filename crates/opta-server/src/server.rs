use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use opta_core::settings::ServerSettings;
use opta_engine::{SessionManager, Watchdog};
use opta_upstream::ConnectionManager;

use crate::auth::{self, AuthToken};
use crate::client::{self, ClientRegistry};
use crate::handlers;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_secs: u64,
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_send_queue: settings.max_send_queue,
            heartbeat_secs: settings.heartbeat_secs,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

/// What the server fronts.
pub struct ServerParts {
    pub sessions: SessionManager,
    pub token: AuthToken,
    pub upstream: Option<Arc<ConnectionManager>>,
    pub watchdog: Option<Arc<Watchdog>>,
}

/// Shared application state passed to handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub token: Arc<AuthToken>,
    pub clients: Arc<ClientRegistry>,
    pub upstream: Option<Arc<ConnectionManager>>,
    pub watchdog: Option<Arc<Watchdog>>,
    pub config: Arc<ServerConfig>,
    pub shutdown: CancellationToken,
    pub started: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route(
            "/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/sessions/{id}/turns", post(handlers::submit_turn))
        .route("/sessions/{id}/events", get(handlers::events))
        .route("/sessions/{id}/cancel", post(handlers::cancel))
        .route(
            "/sessions/{id}/permissions/{request_id}",
            post(handlers::resolve_permission),
        )
        .route("/v1/stats", get(handlers::stats))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .merge(api)
        .route("/health", get(handlers::health))
        .route("/ws", get(client::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve. Port 0 picks a free port; see [`ServerHandle::port`].
pub async fn start(config: ServerConfig, parts: ServerParts) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    let state = AppState {
        sessions: parts.sessions,
        token: Arc::new(parts.token),
        clients: Arc::new(ClientRegistry::new()),
        upstream: parts.upstream,
        watchdog: parts.watchdog,
        config: Arc::new(config),
        shutdown: CancellationToken::new(),
        started: Instant::now(),
    };
    let router = build_router(state.clone());
    let signal = state.shutdown.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            error!(error = %e, "server stopped with error");
        }
    });

    info!(%addr, "daemon listening");
    Ok(ServerHandle { addr, state, task })
}

pub struct ServerHandle {
    addr: SocketAddr,
    state: AppState,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting, close event streams, wait briefly for in-flight
    /// requests.
    pub async fn shutdown(self) {
        self.state.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.task).await.is_err() {
            warn!("server did not stop within grace period");
        }
    }
}
