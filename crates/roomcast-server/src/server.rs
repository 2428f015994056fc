//! `Server`: Axum HTTP + WebSocket endpoint tying every component together.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum_server::tls_rustls::RustlsConfig;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;
use roomcast_core::{ConnectionId, EventBus, ListenerId};
use roomcast_settings::ServerSettings;
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::middleware::{Middleware, MiddlewareChain};
use crate::registry::ConnectionRegistry;
use crate::rooms::{Room, RoomRegistry};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::run_ws_session;
use crate::websocket::{ON_CONNECT_EVENT, ServerEvent, SessionContext, SessionOptions};

/// Grace period the TLS listener gives open connections on stop.
const TLS_GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(10);

struct Inner {
    settings: ServerSettings,
    events: Arc<EventBus<ServerEvent>>,
    middleware: Arc<MiddlewareChain>,
    connections: Arc<ConnectionRegistry>,
    rooms: Arc<RoomRegistry>,
    shutdown: ShutdownCoordinator,
    metrics: RwLock<Option<PrometheusHandle>>,
    started: AtomicBool,
    start_time: Instant,
    /// Sessions accepted and not yet torn down, upgrades in flight included.
    slots: Arc<AtomicUsize>,
}

/// One reserved connection slot, released on drop.
struct ConnectionSlot {
    slots: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    /// Take a slot if fewer than `max` are held.
    fn try_reserve(slots: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                (held < max).then_some(held + 1)
            })
            .ok()
            .map(|_| Self {
                slots: Arc::clone(slots),
            })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.slots.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A real-time messaging server.
///
/// Cheap to clone; clones share all state. Register middleware and
/// listeners, then call [`start`](Self::start).
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

/// A bound, serving listener.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Wait for the serve task to finish (after [`Server::stop`]).
    pub async fn stopped(self) {
        if let Err(error) = self.task.await {
            warn!(%error, "serve task ended abnormally");
        }
    }
}

impl Server {
    /// Create a server from settings. Settings are validated by `start`.
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                events: Arc::new(EventBus::new()),
                middleware: Arc::new(MiddlewareChain::new()),
                connections: Arc::new(ConnectionRegistry::new()),
                rooms: Arc::new(RoomRegistry::new()),
                shutdown: ShutdownCoordinator::new(),
                metrics: RwLock::new(None),
                started: AtomicBool::new(false),
                start_time: Instant::now(),
                slots: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Create a server from `~/.roomcast/settings.json` and `ROOMCAST_*`.
    pub fn from_settings_file() -> Result<Self, ServerError> {
        Ok(Self::new(roomcast_settings::load_settings()?))
    }

    /// Serve `/metrics` from this recorder handle.
    #[must_use]
    pub fn with_metrics(self, handle: PrometheusHandle) -> Self {
        *self.inner.metrics.write() = Some(handle);
        self
    }

    /// Install the compact `tracing` subscriber at the configured level.
    ///
    /// Returns `false` if a subscriber was already installed.
    pub fn init_logging(&self) -> bool {
        roomcast_core::logging::init_subscriber(&self.inner.settings.log_level)
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Append a middleware to the chain.
    pub fn use_middleware<M>(&self, middleware: M) -> &Self
    where
        M: Middleware + 'static,
    {
        self.inner.middleware.push(Arc::new(middleware));
        self
    }

    /// Append several middleware, in order.
    pub fn extend_middleware<I>(&self, middleware: I) -> &Self
    where
        I: IntoIterator<Item = Arc<dyn Middleware>>,
    {
        self.inner.middleware.extend(middleware);
        self
    }

    /// Listen for `event` from any connection.
    pub fn on<F, Fut>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(ServerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.events.on(event, listener)
    }

    /// Alias of [`on`](Self::on).
    pub fn event<F, Fut>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(ServerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(event, listener)
    }

    /// Listen for new connections. The argument list holds the request
    /// metadata object.
    pub fn on_connect<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(ServerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(ON_CONNECT_EVENT, listener)
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Send `[event, ...args]` to every live connection.
    pub fn broadcast(&self, event: &str, args: &[Value]) -> usize {
        self.inner.connections.broadcast(event, args)
    }

    /// Validate settings, bind, and start serving in the background.
    pub async fn start(&self) -> Result<ServerHandle, ServerError> {
        let settings = &self.inner.settings;
        settings.validate()?;
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }

        match self.bind_and_serve().await {
            Ok(handle) => {
                info!(
                    addr = %handle.local_addr,
                    secure = settings.secure,
                    ws_path = %settings.ws_path,
                    "server listening"
                );
                Ok(handle)
            }
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn bind_and_serve(&self) -> Result<ServerHandle, ServerError> {
        let settings = &self.inner.settings;
        let addr = settings.bind_address();
        let bind_err = |source| ServerError::Bind {
            addr: addr.clone(),
            source,
        };

        let tls = match (settings.secure, &settings.cert_file, &settings.key_file) {
            (true, Some(cert), Some(key)) => Some(
                RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(ServerError::Tls)?,
            ),
            _ => None,
        };

        let listener = TcpListener::bind(&addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        let router = self.router();
        let token = self.inner.shutdown.token();

        let task = if let Some(tls) = tls {
            let std_listener = listener.into_std().map_err(bind_err)?;
            let handle = axum_server::Handle::new();
            let stopper = handle.clone();
            let _ = tokio::spawn(async move {
                token.cancelled().await;
                stopper.graceful_shutdown(Some(TLS_GRACEFUL_SHUTDOWN));
            });
            let server = axum_server::from_tcp_rustls(std_listener, tls).handle(handle);
            tokio::spawn(async move {
                if let Err(error) = server.serve(router.into_make_service()).await {
                    error!(%error, "tls server error");
                }
            })
        } else {
            tokio::spawn(async move {
                let serve = axum::serve(listener, router)
                    .with_graceful_shutdown(async move { token.cancelled().await });
                if let Err(error) = serve.await {
                    error!(%error, "server error");
                }
            })
        };

        Ok(ServerHandle { local_addr, task })
    }

    /// Stop accepting and close every open session.
    pub fn stop(&self) {
        info!(connections = self.connection_count(), "server stopping");
        self.inner.shutdown.shutdown();
    }

    /// Stop, then wait up to `timeout` for the serve task to finish.
    pub async fn shutdown(&self, handle: ServerHandle, timeout: Option<Duration>) {
        info!(connections = self.connection_count(), "server stopping");
        self.inner
            .shutdown
            .graceful_shutdown(vec![handle.task], timeout)
            .await;
    }

    /// Whether [`stop`](Self::stop) was called.
    pub fn is_stopping(&self) -> bool {
        self.inner.shutdown.is_shutting_down()
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// Live connections.
    pub fn clients(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.connections
    }

    /// Snapshot of all rooms.
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.inner.rooms.rooms()
    }

    /// The room registry.
    pub fn room_manager(&self) -> &Arc<RoomRegistry> {
        &self.inner.rooms
    }

    /// Settings this server was built with.
    pub fn config(&self) -> &ServerSettings {
        &self.inner.settings
    }

    /// The application event bus.
    pub fn event_bus(&self) -> &Arc<EventBus<ServerEvent>> {
        &self.inner.events
    }

    /// The middleware chain.
    pub fn middleware(&self) -> &Arc<MiddlewareChain> {
        &self.inner.middleware
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            events: Arc::clone(&self.inner.events),
            middleware: Arc::clone(&self.inner.middleware),
            connections: Arc::clone(&self.inner.connections),
            rooms: Arc::clone(&self.inner.rooms),
            shutdown: self.inner.shutdown.token(),
            options: SessionOptions::from(&self.inner.settings),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route(&self.inner.settings.ws_path, any(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerSettings::default())
    }
}

/// `{ "path": ..., "headers": { name: value } }` for `onConnect`.
fn request_metadata(uri: &Uri, headers: &HeaderMap) -> Value {
    let mut names: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            names.entry(name.as_str()).or_default().push(value);
        }
    }
    let headers: Map<String, Value> = names
        .into_iter()
        .map(|(name, values)| (name.to_owned(), Value::String(values.join(", "))))
        .collect();
    json!({ "path": uri.path(), "headers": headers })
}

/// `{wsPath}`: upgrade to a WebSocket session.
async fn ws_handler(
    State(server): State<Server>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(%rejection, path = uri.path(), "non-upgrade request");
            return (StatusCode::NOT_IMPLEMENTED, "WebSocket upgrade required").into_response();
        }
    };

    if server.is_stopping() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    let settings = server.config();
    let Some(slot) = ConnectionSlot::try_reserve(&server.inner.slots, settings.max_connections)
    else {
        warn!(max = settings.max_connections, "connection limit reached, upgrade refused");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let metadata = request_metadata(&uri, &headers);
    let ctx = server.session_context();
    upgrade
        .max_message_size(settings.max_message_size)
        .on_upgrade(move |socket| async move {
            let _ = run_ws_session(socket, ConnectionId::new(), ctx, metadata).await;
            drop(slot);
        })
}

/// GET /health
async fn health_handler(State(server): State<Server>) -> Json<HealthResponse> {
    Json(health::health_check(
        server.inner.start_time,
        server.is_stopping(),
        server.connection_count(),
        server.inner.rooms.len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(server): State<Server>) -> Response {
    match server.inner.metrics.read().as_ref() {
        Some(handle) => metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics not enabled").into_response(),
    }
}
