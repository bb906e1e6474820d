//! HTTP and WebSocket surface.
//!
//! Two listeners: the client-facing one carries the WebSocket upgrade,
//! the update endpoint and the status pages; the routing listener only
//! accepts peer deliveries. All shared state travels through
//! [`AppState`]; there are no process globals.

use crate::config::{Config, StoreBackend};
use crate::metrics;
use crate::worker;
use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::Json;
use beacon_core::{Router as NodeRouter, RouteRequest, StaticLocator, WorkerRegistry};
use beacon_protocol::{ids, ChannelId, DeviceId, TokenCodec, TokenError, Update};
use beacon_store::kv::memory::MemoryConnector;
use beacon_store::kv::MemcacheConnector;
use beacon_store::{Store, StoreError};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared server state; the composition root wires every subsystem here.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Channel-record store.
    pub store: Store,
    /// Device → session worker table.
    pub registry: Arc<WorkerRegistry>,
    /// Inter-node fan-out.
    pub router: NodeRouter,
    /// Endpoint token codec.
    pub tokens: TokenCodec,
    /// Process-wide shutdown signal.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build and wire all subsystems from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed token key.
    pub fn new(config: Config) -> Result<Self> {
        let connector: Arc<dyn beacon_store::Connector> = match config.store.backend {
            StoreBackend::Memcache => Arc::new(MemcacheConnector::new(
                config.store.hosts.clone(),
                config.kv_settings(),
            )),
            StoreBackend::Memory => Arc::new(MemoryConnector::new()),
        };
        let store = Store::new(connector, config.store_config(), config.pool_config());

        let locator = Arc::new(StaticLocator::new(
            config.router.peers.clone(),
            &config.route_url(),
        ));
        let router = NodeRouter::new(locator, config.router_config());

        let key = config.token_key_bytes()?;
        let tokens = TokenCodec::new(key.as_deref()).context("invalid token key")?;

        Ok(Self {
            config,
            store,
            registry: Arc::new(WorkerRegistry::new()),
            router,
            tokens,
            shutdown: CancellationToken::new(),
        })
    }

    /// Stop listeners, disconnect workers, and close the subsystems.
    /// Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
        for handle in self.registry.drain() {
            handle.close();
        }
        self.router.close();
        self.store.close();
    }
}

/// Build the client-facing application.
pub fn socket_app(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/", get(ws_handler))
        .route("/update/:token", put(update_handler))
        .route("/status/", get(status_handler))
        .route("/realstatus/", get(realstatus_handler))
        .route("/metrics/", get(metrics_handler))
        .with_state(state)
}

/// Build the routing listener application.
pub fn routing_app(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/route/:uaid", put(route_handler))
        .with_state(state)
}

/// Bind both listeners from configuration and serve until shutdown.
///
/// # Errors
///
/// Returns an error if binding or serving fails.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.config.bind_addr()?)
        .await
        .context("binding client listener")?;
    let route_listener = TcpListener::bind(state.config.router_addr()?)
        .await
        .context("binding routing listener")?;
    serve(state, listener, route_listener).await
}

/// Serve the client and routing applications on the given listeners.
///
/// # Errors
///
/// Returns an error if either server fails.
pub async fn serve(
    state: Arc<AppState>,
    listener: TcpListener,
    route_listener: TcpListener,
) -> Result<()> {
    if state.config.metrics.enabled {
        if let Err(err) = metrics::start_metrics_server(state.config.metrics.port) {
            error!(error = %err, "failed to start metrics server");
        }
    }
    metrics::spawn_worker_gauge(state.registry.clone(), state.shutdown.clone());

    info!(
        addr = %listener.local_addr().context("client listener address")?,
        routing = %route_listener.local_addr().context("routing listener address")?,
        "beacon listening"
    );

    let shutdown = state.shutdown.clone();
    let client = axum::serve(listener, socket_app(state.clone()))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let routing = axum::serve(route_listener, routing_app(state))
        .with_graceful_shutdown(shutdown.cancelled_owned());

    tokio::try_join!(async { client.await }, async { routing.await })
        .context("server error")?;
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| worker::run_session(socket, state))
}

#[derive(Debug, Deserialize)]
struct UpdateForm {
    #[serde(default)]
    version: Option<u64>,
    #[serde(default)]
    data: Option<String>,
}

/// Third-party update endpoint: `PUT /update/<token>`.
async fn update_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Form(form): Form<UpdateForm>,
) -> impl IntoResponse {
    // 401 on a failed MAC, 404 on anything structurally invalid.
    let plain = match state.tokens.decode(&token) {
        Ok(plain) => plain,
        Err(TokenError::Verification) => return (StatusCode::UNAUTHORIZED, "{}"),
        Err(_) => return (StatusCode::NOT_FOUND, "{}"),
    };
    let Some((suaid, schid)) = ids::key_to_ids(&plain) else {
        return (StatusCode::NOT_FOUND, "{}");
    };
    let (Ok(uaid), Ok(chid)) = (suaid.parse::<DeviceId>(), schid.parse::<ChannelId>()) else {
        return (StatusCode::NOT_FOUND, "{}");
    };

    if let Some(data) = &form.data {
        if data.len() > state.config.max_data_len {
            return (StatusCode::PAYLOAD_TOO_LARGE, "{}");
        }
    }
    let version = match form.version {
        Some(version) if version > 0 => version,
        _ => now_secs(),
    };

    match state.store.update(&uaid, &chid, version).await {
        Ok(()) => {}
        Err(StoreError::InvalidChannel) => return (StatusCode::NOT_FOUND, "{}"),
        Err(err) => {
            error!(uaid = %uaid, chid = %chid, error = %err, "store update failed");
            metrics::record_error("store");
            return (StatusCode::SERVICE_UNAVAILABLE, "{}");
        }
    }

    let uaid_hex = uaid.to_string();
    let chid_hex = chid.to_string();

    // Local delivery first; fall back to the routing fabric.
    if let Some(handle) = state.registry.get(&uaid_hex) {
        let mut update = Update::new(chid_hex.clone(), version);
        update.data = form.data.clone();
        if handle.flush(update) {
            debug!(uaid = %uaid_hex, chid = %chid_hex, version, "flushed local worker");
            metrics::record_update("local");
            return (StatusCode::OK, "{}");
        }
    }

    let request = RouteRequest::new(chid_hex.clone(), version, form.data.clone())
        .with_log_id(uuid::Uuid::new_v4().simple().to_string());
    match state
        .router
        .route(&state.shutdown.child_token(), &uaid_hex, request)
        .await
    {
        Ok(true) => {
            metrics::record_update("routed");
            metrics::record_route("delivered");
            (StatusCode::OK, "{}")
        }
        Ok(false) => {
            // Nobody holds the device right now; the record is stored and
            // the next reconnect delivers it.
            metrics::record_update("stored");
            metrics::record_route("missed");
            (StatusCode::OK, "{}")
        }
        Err(err) => {
            warn!(uaid = %uaid_hex, error = %err, "routing failed");
            metrics::record_route("error");
            (StatusCode::ACCEPTED, "{}")
        }
    }
}

/// Peer delivery endpoint: `PUT /route/<hex-uaid>`.
///
/// Trusts the sender; the record was already written on the receiving
/// node, so this only consults the worker table.
async fn route_handler(
    State(state): State<Arc<AppState>>,
    Path(uaid): Path<String>,
    Json(request): Json<RouteRequest>,
) -> StatusCode {
    let Some(handle) = state.registry.get(&uaid) else {
        return StatusCode::NOT_FOUND;
    };
    let mut update = Update::new(request.chid, request.version);
    update.data = request.data;
    if handle.flush(update) {
        debug!(uaid = %uaid, time = %request.time, log_id = ?request.log_id, "routed flush enqueued");
        metrics::record_update("routed");
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Cheap liveness probe.
async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "OK",
        "clients": state.registry.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Deep health: store roundtrip plus locator status.
async fn realstatus_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = match state.store.status().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "store status probe failed");
            false
        }
    };
    let router_ok = state.router.status().await.unwrap_or(false);
    let code = if store_ok && router_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(serde_json::json!({
            "status": if store_ok && router_ok { "OK" } else { "NOT OK" },
            "store": store_ok,
            "router": router_ok,
        })),
    )
}

/// JSON snapshot of the cheap counters; Prometheus scrapes its own port.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "clients": state.registry.len(),
    }))
}
