//! Inter-node update routing.
//!
//! Each node listens on a routing port and advertises its own URL. To
//! deliver to a device attached elsewhere, [`Router::route`] fans a PUT
//! out to every peer the [`Locator`] reports; the first 2xx wins and
//! cancels the rest. Peers answering 404 simply don't hold the device;
//! other failures are counted but never fail the call.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The locator could not produce a peer set.
    #[error("locator failed: {0}")]
    Locator(String),

    /// The router has been closed.
    #[error("router is closed")]
    Closed,
}

/// Supplies the current peer URL set.
///
/// The locator is the source of truth for membership; there is no gossip
/// or leader election. The remaining methods are advisory hooks for
/// discovery backends that want registration heartbeats.
#[async_trait]
pub trait Locator: Send + Sync {
    /// The current peer URLs, excluding this node.
    async fn peers(&self) -> Result<Vec<String>, RouterError>;

    /// Announce this node to the discovery service.
    async fn register(&self, _url: &str) -> Result<(), RouterError> {
        Ok(())
    }

    /// Withdraw this node from the discovery service.
    async fn unregister(&self, _url: &str) -> Result<(), RouterError> {
        Ok(())
    }

    /// Whether the discovery service is healthy.
    async fn status(&self) -> Result<bool, RouterError> {
        Ok(true)
    }
}

/// A fixed peer list from configuration.
pub struct StaticLocator {
    peers: Vec<String>,
}

impl StaticLocator {
    /// Create a locator over a fixed peer list, excluding `self_url`.
    #[must_use]
    pub fn new(peers: Vec<String>, self_url: &str) -> Self {
        let peers = peers
            .into_iter()
            .filter(|p| p.trim_end_matches('/') != self_url.trim_end_matches('/'))
            .collect();
        Self { peers }
    }
}

#[async_trait]
impl Locator for StaticLocator {
    async fn peers(&self) -> Result<Vec<String>, RouterError> {
        Ok(self.peers.clone())
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bound on the total elapsed time of one routed delivery.
    pub deadline: Duration,
    /// This node's advertised routing URL.
    pub self_url: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(3),
            self_url: "http://localhost:3000".to_string(),
        }
    }
}

/// The JSON body of a routed update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    /// Hex channel ID.
    pub chid: String,

    /// Channel version.
    pub version: u64,

    /// RFC 3339 timestamp of when the update was accepted.
    pub time: String,

    /// Optional opaque payload from the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    /// Correlation ID for tracing the update across nodes.
    #[serde(rename = "logID", default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
}

impl RouteRequest {
    /// Build a request stamped with the current time.
    #[must_use]
    pub fn new(chid: impl Into<String>, version: u64, data: Option<String>) -> Self {
        Self {
            chid: chid.into(),
            version,
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            data,
            log_id: None,
        }
    }

    /// Attach a correlation ID.
    #[must_use]
    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = Some(log_id.into());
        self
    }
}

enum RouteOutcome {
    Delivered,
    NotHere,
    Failed,
}

/// Point-to-point update fan-out.
pub struct Router {
    client: reqwest::Client,
    locator: Arc<dyn Locator>,
    config: RouterConfig,
    shutdown: CancellationToken,
}

impl Router {
    /// Create a router over the given locator.
    #[must_use]
    pub fn new(locator: Arc<dyn Locator>, config: RouterConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.deadline)
            .build()
            .unwrap_or_default();
        Self {
            client,
            locator,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// This node's advertised routing URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.self_url
    }

    /// Deliver an update to whichever peer holds the device.
    ///
    /// Returns `true` iff some peer accepted the update before the
    /// deadline or cancellation. An empty peer set returns `false`
    /// immediately; peer failures are counted, not surfaced.
    ///
    /// # Errors
    ///
    /// `Closed` after [`Router::close`]; locator failures.
    pub async fn route(
        &self,
        cancel: &CancellationToken,
        uaid: &str,
        request: RouteRequest,
    ) -> Result<bool, RouterError> {
        if self.shutdown.is_cancelled() {
            return Err(RouterError::Closed);
        }
        let peers = self.locator.peers().await?;
        if peers.is_empty() {
            debug!(uaid, "no peers to route to");
            return Ok(false);
        }

        let call = cancel.child_token();
        let mut requests: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| self.route_one(peer, uaid, &request, call.clone()))
            .collect();

        let deadline = tokio::time::sleep(self.config.deadline);
        tokio::pin!(deadline);

        let mut delivered = false;
        let mut failures = 0usize;
        loop {
            tokio::select! {
                () = call.cancelled() => break,
                () = self.shutdown.cancelled() => {
                    call.cancel();
                    break;
                }
                () = &mut deadline => {
                    debug!(uaid, "route deadline elapsed");
                    call.cancel();
                    break;
                }
                outcome = requests.next() => match outcome {
                    None => break,
                    Some(RouteOutcome::Delivered) => {
                        delivered = true;
                        call.cancel();
                        break;
                    }
                    Some(RouteOutcome::NotHere) => {}
                    Some(RouteOutcome::Failed) => failures += 1,
                }
            }
        }

        if failures > 0 {
            warn!(uaid, failures, "peers failed during routing");
        }
        debug!(uaid, delivered, "routing finished");
        Ok(delivered)
    }

    async fn route_one(
        &self,
        peer: &str,
        uaid: &str,
        request: &RouteRequest,
        cancel: CancellationToken,
    ) -> RouteOutcome {
        let url = format!("{}/route/{}", peer.trim_end_matches('/'), uaid);
        let send = self.client.put(&url).json(request).send();
        tokio::select! {
            () = cancel.cancelled() => RouteOutcome::Failed,
            result = send => match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!(peer, uaid, "peer accepted update");
                    RouteOutcome::Delivered
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => RouteOutcome::NotHere,
                Ok(resp) => {
                    debug!(peer, status = %resp.status(), "unexpected peer status");
                    RouteOutcome::Failed
                }
                Err(err) => {
                    debug!(peer, error = %err, "peer request failed");
                    RouteOutcome::Failed
                }
            }
        }
    }

    /// Whether the locator reports healthy.
    ///
    /// # Errors
    ///
    /// Locator failures.
    pub async fn status(&self) -> Result<bool, RouterError> {
        self.locator.status().await
    }

    /// Stop the router and cancel all in-flight outbound calls.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::put;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn_peer(status: StatusCode, delay: Duration) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let app = axum::Router::new().route(
            "/route/:uaid",
            put(move |Path(_uaid): Path<String>| {
                let hits = hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn test_router(peers: Vec<String>) -> Router {
        Router::new(
            Arc::new(StaticLocator::new(peers, "http://self:3000")),
            RouterConfig {
                deadline: Duration::from_millis(500),
                self_url: "http://self:3000".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_route_with_no_peers() {
        let router = test_router(vec![]);
        let cancel = CancellationToken::new();
        let delivered = router
            .route(&cancel, "aa", RouteRequest::new("bb", 1, None))
            .await
            .unwrap();
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_static_locator_excludes_self() {
        let locator = StaticLocator::new(
            vec![
                "http://self:3000/".to_string(),
                "http://other:3000".to_string(),
            ],
            "http://self:3000",
        );
        assert_eq!(locator.peers().await.unwrap(), vec!["http://other:3000"]);
    }

    #[tokio::test]
    async fn test_route_delivers_to_owning_peer() {
        let (wrong, _) = spawn_peer(StatusCode::NOT_FOUND, Duration::ZERO).await;
        let (right, right_hits) = spawn_peer(StatusCode::OK, Duration::ZERO).await;

        let router = test_router(vec![wrong, right]);
        let cancel = CancellationToken::new();
        let delivered = router
            .route(&cancel, "aa", RouteRequest::new("bb", 42, None))
            .await
            .unwrap();

        assert!(delivered);
        assert_eq!(right_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_route_nobody_home() {
        let (a, _) = spawn_peer(StatusCode::NOT_FOUND, Duration::ZERO).await;
        let (b, _) = spawn_peer(StatusCode::NOT_FOUND, Duration::ZERO).await;

        let router = test_router(vec![a, b]);
        let cancel = CancellationToken::new();
        let delivered = router
            .route(&cancel, "aa", RouteRequest::new("bb", 1, None))
            .await
            .unwrap();
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_route_peer_failure_is_not_fatal() {
        let (broken, _) = spawn_peer(StatusCode::INTERNAL_SERVER_ERROR, Duration::ZERO).await;
        let (right, _) = spawn_peer(StatusCode::OK, Duration::ZERO).await;

        let router = test_router(vec![broken, right]);
        let cancel = CancellationToken::new();
        let delivered = router
            .route(&cancel, "aa", RouteRequest::new("bb", 1, None))
            .await
            .unwrap();
        assert!(delivered);
    }

    #[tokio::test]
    async fn test_route_deadline_bounds_slow_peers() {
        let (slow, _) = spawn_peer(StatusCode::OK, Duration::from_secs(5)).await;

        let router = test_router(vec![slow]);
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let delivered = router
            .route(&cancel, "aa", RouteRequest::new("bb", 1, None))
            .await
            .unwrap();

        assert!(!delivered);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_route_observes_caller_cancellation() {
        let (slow, _) = spawn_peer(StatusCode::OK, Duration::from_secs(5)).await;

        let router = test_router(vec![slow]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let delivered = router
            .route(&cancel, "aa", RouteRequest::new("bb", 1, None))
            .await
            .unwrap();
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_route_after_close() {
        let router = test_router(vec![]);
        router.close();
        assert!(matches!(
            router
                .route(
                    &CancellationToken::new(),
                    "aa",
                    RouteRequest::new("bb", 1, None)
                )
                .await,
            Err(RouterError::Closed)
        ));
    }

    #[test]
    fn test_route_request_shape() {
        let req = RouteRequest::new("bb", 42, Some("hi".into())).with_log_id("req-1");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["chid"], "bb");
        assert_eq!(json["version"], 42);
        assert_eq!(json["data"], "hi");
        assert_eq!(json["logID"], "req-1");
        assert!(json["time"].as_str().unwrap().contains('T'));
    }
}
