//! The native-HTTP-backed server handle.
//!
//! A server may advertise several endpoint URLs; connection establishment
//! delegates to the racer (`pick_http_server`) and the handle adopts the
//! winning endpoint for subsequent requests, re-probing it periodically to
//! notice when it goes away.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use gridstore_common::{Announcement, GridError, Result, ServerId};

use crate::config::HandleConfig;
use crate::handle::{HandleCore, ProtocolVariant, ServerHandle, StatusSink};
use crate::racer::pick_http_server;
use crate::status::ConnectionStatus;

/// Checks whether one endpoint is alive and speaks a storage protocol
/// version we understand. No retry here; the handle's own backoff decides
/// when to probe again.
#[async_trait]
pub trait HttpProber: Send + Sync {
    async fn probe(&self, url: &str) -> Result<()>;
}

/// Default prober: issues a GET to the endpoint's version resource over a
/// fresh hyper client and accepts any successful response.
pub struct HyperProber {
    timeout: Duration,
}

impl HyperProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HyperProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl HttpProber for HyperProber {
    async fn probe(&self, url: &str) -> Result<()> {
        let uri: hyper::Uri = url
            .parse()
            .map_err(|e| GridError::Transport(format!("bad endpoint url {url:?}: {e}")))?;

        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| GridError::Transport(format!("failed to build request: {e}")))?;

        let client = Client::builder(TokioExecutor::new()).build_http();
        let response = tokio::time::timeout(self.timeout, client.request(request))
            .await
            .map_err(|_| GridError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| GridError::Transport(format!("probe failed: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(GridError::Connection(format!(
                "endpoint answered with status {}",
                response.status()
            )))
        }
    }
}

struct HttpInner {
    core: HandleCore,
    nurls: Vec<String>,
    prober: Arc<dyn HttpProber>,
    config: HandleConfig,
    active_endpoint: RwLock<Option<String>>,
}

/// HTTP-backed server handle: races the announced endpoint candidates and
/// manages the winner as the active endpoint for one server.
pub struct HttpServerHandle {
    inner: Arc<HttpInner>,
}

impl HttpServerHandle {
    pub fn new(
        server_id: ServerId,
        announcement: Announcement,
        nurls: Vec<String>,
        prober: Arc<dyn HttpProber>,
        config: HandleConfig,
        sink: StatusSink,
    ) -> Result<Self> {
        let core = HandleCore::new(server_id, announcement, sink)?;
        Ok(Self {
            inner: Arc::new(HttpInner {
                core,
                nurls,
                prober,
                config,
                active_endpoint: RwLock::new(None),
            }),
        })
    }

    /// The endpoint that won the race, used for subsequent storage requests.
    pub fn active_endpoint(&self) -> Option<String> {
        self.inner.active_endpoint.read().unwrap().clone()
    }

    async fn run(inner: Arc<HttpInner>) {
        let mut backoff_ms = inner.config.retry.initial_backoff_ms;
        loop {
            let race = pick_http_server(inner.nurls.clone(), |url| {
                let prober = inner.prober.clone();
                async move { prober.probe(&url).await }
            });
            match race.await {
                Ok(winner) => {
                    backoff_ms = inner.config.retry.initial_backoff_ms;
                    *inner.active_endpoint.write().unwrap() = Some(winner.clone());
                    inner
                        .core
                        .note_connected(format!("connected to {winner}"));

                    Self::watch_endpoint(&inner, &winner).await;
                    inner.active_endpoint.write().unwrap().take();
                    inner
                        .core
                        .note_connection_lost(format!("{winner} stopped responding"));
                }
                Err(all_failed) => {
                    for failure in &all_failed.failures {
                        debug!(url = %failure.url, reason = %failure.reason, "endpoint probe failed");
                    }
                    inner.core.note_attempt_failed(all_failed.to_string());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                _ = inner.core.poked() => {}
            }
            backoff_ms = inner.config.retry.next_backoff(backoff_ms);
        }
    }

    /// Re-probes the active endpoint until it stops answering. A poke
    /// (`try_to_connect`) forces an immediate re-probe.
    async fn watch_endpoint(inner: &Arc<HttpInner>, endpoint: &str) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(inner.config.liveness_interval) => {}
                _ = inner.core.poked() => {}
            }
            if inner.prober.probe(endpoint).await.is_err() {
                return;
            }
        }
    }
}

impl ServerHandle for HttpServerHandle {
    fn server_id(&self) -> &ServerId {
        self.inner.core.server_id()
    }

    fn announcement(&self) -> &Announcement {
        self.inner.core.announcement()
    }

    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Http
    }

    fn permutation_seed(&self) -> &[u8] {
        self.inner.core.seed()
    }

    fn nickname(&self) -> &str {
        self.inner.core.nickname()
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.inner.core.status()
    }

    fn is_running(&self) -> bool {
        self.inner.core.is_running()
    }

    fn start_connecting(&self) {
        let inner = self.inner.clone();
        self.inner
            .core
            .start_with(move || tokio::spawn(Self::run(inner)));
    }

    fn stop_connecting(&self) {
        self.inner.core.halt();
        self.inner.active_endpoint.write().unwrap().take();
        self.inner.core.note_stopped();
    }

    fn try_to_connect(&self) {
        self.inner.core.poke();
    }
}
