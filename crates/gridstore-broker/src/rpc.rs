//! The legacy-RPC-backed server handle.
//!
//! The RPC wire protocol itself (negotiation, certificates, encoding) lives
//! behind [`RpcConnector`]; the handle only starts and stops it, keeps hold
//! of the connection it produces, and turns connection events into status
//! updates. The connector is an explicit constructor parameter so tests and
//! embedders control it - there is no process-global transport state.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use gridstore_common::{Announcement, Result, ServerId};

use crate::config::HandleConfig;
use crate::handle::{HandleCore, ProtocolVariant, ServerHandle, StatusSink};
use crate::status::ConnectionStatus;

/// Key under which a storage server reports its v1 capabilities in the
/// version map exchanged at connection time.
pub const VERSION_STORAGE_V1: &str = "gridstore.storage/v1";

/// A live connection produced by an [`RpcConnector`]. Dropping it releases
/// the underlying transport.
#[async_trait]
pub trait RpcConnection: Send + Sync {
    /// The version map the server reported during negotiation, or
    /// `Value::Null` if it reported none.
    fn version(&self) -> Value;

    /// Resolves when the connection is lost.
    async fn closed(&self);
}

/// Factory for legacy RPC connections.
#[async_trait]
pub trait RpcConnector: Send + Sync {
    async fn connect(&self, furl: &str) -> Result<Arc<dyn RpcConnection>>;
}

/// Reads the advertised free space out of a server version map: prefer the
/// explicit `available-space` field, fall back to the older
/// `maximum-immutable-share-size`.
pub fn available_space_from_version(version: &Value) -> Option<u64> {
    let v1 = version.get(VERSION_STORAGE_V1)?;
    v1.get("available-space")
        .and_then(Value::as_u64)
        .or_else(|| v1.get("maximum-immutable-share-size").and_then(Value::as_u64))
}

struct RpcInner {
    core: HandleCore,
    furl: String,
    connector: Arc<dyn RpcConnector>,
    config: HandleConfig,
    connection: RwLock<Option<Arc<dyn RpcConnection>>>,
}

/// RPC-backed server handle: owns the connect/disconnect lifecycle of one
/// legacy-protocol server.
pub struct RpcServerHandle {
    inner: Arc<RpcInner>,
}

impl RpcServerHandle {
    pub fn new(
        server_id: ServerId,
        announcement: Announcement,
        furl: String,
        connector: Arc<dyn RpcConnector>,
        config: HandleConfig,
        sink: StatusSink,
    ) -> Result<Self> {
        let core = HandleCore::new(server_id, announcement, sink)?;
        Ok(Self {
            inner: Arc::new(RpcInner {
                core,
                furl,
                connector,
                config,
                connection: RwLock::new(None),
            }),
        })
    }

    /// The current connection, for callers issuing storage requests.
    pub fn connection(&self) -> Option<Arc<dyn RpcConnection>> {
        self.inner.connection.read().unwrap().clone()
    }

    async fn run(inner: Arc<RpcInner>) {
        let mut backoff_ms = inner.config.retry.initial_backoff_ms;
        loop {
            let attempt = inner.connector.connect(&inner.furl);
            match tokio::time::timeout(inner.config.connect_timeout, attempt).await {
                Ok(Ok(connection)) => {
                    backoff_ms = inner.config.retry.initial_backoff_ms;
                    *inner.connection.write().unwrap() = Some(connection.clone());
                    inner
                        .core
                        .note_connected(format!("connected via {}", inner.furl));

                    connection.closed().await;
                    inner.connection.write().unwrap().take();
                    inner
                        .core
                        .note_connection_lost("connection lost".to_string());
                }
                Ok(Err(e)) => {
                    inner.core.note_attempt_failed(e.to_string());
                }
                Err(_) => {
                    inner
                        .core
                        .note_attempt_failed("connection attempt timed out".to_string());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                _ = inner.core.poked() => {}
            }
            backoff_ms = inner.config.retry.next_backoff(backoff_ms);
        }
    }
}

impl ServerHandle for RpcServerHandle {
    fn server_id(&self) -> &ServerId {
        self.inner.core.server_id()
    }

    fn announcement(&self) -> &Announcement {
        self.inner.core.announcement()
    }

    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Rpc
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
        // Dropping the connection here releases the transport; the aborted
        // task can no longer do it.
        self.inner.connection.write().unwrap().take();
        self.inner.core.note_stopped();
    }

    fn try_to_connect(&self) {
        self.inner.core.poke();
    }

    fn available_space(&self) -> Option<u64> {
        let connection = self.inner.connection.read().unwrap().clone()?;
        available_space_from_version(&connection.version())
    }
}
