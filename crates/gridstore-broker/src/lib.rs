//! Gridstore Storage Farm Broker
//!
//! This crate is the client-side connectivity layer of a gridstore grid: it
//! learns about storage servers (from a static table or a live introducer
//! feed), decides which wire protocol to speak with each one, supervises the
//! per-server connections, and exposes a stable ServerId-to-handle view to
//! the upload/download planners.
//!
//! # Components
//!
//! - [`StorageFarmBroker`] - top-level registry; ingests announcements,
//!   selects protocol variants, performs upgrade-in-place, and aggregates
//!   connectivity into a threshold-notification facility.
//! - [`ServerHandle`] - one live connection manager per server, in four
//!   variants: RPC-backed, HTTP-backed, plugin-backed, and null/inert.
//! - [`pick_http_server`] - races multiple HTTP endpoint candidates for one
//!   logical server and adopts the first success.
//! - Seams for collaborators the broker drives but does not implement:
//!   [`RpcConnector`] (legacy RPC transport), [`HttpProber`] (endpoint
//!   liveness), [`StoragePlugin`] (third-party protocols), and
//!   [`IntroducerClient`] (announcement delivery).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gridstore_broker::{BrokerConfig, StorageFarmBroker, RpcConnector};
//! # fn connector() -> Arc<dyn RpcConnector> { unimplemented!() }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let broker = StorageFarmBroker::new(BrokerConfig::default(), connector());
//! broker.start();
//! let enough = broker.when_connected_enough(3);
//! // ... hand announcements to the broker, await `enough` before uploading.
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod handle;
pub mod http;
pub mod introducer;
pub mod plugin;
pub mod racer;
pub mod rpc;
pub mod status;

pub use broker::{StaticServerDefinition, StorageFarmBroker};
pub use config::{BrokerConfig, HandleConfig, RetryConfig};
pub use handle::{NullServerHandle, ProtocolVariant, ServerHandle, StatusSink};
pub use http::{HttpProber, HttpServerHandle, HyperProber};
pub use introducer::{AnnouncementCallback, IntroducerClient, MemoryIntroducerClient};
pub use plugin::{PluginRegistry, PluginServerHandle, PluginStorageClient, StoragePlugin};
pub use racer::{pick_http_server, AllProbesFailed, ProbeFailure};
pub use rpc::{RpcConnection, RpcConnector, RpcServerHandle};
pub use status::ConnectionStatus;
