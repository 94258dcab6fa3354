//! The storage farm broker: the top-level registry of storage servers.
//!
//! The broker is the sole owner of the ServerId-to-handle mapping. It
//! ingests announcements from the static server table and the introducer
//! feed, runs the matcher to pick a protocol variant, performs
//! upgrade-in-place when a server's capabilities change, and aggregates
//! per-handle connectivity into the connected-enough threshold facility.
//!
//! Per-ServerId announcement processing is serialized: a new announcement is
//! never processed concurrently with an upgrade still in progress for the
//! same ServerId. An upgrade stops and detaches the old handle before the
//! new one starts, so at most one handle per ServerId is ever attached.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use gridstore_common::{
    derive_permutation_seed, select_variant, Announcement, Result, ServerId, VariantSelection,
    SERVICE_STORAGE,
};

use crate::config::BrokerConfig;
use crate::handle::{NullServerHandle, ServerHandle, StatusSink};
use crate::http::{HttpProber, HttpServerHandle, HyperProber};
use crate::introducer::IntroducerClient;
use crate::plugin::{PluginRegistry, PluginServerHandle};
use crate::rpc::{RpcConnector, RpcServerHandle};

/// One entry of the static server table: at minimum an `ann` sub-mapping
/// equivalent to an introducer announcement.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticServerDefinition {
    pub ann: Announcement,
}

struct ServerDescriptor {
    announcement: Announcement,
    handle: Arc<dyn ServerHandle>,
    is_static: bool,
}

struct Waiter {
    threshold: usize,
    tx: oneshot::Sender<()>,
}

struct BrokerInner {
    servers: HashMap<ServerId, ServerDescriptor>,
    static_ids: HashSet<ServerId>,
    waiters: Vec<Waiter>,
    running: bool,
}

struct BrokerShared {
    config: BrokerConfig,
    connector: Arc<dyn RpcConnector>,
    prober: Arc<dyn HttpProber>,
    plugins: PluginRegistry,
    inner: Mutex<BrokerInner>,
}

/// Registry of storage servers and their connection handles.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct StorageFarmBroker {
    shared: Arc<BrokerShared>,
}

impl StorageFarmBroker {
    /// Creates a broker with the default HTTP prober and no plugins.
    pub fn new(config: BrokerConfig, connector: Arc<dyn RpcConnector>) -> Self {
        Self::with_parts(
            config,
            connector,
            Arc::new(HyperProber::default()),
            PluginRegistry::new(),
        )
    }

    /// Creates a broker with every collaborator supplied explicitly. Tests
    /// inject probers and connectors here; nothing is process-global.
    pub fn with_parts(
        config: BrokerConfig,
        connector: Arc<dyn RpcConnector>,
        prober: Arc<dyn HttpProber>,
        plugins: PluginRegistry,
    ) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                config,
                connector,
                prober,
                plugins,
                inner: Mutex::new(BrokerInner {
                    servers: HashMap::new(),
                    static_ids: HashSet::new(),
                    waiters: Vec::new(),
                    running: false,
                }),
            }),
        }
    }

    /// Attaches and starts every known handle. Idempotent.
    pub fn start(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.running {
            return;
        }
        inner.running = true;
        info!(servers = inner.servers.len(), "storage farm broker starting");
        for descriptor in inner.servers.values() {
            descriptor.handle.start_connecting();
        }
    }

    /// Detaches and stops every handle. Outstanding connected-enough waiters
    /// are left unresolved; their callers own cancellation.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.running = false;
        info!("storage farm broker stopping");
        for descriptor in inner.servers.values() {
            descriptor.handle.stop_connecting();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.inner.lock().unwrap().running
    }

    /// Records the static server table. Called once before the broker
    /// starts; these ServerIds are immune to later introducer overwrite.
    /// A malformed explicit permutation seed here is a hard configuration
    /// error, unlike in introducer announcements, and rejects the whole
    /// table: nothing is registered until every entry validates.
    pub fn set_static_servers(
        &self,
        servers: HashMap<String, StaticServerDefinition>,
    ) -> Result<()> {
        let mut validated = Vec::with_capacity(servers.len());
        for (key, definition) in servers {
            let server_id = ServerId::from(key.as_str());
            if !definition.ann.is_storage_service() {
                warn!(
                    server = %server_id,
                    service = ?definition.ann.service_name,
                    "skipping static entry for non-storage service"
                );
                continue;
            }
            derive_permutation_seed(
                &server_id,
                definition.ann.permutation_seed_base32.as_deref(),
                None,
            )?;
            validated.push((server_id, definition));
        }

        let mut inner = self.shared.inner.lock().unwrap();
        for (server_id, definition) in validated {
            let handle = self.make_handle(&server_id, &definition.ann);
            debug!(server = %server_id, "static server recorded");
            inner.static_ids.insert(server_id.clone());
            if inner.running {
                handle.start_connecting();
            }
            inner.servers.insert(
                server_id,
                ServerDescriptor {
                    announcement: definition.ann,
                    handle,
                    is_static: true,
                },
            );
        }
        Ok(())
    }

    /// Subscribes to the storage announcement feed; every delivered pair is
    /// handed to [`got_announcement`](Self::got_announcement).
    pub fn use_introducer(&self, introducer: &dyn IntroducerClient) {
        let weak = Arc::downgrade(&self.shared);
        introducer.subscribe_to(
            SERVICE_STORAGE,
            Arc::new(move |server_id, announcement| {
                if let Some(shared) = weak.upgrade() {
                    StorageFarmBroker { shared }.got_announcement(server_id, announcement);
                }
            }),
        );
    }

    /// Processes one announcement for one server: deduplicates, re-matches,
    /// and upgrades the handle in place when the variant or content changed.
    pub fn got_announcement(&self, server_id: ServerId, announcement: Announcement) {
        if !announcement.is_storage_service() {
            warn!(
                server = %server_id,
                service = ?announcement.service_name,
                "ignoring announcement for non-storage service"
            );
            return;
        }

        let mut inner = self.shared.inner.lock().unwrap();

        if inner.static_ids.contains(&server_id) {
            debug!(server = %server_id, "ignoring introducer announcement for static server");
            return;
        }
        if let Some(descriptor) = inner.servers.get(&server_id) {
            if descriptor.announcement == announcement {
                debug!(server = %server_id, "unchanged announcement, keeping current handle");
                return;
            }
        }

        let handle = self.make_handle(&server_id, &announcement);
        if let Some(old) = inner.servers.get(&server_id) {
            info!(server = %server_id, "superseding handle for changed announcement");
            // Strict sequencing: the old handle is fully stopped before the
            // new one starts, so we never hold two live connections to the
            // same physical server.
            old.handle.stop_connecting();
        }
        if inner.running {
            handle.start_connecting();
        }
        inner.servers.insert(
            server_id,
            ServerDescriptor {
                announcement,
                handle,
                is_static: false,
            },
        );
    }

    /// The current ServerId-to-handle view, for placement and selection
    /// logic. Handles are shared; only the broker replaces them.
    pub fn servers(&self) -> HashMap<ServerId, Arc<dyn ServerHandle>> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .servers
            .iter()
            .map(|(id, descriptor)| (id.clone(), descriptor.handle.clone()))
            .collect()
    }

    pub fn get_server(&self, server_id: &ServerId) -> Option<Arc<dyn ServerHandle>> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .servers
            .get(server_id)
            .map(|descriptor| descriptor.handle.clone())
    }

    /// How many handles are currently connected.
    pub fn connected_count(&self) -> usize {
        Self::count_connected(&self.shared.inner.lock().unwrap())
    }

    /// Resolves exactly once, the first time the number of simultaneously
    /// connected handles reaches `threshold`. Resolves immediately when the
    /// threshold is already met. Dropping below the threshold later never
    /// un-resolves or re-fires it.
    pub fn when_connected_enough(&self, threshold: usize) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.shared.inner.lock().unwrap();
        if Self::count_connected(&inner) >= threshold {
            let _ = tx.send(());
        } else {
            inner.waiters.push(Waiter { threshold, tx });
        }
        rx
    }

    fn count_connected(inner: &BrokerInner) -> usize {
        inner
            .servers
            .values()
            .filter(|descriptor| descriptor.handle.is_connected())
            .count()
    }

    /// Called from handle tasks whenever a connection comes or goes.
    fn connectivity_changed(shared: &Arc<BrokerShared>) {
        let mut inner = shared.inner.lock().unwrap();
        let count = Self::count_connected(&inner);
        if !inner.waiters.iter().any(|w| count >= w.threshold) {
            return;
        }
        let (ready, pending): (Vec<_>, Vec<_>) = inner
            .waiters
            .drain(..)
            .partition(|w| count >= w.threshold);
        inner.waiters = pending;
        drop(inner);
        for waiter in ready {
            debug!(threshold = waiter.threshold, count, "connected-enough threshold reached");
            let _ = waiter.tx.send(());
        }
    }

    fn sink(&self) -> StatusSink {
        let weak = Arc::downgrade(&self.shared);
        StatusSink::new(move || {
            if let Some(shared) = weak.upgrade() {
                Self::connectivity_changed(&shared);
            }
        })
    }

    /// Resolves an announcement to a handle. Infallible by design: anything
    /// that can't be turned into a connecting handle becomes the inert null
    /// variant, so one server's bad announcement never disturbs the rest.
    fn make_handle(
        &self,
        server_id: &ServerId,
        announcement: &Announcement,
    ) -> Arc<dyn ServerHandle> {
        let selection = select_variant(
            announcement,
            &self.shared.plugins.configs(),
            self.shared.config.force_legacy_rpc,
        );
        let handle_config = self.shared.config.handle.clone();

        let built: Result<Arc<dyn ServerHandle>> = match selection {
            VariantSelection::Http { nurls } => HttpServerHandle::new(
                server_id.clone(),
                announcement.clone(),
                nurls,
                self.shared.prober.clone(),
                handle_config,
                self.sink(),
            )
            .map(|handle| Arc::new(handle) as Arc<dyn ServerHandle>),
            VariantSelection::Rpc { furl } => RpcServerHandle::new(
                server_id.clone(),
                announcement.clone(),
                furl,
                self.shared.connector.clone(),
                handle_config,
                self.sink(),
            )
            .map(|handle| Arc::new(handle) as Arc<dyn ServerHandle>),
            VariantSelection::Plugin {
                name,
                announcement: plugin_announcement,
                config,
            } => match self.shared.plugins.get(&name) {
                Some((plugin, _)) => PluginServerHandle::new(
                    server_id.clone(),
                    announcement.clone(),
                    plugin.clone(),
                    plugin_announcement,
                    config,
                    handle_config,
                    self.sink(),
                )
                .map(|handle| Arc::new(handle) as Arc<dyn ServerHandle>),
                // The matcher only names plugins out of our own registry.
                None => Ok(Arc::new(NullServerHandle::new(
                    server_id.clone(),
                    announcement.clone(),
                ))),
            },
            VariantSelection::Null => Ok(Arc::new(NullServerHandle::new(
                server_id.clone(),
                announcement.clone(),
            ))),
        };

        match built {
            Ok(handle) => handle,
            Err(e) => {
                warn!(server = %server_id, error = %e, "announcement degraded to inert handle");
                Arc::new(NullServerHandle::new(
                    server_id.clone(),
                    announcement.clone(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::handle::ProtocolVariant;
    use crate::rpc::{RpcConnection, RpcConnector};
    use async_trait::async_trait;
    use gridstore_common::{base32_decode, GridError};

    /// Connector that never finishes connecting; good enough for tests that
    /// only look at registry behavior.
    struct PendingConnector;

    #[async_trait]
    impl RpcConnector for PendingConnector {
        async fn connect(&self, _furl: &str) -> Result<Arc<dyn RpcConnection>> {
            std::future::pending().await
        }
    }

    fn make_broker() -> StorageFarmBroker {
        StorageFarmBroker::new(BrokerConfig::default(), Arc::new(PendingConnector))
    }

    fn static_table(value: serde_json::Value) -> HashMap<String, StaticServerDefinition> {
        serde_json::from_value(value).unwrap()
    }

    const SOME_FURL: &str = "pb://abcde@nowhere/fake";

    #[tokio::test]
    async fn test_static_servers_win_over_introducer() {
        let broker = make_broker();
        let server_id = ServerId::from("v0-1234-1");

        broker
            .set_static_servers(static_table(json!({
                "v0-1234-1": {
                    "ann": {
                        "anonymous-storage-FURL": SOME_FURL,
                        "permutation-seed-base32": "aaaaaaaaaaaaaaaaaaaaaaaa",
                    }
                }
            })))
            .unwrap();

        let server = broker.get_server(&server_id).unwrap();
        assert_eq!(server.server_id(), &server_id);
        assert_eq!(
            server.permutation_seed(),
            base32_decode("aaaaaaaaaaaaaaaaaaaaaaaa").unwrap()
        );

        // If the introducer announces the same ServerId, we're supposed to
        // ignore it.
        let ann2: Announcement = serde_json::from_value(json!({
            "service-name": "storage",
            "anonymous-storage-FURL": "pb://other@nowhere/fake2",
            "permutation-seed-base32": "bbbbbbbbbbbbbbbbbbbbbbbb",
        }))
        .unwrap();
        broker.got_announcement(server_id.clone(), ann2);

        let still = broker.get_server(&server_id).unwrap();
        assert!(Arc::ptr_eq(&server, &still));
        assert_eq!(
            still.permutation_seed(),
            base32_decode("aaaaaaaaaaaaaaaaaaaaaaaa").unwrap()
        );
    }

    #[tokio::test]
    async fn test_static_permutation_seed_pubkey() {
        let broker = make_broker();
        let k = "4uazse3xb6uu5qpkb7tel2bm6bpea4jhuigdhqcuvvse7hugtsia";
        let key = format!("v0-{k}");
        let server_id = ServerId::from(key.as_str());
        let definition = StaticServerDefinition {
            ann: serde_json::from_value(json!({ "anonymous-storage-FURL": SOME_FURL })).unwrap(),
        };
        broker
            .set_static_servers(HashMap::from([(key, definition)]))
            .unwrap();
        let server = broker.get_server(&server_id).unwrap();
        assert_eq!(server.permutation_seed(), base32_decode(k).unwrap());
    }

    #[tokio::test]
    async fn test_static_permutation_seed_hashed() {
        use sha2::{Digest, Sha256};
        let broker = make_broker();
        let server_id = ServerId::from("unparseable");
        broker
            .set_static_servers(static_table(json!({
                "unparseable": { "ann": { "anonymous-storage-FURL": SOME_FURL } }
            })))
            .unwrap();
        let server = broker.get_server(&server_id).unwrap();
        assert_eq!(
            server.permutation_seed(),
            Sha256::digest(b"unparseable").to_vec()
        );
    }

    #[tokio::test]
    async fn test_static_bad_seed_is_hard_error() {
        let broker = make_broker();
        let result = broker.set_static_servers(static_table(json!({
            "v0-1234-1": {
                "ann": {
                    "anonymous-storage-FURL": SOME_FURL,
                    "permutation-seed-base32": "0189",
                }
            }
        })));
        assert!(matches!(result, Err(GridError::SeedDecode(_))));
    }

    #[tokio::test]
    async fn test_bad_static_seed_rejects_whole_table() {
        let broker = make_broker();
        let result = broker.set_static_servers(static_table(json!({
            "v0-good": {
                "ann": { "anonymous-storage-FURL": SOME_FURL }
            },
            "v0-bad": {
                "ann": {
                    "anonymous-storage-FURL": SOME_FURL,
                    "permutation-seed-base32": "0189",
                }
            }
        })));
        assert!(matches!(result, Err(GridError::SeedDecode(_))));

        // Nothing was registered, not even the valid entry, and the valid
        // ServerId is not reserved as static.
        assert!(broker.servers().is_empty());
        let ann: Announcement = serde_json::from_value(json!({
            "service-name": "storage",
            "anonymous-storage-FURL": SOME_FURL,
        }))
        .unwrap();
        broker.got_announcement(ServerId::from("v0-good"), ann);
        assert!(broker.get_server(&ServerId::from("v0-good")).is_some());
    }

    #[tokio::test]
    async fn test_non_storage_announcement_is_ignored() {
        let broker = make_broker();
        let ann: Announcement = serde_json::from_value(json!({
            "service-name": "helper",
            "anonymous-storage-FURL": SOME_FURL,
        }))
        .unwrap();
        broker.got_announcement(ServerId::from("v0-helper"), ann);
        assert!(broker.get_server(&ServerId::from("v0-helper")).is_none());
    }

    #[tokio::test]
    async fn test_non_storage_static_entry_is_skipped() {
        let broker = make_broker();
        broker
            .set_static_servers(static_table(json!({
                "v0-storage": {
                    "ann": {
                        "service-name": "storage",
                        "anonymous-storage-FURL": SOME_FURL,
                    }
                },
                "v0-helper": {
                    "ann": {
                        "service-name": "helper",
                        "anonymous-storage-FURL": SOME_FURL,
                    }
                }
            })))
            .unwrap();
        assert!(broker.get_server(&ServerId::from("v0-storage")).is_some());
        assert!(broker.get_server(&ServerId::from("v0-helper")).is_none());
    }

    #[tokio::test]
    async fn test_unchanged_announcement_keeps_handle_instance() {
        let broker = make_broker();
        let server_id = ServerId::from("v0-1234-1");
        let ann: Announcement = serde_json::from_value(json!({
            "service-name": "storage",
            "anonymous-storage-FURL": SOME_FURL,
        }))
        .unwrap();

        broker.got_announcement(server_id.clone(), ann.clone());
        let first = broker.get_server(&server_id).unwrap();

        broker.got_announcement(server_id.clone(), ann);
        let second = broker.get_server(&server_id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // A genuinely changed announcement replaces the handle.
        let changed: Announcement = serde_json::from_value(json!({
            "service-name": "storage",
            "anonymous-storage-FURL": "pb://other@nowhere/fake2",
        }))
        .unwrap();
        broker.got_announcement(server_id.clone(), changed);
        let third = broker.get_server(&server_id).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn test_unrecognized_announcement_is_inert_and_isolated() {
        let broker = make_broker();
        broker.start();

        let junk: Announcement = serde_json::from_value(json!({
            "name": "gridstore-testing-v1",
            "any-parameter": 12345,
        }))
        .unwrap();
        broker.got_announcement(ServerId::from("abc"), junk);

        let handle = broker.get_server(&ServerId::from("abc")).unwrap();
        assert_eq!(handle.variant(), ProtocolVariant::Null);
        assert!(!handle.connection_status().connected);

        // Other servers keep working.
        let good: Announcement = serde_json::from_value(json!({
            "service-name": "storage",
            "anonymous-storage-FURL": SOME_FURL,
        }))
        .unwrap();
        broker.got_announcement(ServerId::from("v0-good"), good);
        let good_handle = broker.get_server(&ServerId::from("v0-good")).unwrap();
        assert_eq!(good_handle.variant(), ProtocolVariant::Rpc);
        assert!(good_handle.is_running());

        broker.stop();
    }

    #[tokio::test]
    async fn test_bad_seed_from_introducer_degrades_to_null() {
        let broker = make_broker();
        let ann: Announcement = serde_json::from_value(json!({
            "service-name": "storage",
            "anonymous-storage-FURL": SOME_FURL,
            "permutation-seed-base32": "0189",
        }))
        .unwrap();
        broker.got_announcement(ServerId::from("v0-1234-1"), ann);
        let handle = broker.get_server(&ServerId::from("v0-1234-1")).unwrap();
        assert_eq!(handle.variant(), ProtocolVariant::Null);
    }

    #[tokio::test]
    async fn test_handles_start_only_when_broker_runs() {
        let broker = make_broker();
        let ann: Announcement = serde_json::from_value(json!({
            "service-name": "storage",
            "anonymous-storage-FURL": SOME_FURL,
        }))
        .unwrap();
        broker.got_announcement(ServerId::from("v0-1"), ann.clone());
        let handle = broker.get_server(&ServerId::from("v0-1")).unwrap();
        assert!(!handle.is_running());

        broker.start();
        assert!(handle.is_running());

        // Announcements that arrive while running start immediately.
        broker.got_announcement(ServerId::from("v0-2"), ann);
        let second = broker.get_server(&ServerId::from("v0-2")).unwrap();
        assert!(second.is_running());

        broker.stop();
        assert!(!handle.is_running());
        assert!(!second.is_running());
    }
}
