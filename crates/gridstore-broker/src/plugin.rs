//! Pluggable third-party storage protocols.
//!
//! The broker never implements a plugin protocol itself; it matches an
//! announcement's plugin name against the registry of enabled plugins and
//! delegates client construction to the match. A plugin's configuration may
//! be absent (no section at all), which is distinct from an empty
//! configuration and is handed through exactly as registered.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use gridstore_common::{Announcement, PluginAnnouncement, PluginConfigs, Result, ServerId};

use crate::config::HandleConfig;
use crate::handle::{HandleCore, ProtocolVariant, ServerHandle, StatusSink};
use crate::status::ConnectionStatus;

/// The storage client a plugin builds for one server. Opaque to the broker;
/// `as_any` lets embedders downcast to the concrete client.
pub trait PluginStorageClient: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// One enabled third-party storage protocol.
#[async_trait]
pub trait StoragePlugin: Send + Sync {
    /// The name announcements are matched against.
    fn name(&self) -> &str;

    /// Builds a storage client for one server from its plugin announcement
    /// and the plugin's local configuration.
    async fn build_client(
        &self,
        announcement: &PluginAnnouncement,
        config: Option<&Map<String, Value>>,
    ) -> Result<Arc<dyn PluginStorageClient>>;
}

/// The set of enabled plugins with their per-plugin configuration.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, (Arc<dyn StoragePlugin>, Option<Map<String, Value>>)>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        plugin: Arc<dyn StoragePlugin>,
        config: Option<Map<String, Value>>,
    ) {
        self.plugins
            .insert(plugin.name().to_string(), (plugin, config));
    }

    pub fn get(&self, name: &str) -> Option<&(Arc<dyn StoragePlugin>, Option<Map<String, Value>>)> {
        self.plugins.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// The name-to-configuration view the announcement matcher consumes.
    pub fn configs(&self) -> PluginConfigs {
        self.plugins
            .iter()
            .map(|(name, (_, config))| (name.clone(), config.clone()))
            .collect()
    }
}

struct PluginInner {
    core: HandleCore,
    plugin: Arc<dyn StoragePlugin>,
    plugin_announcement: PluginAnnouncement,
    plugin_config: Option<Map<String, Value>>,
    config: HandleConfig,
    client: RwLock<Option<Arc<dyn PluginStorageClient>>>,
}

/// Plugin-backed server handle: delegates connection establishment to the
/// matched plugin and holds on to the client it builds.
pub struct PluginServerHandle {
    inner: Arc<PluginInner>,
}

impl PluginServerHandle {
    pub fn new(
        server_id: ServerId,
        announcement: Announcement,
        plugin: Arc<dyn StoragePlugin>,
        plugin_announcement: PluginAnnouncement,
        plugin_config: Option<Map<String, Value>>,
        config: HandleConfig,
        sink: StatusSink,
    ) -> Result<Self> {
        let core = HandleCore::new(server_id, announcement, sink)?;
        Ok(Self {
            inner: Arc::new(PluginInner {
                core,
                plugin,
                plugin_announcement,
                plugin_config,
                config,
                client: RwLock::new(None),
            }),
        })
    }

    /// The plugin-built storage client, once available.
    pub fn client(&self) -> Option<Arc<dyn PluginStorageClient>> {
        self.inner.client.read().unwrap().clone()
    }

    async fn run(inner: Arc<PluginInner>) {
        let mut backoff_ms = inner.config.retry.initial_backoff_ms;
        loop {
            let built = inner
                .plugin
                .build_client(
                    &inner.plugin_announcement,
                    inner.plugin_config.as_ref(),
                )
                .await;
            match built {
                Ok(client) => {
                    backoff_ms = inner.config.retry.initial_backoff_ms;
                    *inner.client.write().unwrap() = Some(client);
                    inner.core.note_connected(format!(
                        "connected through plugin {}",
                        inner.plugin.name()
                    ));
                    // The client stays in service until poked or stopped;
                    // a poke rebuilds it.
                    inner.core.poked().await;
                }
                Err(e) => {
                    inner.core.note_attempt_failed(e.to_string());
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        _ = inner.core.poked() => {}
                    }
                    backoff_ms = inner.config.retry.next_backoff(backoff_ms);
                }
            }
        }
    }
}

impl ServerHandle for PluginServerHandle {
    fn server_id(&self) -> &ServerId {
        self.inner.core.server_id()
    }

    fn announcement(&self) -> &Announcement {
        self.inner.core.announcement()
    }

    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Plugin
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
        self.inner.client.write().unwrap().take();
        self.inner.core.note_stopped();
    }

    fn try_to_connect(&self) {
        self.inner.core.poke();
    }
}
