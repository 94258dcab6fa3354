//! Announcement matching: which protocol variant to instantiate for a server.
//!
//! Matching is pure and re-evaluated on every announcement, so an
//! announcement that is unrecognized today (say, for a plugin that isn't
//! loaded) can be recognized later without any cached "permanently
//! unrecognized" state.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::announcement::{Announcement, PluginAnnouncement};

/// Enabled plugin names mapped to their per-plugin configuration.
///
/// `None` means the plugin has no configuration section at all, which is
/// distinct from `Some` of an empty map and must be preserved as given.
pub type PluginConfigs = BTreeMap<String, Option<Map<String, Value>>>;

/// The protocol variant selected for one announcement.
#[derive(Debug, Clone, PartialEq)]
pub enum VariantSelection {
    /// Native HTTP protocol; candidate endpoints to race, in announced order.
    Http { nurls: Vec<String> },
    /// Legacy RPC protocol, reached through the announced connection hint.
    Rpc { furl: String },
    /// A third-party storage protocol handled by an enabled plugin.
    Plugin {
        name: String,
        announcement: PluginAnnouncement,
        config: Option<Map<String, Value>>,
    },
    /// Nothing recognized: store the announcement, perform no networking.
    Null,
}

/// Pure policy decision: use native HTTP unless the local configuration
/// forces the legacy protocol, and only if the announcement actually carries
/// a non-empty endpoint list. An empty list is the same as no list.
pub fn should_use_http(force_legacy_rpc: bool, announcement: &Announcement) -> bool {
    !force_legacy_rpc && announcement.has_nurls()
}

/// Selects the protocol variant for an announcement.
///
/// Priority: native HTTP (when policy permits), then the legacy RPC hint,
/// then the first plugin announcement matching an enabled plugin, then the
/// inert null variant. Unrecognized announcements are a valid result, never
/// an error.
pub fn select_variant(
    announcement: &Announcement,
    enabled_plugins: &PluginConfigs,
    force_legacy_rpc: bool,
) -> VariantSelection {
    if should_use_http(force_legacy_rpc, announcement) {
        // has_nurls() guarantees the list exists and is non-empty.
        let nurls = announcement
            .anonymous_storage_nurls
            .clone()
            .unwrap_or_default();
        return VariantSelection::Http { nurls };
    }

    if let Some(furl) = &announcement.anonymous_storage_furl {
        return VariantSelection::Rpc { furl: furl.clone() };
    }

    if let Some(options) = &announcement.storage_options {
        for option in options {
            if let Some(config) = enabled_plugins.get(&option.name) {
                return VariantSelection::Plugin {
                    name: option.name.clone(),
                    announcement: option.clone(),
                    config: config.clone(),
                };
            }
        }
    }

    // An announcement may itself be plugin-shaped, with the plugin name at
    // the top level instead of inside storage-options.
    if let Some(name) = &announcement.name {
        if let Some(config) = enabled_plugins.get(name) {
            return VariantSelection::Plugin {
                name: name.clone(),
                announcement: PluginAnnouncement {
                    name: name.clone(),
                    options: announcement.extra.clone(),
                },
                config: config.clone(),
            };
        }
    }

    VariantSelection::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ann(value: Value) -> Announcement {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_should_use_http_truth_table() {
        let no_nurls = ann(json!({}));
        let empty_nurls = ann(json!({ "anonymous-storage-NURLs": [] }));
        let has_nurls = ann(json!({ "anonymous-storage-NURLs": ["pb://.."] }));

        for (force_legacy, announcement, expected) in [
            (false, &no_nurls, false),
            (false, &empty_nurls, false),
            (false, &has_nurls, true),
            (true, &empty_nurls, false),
            (true, &no_nurls, false),
            (true, &has_nurls, false),
        ] {
            assert_eq!(
                should_use_http(force_legacy, announcement),
                expected,
                "force_legacy={force_legacy} announcement={announcement:?}"
            );
        }
    }

    #[test]
    fn test_http_preferred_over_rpc() {
        let announcement = ann(json!({
            "anonymous-storage-FURL": "pb://key@host/swissnum",
            "anonymous-storage-NURLs": ["pb://key@host:1234/swissnum#v=1"],
        }));
        let selection = select_variant(&announcement, &BTreeMap::new(), false);
        assert_eq!(
            selection,
            VariantSelection::Http {
                nurls: vec!["pb://key@host:1234/swissnum#v=1".to_string()]
            }
        );
    }

    #[test]
    fn test_forced_legacy_falls_back_to_rpc() {
        let announcement = ann(json!({
            "anonymous-storage-FURL": "pb://key@host/swissnum",
            "anonymous-storage-NURLs": ["pb://key@host:1234/swissnum#v=1"],
        }));
        let selection = select_variant(&announcement, &BTreeMap::new(), true);
        assert_eq!(
            selection,
            VariantSelection::Rpc {
                furl: "pb://key@host/swissnum".to_string()
            }
        );
    }

    #[test]
    fn test_plugin_matched_when_enabled() {
        let announcement = ann(json!({
            "service-name": "storage",
            "storage-options": [{
                "name": "gridstore-dummy-v1",
                "storage-server-FURL": "pb://key@host/swissnum",
            }],
        }));
        let mut plugins = PluginConfigs::new();
        plugins.insert(
            "gridstore-dummy-v1".to_string(),
            Some(Map::from_iter([("abc".to_string(), json!("xyz"))])),
        );

        match select_variant(&announcement, &plugins, false) {
            VariantSelection::Plugin { name, config, .. } => {
                assert_eq!(name, "gridstore-dummy-v1");
                assert_eq!(config.unwrap().get("abc"), Some(&json!("xyz")));
            }
            other => panic!("expected plugin selection, got {other:?}"),
        }
    }

    #[test]
    fn test_absent_plugin_config_stays_absent() {
        let announcement = ann(json!({
            "storage-options": [{ "name": "gridstore-dummy-v1" }],
        }));
        let mut plugins = PluginConfigs::new();
        plugins.insert("gridstore-dummy-v1".to_string(), None);

        match select_variant(&announcement, &plugins, false) {
            VariantSelection::Plugin { config, .. } => assert_eq!(config, None),
            other => panic!("expected plugin selection, got {other:?}"),
        }
    }

    #[test]
    fn test_first_matching_plugin_option_wins() {
        let announcement = ann(json!({
            "storage-options": [
                { "name": "not-enabled-v2" },
                { "name": "enabled-a", "which": 1 },
                { "name": "enabled-a", "which": 2 },
            ],
        }));
        let mut plugins = PluginConfigs::new();
        plugins.insert("enabled-a".to_string(), None);

        match select_variant(&announcement, &plugins, false) {
            VariantSelection::Plugin { announcement, .. } => {
                assert_eq!(announcement.options.get("which"), Some(&json!(1)));
            }
            other => panic!("expected plugin selection, got {other:?}"),
        }
    }

    #[test]
    fn test_non_enabled_plugin_is_null() {
        let announcement = ann(json!({
            "service-name": "storage",
            "storage-options": [{
                "name": "gridstore-dummy-v2",
                "storage-server-FURL": "pb://key@host/swissnum",
            }],
        }));
        let mut plugins = PluginConfigs::new();
        plugins.insert("gridstore-dummy-v1".to_string(), None);

        assert_eq!(
            select_variant(&announcement, &plugins, false),
            VariantSelection::Null
        );
    }

    #[test]
    fn test_top_level_plugin_name_matched() {
        let announcement = ann(json!({
            "name": "gridstore-dummy-v1",
            "any-parameter": 12345,
        }));
        let mut plugins = PluginConfigs::new();
        plugins.insert("gridstore-dummy-v1".to_string(), None);

        match select_variant(&announcement, &plugins, false) {
            VariantSelection::Plugin { announcement, .. } => {
                assert_eq!(announcement.options.get("any-parameter"), Some(&json!(12345)));
            }
            other => panic!("expected plugin selection, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_announcement_is_null() {
        let announcement = Announcement::default();
        assert_eq!(
            select_variant(&announcement, &BTreeMap::new(), false),
            VariantSelection::Null
        );
    }
}
