use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The service name under which storage servers announce themselves.
pub const SERVICE_STORAGE: &str = "storage";

/// Opaque, stable identity of one storage server.
///
/// Derived from the server's public key for introducer-announced servers
/// (`v0-<base32>`), or an arbitrary configured string for static entries.
/// Used as the map key everywhere in the broker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(Vec<u8>);

impl ServerId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Human-readable form of the full identity, for logs and status pages.
    pub fn longname(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    /// Short form of the identity (first 8 characters past any version tag).
    pub fn name(&self) -> String {
        let long = self.longname();
        let tail = long.strip_prefix("v0-").unwrap_or(&long);
        tail.chars().take(8).collect()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.longname())
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for ServerId {
    fn from(b: &[u8]) -> Self {
        Self(b.to_vec())
    }
}

/// One server's published description of how to reach it.
///
/// Announcements arrive as loosely-typed JSON maps, either from the static
/// server table or from the introducer feed. The fields the client recognizes
/// are spelled out here with their exact case-sensitive wire keys; anything
/// else is preserved in `extra` so that announcement equality covers the full
/// wire form.
///
/// Two announcements are equal when their canonical serialized forms match;
/// the derived `PartialEq` gives exactly that (maps compare structurally,
/// independent of key order).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(rename = "service-name", skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Legacy RPC connection hint.
    #[serde(
        rename = "anonymous-storage-FURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub anonymous_storage_furl: Option<String>,

    /// Native-HTTP endpoint candidates, in the server's preference order.
    #[serde(
        rename = "anonymous-storage-NURLs",
        skip_serializing_if = "Option::is_none"
    )]
    pub anonymous_storage_nurls: Option<Vec<String>>,

    /// Explicit permutation seed, overriding anything derived from the
    /// server identity.
    #[serde(
        rename = "permutation-seed-base32",
        skip_serializing_if = "Option::is_none"
    )]
    pub permutation_seed_base32: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,

    /// Plugin name, for announcements that are themselves plugin-shaped
    /// rather than carrying a `storage-options` list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Candidate plugin announcements; the first one whose name matches an
    /// enabled plugin wins.
    #[serde(rename = "storage-options", skip_serializing_if = "Option::is_none")]
    pub storage_options: Option<Vec<PluginAnnouncement>>,

    /// Unrecognized keys, kept so equality and re-serialization are faithful
    /// to the wire form.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Announcement {
    /// The nickname to display for this server; missing nicknames are the
    /// empty string.
    pub fn nickname_or_default(&self) -> &str {
        self.nickname.as_deref().unwrap_or("")
    }

    /// Whether this announcement is for the storage service. Static-table
    /// entries routinely omit `service-name`, so an absent field passes; only
    /// an explicit different service name fails.
    pub fn is_storage_service(&self) -> bool {
        self.service_name
            .as_deref()
            .is_none_or(|name| name == SERVICE_STORAGE)
    }

    /// Whether the announcement advertises at least one native-HTTP endpoint.
    /// An empty list is treated the same as an absent field.
    pub fn has_nurls(&self) -> bool {
        self.anonymous_storage_nurls
            .as_ref()
            .is_some_and(|nurls| !nurls.is_empty())
    }
}

/// One entry of an announcement's `storage-options` list: a plugin name plus
/// whatever plugin-specific fields the server chose to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginAnnouncement {
    pub name: String,

    #[serde(flatten)]
    pub options: Map<String, Value>,
}
