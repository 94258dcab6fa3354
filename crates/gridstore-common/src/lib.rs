//! Gridstore Common Types
//!
//! This crate provides the announcement model and protocol-selection logic
//! shared by the gridstore storage client components.
//!
//! # Overview
//!
//! A gridstore client learns about storage servers through *announcements*:
//! small maps of string keys describing how a server can be reached and which
//! protocols it speaks. This crate contains everything needed to interpret
//! them without doing any networking:
//!
//! - **Announcement model**: [`Announcement`], [`PluginAnnouncement`] and
//!   [`ServerId`] — typed views over the wire-format maps.
//! - **Matcher**: [`select_variant`] decides which protocol variant a client
//!   should instantiate for an announcement.
//! - **Permutation seeds**: [`derive_permutation_seed`] turns a server
//!   identity into the deterministic seed used for share placement.
//!
//! # Example
//!
//! ```
//! use gridstore_common::{Announcement, select_variant, VariantSelection};
//! use std::collections::BTreeMap;
//!
//! let ann: Announcement = serde_json::from_str(
//!     r#"{"service-name": "storage", "anonymous-storage-FURL": "pb://key@host/swissnum"}"#,
//! ).unwrap();
//!
//! let selection = select_variant(&ann, &BTreeMap::new(), false);
//! assert!(matches!(selection, VariantSelection::Rpc { .. }));
//! ```

pub mod announcement;
pub mod error;
pub mod matcher;
pub mod seed;

pub use announcement::{Announcement, PluginAnnouncement, ServerId, SERVICE_STORAGE};
pub use error::{GridError, Result};
pub use matcher::{select_variant, should_use_http, PluginConfigs, VariantSelection};
pub use seed::{base32_decode, base32_encode, derive_permutation_seed};
