//! The capability interface every server handle implements, plus the shared
//! connection-management plumbing behind the concrete variants.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gridstore_common::{derive_permutation_seed, Announcement, ServerId};

use crate::status::{ConnectionStatus, StatusTracker};

/// Which protocol a handle speaks; informational only. Everything the broker
/// does goes through [`ServerHandle`], never through the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    Rpc,
    Http,
    Plugin,
    Null,
}

/// Where handles report connectivity changes: the broker registers a callback
/// here so it can re-check its connected-enough waiters. A sink made with
/// [`StatusSink::detached`] reports nowhere, which is what tests and
/// not-yet-registered handles use.
#[derive(Clone)]
pub struct StatusSink(Option<Arc<dyn Fn() + Send + Sync>>);

impl StatusSink {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(callback)))
    }

    pub fn detached() -> Self {
        Self(None)
    }

    pub(crate) fn connectivity_changed(&self) {
        if let Some(callback) = &self.0 {
            callback();
        }
    }
}

impl fmt::Debug for StatusSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StatusSink")
            .field(&self.0.as_ref().map(|_| "..."))
            .finish()
    }
}

/// One live connection manager for one storage server.
///
/// The broker stores handles exclusively behind this trait; at most one
/// handle per ServerId is attached at any time. `start_connecting` must not
/// fail even for unrecognized or incomplete announcements - such a handle
/// simply never connects.
pub trait ServerHandle: Send + Sync {
    fn server_id(&self) -> &ServerId;
    fn announcement(&self) -> &Announcement;
    fn variant(&self) -> ProtocolVariant;

    /// Deterministic seed used by placement logic to permute the server list.
    fn permutation_seed(&self) -> &[u8];

    fn nickname(&self) -> &str;

    fn longname(&self) -> String {
        self.server_id().longname()
    }

    fn connection_status(&self) -> ConnectionStatus;

    fn is_connected(&self) -> bool {
        self.connection_status().connected
    }

    /// Whether the handle is attached and managing a connection attempt.
    fn is_running(&self) -> bool;

    /// Begins asynchronous, retried connection attempts. Idempotent.
    fn start_connecting(&self);

    /// Halts any outstanding attempt and retry timer. Idempotent.
    fn stop_connecting(&self);

    /// Forces an immediate reconnection attempt, skipping the retry backoff.
    fn try_to_connect(&self);

    /// Space the server reports as available, when connected and reported.
    fn available_space(&self) -> Option<u64> {
        None
    }
}

/// State shared by the connecting handle variants: identity, derived seed,
/// status tracking, and the lifecycle of the background connect task.
pub(crate) struct HandleCore {
    server_id: ServerId,
    announcement: Announcement,
    seed: Vec<u8>,
    nickname: String,
    status: StatusTracker,
    sink: StatusSink,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    poke: Notify,
}

impl HandleCore {
    pub fn new(
        server_id: ServerId,
        announcement: Announcement,
        sink: StatusSink,
    ) -> gridstore_common::Result<Self> {
        let seed = derive_permutation_seed(
            &server_id,
            announcement.permutation_seed_base32.as_deref(),
            None,
        )?;
        let nickname = announcement.nickname_or_default().to_string();
        Ok(Self {
            server_id,
            announcement,
            seed,
            nickname,
            status: StatusTracker::new(),
            sink,
            running: AtomicBool::new(false),
            task: Mutex::new(None),
            poke: Notify::new(),
        })
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn announcement(&self) -> &Announcement {
        &self.announcement
    }

    pub fn seed(&self) -> &[u8] {
        &self.seed
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the connect task unless one is already running.
    pub fn start_with(&self, spawn: impl FnOnce() -> JoinHandle<()>) {
        let mut task = self.task.lock().unwrap();
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *task = Some(spawn());
    }

    /// Stops the connect task. The caller is responsible for dropping any
    /// transport resource it holds outside the task.
    pub fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn poke(&self) {
        self.poke.notify_one();
    }

    pub fn poked(&self) -> Notified<'_> {
        self.poke.notified()
    }

    pub fn note_connected(&self, summary: String) {
        info!(server = %self.server_id, %summary, "storage server connected");
        self.status.note_connected(summary);
        self.sink.connectivity_changed();
    }

    pub fn note_connection_lost(&self, summary: String) {
        warn!(server = %self.server_id, %summary, "storage server connection lost");
        self.status.note_connection_lost(summary);
        self.sink.connectivity_changed();
    }

    pub fn note_attempt_failed(&self, summary: String) {
        debug!(server = %self.server_id, %summary, "connection attempt failed");
        self.status.note_attempt_failed(summary);
    }

    /// Broker-initiated stop: status is updated but the sink is not notified.
    /// Waiters only fire when the connected count rises, and the count is
    /// recomputed from scratch on every change.
    pub fn note_stopped(&self) {
        if self.status.is_connected() {
            self.status.note_connection_lost("stopped".to_string());
        }
    }
}

/// The inert variant: the announcement wasn't recognized (or a plugin it
/// names isn't loaded), so the broker stores it and performs no networking.
/// Recognition may succeed later when a changed announcement arrives.
pub struct NullServerHandle {
    server_id: ServerId,
    announcement: Announcement,
    seed: Vec<u8>,
    nickname: String,
    status: StatusTracker,
}

impl NullServerHandle {
    /// Never fails: a seed that cannot be derived from the announcement falls
    /// back to the identity hash, since an inert handle still needs a stable
    /// seed for bookkeeping.
    pub fn new(server_id: ServerId, announcement: Announcement) -> Self {
        let seed = derive_permutation_seed(
            &server_id,
            announcement.permutation_seed_base32.as_deref(),
            None,
        )
        .unwrap_or_else(|_| {
            derive_permutation_seed(&server_id, None, None)
                .unwrap_or_default()
        });
        let nickname = announcement.nickname_or_default().to_string();
        Self {
            server_id,
            announcement,
            seed,
            nickname,
            status: StatusTracker::new(),
        }
    }
}

impl ServerHandle for NullServerHandle {
    fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    fn announcement(&self) -> &Announcement {
        &self.announcement
    }

    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Null
    }

    fn permutation_seed(&self) -> &[u8] {
        &self.seed
    }

    fn nickname(&self) -> &str {
        &self.nickname
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.status.snapshot()
    }

    fn is_running(&self) -> bool {
        false
    }

    fn start_connecting(&self) {}

    fn stop_connecting(&self) {}

    fn try_to_connect(&self) {}
}
