use std::sync::RwLock;
use std::time::SystemTime;

/// Snapshot of one server's connectivity, read-only to consumers.
///
/// Always queryable: a server that has never connected still reports a
/// coherent status instead of erroring.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub connected: bool,
    /// Short human-readable description of the current state.
    pub summary: String,
    pub last_connected: Option<SystemTime>,
    pub last_connection_lost: Option<SystemTime>,
    /// Since when the server has been continuously unreachable; `None` while
    /// connected.
    pub non_connected_since: Option<SystemTime>,
}

impl ConnectionStatus {
    fn initial() -> Self {
        Self {
            connected: false,
            summary: "never connected".to_string(),
            last_connected: None,
            last_connection_lost: None,
            non_connected_since: Some(SystemTime::now()),
        }
    }
}

/// Internal writer side of [`ConnectionStatus`]; owned by a handle, mutated
/// only by its connection events.
#[derive(Debug)]
pub(crate) struct StatusTracker {
    inner: RwLock<ConnectionStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ConnectionStatus::initial()),
        }
    }

    pub fn snapshot(&self) -> ConnectionStatus {
        self.inner.read().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read().unwrap().connected
    }

    pub fn note_connected(&self, summary: String) {
        let mut status = self.inner.write().unwrap();
        status.connected = true;
        status.summary = summary;
        status.last_connected = Some(SystemTime::now());
        status.non_connected_since = None;
    }

    pub fn note_connection_lost(&self, summary: String) {
        let mut status = self.inner.write().unwrap();
        let now = SystemTime::now();
        status.connected = false;
        status.summary = summary;
        status.last_connection_lost = Some(now);
        status.non_connected_since = Some(now);
    }

    /// A failed attempt at a server we weren't connected to; updates the
    /// summary without touching the loss timestamps.
    pub fn note_attempt_failed(&self, summary: String) {
        let mut status = self.inner.write().unwrap();
        status.connected = false;
        status.summary = summary;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_status_is_queryable() {
        let tracker = StatusTracker::new();
        let status = tracker.snapshot();
        assert!(!status.connected);
        assert_eq!(status.summary, "never connected");
        assert!(status.last_connected.is_none());
        assert!(status.non_connected_since.is_some());
    }

    #[test]
    fn test_connect_then_lose() {
        let tracker = StatusTracker::new();
        tracker.note_connected("connected to a".to_string());
        assert!(tracker.is_connected());
        assert!(tracker.snapshot().non_connected_since.is_none());
        assert!(tracker.snapshot().last_connected.is_some());

        tracker.note_connection_lost("connection lost".to_string());
        let status = tracker.snapshot();
        assert!(!status.connected);
        assert!(status.last_connection_lost.is_some());
        assert!(status.non_connected_since.is_some());
        // A prior connection stays on record.
        assert!(status.last_connected.is_some());
    }

    #[test]
    fn test_failed_attempt_keeps_timestamps() {
        let tracker = StatusTracker::new();
        tracker.note_attempt_failed("connection refused".to_string());
        let status = tracker.snapshot();
        assert!(!status.connected);
        assert_eq!(status.summary, "connection refused");
        assert!(status.last_connection_lost.is_none());
    }
}
