//! The announcement-delivery seam.
//!
//! The introducer's own protocol is somebody else's problem; the broker only
//! consumes a subscribe/callback interface. Announcements for different
//! servers may arrive in any order; per-server ordering is assumed from the
//! feed but not required for correctness.

use std::sync::{Arc, Mutex};

use gridstore_common::{Announcement, ServerId};

/// Invoked for every new or changed announcement of the subscribed service.
pub type AnnouncementCallback = Arc<dyn Fn(ServerId, Announcement) + Send + Sync>;

/// Client of an announcement feed.
pub trait IntroducerClient: Send + Sync {
    fn subscribe_to(&self, service_name: &str, callback: AnnouncementCallback);
}

struct Subscription {
    service_name: String,
    callback: AnnouncementCallback,
}

/// In-memory introducer client: records subscriptions and lets a test (or a
/// static feed) publish announcements by hand.
#[derive(Default)]
pub struct MemoryIntroducerClient {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MemoryIntroducerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers an announcement to every subscriber of `service_name`.
    pub fn publish(&self, service_name: &str, server_id: &ServerId, announcement: &Announcement) {
        let subscriptions = self.subscriptions.lock().unwrap();
        for subscription in subscriptions.iter() {
            if subscription.service_name == service_name {
                (subscription.callback)(server_id.clone(), announcement.clone());
            }
        }
    }

    /// The service names subscribed so far, in subscription order.
    pub fn subscribed_services(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.service_name.clone())
            .collect()
    }
}

impl IntroducerClient for MemoryIntroducerClient {
    fn subscribe_to(&self, service_name: &str, callback: AnnouncementCallback) {
        self.subscriptions.lock().unwrap().push(Subscription {
            service_name: service_name.to_string(),
            callback,
        });
    }
}
