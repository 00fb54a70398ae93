//! Publisher-side change pipelines: fan out application "publish" calls to
//! the subscribers whose pattern matches, filtered by modification time.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Send-channel capacity. One slot turns the channel into a coalescing
/// latch: a publish that lands while a prior event is pending is dropped,
/// so subscribers see at least one notification per burst, not one per
/// publish.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1;

/// A subscriber interested in modifications of resources matching one URI
/// pattern.
pub(crate) struct ResourceChangeSubscriber {
    id: String,
    subscribed_uri: Url,
    last_received: Mutex<SystemTime>,
    tx: mpsc::Sender<Url>,
}

impl ResourceChangeSubscriber {
    pub(crate) fn new(id: String, subscribed_uri: Url) -> (Self, mpsc::Receiver<Url>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        (
            Self {
                id,
                subscribed_uri,
                last_received: Mutex::new(SystemTime::now()),
                tx,
            },
            rx,
        )
    }

    fn last_received(&self) -> SystemTime {
        *self.last_received.lock().unwrap()
    }

    /// Record delivery and hand the concrete URI to the notifier. Never
    /// blocks; a full latch drops the event.
    fn deliver(&self, uri: Url) {
        *self.last_received.lock().unwrap() = SystemTime::now();
        let _ = self.tx.try_send(uri);
    }
}

/// Fan-out point for modifications of one registered resource pattern.
pub struct ResourceChangePipeline {
    subscribers: RwLock<HashMap<String, ResourceChangeSubscriber>>,
}

impl ResourceChangePipeline {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn subscribe(&self, subscriber: ResourceChangeSubscriber) {
        self.subscribers
            .write()
            .unwrap()
            .insert(subscriber.id.clone(), subscriber);
    }

    pub(crate) fn unsubscribe(&self, id: &str) {
        self.subscribers.write().unwrap().remove(id);
    }

    /// Announce that the resource at `uri` changed at `modified_at`.
    /// Delivers to every subscriber whose pattern matches and whose last
    /// delivery is not newer than the change.
    pub fn publish(&self, uri: &Url, modified_at: SystemTime) {
        let subscribers = self.subscribers.read().unwrap();
        for subscriber in subscribers.values() {
            if !uri_matches(uri, &subscriber.subscribed_uri) {
                continue;
            }
            if subscriber.last_received() > modified_at {
                continue;
            }
            debug!(uri = %uri, subscriber = %subscriber.id, "resource change delivered");
            subscriber.deliver(uri.clone());
        }
    }

}

/// A subscriber interested in changes to the resource list as a whole.
pub(crate) struct ListChangeSubscriber {
    id: String,
    last_received: Mutex<SystemTime>,
    tx: mpsc::Sender<()>,
}

impl ListChangeSubscriber {
    pub(crate) fn new(id: String) -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        (
            Self {
                id,
                last_received: Mutex::new(SystemTime::now()),
                tx,
            },
            rx,
        )
    }

    fn last_received(&self) -> SystemTime {
        *self.last_received.lock().unwrap()
    }

    fn deliver(&self) {
        *self.last_received.lock().unwrap() = SystemTime::now();
        let _ = self.tx.try_send(());
    }
}

/// Fan-out point for resource-list changes.
pub struct ResourceListChangePipeline {
    subscribers: RwLock<HashMap<String, ListChangeSubscriber>>,
}

impl ResourceListChangePipeline {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn subscribe(&self, subscriber: ListChangeSubscriber) {
        self.subscribers
            .write()
            .unwrap()
            .insert(subscriber.id.clone(), subscriber);
    }

    pub(crate) fn unsubscribe(&self, id: &str) {
        self.subscribers.write().unwrap().remove(id);
    }

    /// Announce that the resource list changed at `modified_at`.
    pub fn publish(&self, modified_at: SystemTime) {
        let subscribers = self.subscribers.read().unwrap();
        for subscriber in subscribers.values() {
            if subscriber.last_received() > modified_at {
                continue;
            }
            debug!(subscriber = %subscriber.id, "resource list change delivered");
            subscriber.deliver();
        }
    }
}

/// Application-facing publisher for one resource pattern's changes.
/// Obtained through a resource change observer registration.
#[derive(Clone)]
pub struct ResourceChangeHandle {
    pub(crate) pipeline: std::sync::Arc<ResourceChangePipeline>,
    pub(crate) cancel: CancellationToken,
}

impl ResourceChangeHandle {
    /// Publish a modification of the concrete `uri`, asserted to have
    /// happened at `modified_at`.
    pub fn publish(&self, uri: &Url, modified_at: SystemTime) {
        self.pipeline.publish(uri, modified_at);
    }

    /// Token cancelled when the server shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Application-facing publisher for resource-list changes.
#[derive(Clone)]
pub struct ResourceListChangeHandle {
    pub(crate) pipeline: std::sync::Arc<ResourceListChangePipeline>,
    pub(crate) cancel: CancellationToken,
}

impl ResourceListChangeHandle {
    pub fn publish(&self, modified_at: SystemTime) {
        self.pipeline.publish(modified_at);
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// True when the concrete `uri` satisfies the subscriber's `pattern`: same
/// scheme, same host, same number of path segments, each segment equal or a
/// `{param}` wildcard in the pattern.
pub(crate) fn uri_matches(uri: &Url, pattern: &Url) -> bool {
    if uri.scheme() != pattern.scheme() {
        return false;
    }
    if uri.host_str() != pattern.host_str() {
        return false;
    }
    let actual: Vec<&str> = uri.path().split('/').collect();
    let subscribed: Vec<&str> = pattern.path().split('/').collect();
    if actual.len() != subscribed.len() {
        return false;
    }
    for (a, s) in actual.iter().zip(subscribed.iter()) {
        if crate::routing::wildcard_name(s).is_some() {
            continue;
        }
        if a != s {
            return false;
        }
    }
    true
}
