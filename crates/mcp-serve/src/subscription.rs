//! Subscription stores and managers.
//!
//! A subscription records a session's interest in resource changes (per
//! URI) or resource-list changes (per session), together with a last-alive
//! stamp refreshed by the notifier's health ticker. Entries that miss their
//! health window are considered stale and get re-established by the
//! dispatcher's post-handle sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};

/// Liveness handle for one subscription.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    token: CancellationToken,
    last_alive: Mutex<Instant>,
}

impl Subscription {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                token: CancellationToken::new(),
                last_alive: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Record that the subscription is still serviced.
    pub fn signal_alive(&self) {
        *self.inner.last_alive.lock().unwrap() = Instant::now();
    }

    /// Token cancelled when this subscription is unsubscribed.
    pub fn unsubscribed(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Time of the last liveness signal.
    pub fn last_alive(&self) -> Instant {
        *self.inner.last_alive.lock().unwrap()
    }

    pub(crate) fn cancel(&self) {
        self.inner.token.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Healthy while the last liveness signal is within `interval`.
    pub fn is_healthy(&self, interval: Duration) -> bool {
        self.last_alive().elapsed() <= interval
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, age: Duration) {
        *self.inner.last_alive.lock().unwrap() = Instant::now() - age;
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

/// Pluggable persistence for resource-list-change subscriptions, keyed by
/// session ID.
#[async_trait]
pub trait ListChangeSubscriptionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Subscription>;
    async fn issue(&self, session_id: &str) -> Result<Subscription>;
    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// Pluggable persistence for resource-modification subscriptions, keyed by
/// session ID and resource URI.
#[async_trait]
pub trait ResourceSubscriptionStore: Send + Sync {
    async fn get(&self, session_id: &str, uri: &Url) -> Result<Subscription>;
    async fn issue(&self, session_id: &str, uri: &Url) -> Result<Subscription>;
    async fn delete(&self, session_id: &str, uri: &Url) -> Result<()>;
    /// URIs whose subscriptions missed the health window, for recovery.
    async fn unhealthy_uris_by_session(&self, session_id: &str) -> Result<Vec<Url>>;
    async fn delete_by_session(&self, session_id: &str) -> Result<()>;
}

/// In-memory list-change subscription store.
///
/// NOTE: only suitable for a single-process deployment.
pub struct InMemoryListChangeSubscriptionStore {
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl InMemoryListChangeSubscriptionStore {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryListChangeSubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListChangeSubscriptionStore for InMemoryListChangeSubscriptionStore {
    async fn get(&self, session_id: &str) -> Result<Subscription> {
        self.subscriptions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or(Error::ListSubscriptionNotFound)
    }

    async fn issue(&self, session_id: &str) -> Result<Subscription> {
        let subscription = Subscription::new();
        self.subscriptions
            .write()
            .await
            .insert(session_id.to_string(), subscription.clone());
        Ok(subscription)
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        if let Some(subscription) = self.subscriptions.write().await.remove(session_id) {
            subscription.cancel();
        }
        Ok(())
    }
}

/// In-memory resource-modification subscription store.
///
/// `get` refreshes the entry's last-alive stamp: a subscription that is
/// being looked at is being serviced ("touch on read").
pub struct InMemoryResourceSubscriptionStore {
    subscriptions: RwLock<HashMap<String, HashMap<String, Subscription>>>,
    health_interval: Duration,
}

impl InMemoryResourceSubscriptionStore {
    pub fn new(health_interval: Duration) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            health_interval,
        }
    }
}

#[async_trait]
impl ResourceSubscriptionStore for InMemoryResourceSubscriptionStore {
    async fn get(&self, session_id: &str, uri: &Url) -> Result<Subscription> {
        let subscriptions = self.subscriptions.read().await;
        let subscription = subscriptions
            .get(session_id)
            .and_then(|per_session| per_session.get(uri.as_str()))
            .cloned()
            .ok_or(Error::ResourceSubscriptionNotFound)?;
        if subscription.is_cancelled() {
            return Err(Error::ResourceSubscriptionNotFound);
        }
        subscription.signal_alive();
        Ok(subscription)
    }

    async fn issue(&self, session_id: &str, uri: &Url) -> Result<Subscription> {
        let subscription = Subscription::new();
        self.subscriptions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .entry(uri.as_str().to_string())
            .or_insert_with(|| subscription.clone());
        Ok(subscription)
    }

    async fn delete(&self, session_id: &str, uri: &Url) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(per_session) = subscriptions.get_mut(session_id) {
            if let Some(subscription) = per_session.remove(uri.as_str()) {
                subscription.cancel();
            }
        }
        Ok(())
    }

    async fn unhealthy_uris_by_session(&self, session_id: &str) -> Result<Vec<Url>> {
        let subscriptions = self.subscriptions.read().await;
        let per_session = subscriptions
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let mut uris = Vec::new();
        for (uri, subscription) in per_session.iter() {
            if !subscription.is_healthy(self.health_interval) {
                if let Ok(parsed) = Url::parse(uri) {
                    uris.push(parsed);
                }
            }
        }
        Ok(uris)
    }

    async fn delete_by_session(&self, session_id: &str) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let per_session = subscriptions
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        for subscription in per_session.values() {
            subscription.cancel();
        }
        Ok(())
    }
}

/// Manages resource-modification subscriptions for the dispatcher.
#[derive(Clone)]
pub struct ResourceSubscriptionManager {
    store: Arc<dyn ResourceSubscriptionStore>,
    health_interval: Duration,
}

impl ResourceSubscriptionManager {
    pub fn new(store: Arc<dyn ResourceSubscriptionStore>, health_interval: Duration) -> Self {
        Self {
            store,
            health_interval,
        }
    }

    pub fn in_memory(health_interval: Duration) -> Self {
        Self::new(
            Arc::new(InMemoryResourceSubscriptionStore::new(health_interval)),
            health_interval,
        )
    }

    pub fn health_interval(&self) -> Duration {
        self.health_interval
    }

    /// Create-or-return: a second subscribe for the same (session, URI)
    /// yields the existing subscription.
    pub async fn subscribe(&self, session_id: &str, uri: &Url) -> Result<Subscription> {
        if let Ok(existing) = self.store.get(session_id, uri).await {
            return Ok(existing);
        }
        self.store.issue(session_id, uri).await
    }

    pub async fn unsubscribe(&self, session_id: &str, uri: &Url) -> Result<()> {
        self.store.delete(session_id, uri).await
    }

    pub async fn unhealthy_uris(&self, session_id: &str) -> Result<Vec<Url>> {
        self.store.unhealthy_uris_by_session(session_id).await
    }

    pub async fn delete_by_session(&self, session_id: &str) -> Result<()> {
        self.store.delete_by_session(session_id).await
    }
}

/// Manages resource-list-change subscriptions for the dispatcher.
#[derive(Clone)]
pub struct ListChangeSubscriptionManager {
    store: Arc<dyn ListChangeSubscriptionStore>,
    health_interval: Duration,
}

impl ListChangeSubscriptionManager {
    pub fn new(store: Arc<dyn ListChangeSubscriptionStore>, health_interval: Duration) -> Self {
        Self {
            store,
            health_interval,
        }
    }

    pub fn in_memory(health_interval: Duration) -> Self {
        Self::new(
            Arc::new(InMemoryListChangeSubscriptionStore::new()),
            health_interval,
        )
    }

    pub fn health_interval(&self) -> Duration {
        self.health_interval
    }

    pub async fn subscribe(&self, session_id: &str) -> Result<Subscription> {
        if let Ok(existing) = self.store.get(session_id).await {
            return Ok(existing);
        }
        self.store.issue(session_id).await
    }

    pub async fn unsubscribe(&self, session_id: &str) -> Result<()> {
        self.store.delete(session_id).await
    }

    /// True while the session's subscription was kept alive within the
    /// health window; errors when no subscription exists.
    pub async fn health(&self, session_id: &str) -> Result<bool> {
        let subscription = self.store.get(session_id).await?;
        Ok(subscription.is_healthy(self.health_interval))
    }
}
