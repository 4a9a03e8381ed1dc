//! Namespaced TTL cache
//!
//! One [`TtlCache`] per semantic namespace, each with its own default TTL.
//! Expired entries are evicted lazily on read and by a periodic sweep.
//! State is process-local and lost on restart.

use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Cache abstraction, so a shared store can replace the in-process map
#[async_trait]
pub trait CacheLayer<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Cached value, or `None` when missing or expired
    async fn get(&self, key: &str) -> Option<V>;

    /// Store a value; `ttl` of `None` uses the namespace default
    async fn set(&self, key: &str, value: V, ttl: Option<Duration>);

    /// Remove an entry. Returns whether one was present.
    async fn invalidate(&self, key: &str) -> bool;

    /// Evict every expired entry. Returns how many were removed.
    async fn sweep(&self) -> usize;
}

struct CacheEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// In-memory TTL map backed by [`DashMap`]
pub struct TtlCache<V> {
    namespace: String,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, CacheEntry<V>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(namespace: impl Into<String>, default_ttl: Duration) -> Self {
        Self::with_clock(namespace, default_ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(
        namespace: impl Into<String>,
        default_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            default_ttl,
            clock,
            entries: DashMap::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Entries held, expired ones included until evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(key) {
            if now < entry.expires_at {
                return Some(entry.value.clone());
            }
            drop(entry);
            // Recheck under the write lock; a fresh value may have landed
            self.entries.remove_if(key, |_, e| now >= e.expires_at);
        }
        None
    }

    fn store(&self, key: &str, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries
            .insert(key.to_string(), CacheEntry { value, expires_at });
    }

    fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(namespace = %self.namespace, removed, "Swept expired cache entries");
        }
        removed
    }
}

#[async_trait]
impl<V> CacheLayer<V> for TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        self.lookup(key)
    }

    async fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        self.store(key, value, ttl);
    }

    async fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    async fn sweep(&self) -> usize {
        self.evict_expired()
    }
}

/// Sweep `cache` every `interval` until the returned task is aborted
pub fn spawn_sweeper<V>(cache: Arc<dyn CacheLayer<V>>, interval: Duration) -> JoinHandle<()>
where
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            cache.sweep().await;
        }
    })
}
