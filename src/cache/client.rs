//! `QueryClient`: the cache context owned by the application root.
//!
//! Cloning a client is cheap and every clone shares the same store. Tests
//! construct as many isolated clients as they need.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::CacheConfig;
use super::inflight::RequestMultiplexer;
use super::keys::{QueryIdentity, QueryKey, QueryMatcher};
use super::lock::mutex_lock;
use super::store::{CacheEntry, CacheStore};
use crate::application::error::SyncError;

const SOURCE: &str = "cache::client";

const METRIC_HIT: &str = "hearth_cache_hit_total";
const METRIC_MISS: &str = "hearth_cache_miss_total";

/// Re-runs the fetch behind an identity. Invoked when the identity turns stale.
pub type Refetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<(), SyncError>> + Send + Sync>;

type Fetch<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, SyncError>> + Send + Sync>;

struct ClientInner {
    config: CacheConfig,
    store: Arc<CacheStore>,
    multiplexer: RequestMultiplexer,
    refetchers: Mutex<HashMap<QueryIdentity, Vec<(u64, Refetcher)>>>,
    next_registration: AtomicU64,
    serial: Mutex<HashMap<QueryIdentity, Arc<AsyncMutex<()>>>>,
}

#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

/// Non-owning handle, held by background tasks and refetch closures.
#[derive(Clone)]
pub struct WeakQueryClient {
    inner: Weak<ClientInner>,
}

impl WeakQueryClient {
    pub fn upgrade(&self) -> Option<QueryClient> {
        self.inner.upgrade().map(|inner| QueryClient { inner })
    }
}

impl QueryClient {
    pub fn new(config: CacheConfig) -> Self {
        let store = Arc::new(CacheStore::new(config.stale_time()));
        let multiplexer = RequestMultiplexer::new(Arc::clone(&store), config.request_timeout());
        Self {
            inner: Arc::new(ClientInner {
                config,
                store,
                multiplexer,
                refetchers: Mutex::new(HashMap::new()),
                next_registration: AtomicU64::new(0),
                serial: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn multiplexer(&self) -> &RequestMultiplexer {
        &self.inner.multiplexer
    }

    pub fn downgrade(&self) -> WeakQueryClient {
        WeakQueryClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn read<T: Clone + 'static>(&self, key: &QueryKey<T>) -> Option<CacheEntry<T>> {
        self.inner.store.read(key)
    }

    /// Write a value directly, as if it had just been fetched.
    pub fn set_query_data<T: Send + Sync + 'static>(&self, key: &QueryKey<T>, value: T) {
        self.inner.store.write(key, value);
    }

    /// Serve the cached value while it is fresh, otherwise fetch through the
    /// multiplexer.
    pub async fn fetch_query<T, F, Fut>(&self, key: &QueryKey<T>, fetcher: F) -> Result<T, SyncError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        if let Some(entry) = self.inner.store.read(key).filter(CacheEntry::is_fresh) {
            counter!(METRIC_HIT).increment(1);
            return Ok(entry.value);
        }
        counter!(METRIC_MISS).increment(1);
        self.fetch_fresh(key, fetcher).await
    }

    /// Always go to the network, joining an outstanding fetch if there is one.
    pub async fn fetch_fresh<T, F, Fut>(&self, key: &QueryKey<T>, fetcher: F) -> Result<T, SyncError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        self.inner.multiplexer.request(key, fetcher).await
    }

    /// Watch `key` and refetch it through `fetcher` whenever it turns stale.
    ///
    /// Dropping the observer stops notifications and unregisters the
    /// refetcher. Fetches already running are not cancelled.
    pub fn observe<T, F, Fut>(&self, key: QueryKey<T>, fetcher: F) -> QueryObserver<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let fetch: Fetch<T> = Arc::new(move || fetcher().boxed());
        let shared = Arc::clone(&fetch);
        let refetcher = self.refetcher_for(key.clone(), move || shared());
        let registration = self.register_refetcher(key.identity().clone(), refetcher);
        QueryObserver {
            client: self.clone(),
            changes: self.inner.store.subscribe(key.identity()),
            key,
            fetch,
            _registration: registration,
        }
    }

    /// Build a refetcher that fetches `key` through the multiplexer.
    pub fn refetcher_for<T, F, Fut>(&self, key: QueryKey<T>, fetcher: F) -> Refetcher
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let client = self.downgrade();
        let fetcher = Arc::new(fetcher);
        Arc::new(move || {
            let client = client.clone();
            let key = key.clone();
            let fetcher = Arc::clone(&fetcher);
            async move {
                let Some(client) = client.upgrade() else {
                    return Ok(());
                };
                client
                    .fetch_fresh(&key, move || fetcher())
                    .await
                    .map(|_| ())
            }
            .boxed()
        })
    }

    /// Register how to refetch `identity` after invalidation. The first live
    /// registration for an identity is the one used.
    pub fn register_refetcher(&self, identity: QueryIdentity, refetcher: Refetcher) -> RefetchRegistration {
        let id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        mutex_lock(&self.inner.refetchers, SOURCE, "register_refetcher")
            .entry(identity.clone())
            .or_default()
            .push((id, refetcher));
        RefetchRegistration {
            client: self.downgrade(),
            identity,
            id,
        }
    }

    fn unregister_refetcher(&self, identity: &QueryIdentity, id: u64) {
        let mut refetchers = mutex_lock(&self.inner.refetchers, SOURCE, "unregister_refetcher");
        if let Some(list) = refetchers.get_mut(identity) {
            list.retain(|(registered, _)| *registered != id);
            if list.is_empty() {
                refetchers.remove(identity);
            }
        }
    }

    pub fn has_refetcher(&self, identity: &QueryIdentity) -> bool {
        mutex_lock(&self.inner.refetchers, SOURCE, "has_refetcher").contains_key(identity)
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Mark matching entries stale and start one background refetch for each
    /// entry that flipped and has a registered refetcher.
    ///
    /// Returns the identities that flipped.
    pub fn invalidate(&self, matcher: impl Into<QueryMatcher>) -> Vec<QueryIdentity> {
        let matcher = matcher.into();
        let flipped = self.inner.store.invalidate(&matcher);
        if !flipped.is_empty() {
            debug!(?matcher, count = flipped.len(), "Invalidated cache entries");
            self.refetch_all(&flipped);
        }
        flipped
    }

    /// Invalidate an identity whose last in-flight mutation just settled.
    ///
    /// The identity is refetched even when nothing flipped if its entry is
    /// absent or already stale, or if a fetched value was dropped while the
    /// mutation held it.
    pub fn invalidate_settled(&self, identity: &QueryIdentity) -> Vec<QueryIdentity> {
        let flipped = self.invalidate(QueryMatcher::Exact(identity.clone()));
        let dropped = self.inner.store.take_dropped(identity);
        if flipped.is_empty() {
            let fresh = self.inner.store.is_stale(identity) == Some(false);
            if dropped || !fresh {
                debug!(identity = %identity, dropped, "Refetching settled identity");
                self.refetch_all(std::slice::from_ref(identity));
            }
        }
        flipped
    }

    fn refetch_all(&self, identities: &[QueryIdentity]) {
        let jobs: Vec<(QueryIdentity, Refetcher)> = {
            let refetchers = mutex_lock(&self.inner.refetchers, SOURCE, "refetch_all");
            identities
                .iter()
                .filter_map(|identity| {
                    refetchers
                        .get(identity)
                        .and_then(|list| list.first())
                        .map(|(_, refetcher)| (identity.clone(), Arc::clone(refetcher)))
                })
                .collect()
        };
        if jobs.is_empty() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(count = jobs.len(), "No runtime available; skipping background refetch");
            return;
        };
        for (identity, refetcher) in jobs {
            handle.spawn(async move {
                if let Err(err) = refetcher().await {
                    warn!(identity = %identity, error = %err, kind = err.kind(), "Background refetch failed");
                }
            });
        }
    }

    // ========================================================================
    // Serialization gates
    // ========================================================================

    /// Exclusive async gate per identity. Used to serialize operations whose
    /// input depends on the outcome of the previous one, such as loading the
    /// next page.
    pub async fn acquire_serial(&self, identity: &QueryIdentity) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = mutex_lock(&self.inner.serial, SOURCE, "acquire_serial");
            Arc::clone(
                gates
                    .entry(identity.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        gate.lock_owned().await
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    pub fn collect_garbage(&self) -> Vec<QueryIdentity> {
        self.collect_garbage_at(OffsetDateTime::now_utc())
    }

    pub fn collect_garbage_at(&self, now: OffsetDateTime) -> Vec<QueryIdentity> {
        let evicted = self
            .inner
            .store
            .collect_garbage(now, self.inner.config.gc_horizon());
        mutex_lock(&self.inner.serial, SOURCE, "gc.serial")
            .retain(|_, gate| Arc::strong_count(gate) > 1);
        evicted
    }

    /// Sweep unobserved entries every `gc_interval` until the client is dropped.
    pub fn spawn_gc(&self) -> JoinHandle<()> {
        let client = self.downgrade();
        let period = self.inner.config.gc_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                let evicted = client.collect_garbage();
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "Cache sweep evicted entries");
                }
            }
        })
    }
}

/// Keeps a refetcher registered until dropped.
pub struct RefetchRegistration {
    client: WeakQueryClient,
    identity: QueryIdentity,
    id: u64,
}

impl Drop for RefetchRegistration {
    fn drop(&mut self) {
        if let Some(client) = self.client.upgrade() {
            client.unregister_refetcher(&self.identity, self.id);
        }
    }
}

/// A consumer's view of one identity.
pub struct QueryObserver<T> {
    client: QueryClient,
    key: QueryKey<T>,
    changes: watch::Receiver<u64>,
    fetch: Fetch<T>,
    _registration: RefetchRegistration,
}

impl<T: Clone + Send + Sync + 'static> QueryObserver<T> {
    pub fn key(&self) -> &QueryKey<T> {
        &self.key
    }

    pub fn current(&self) -> Option<CacheEntry<T>> {
        self.client.read(&self.key)
    }

    /// Current value, fetching first when absent or no longer fresh.
    ///
    /// A fetched value is returned as the server sent it, even when the
    /// store declined it because a mutation held the identity.
    pub async fn load(&self) -> Result<T, SyncError> {
        if let Some(entry) = self.current().filter(CacheEntry::is_fresh) {
            return Ok(entry.value);
        }
        let fetch = Arc::clone(&self.fetch);
        self.client.fetch_fresh(&self.key, move || fetch()).await
    }

    /// Whether the entry changed since the last `changed` call.
    pub fn has_changed(&self) -> bool {
        self.changes.has_changed().unwrap_or(false)
    }

    /// Wait for the next write, invalidation or removal and return the entry
    /// as it is afterwards.
    pub async fn changed(&mut self) -> Option<CacheEntry<T>> {
        if self.changes.changed().await.is_err() {
            return None;
        }
        self.changes.borrow_and_update();
        self.current()
    }
}
