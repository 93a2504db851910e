//! In-flight request multiplexer.
//!
//! Concurrent fetches for equal identities share one network round trip. The
//! fetch itself runs on its own task so that dropping any waiter, including
//! the one that started it, never cancels the request for the others.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use tokio::sync::oneshot;
use tracing::{Instrument, debug, debug_span, warn};

use super::keys::{QueryIdentity, QueryKey};
use super::lock::mutex_lock;
use super::store::CacheStore;
use crate::application::error::SyncError;

const SOURCE: &str = "cache::inflight";

const METRIC_DEDUPLICATED: &str = "hearth_fetch_deduplicated_total";

type Erased = Arc<dyn Any + Send + Sync>;
type SharedFetch = Shared<BoxFuture<'static, Result<Erased, SyncError>>>;

struct Pending {
    generation: u64,
    /// Store fetch epoch when the request began.
    started: u64,
    fetch: SharedFetch,
}

type PendingMap = Arc<Mutex<HashMap<QueryIdentity, Pending>>>;

pub struct RequestMultiplexer {
    store: Arc<CacheStore>,
    timeout: Duration,
    pending: PendingMap,
    generation: AtomicU64,
    deduplicated: AtomicU64,
}

impl RequestMultiplexer {
    pub fn new(store: Arc<CacheStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
        }
    }

    /// Fetch the value for `key`, joining an outstanding request for an equal
    /// identity instead of invoking `fetcher` again.
    ///
    /// A request that began before a mutation last held the identity is not
    /// joined; a new one replaces it in the pending table. A successful result
    /// is offered to the cache store before any waiter observes it. Every
    /// waiter receives the same value or the same error.
    /// `fetcher` is called while the pending table is locked and must only
    /// build its future.
    pub async fn request<T, F, Fut>(&self, key: &QueryKey<T>, fetcher: F) -> Result<T, SyncError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let fetch = {
            let mut pending = mutex_lock(&self.pending, SOURCE, "request");
            let joinable = pending
                .get(key.identity())
                .filter(|existing| self.store.fetch_is_current(key.identity(), existing.started));
            match joinable {
                Some(existing) => {
                    self.deduplicated.fetch_add(1, Ordering::Relaxed);
                    counter!(METRIC_DEDUPLICATED).increment(1);
                    debug!(identity = %key.identity(), "Joined in-flight fetch");
                    existing.fetch.clone()
                }
                None => {
                    if pending.contains_key(key.identity()) {
                        debug!(
                            identity = %key.identity(),
                            "In-flight fetch predates a mutation; starting a new one"
                        );
                    }
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let started = self.store.fetch_epoch();
                    let fetch = self.spawn_fetch(key.clone(), generation, started, fetcher());
                    pending.insert(
                        key.identity().clone(),
                        Pending {
                            generation,
                            started,
                            fetch: fetch.clone(),
                        },
                    );
                    fetch
                }
            }
        };

        let value = fetch.await?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| SyncError::type_mismatch(key.identity().to_string()))
    }

    fn spawn_fetch<T, Fut>(
        &self,
        key: QueryKey<T>,
        generation: u64,
        started: u64,
        fut: Fut,
    ) -> SharedFetch
    where
        T: Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let store = Arc::clone(&self.store);
        let pending = Arc::clone(&self.pending);
        let timeout = self.timeout;
        let span = debug_span!("fetch", identity = %key.identity(), generation);

        tokio::spawn(
            async move {
                let outcome = match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(value)) => {
                        store.write_fetched(&key, value.clone(), started);
                        Ok(Arc::new(value) as Erased)
                    }
                    Ok(Err(err)) => {
                        debug!(error = %err, kind = err.kind(), "Fetch failed");
                        Err(err)
                    }
                    Err(_) => {
                        warn!(timeout_ms = timeout.as_millis() as u64, "Fetch timed out");
                        Err(SyncError::timeout(timeout))
                    }
                };

                {
                    let mut pending = mutex_lock(&pending, SOURCE, "complete");
                    let own = pending
                        .get(key.identity())
                        .is_some_and(|entry| entry.generation == generation);
                    if own {
                        pending.remove(key.identity());
                    }
                }

                // Every waiter may already be gone; the store has already seen the value.
                let _ = tx.send(outcome);
            }
            .instrument(span),
        );

        async move {
            rx.await
                .unwrap_or_else(|_| Err(SyncError::network("fetch task ended without a result")))
        }
        .boxed()
        .shared()
    }

    pub fn is_in_flight(&self, identity: &QueryIdentity) -> bool {
        mutex_lock(&self.pending, SOURCE, "is_in_flight").contains_key(identity)
    }

    pub fn in_flight(&self) -> usize {
        mutex_lock(&self.pending, SOURCE, "in_flight").len()
    }

    /// Number of callers that joined an existing fetch.
    pub fn deduplicated(&self) -> u64 {
        self.deduplicated.load(Ordering::Relaxed)
    }
}
