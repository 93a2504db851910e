//! Cache Store: the keyed map from query identity to cached value.
//!
//! One process-wide instance lives inside the [`QueryClient`] context. Values
//! are stored type-erased and recovered through the `QueryKey<T>` they were
//! written with. Consumers always receive clones.
//!
//! [`QueryClient`]: super::client::QueryClient

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::keys::{QueryIdentity, QueryKey, QueryMatcher};
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::store";

const METRIC_STALE_MARKED: &str = "hearth_cache_stale_marked_total";
const METRIC_EVICT: &str = "hearth_cache_evict_total";

/// A cached value plus freshness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub written_at: OffsetDateTime,
    pub stale_after: OffsetDateTime,
    pub is_stale: bool,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(OffsetDateTime::now_utc())
    }

    pub fn is_fresh_at(&self, now: OffsetDateTime) -> bool {
        !self.is_stale && now < self.stale_after
    }
}

/// Result of an atomic read-modify-write.
#[derive(Debug, Clone)]
pub struct Replaced<T> {
    /// Value present before the write, if any.
    pub previous: Option<T>,
    pub current: T,
}

/// Counters describing store activity since construction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub writes: u64,
    /// Entries that flipped from fresh to stale.
    pub stale_marks: u64,
    /// Invalidations postponed because a mutation held the identity.
    pub deferred_invalidations: u64,
    pub removals: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    writes: AtomicU64,
    stale_marks: AtomicU64,
    deferred_invalidations: AtomicU64,
    removals: AtomicU64,
    evictions: AtomicU64,
}

struct Slot {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    written_at: OffsetDateTime,
    stale_after: OffsetDateTime,
    is_stale: bool,
}

impl Slot {
    fn new<T: Send + Sync + 'static>(value: T, written_at: OffsetDateTime, stale_time: Duration) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
            written_at,
            stale_after: written_at + stale_time,
            is_stale: false,
        }
    }

    fn downcast<T: Clone + 'static>(&self, identity: &QueryIdentity) -> Option<T> {
        let value = self.value.downcast_ref::<T>().cloned();
        if value.is_none() {
            warn!(
                identity = %identity,
                stored = self.type_name,
                requested = std::any::type_name::<T>(),
                "Cached value type does not match query key"
            );
        }
        value
    }

    fn entry<T: Clone + 'static>(&self, identity: &QueryIdentity) -> Option<CacheEntry<T>> {
        self.downcast::<T>(identity).map(|value| CacheEntry {
            value,
            written_at: self.written_at,
            stale_after: self.stale_after,
            is_stale: self.is_stale,
        })
    }
}

/// Mutation bookkeeping per identity.
#[derive(Default)]
struct HoldTable {
    counts: HashMap<QueryIdentity, usize>,
    /// Fetch epoch at which each identity was last held. Kept after release.
    last_hold: HashMap<QueryIdentity, u64>,
    /// Identities whose fetched value was dropped while held.
    dropped: HashSet<QueryIdentity>,
}

impl HoldTable {
    fn count(&self, identity: &QueryIdentity) -> usize {
        self.counts.get(identity).copied().unwrap_or(0)
    }
}

/// Keyed cache of server-owned records.
///
/// Lock order when more than one lock is needed: `entries`, then `holds`.
pub struct CacheStore {
    stale_time: Duration,
    entries: RwLock<HashMap<QueryIdentity, Slot>>,
    watchers: RwLock<HashMap<QueryIdentity, watch::Sender<u64>>>,
    holds: Mutex<HoldTable>,
    epoch: AtomicU64,
    version: AtomicU64,
    counters: Counters,
}

impl CacheStore {
    pub fn new(stale_time: Duration) -> Self {
        Self {
            stale_time,
            entries: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
            holds: Mutex::new(HoldTable::default()),
            epoch: AtomicU64::new(0),
            version: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Copy of the entry stored under `key`, if any.
    pub fn read<T: Clone + 'static>(&self, key: &QueryKey<T>) -> Option<CacheEntry<T>> {
        rw_read(&self.entries, SOURCE, "read")
            .get(key.identity())
            .and_then(|slot| slot.entry(key.identity()))
    }

    /// Stale flag of an entry without touching its value.
    pub fn is_stale(&self, identity: &QueryIdentity) -> Option<bool> {
        rw_read(&self.entries, SOURCE, "is_stale")
            .get(identity)
            .map(|slot| slot.is_stale)
    }

    pub fn contains(&self, identity: &QueryIdentity) -> bool {
        rw_read(&self.entries, SOURCE, "contains").contains_key(identity)
    }

    pub fn identities(&self) -> Vec<QueryIdentity> {
        rw_read(&self.entries, SOURCE, "identities")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Replace the entry under `key` with a fresh value and notify observers.
    pub fn write<T: Send + Sync + 'static>(&self, key: &QueryKey<T>, value: T) {
        let slot = Slot::new(value, OffsetDateTime::now_utc(), self.stale_time);
        rw_write(&self.entries, SOURCE, "write").insert(key.identity().clone(), slot);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.notify(key.identity());
    }

    /// Write a value obtained by a fetch that began at `started` (see
    /// [`CacheStore::fetch_epoch`]).
    ///
    /// The value is dropped while a mutation holds the identity, and also
    /// when the fetch began before the identity was last held: its response
    /// may predate the mutation's effect on the server. Drops during a hold
    /// are remembered until [`CacheStore::take_dropped`].
    ///
    /// Returns whether the value was written.
    pub fn write_fetched<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey<T>,
        value: T,
        started: u64,
    ) -> bool {
        let identity = key.identity();
        {
            let mut entries = rw_write(&self.entries, SOURCE, "write_fetched");
            let mut holds = mutex_lock(&self.holds, SOURCE, "write_fetched.holds");
            if holds.count(identity) > 0 {
                holds.dropped.insert(identity.clone());
                debug!(identity = %identity, "Fetched value dropped: identity held by mutation");
                return false;
            }
            if holds.last_hold.get(identity).is_some_and(|held| *held > started) {
                debug!(
                    identity = %identity,
                    started,
                    "Fetched value dropped: fetch began before the latest mutation"
                );
                return false;
            }
            let slot = Slot::new(value, OffsetDateTime::now_utc(), self.stale_time);
            entries.insert(identity.clone(), slot);
        }
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.notify(identity);
        true
    }

    /// Atomically compute and store a new value from the current one.
    ///
    /// No reader can observe a state between the read and the write.
    pub fn replace_with<T, F>(&self, key: &QueryKey<T>, f: F) -> Replaced<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Option<&T>) -> T,
    {
        let replaced = {
            let mut entries = rw_write(&self.entries, SOURCE, "replace_with");
            let previous = entries
                .get(key.identity())
                .and_then(|slot| slot.downcast::<T>(key.identity()));
            let current = f(previous.as_ref());
            let slot = Slot::new(current.clone(), OffsetDateTime::now_utc(), self.stale_time);
            entries.insert(key.identity().clone(), slot);
            Replaced { previous, current }
        };
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.notify(key.identity());
        replaced
    }

    /// Flag every matching entry stale without dropping its value.
    ///
    /// Entries held by an in-flight mutation are skipped; the mutation
    /// invalidates them itself once it settles. Returns the identities that
    /// flipped from fresh to stale, so repeated calls return nothing new.
    pub fn invalidate(&self, matcher: &QueryMatcher) -> Vec<QueryIdentity> {
        let mut flipped = Vec::new();
        let mut deferred = 0_u64;
        {
            let mut entries = rw_write(&self.entries, SOURCE, "invalidate");
            let holds = mutex_lock(&self.holds, SOURCE, "invalidate.holds");
            for (identity, slot) in entries.iter_mut() {
                if !matcher.matches(identity) {
                    continue;
                }
                if holds.count(identity) > 0 {
                    deferred += 1;
                    continue;
                }
                if !slot.is_stale {
                    slot.is_stale = true;
                    flipped.push(identity.clone());
                }
            }
        }

        if deferred > 0 {
            self.counters
                .deferred_invalidations
                .fetch_add(deferred, Ordering::Relaxed);
            debug!(?matcher, deferred, "Invalidation deferred for held identities");
        }
        if !flipped.is_empty() {
            self.counters
                .stale_marks
                .fetch_add(flipped.len() as u64, Ordering::Relaxed);
            counter!(METRIC_STALE_MARKED).increment(flipped.len() as u64);
            for identity in &flipped {
                self.notify(identity);
            }
        }
        flipped
    }

    /// Delete an entry entirely. Returns whether one existed.
    pub fn remove(&self, identity: &QueryIdentity) -> bool {
        let removed = rw_write(&self.entries, SOURCE, "remove")
            .remove(identity)
            .is_some();
        if removed {
            self.counters.removals.fetch_add(1, Ordering::Relaxed);
            self.notify(identity);
        }
        removed
    }

    // ========================================================================
    // Mutation holds
    // ========================================================================

    /// Mark an identity as the target of one more in-flight mutation.
    ///
    /// Fetches that began before this call can no longer write the identity.
    pub fn hold(&self, identity: &QueryIdentity) -> usize {
        let mut holds = mutex_lock(&self.holds, SOURCE, "hold");
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        holds.last_hold.insert(identity.clone(), epoch);
        let count = holds.counts.entry(identity.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Release one hold. Returns the number of holds still outstanding.
    pub fn release(&self, identity: &QueryIdentity) -> usize {
        let mut holds = mutex_lock(&self.holds, SOURCE, "release");
        let remaining = match holds.counts.get_mut(identity) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            holds.counts.remove(identity);
        }
        remaining
    }

    pub fn hold_count(&self, identity: &QueryIdentity) -> usize {
        mutex_lock(&self.holds, SOURCE, "hold_count").count(identity)
    }

    /// Epoch to record when a fetch begins; pass it to `write_fetched`.
    pub fn fetch_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether a fetch that began at `started` may still write `identity`.
    pub fn fetch_is_current(&self, identity: &QueryIdentity, started: u64) -> bool {
        mutex_lock(&self.holds, SOURCE, "fetch_is_current")
            .last_hold
            .get(identity)
            .is_none_or(|held| *held <= started)
    }

    /// Whether a fetched value was dropped while the identity was held,
    /// clearing the mark.
    pub fn take_dropped(&self, identity: &QueryIdentity) -> bool {
        mutex_lock(&self.holds, SOURCE, "take_dropped")
            .dropped
            .remove(identity)
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Receiver bumped synchronously after every write, invalidation or
    /// removal of `identity`.
    pub fn subscribe(&self, identity: &QueryIdentity) -> watch::Receiver<u64> {
        let mut watchers = rw_write(&self.watchers, SOURCE, "subscribe");
        watchers
            .entry(identity.clone())
            .or_insert_with(|| watch::channel(self.version.load(Ordering::Relaxed)).0)
            .subscribe()
    }

    pub fn observer_count(&self, identity: &QueryIdentity) -> usize {
        rw_read(&self.watchers, SOURCE, "observer_count")
            .get(identity)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn notify(&self, identity: &QueryIdentity) {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(sender) = rw_read(&self.watchers, SOURCE, "notify").get(identity) {
            sender.send_replace(version);
        }
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    /// Evict entries that nobody observes or mutates and that were last
    /// written at least `horizon` before `now`.
    pub fn collect_garbage(&self, now: OffsetDateTime, horizon: Duration) -> Vec<QueryIdentity> {
        let observed: HashSet<QueryIdentity> = {
            let mut watchers = rw_write(&self.watchers, SOURCE, "gc.watchers");
            watchers.retain(|_, sender| sender.receiver_count() > 0);
            watchers.keys().cloned().collect()
        };

        let mut evicted = Vec::new();
        {
            let mut entries = rw_write(&self.entries, SOURCE, "gc.entries");
            let mut holds = mutex_lock(&self.holds, SOURCE, "gc.holds");
            entries.retain(|identity, slot| {
                let expired = now - slot.written_at >= horizon;
                let keep =
                    !expired || observed.contains(identity) || holds.counts.contains_key(identity);
                if !keep {
                    evicted.push(identity.clone());
                }
                keep
            });
            let HoldTable {
                counts, last_hold, ..
            } = &mut *holds;
            last_hold.retain(|identity, _| entries.contains_key(identity) || counts.contains_key(identity));
        }

        if !evicted.is_empty() {
            self.counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            counter!(METRIC_EVICT).increment(evicted.len() as u64);
            debug!(count = evicted.len(), "Evicted unobserved cache entries");
        }
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            writes: self.counters.writes.load(Ordering::Relaxed),
            stale_marks: self.counters.stale_marks.load(Ordering::Relaxed),
            deferred_invalidations: self.counters.deferred_invalidations.load(Ordering::Relaxed),
            removals: self.counters.removals.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}
