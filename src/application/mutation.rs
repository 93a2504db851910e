//! Mutation coordinator.
//!
//! Each mutation runs `idle → optimistic → settling → confirmed | rolled_back`.
//! The optimistic write and the snapshot it replaces are taken in one atomic
//! store operation. Settling runs on its own task, so dropping the caller's
//! handle neither cancels the remote call nor skips the rollback.
//!
//! While any mutation on an identity is in flight the store holds the
//! identity: push invalidations for it are deferred and fetch results for it
//! are dropped. Fetches that began before the hold never write it. The last
//! mutation to settle invalidates it once, and refetches it when the entry is
//! gone or a fetch result was dropped in the meantime.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use tokio::sync::{oneshot, watch};
use tracing::{Instrument, debug, info_span, warn};

use super::error::SyncError;
use super::remote::{RemoteRequest, RemoteTransport, decode};
use crate::cache::lock::mutex_lock;
use crate::cache::{QueryClient, QueryIdentity, QueryKey, QueryMatcher};

const SOURCE: &str = "application::mutation";

const METRIC_MUTATION_TOTAL: &str = "hearth_mutation_total";
const METRIC_MUTATION_MS: &str = "hearth_mutation_ms";

/// A change to server data with a locally predicted effect on one cache entry.
pub trait Mutation: Send + Sync + 'static {
    /// Value cached under [`Mutation::key`].
    type Value: Clone + Send + Sync + 'static;
    /// Body of a successful server response.
    type Output: DeserializeOwned + Send + 'static;

    fn name(&self) -> &'static str;

    fn key(&self) -> QueryKey<Self::Value>;

    /// Local checks run before anything is written or sent.
    fn validate(&self) -> Result<(), SyncError> {
        Ok(())
    }

    fn request(&self) -> Result<RemoteRequest, SyncError>;

    /// Predicted value given what the cache holds right now.
    fn optimistic(&self, current: Option<&Self::Value>) -> Self::Value;

    /// Fold the confirmed server response into what the cache holds at
    /// settle time.
    fn confirm(&self, current: Option<&Self::Value>, output: &Self::Output) -> Self::Value;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Idle,
    Optimistic,
    Settling,
    Confirmed,
    RolledBack,
}

impl MutationState {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Confirmed | Self::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Optimistic => "optimistic",
            Self::Settling => "settling",
            Self::Confirmed => "confirmed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The rollback record of one in-flight mutation.
struct PendingMutation<V> {
    identity: QueryIdentity,
    /// Cached value at mutation start; `None` when the identity was uncached.
    snapshot: Option<V>,
    seq: u64,
}

struct CoordinatorInner {
    client: QueryClient,
    remote: Arc<dyn RemoteTransport>,
    timeout: Duration,
    sequence: AtomicU64,
    /// Sequence number of the most recently started mutation per identity.
    latest: Mutex<HashMap<QueryIdentity, u64>>,
}

#[derive(Clone)]
pub struct MutationCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl MutationCoordinator {
    pub fn new(client: QueryClient, remote: Arc<dyn RemoteTransport>) -> Self {
        let timeout = client.config().request_timeout();
        Self {
            inner: Arc::new(CoordinatorInner {
                client,
                remote,
                timeout,
                sequence: AtomicU64::new(0),
                latest: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn client(&self) -> &QueryClient {
        &self.inner.client
    }

    /// Run a mutation to completion.
    ///
    /// On failure the optimistic value has already been rolled back when the
    /// error is returned.
    pub async fn mutate<M: Mutation>(&self, mutation: M) -> Result<M::Output, SyncError> {
        self.start(mutation)?.settled().await
    }

    /// Validate, apply the optimistic value and start settling in the
    /// background.
    ///
    /// When this returns `Ok`, the optimistic value is already visible to
    /// every reader. Validation failures return before anything is written.
    pub fn start<M: Mutation>(&self, mutation: M) -> Result<MutationHandle<M::Output>, SyncError> {
        let name = mutation.name();
        let request = match mutation.validate().and_then(|()| mutation.request()) {
            Ok(request) => request,
            Err(err) => {
                counter!(METRIC_MUTATION_TOTAL, "mutation" => name, "outcome" => "invalid")
                    .increment(1);
                debug!(mutation = name, error = %err, "Mutation rejected before optimistic write");
                return Err(err);
            }
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| SyncError::network(format!("no async runtime to settle mutation: {err}")))?;

        let inner = &self.inner;
        let key = mutation.key();
        let identity = key.identity().clone();
        let seq = inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        mutex_lock(&inner.latest, SOURCE, "start")
            .insert(identity.clone(), seq);
        let store = inner.client.store();
        store.hold(&identity);
        let replaced = store.replace_with(&key, |current| mutation.optimistic(current));

        let pending = PendingMutation {
            identity: identity.clone(),
            snapshot: replaced.previous,
            seq,
        };
        debug!(
            mutation = name,
            identity = %identity,
            seq,
            state = %MutationState::Optimistic,
            "Optimistic value applied"
        );

        let (state_tx, state_rx) = watch::channel(MutationState::Optimistic);
        let (result_tx, result_rx) = oneshot::channel();
        let settle = Settle {
            inner: Arc::clone(&self.inner),
            key,
            pending: Some(pending),
            name,
        };
        let span = info_span!("mutation", mutation = name, identity = %identity, seq);
        let started = Instant::now();

        runtime.spawn(
            async move {
                let mut settle = settle;
                let timeout = settle.inner.timeout;
                state_tx.send_replace(MutationState::Settling);

                let outcome = match tokio::time::timeout(timeout, settle.inner.remote.send(request)).await {
                    Ok(Ok(body)) => decode::<M::Output>(body),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(SyncError::timeout(timeout)),
                };

                let state = match &outcome {
                    Ok(output) => {
                        settle.confirm(|current| mutation.confirm(current, output));
                        MutationState::Confirmed
                    }
                    Err(err) => {
                        settle.rollback(err.kind());
                        MutationState::RolledBack
                    }
                };
                state_tx.send_replace(state);

                counter!(METRIC_MUTATION_TOTAL, "mutation" => name, "outcome" => state.as_str())
                    .increment(1);
                histogram!(METRIC_MUTATION_MS, "mutation" => name)
                    .record(started.elapsed().as_secs_f64() * 1000.0);

                // The caller may have dropped its handle; the cache is already settled.
                let _ = result_tx.send(outcome);
            }
            .instrument(span),
        );

        Ok(MutationHandle {
            identity,
            state: state_rx,
            result: result_rx,
        })
    }
}

/// Caller's view of a started mutation. Dropping it does not cancel anything.
pub struct MutationHandle<O> {
    identity: QueryIdentity,
    state: watch::Receiver<MutationState>,
    result: oneshot::Receiver<Result<O, SyncError>>,
}

impl<O> MutationHandle<O> {
    pub fn identity(&self) -> &QueryIdentity {
        &self.identity
    }

    pub fn state(&self) -> MutationState {
        *self.state.borrow()
    }

    /// Wait until the mutation is confirmed or rolled back.
    pub async fn settled(self) -> Result<O, SyncError> {
        self.result.await.unwrap_or_else(|_| {
            Err(SyncError::network("mutation task ended before settling"))
        })
    }
}

/// Finishes one mutation exactly once. Dropping it unfinished rolls back.
struct Settle<V: Clone + Send + Sync + 'static> {
    inner: Arc<CoordinatorInner>,
    key: QueryKey<V>,
    pending: Option<PendingMutation<V>>,
    name: &'static str,
}

impl<V: Clone + Send + Sync + 'static> Settle<V> {
    fn confirm(&mut self, fold: impl FnOnce(Option<&V>) -> V) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        self.inner.client.store().replace_with(&self.key, fold);
        debug!(mutation = self.name, identity = %pending.identity, "Mutation confirmed");
        self.finish(pending);
    }

    fn rollback(&mut self, reason: &str) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let superseded = mutex_lock(&self.inner.latest, SOURCE, "rollback")
            .get(&pending.identity)
            .is_some_and(|latest| *latest > pending.seq);

        let store = self.inner.client.store();
        if superseded {
            debug!(
                mutation = self.name,
                identity = %pending.identity,
                reason,
                "Newer mutation started on identity; skipping snapshot restore"
            );
        } else {
            match pending.snapshot.clone() {
                Some(snapshot) => store.write(&self.key, snapshot),
                None => {
                    store.remove(&pending.identity);
                }
            }
            debug!(mutation = self.name, identity = %pending.identity, reason, "Mutation rolled back");
        }
        self.finish(pending);
    }

    fn finish(&self, pending: PendingMutation<V>) {
        let store = self.inner.client.store();
        let remaining = {
            let mut latest = mutex_lock(&self.inner.latest, SOURCE, "finish");
            let remaining = store.release(&pending.identity);
            if remaining == 0 {
                latest.remove(&pending.identity);
            }
            remaining
        };
        let client = &self.inner.client;
        if remaining == 0 {
            client.invalidate_settled(&pending.identity);
        } else {
            // Deferred; the last mutation to settle marks it stale.
            client.invalidate(QueryMatcher::Exact(pending.identity));
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Drop for Settle<V> {
    fn drop(&mut self) {
        if self.pending.is_some() {
            warn!(mutation = self.name, "Mutation interrupted before settling; rolling back");
            self.rollback("interrupted");
        }
    }
}
