//! Change-feed subscriber.
//!
//! Consumers bind query identities to a `(table, filter)` pair. Bindings for
//! the same pair share one transport channel, driven by a task that walks
//! `connecting → open → closed`. Every event on a channel invalidates every
//! identity bound to it; the payload is not inspected.
//!
//! A channel whose transport ends without a local close is reopened with
//! exponential backoff. Events may have been missed meanwhile, so all bound
//! identities are invalidated once the channel is open again.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hearth_api_types::ChangeEvent;
use metrics::counter;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};

use super::transport::{ChannelSpec, FeedTransport};
use crate::application::error::SyncError;
use crate::cache::lock::mutex_lock;
use crate::cache::{QueryClient, QueryIdentity};
use crate::config::RealtimeSettings;

const SOURCE: &str = "realtime::subscriber";

const METRIC_FEED_EVENT_TOTAL: &str = "hearth_feed_event_total";

// ============================================================================
// Reconnect policy
// ============================================================================

/// Exponential backoff between reopen attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: Duration::from_millis(250),
        }
    }
}

impl From<&RealtimeSettings> for ReconnectPolicy {
    fn from(settings: &RealtimeSettings) -> Self {
        Self {
            initial: settings.reconnect_initial,
            max: settings.reconnect_max,
            multiplier: settings.reconnect_multiplier,
            jitter: settings.jitter,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + jitter(self.jitter)
    }
}

fn jitter(bound: Duration) -> Duration {
    let bound_nanos = bound.as_nanos() as u64;
    if bound_nanos == 0 {
        return Duration::ZERO;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .subsec_nanos() as u64;
    Duration::from_nanos(nanos % bound_nanos)
}

// ============================================================================
// Channels
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transport channel and the bindings sharing it.
struct SharedChannel {
    spec: ChannelSpec,
    bindings: Mutex<HashMap<u64, Vec<QueryIdentity>>>,
    state: watch::Sender<ChannelState>,
    shutdown: watch::Sender<bool>,
}

impl SharedChannel {
    fn bound_identities(&self) -> Vec<QueryIdentity> {
        let bindings = mutex_lock(&self.bindings, SOURCE, "bound_identities");
        let mut seen = HashSet::new();
        bindings
            .values()
            .flatten()
            .filter(|identity| seen.insert((*identity).clone()))
            .cloned()
            .collect()
    }
}

struct SubscriberInner {
    client: QueryClient,
    transport: Arc<dyn FeedTransport>,
    policy: ReconnectPolicy,
    channels: Mutex<HashMap<ChannelSpec, Arc<SharedChannel>>>,
    next_binding: AtomicU64,
}

/// Binds query identities to change-feed channels.
#[derive(Clone)]
pub struct ChangeFeedSubscriber {
    inner: Arc<SubscriberInner>,
}

impl ChangeFeedSubscriber {
    pub fn new(client: QueryClient, transport: Arc<dyn FeedTransport>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(SubscriberInner {
                client,
                transport,
                policy,
                channels: Mutex::new(HashMap::new()),
                next_binding: AtomicU64::new(0),
            }),
        }
    }

    /// Invalidate `identities` on every change event for `spec`.
    ///
    /// Returns immediately; the channel opens in the background. A blank
    /// filter or an empty identity list yields an inert handle that opens
    /// nothing.
    pub fn subscribe(
        &self,
        spec: ChannelSpec,
        identities: Vec<QueryIdentity>,
    ) -> Result<SubscriptionHandle, SyncError> {
        if spec.has_blank_filter() || identities.is_empty() {
            debug!(channel = %spec, "Nothing to subscribe to; handle is inert");
            return Ok(SubscriptionHandle::inert(spec));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| SyncError::feed(format!("no async runtime for change feed: {err}")))?;

        let inner = &self.inner;
        let id = inner.next_binding.fetch_add(1, Ordering::Relaxed);
        let channel = {
            let mut channels = mutex_lock(&inner.channels, SOURCE, "subscribe");
            let channel = match channels.get(&spec) {
                Some(channel) => Arc::clone(channel),
                None => {
                    let channel = Arc::new(SharedChannel {
                        spec: spec.clone(),
                        bindings: Mutex::new(HashMap::new()),
                        state: watch::channel(ChannelState::Connecting).0,
                        shutdown: watch::channel(false).0,
                    });
                    channels.insert(spec.clone(), Arc::clone(&channel));
                    let span = info_span!("feed_channel", channel = %spec);
                    runtime.spawn(
                        drive_channel(
                            Arc::clone(&channel),
                            Arc::clone(&inner.transport),
                            inner.client.clone(),
                            inner.policy,
                        )
                        .instrument(span),
                    );
                    channel
                }
            };
            mutex_lock(&channel.bindings, SOURCE, "subscribe.bind").insert(id, identities);
            channel
        };

        debug!(channel = %spec, binding = id, "Subscribed");
        Ok(SubscriptionHandle {
            spec,
            binding: Some(Binding {
                subscriber: Arc::downgrade(&self.inner),
                state: channel.state.subscribe(),
                channel,
                id,
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Distinct channels currently shared by live handles.
    pub fn channel_count(&self) -> usize {
        mutex_lock(&self.inner.channels, SOURCE, "channel_count").len()
    }

    pub fn channel_state(&self, spec: &ChannelSpec) -> Option<ChannelState> {
        mutex_lock(&self.inner.channels, SOURCE, "channel_state")
            .get(spec)
            .map(|channel| *channel.state.borrow())
    }
}

struct Binding {
    subscriber: Weak<SubscriberInner>,
    channel: Arc<SharedChannel>,
    state: watch::Receiver<ChannelState>,
    id: u64,
}

/// A consumer's subscription. Closing (or dropping) it releases the binding;
/// the last binding on a channel closes the channel, even if the channel is
/// still connecting.
pub struct SubscriptionHandle {
    spec: ChannelSpec,
    binding: Option<Binding>,
    closed: AtomicBool,
}

impl SubscriptionHandle {
    fn inert(spec: ChannelSpec) -> Self {
        Self {
            spec,
            binding: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    pub fn is_inert(&self) -> bool {
        self.binding.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ChannelState {
        match &self.binding {
            Some(binding) if !self.is_closed() => *binding.state.borrow(),
            _ => ChannelState::Closed,
        }
    }

    /// Wait until the channel is acknowledged. Inert handles return at once.
    pub async fn wait_open(&self) -> Result<(), SyncError> {
        let Some(binding) = &self.binding else {
            return Ok(());
        };
        let mut state = binding.state.clone();
        let reached = state
            .wait_for(|state| *state != ChannelState::Connecting)
            .await
            .map(|state| *state);
        match reached {
            Ok(ChannelState::Open) if !self.is_closed() => Ok(()),
            _ => Err(SyncError::feed(format!("channel {} closed", self.spec))),
        }
    }

    /// Release this subscription. Calling it again is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(binding) = &self.binding else {
            return;
        };
        let channel = &binding.channel;

        let last = match binding.subscriber.upgrade() {
            Some(subscriber) => {
                let mut channels = mutex_lock(&subscriber.channels, SOURCE, "close");
                let mut bindings = mutex_lock(&channel.bindings, SOURCE, "close.unbind");
                bindings.remove(&binding.id);
                let last = bindings.is_empty();
                if last
                    && channels
                        .get(&channel.spec)
                        .is_some_and(|registered| Arc::ptr_eq(registered, channel))
                {
                    channels.remove(&channel.spec);
                }
                last
            }
            None => {
                let mut bindings = mutex_lock(&channel.bindings, SOURCE, "close.unbind");
                bindings.remove(&binding.id);
                bindings.is_empty()
            }
        };
        if last {
            channel.shutdown.send_replace(true);
        }
        debug!(channel = %self.spec, binding = binding.id, last, "Subscription closed");
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("channel", &self.spec.channel_id())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Channel task
// ============================================================================

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Sleep for `delay` unless shutdown arrives first. Returns false on shutdown.
async fn backoff(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = shutdown_requested(shutdown) => false,
    }
}

async fn drive_channel(
    channel: Arc<SharedChannel>,
    transport: Arc<dyn FeedTransport>,
    client: QueryClient,
    policy: ReconnectPolicy,
) {
    let mut shutdown = channel.shutdown.subscribe();
    let mut attempt: u32 = 0;
    let mut reopened = false;

    loop {
        if *shutdown.borrow() {
            break;
        }
        channel.state.send_replace(ChannelState::Connecting);

        // The handshake runs to completion even if the last binding closes
        // meanwhile, so the server-side channel can be released below.
        let opened = transport.open(&channel.spec).await;
        let mut feed = match opened {
            Ok(feed) => feed,
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let delay = policy.delay(attempt);
                warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "Channel open failed");
                counter!(METRIC_FEED_EVENT_TOTAL, "outcome" => "open_failed").increment(1);
                if !backoff(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        if *shutdown.borrow() {
            feed.close();
            debug!("Closed channel whose subscribers left during the handshake");
            break;
        }

        channel.state.send_replace(ChannelState::Open);
        attempt = 0;
        if reopened {
            let identities = channel.bound_identities();
            info!(count = identities.len(), "Channel reopened; invalidating bound queries");
            for identity in &identities {
                client.invalidate(identity);
            }
        } else {
            info!("Channel open");
        }

        loop {
            tokio::select! {
                event = feed.recv() => match event {
                    Some(event) => dispatch(&channel, &client, &event),
                    None => break,
                },
                () = shutdown_requested(&mut shutdown) => {
                    feed.close();
                    channel.state.send_replace(ChannelState::Closed);
                    debug!("Channel closed");
                    return;
                }
            }
        }

        drop(feed);
        reopened = true;
        attempt = attempt.saturating_add(1);
        let delay = policy.delay(attempt);
        warn!(delay_ms = delay.as_millis() as u64, "Channel ended by transport; reconnecting");
        counter!(METRIC_FEED_EVENT_TOTAL, "outcome" => "disconnected").increment(1);
        channel.state.send_replace(ChannelState::Connecting);
        if !backoff(delay, &mut shutdown).await {
            break;
        }
    }

    channel.state.send_replace(ChannelState::Closed);
    debug!("Channel closed");
}

fn dispatch(channel: &SharedChannel, client: &QueryClient, event: &ChangeEvent) {
    if event.table != channel.spec.table {
        counter!(METRIC_FEED_EVENT_TOTAL, "outcome" => "ignored").increment(1);
        debug!(table = %event.table, "Ignoring event for another table");
        return;
    }
    if !event.filter_match {
        counter!(METRIC_FEED_EVENT_TOTAL, "outcome" => "ignored").increment(1);
        debug!("Ignoring event outside the channel filter");
        return;
    }

    let identities = channel.bound_identities();
    let mut flipped = 0;
    for identity in &identities {
        flipped += client.invalidate(identity).len();
    }
    counter!(METRIC_FEED_EVENT_TOTAL, "outcome" => "invalidated").increment(1);
    debug!(
        event_type = event.event_type.as_str(),
        bound = identities.len(),
        flipped,
        "Change event dispatched"
    );
}
