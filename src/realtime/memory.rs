//! In-process change-feed hub.
//!
//! Several subscribers (one per simulated device) can share a hub. Tests use
//! the pause and failure switches to stage slow handshakes and reconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use hearth_api_types::ChangeEvent;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::transport::{ChannelSpec, EVENT_BUFFER, FeedChannel, FeedTransport};
use crate::application::error::SyncError;

struct HubInner {
    channels: DashMap<String, Vec<(u64, mpsc::Sender<ChangeEvent>)>>,
    next_id: AtomicU64,
    opens: AtomicUsize,
    closes: AtomicUsize,
    failures: AtomicUsize,
    paused: watch::Sender<bool>,
}

impl HubInner {
    fn detach(&self, channel_id: &str, id: u64) {
        let empty = match self.channels.get_mut(channel_id) {
            Some(mut senders) => {
                senders.retain(|(registered, _)| *registered != id);
                senders.is_empty()
            }
            None => false,
        };
        if empty {
            self.channels.remove_if(channel_id, |_, senders| senders.is_empty());
        }
    }
}

#[derive(Clone)]
pub struct InMemoryFeed {
    inner: Arc<HubInner>,
}

impl Default for InMemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFeed {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(HubInner {
                channels: DashMap::new(),
                next_id: AtomicU64::new(0),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
                paused,
            }),
        }
    }

    /// Deliver `event` to every open channel for `spec`. Returns how many
    /// channels accepted it.
    pub fn publish(&self, spec: &ChannelSpec, event: ChangeEvent) -> usize {
        self.inner
            .channels
            .get(&spec.channel_id())
            .map(|senders| deliver(&senders, &event))
            .unwrap_or(0)
    }

    /// Deliver `event` to every open channel on `table`, whatever its filter.
    pub fn broadcast(&self, table: &str, event: ChangeEvent) -> usize {
        let prefix = format!("realtime:{table}:");
        self.inner
            .channels
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| deliver(entry.value(), &event))
            .sum()
    }

    /// Drop the server side of every channel for `spec`, as a lost
    /// connection would.
    pub fn disconnect(&self, spec: &ChannelSpec) -> usize {
        self.inner
            .channels
            .remove(&spec.channel_id())
            .map(|(_, senders)| senders.len())
            .unwrap_or(0)
    }

    /// Hold every `open` at the handshake until [`InMemoryFeed::resume_opens`].
    pub fn pause_opens(&self) {
        self.inner.paused.send_replace(true);
    }

    pub fn resume_opens(&self) {
        self.inner.paused.send_replace(false);
    }

    /// Refuse the next `count` handshakes.
    pub fn fail_next_opens(&self, count: usize) {
        self.inner.failures.store(count, Ordering::SeqCst);
    }

    /// Handshakes that succeeded.
    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Explicit channel-close calls received.
    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Channels currently open for `spec`.
    pub fn open_channels(&self, spec: &ChannelSpec) -> usize {
        self.inner
            .channels
            .get(&spec.channel_id())
            .map(|senders| senders.len())
            .unwrap_or(0)
    }
}

fn deliver(senders: &[(u64, mpsc::Sender<ChangeEvent>)], event: &ChangeEvent) -> usize {
    senders
        .iter()
        .filter(|(_, sender)| sender.try_send(event.clone()).is_ok())
        .count()
}

#[async_trait]
impl FeedTransport for InMemoryFeed {
    async fn open(&self, spec: &ChannelSpec) -> Result<FeedChannel, SyncError> {
        let mut paused = self.inner.paused.subscribe();
        if paused.wait_for(|paused| !*paused).await.is_err() {
            return Err(SyncError::feed("hub shut down"));
        }

        let refused = self
            .inner
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            debug!(channel = %spec, "Refusing channel open");
            return Err(SyncError::feed(format!("open refused for {spec}")));
        }

        let channel_id = spec.channel_id();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = mpsc::channel(EVENT_BUFFER);
        self.inner
            .channels
            .entry(channel_id.clone())
            .or_default()
            .push((id, sender));
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        let hub = Arc::downgrade(&self.inner);
        Ok(FeedChannel::new(events, move || {
            if let Some(hub) = hub.upgrade() {
                hub.closes.fetch_add(1, Ordering::SeqCst);
                hub.detach(&channel_id, id);
            }
        }))
    }
}
