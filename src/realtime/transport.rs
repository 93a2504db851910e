//! Seam between the change-feed subscriber and whatever carries push events.

use std::fmt;

use async_trait::async_trait;
use hearth_api_types::ChangeEvent;
use tokio::sync::mpsc;

use crate::application::error::SyncError;

/// Events buffered per open channel before the transport applies
/// backpressure.
pub const EVENT_BUFFER: usize = 64;

/// One `(table, filter)` pair. `filter` is a row filter such as
/// `list_id=eq.L1`; `None` subscribes to every row of the table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSpec {
    pub table: String,
    pub filter: Option<String>,
}

impl ChannelSpec {
    pub fn new(table: impl Into<String>, filter: Option<String>) -> Self {
        Self {
            table: table.into(),
            filter,
        }
    }

    pub fn table(table: impl Into<String>) -> Self {
        Self::new(table, None)
    }

    pub fn filtered(table: impl Into<String>, filter: impl Into<String>) -> Self {
        Self::new(table, Some(filter.into()))
    }

    /// `realtime:{table}:{filter}`, with `*` standing in for no filter.
    pub fn channel_id(&self) -> String {
        format!("realtime:{}:{}", self.table, self.filter.as_deref().unwrap_or("*"))
    }

    /// A present but blank filter key means the consumer has nothing to
    /// subscribe to yet.
    pub fn has_blank_filter(&self) -> bool {
        self.filter
            .as_deref()
            .is_some_and(|filter| filter.trim().is_empty())
    }
}

impl fmt::Display for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel_id())
    }
}

/// An acknowledged channel.
///
/// `recv` yields `None` once the transport side ended the channel. `close`
/// is the explicit channel-close call; it runs at most once and also runs
/// on drop.
pub struct FeedChannel {
    events: mpsc::Receiver<ChangeEvent>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl FeedChannel {
    pub fn new(events: mpsc::Receiver<ChangeEvent>, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            events,
            on_close: Some(Box::new(on_close)),
        }
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            self.events.close();
            on_close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.on_close.is_none()
    }
}

impl Drop for FeedChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for FeedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedChannel")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens change-feed channels.
#[async_trait]
pub trait FeedTransport: Send + Sync + 'static {
    /// Run the channel-open handshake and resolve once the server
    /// acknowledged the subscription.
    async fn open(&self, spec: &ChannelSpec) -> Result<FeedChannel, SyncError>;
}
