//! Push side of the sync layer: change-feed channels that invalidate cached
//! queries when other household members change data.
//!
//! ## Configuration
//!
//! ```toml
//! [realtime]
//! reconnect_initial_ms = 500
//! reconnect_max_ms = 30000
//! reconnect_multiplier = 2.0
//! jitter_ms = 250
//! ```

mod memory;
mod subscriber;
mod transport;

pub use memory::InMemoryFeed;
pub use subscriber::{ChangeFeedSubscriber, ChannelState, ReconnectPolicy, SubscriptionHandle};
pub use transport::{ChannelSpec, EVENT_BUFFER, FeedChannel, FeedTransport};
