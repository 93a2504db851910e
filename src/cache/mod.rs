//! Client-side query cache.
//!
//! - **Store**: typed entries keyed by [`QueryIdentity`] with freshness
//!   metadata, synchronous change notification and mutation holds.
//! - **Multiplexer**: one network round trip per identity no matter how many
//!   callers ask concurrently.
//! - **Client**: the context object threaded through the application; adds
//!   observers, background refetch on invalidation and garbage collection.
//! - **Paginator**: cursor-chained pages for newest-first feeds.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! stale_time_seconds = 30
//! gc_horizon_seconds = 300
//! gc_interval_seconds = 60
//! ```

mod client;
mod config;
mod inflight;
mod keys;
pub(crate) mod lock;
mod paginate;
mod store;

pub use client::{QueryClient, QueryObserver, RefetchRegistration, Refetcher, WeakQueryClient};
pub use config::CacheConfig;
pub use inflight::RequestMultiplexer;
pub use keys::{QueryIdentity, QueryKey, QueryMatcher, Resource};
pub use paginate::{
    CursorPaginator, Cursored, DEFAULT_PAGE_SIZE, InfinitePages, Page, PageCursor, PageSource,
};
pub use store::{CacheEntry, CacheStats, CacheStore, Replaced};
