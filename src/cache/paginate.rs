//! Cursor paginator for newest-first feeds.
//!
//! Pages are chained by a `(created_at, id)` cursor taken from the oldest item
//! of the previous page. All loaded pages of one session live in the cache as
//! a single [`InfinitePages`] value under the feed's identity.
//!
//! Invalidation refreshes only the first page. Older pages are kept as they
//! were loaded; items that moved into the refreshed first page are dropped
//! from them so no item is listed twice.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, instrument};

use super::client::{QueryClient, QueryObserver, WeakQueryClient};
use super::keys::QueryKey;
use crate::application::error::SyncError;

pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Times `fetch_next_page` follows a cursor that moved under it.
const NEXT_PAGE_ATTEMPTS: usize = 3;

// ============================================================================
// Cursor
// ============================================================================

/// Position in a newest-first feed. Ordered by timestamp, then id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageCursor {
    created_at: OffsetDateTime,
    id: String,
}

#[derive(Serialize, Deserialize)]
struct PageCursorPayload {
    created_at: OffsetDateTime,
    id: String,
}

impl PageCursor {
    pub fn new(created_at: OffsetDateTime, id: impl Into<String>) -> Self {
        Self {
            created_at,
            id: id.into(),
        }
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Opaque token for handing the cursor to callers.
    pub fn encode(&self) -> String {
        let payload = PageCursorPayload {
            created_at: self.created_at,
            id: self.id.clone(),
        };
        // An unencodable payload yields an empty token, which decodes as InvalidCursor.
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap_or_default())
    }

    pub fn decode(token: &str) -> Result<Self, SyncError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|err| SyncError::InvalidCursor(err.to_string()))?;
        let payload: PageCursorPayload = serde_json::from_slice(&bytes)
            .map_err(|err| SyncError::InvalidCursor(err.to_string()))?;
        Ok(Self::new(payload.created_at, payload.id))
    }
}

/// Items that can be positioned in a cursor-paginated feed.
pub trait Cursored {
    fn cursor(&self) -> PageCursor;
}

/// Backend for one paginated feed.
#[async_trait]
pub trait PageSource: Send + Sync + 'static {
    type Item: Cursored + Clone + Send + Sync + 'static;

    /// Up to `limit` items strictly older than `before`, newest first.
    async fn fetch_page(
        &self,
        before: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<Self::Item>, SyncError>;
}

// ============================================================================
// Pages
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Absent when the feed has no older items.
    pub next_cursor: Option<PageCursor>,
}

/// Every page loaded in the current session, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct InfinitePages<T> {
    pub pages: Vec<Page<T>>,
}

impl<T: Cursored> InfinitePages<T> {
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.pages.iter().flat_map(|page| page.items.iter())
    }

    pub fn next_cursor(&self) -> Option<&PageCursor> {
        self.pages.last().and_then(|page| page.next_cursor.as_ref())
    }

    pub fn has_next_page(&self) -> bool {
        self.next_cursor().is_some()
    }

    fn ids(&self) -> HashSet<String> {
        self.items().map(|item| item.cursor().id).collect()
    }

    /// Append an older page, dropping items already listed.
    fn append(mut self, mut page: Page<T>) -> Self {
        let seen = self.ids();
        page.items.retain(|item| !seen.contains(item.cursor().id()));
        self.pages.push(page);
        self
    }

    /// Replace the first page, keeping older pages minus anything the new
    /// first page now lists.
    fn with_first_page(self, first: Page<T>) -> Self {
        let fresh: HashSet<String> = first.items.iter().map(|item| item.cursor().id).collect();
        let mut pages = Vec::with_capacity(self.pages.len().max(1));
        pages.push(first);
        for mut page in self.pages.into_iter().skip(1) {
            page.items.retain(|item| !fresh.contains(item.cursor().id()));
            pages.push(page);
        }
        Self { pages }
    }
}

// ============================================================================
// Paginator
// ============================================================================

/// Loads a newest-first feed page by page into the cache.
pub struct CursorPaginator<S: PageSource> {
    client: QueryClient,
    key: QueryKey<InfinitePages<S::Item>>,
    source: Arc<S>,
    page_size: usize,
}

impl<S: PageSource> Clone for CursorPaginator<S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            key: self.key.clone(),
            source: Arc::clone(&self.source),
            page_size: self.page_size,
        }
    }
}

impl<S: PageSource> CursorPaginator<S> {
    pub fn new(
        client: QueryClient,
        key: QueryKey<InfinitePages<S::Item>>,
        source: Arc<S>,
        page_size: usize,
    ) -> Self {
        Self {
            client,
            key,
            source,
            page_size: page_size.max(1),
        }
    }

    pub fn key(&self) -> &QueryKey<InfinitePages<S::Item>> {
        &self.key
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages loaded so far, if any.
    pub fn current(&self) -> Option<InfinitePages<S::Item>> {
        self.client.read(&self.key).map(|entry| entry.value)
    }

    /// Fetch one page older than `cursor` without touching the cache.
    ///
    /// Items not strictly older than `cursor` are dropped. `next_cursor` is
    /// absent when the source returned a short page.
    pub async fn fetch_page(
        &self,
        cursor: Option<&PageCursor>,
    ) -> Result<Page<S::Item>, SyncError> {
        fetch_page(self.source.as_ref(), cursor, self.page_size).await
    }

    /// Serve the cached pages while fresh, otherwise load the first page.
    pub async fn load(&self) -> Result<InfinitePages<S::Item>, SyncError> {
        self.client.fetch_query(&self.key, self.refresh_job()).await
    }

    /// Refetch the newest page and merge it in front of the pages already
    /// loaded. Concurrent refreshes share one request.
    #[instrument(skip(self), fields(identity = %self.key.identity()))]
    pub async fn refresh_first_page(&self) -> Result<InfinitePages<S::Item>, SyncError> {
        self.client.fetch_fresh(&self.key, self.refresh_job()).await
    }

    /// Load the page after the last one loaded.
    ///
    /// Calls for the same feed run one at a time; a second caller waits and
    /// then continues from the page the first one appended. When a first-page
    /// refresh lands while the page is in flight, the fetched page no longer
    /// follows the last loaded one; it is discarded and the fetch repeats from
    /// the new cursor.
    #[instrument(skip(self), fields(identity = %self.key.identity()))]
    pub async fn fetch_next_page(&self) -> Result<InfinitePages<S::Item>, SyncError> {
        let gate = self.client.acquire_serial(self.key.identity()).await;

        let Some(mut current) = self.current() else {
            drop(gate);
            return self.refresh_first_page().await;
        };

        let timeout = self.client.config().request_timeout();
        for attempt in 1..=NEXT_PAGE_ATTEMPTS {
            let Some(cursor) = current.next_cursor().cloned() else {
                debug!("No further pages");
                return Ok(current);
            };

            let page = tokio::time::timeout(timeout, self.fetch_page(Some(&cursor)))
                .await
                .map_err(|_| SyncError::timeout(timeout))??;
            debug!(items = page.items.len(), more = page.next_cursor.is_some(), "Fetched next page");

            let mut appended = false;
            let replaced = self.client.store().replace_with(&self.key, |latest| {
                let base = latest.cloned().unwrap_or(current);
                if base.next_cursor() == Some(&cursor) {
                    appended = true;
                    base.append(page)
                } else {
                    base
                }
            });
            if appended {
                return Ok(replaced.current);
            }
            debug!(attempt, "Pages were refreshed while fetching; continuing from the new cursor");
            current = replaced.current;
        }

        debug!(attempts = NEXT_PAGE_ATTEMPTS, "Next page not appended; pages keep changing");
        drop(gate);
        Ok(current)
    }

    /// Observe the feed; invalidations refresh the first page.
    pub fn observe(&self) -> QueryObserver<InfinitePages<S::Item>> {
        self.client.observe(self.key.clone(), self.refresh_job())
    }

    fn refresh_job(
        &self,
    ) -> impl Fn() -> BoxFuture<'static, Result<InfinitePages<S::Item>, SyncError>>
    + Send
    + Sync
    + 'static {
        let client = self.client.downgrade();
        let key = self.key.clone();
        let source = Arc::clone(&self.source);
        let page_size = self.page_size;
        move || {
            refresh(client.clone(), key.clone(), Arc::clone(&source), page_size).boxed()
        }
    }
}

async fn fetch_page<S: PageSource>(
    source: &S,
    cursor: Option<&PageCursor>,
    page_size: usize,
) -> Result<Page<S::Item>, SyncError> {
    let raw = source.fetch_page(cursor.cloned(), page_size).await?;
    let full = raw.len() >= page_size;
    let items: Vec<S::Item> = match cursor {
        Some(cursor) => raw
            .into_iter()
            .filter(|item| item.cursor() < *cursor)
            .collect(),
        None => raw,
    };
    let next_cursor = if full {
        items.last().map(Cursored::cursor)
    } else {
        None
    };
    Ok(Page { items, next_cursor })
}

fn refresh<S: PageSource>(
    client: WeakQueryClient,
    key: QueryKey<InfinitePages<S::Item>>,
    source: Arc<S>,
    page_size: usize,
) -> impl Future<Output = Result<InfinitePages<S::Item>, SyncError>> + Send + 'static {
    async move {
        let Some(client) = client.upgrade() else {
            return Err(SyncError::network("query client shut down"));
        };
        let _gate = client.acquire_serial(key.identity()).await;
        let first = fetch_page(source.as_ref(), None, page_size).await?;
        let merged = match client.read(&key) {
            Some(entry) => entry.value.with_first_page(first),
            None => InfinitePages { pages: vec![first] },
        };
        Ok(merged)
    }
}
