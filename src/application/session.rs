//! Application root: one cache context, one mutation coordinator and one
//! change-feed subscriber, threaded to whatever reads or writes household
//! data.

use std::future::Future;
use std::sync::Arc;

use hearth_api_types::ActivityFilters;
use tracing::instrument;

use super::activity::{self, ActivityPages, ActivitySource};
use super::categories::{self, Categories};
use super::error::SyncError;
use super::mutation::{Mutation, MutationCoordinator, MutationHandle};
use super::remote::RemoteTransport;
use super::shopping::{self, ShoppingList};
use super::tasks::{self, TaskBoard};
use crate::cache::{CacheConfig, CacheEntry, CursorPaginator, QueryClient, QueryKey, QueryObserver};
use crate::realtime::{ChangeFeedSubscriber, ChannelSpec, FeedTransport, ReconnectPolicy, SubscriptionHandle};

pub struct SyncSession {
    client: QueryClient,
    coordinator: MutationCoordinator,
    remote: Arc<dyn RemoteTransport>,
    feed: ChangeFeedSubscriber,
    page_size: usize,
}

impl SyncSession {
    pub fn new(
        config: CacheConfig,
        remote: Arc<dyn RemoteTransport>,
        feed: Arc<dyn FeedTransport>,
        policy: ReconnectPolicy,
        page_size: usize,
    ) -> Self {
        let client = QueryClient::new(config);
        let coordinator = MutationCoordinator::new(client.clone(), Arc::clone(&remote));
        let feed = ChangeFeedSubscriber::new(client.clone(), feed, policy);
        Self {
            client,
            coordinator,
            remote,
            feed,
            page_size,
        }
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    pub fn feed(&self) -> &ChangeFeedSubscriber {
        &self.feed
    }

    pub fn remote(&self) -> Arc<dyn RemoteTransport> {
        Arc::clone(&self.remote)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn shopping_list(&self, list_id: &str) -> Result<ShoppingList, SyncError> {
        self.client
            .fetch_query(&shopping::list_key(list_id), shopping::list_fetcher(self.remote(), list_id))
            .await
    }

    #[instrument(skip(self))]
    pub async fn task_board(&self, board_id: &str) -> Result<TaskBoard, SyncError> {
        self.client
            .fetch_query(&tasks::board_key(board_id), tasks::board_fetcher(self.remote(), board_id))
            .await
    }

    #[instrument(skip(self))]
    pub async fn categories(&self, household_id: &str) -> Result<Categories, SyncError> {
        self.client
            .fetch_query(
                &categories::categories_key(household_id),
                categories::categories_fetcher(self.remote(), household_id),
            )
            .await
    }

    pub fn activity(&self, household_id: &str, filters: ActivityFilters) -> CursorPaginator<ActivitySource> {
        activity::activity_paginator(
            self.client.clone(),
            self.remote(),
            household_id,
            filters,
            self.page_size,
        )
    }

    // ========================================================================
    // Live queries
    // ========================================================================

    /// Observe a shopping list and keep it in sync with the change feed.
    pub fn watch_shopping_list(&self, list_id: &str) -> Result<LiveQuery<ShoppingList>, SyncError> {
        self.live(
            shopping::list_key(list_id),
            shopping::list_fetcher(self.remote(), list_id),
            ChannelSpec::filtered(shopping::TABLE, shopping::list_filter(list_id)),
        )
    }

    pub fn watch_task_board(&self, board_id: &str) -> Result<LiveQuery<TaskBoard>, SyncError> {
        self.live(
            tasks::board_key(board_id),
            tasks::board_fetcher(self.remote(), board_id),
            ChannelSpec::filtered(tasks::TABLE, tasks::board_filter(board_id)),
        )
    }

    pub fn watch_categories(&self, household_id: &str) -> Result<LiveQuery<Categories>, SyncError> {
        self.live(
            categories::categories_key(household_id),
            categories::categories_fetcher(self.remote(), household_id),
            ChannelSpec::filtered(categories::TABLE, categories::household_filter(household_id)),
        )
    }

    /// Observe an activity feed. Any activity change in the household
    /// refreshes the first page of every filter combination.
    pub fn watch_activity(
        &self,
        household_id: &str,
        filters: ActivityFilters,
    ) -> Result<LiveFeed, SyncError> {
        let paginator = self.activity(household_id, filters);
        let subscription = self.feed.subscribe(
            ChannelSpec::filtered(activity::TABLE, activity::household_filter(household_id)),
            vec![activity::household_prefix(household_id)],
        )?;
        Ok(LiveFeed {
            query: LiveQuery {
                observer: paginator.observe(),
                subscription,
            },
            paginator,
        })
    }

    fn live<T, F, Fut>(&self, key: QueryKey<T>, fetcher: F, spec: ChannelSpec) -> Result<LiveQuery<T>, SyncError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let subscription = self.feed.subscribe(spec, vec![key.identity().clone()])?;
        Ok(LiveQuery {
            observer: self.client.observe(key, fetcher),
            subscription,
        })
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub async fn mutate<M: Mutation>(&self, mutation: M) -> Result<M::Output, SyncError> {
        self.coordinator.mutate(mutation).await
    }

    pub fn start<M: Mutation>(&self, mutation: M) -> Result<MutationHandle<M::Output>, SyncError> {
        self.coordinator.start(mutation)
    }
}

/// An observed query bound to its change-feed channel. Dropping it stops
/// notifications and releases the channel.
pub struct LiveQuery<T> {
    observer: QueryObserver<T>,
    subscription: SubscriptionHandle,
}

impl<T: Clone + Send + Sync + 'static> LiveQuery<T> {
    pub fn observer(&self) -> &QueryObserver<T> {
        &self.observer
    }

    pub fn subscription(&self) -> &SubscriptionHandle {
        &self.subscription
    }

    pub fn current(&self) -> Option<CacheEntry<T>> {
        self.observer.current()
    }

    pub async fn load(&self) -> Result<T, SyncError> {
        self.observer.load().await
    }

    /// Next cache change for this query; `None` when the entry was removed.
    pub async fn changed(&mut self) -> Option<CacheEntry<T>> {
        self.observer.changed().await
    }

    pub fn close(&self) {
        self.subscription.close();
    }
}

/// A live activity feed plus the paginator that loads older pages.
pub struct LiveFeed {
    query: LiveQuery<ActivityPages>,
    paginator: CursorPaginator<ActivitySource>,
}

impl LiveFeed {
    pub fn query(&self) -> &LiveQuery<ActivityPages> {
        &self.query
    }

    pub fn query_mut(&mut self) -> &mut LiveQuery<ActivityPages> {
        &mut self.query
    }

    pub fn paginator(&self) -> &CursorPaginator<ActivitySource> {
        &self.paginator
    }

    pub async fn load(&self) -> Result<ActivityPages, SyncError> {
        self.paginator.load().await
    }

    pub async fn fetch_next_page(&self) -> Result<ActivityPages, SyncError> {
        self.paginator.fetch_next_page().await
    }
}
