//! Household activity feed, read newest-first through the cursor paginator.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_api_types::{ActivityFilters, ActivityRecord};
use serde_json::json;
use time::format_description::well_known::Rfc3339;

use super::error::SyncError;
use super::remote::{RemoteRequest, RemoteTransport, fetch_json};
use crate::cache::{
    CursorPaginator, Cursored, InfinitePages, PageCursor, PageSource, QueryClient, QueryIdentity,
    QueryKey, Resource,
};

pub const TABLE: &str = "activity_events";

const PATH: &str = "/activity_events";

pub type ActivityPages = InfinitePages<ActivityRecord>;

impl Cursored for ActivityRecord {
    fn cursor(&self) -> PageCursor {
        PageCursor::new(self.created_at, self.id.clone())
    }
}

/// `["activity", household_id, {"kind": .., "actor_id": ..}]`
///
/// Filters are part of the identity, so every filter combination pages
/// independently while a `["activity", household_id]` prefix still
/// invalidates all of them.
pub fn activity_key(household_id: &str, filters: &ActivityFilters) -> QueryKey<ActivityPages> {
    QueryKey::new(
        QueryIdentity::resource(Resource::Activity)
            .with(household_id)
            .with(json!({ "kind": filters.kind, "actor_id": filters.actor_id })),
    )
}

pub fn household_prefix(household_id: &str) -> QueryIdentity {
    QueryIdentity::resource(Resource::Activity).with(household_id)
}

pub fn household_filter(household_id: &str) -> String {
    format!("household_id=eq.{household_id}")
}

/// Page request for events strictly older than `before`.
pub fn page_request(
    household_id: &str,
    filters: &ActivityFilters,
    before: Option<&PageCursor>,
    limit: usize,
) -> Result<RemoteRequest, SyncError> {
    let mut request = RemoteRequest::get(PATH)
        .query("household_id", format!("eq.{household_id}"))
        .query("order", "created_at.desc,id.desc")
        .query("limit", limit.to_string());
    if let Some(kind) = filters.kind.as_deref() {
        request = request.query("kind", format!("eq.{kind}"));
    }
    if let Some(actor_id) = filters.actor_id.as_deref() {
        request = request.query("actor_id", format!("eq.{actor_id}"));
    }
    if let Some(cursor) = before {
        let created_at = cursor
            .created_at()
            .format(&Rfc3339)
            .map_err(|err| SyncError::InvalidCursor(err.to_string()))?;
        request = request
            .query("before", created_at)
            .query("before_id", cursor.id());
    }
    Ok(request)
}

/// Pages of one household's activity through the remote API.
pub struct ActivitySource {
    remote: Arc<dyn RemoteTransport>,
    household_id: String,
    filters: ActivityFilters,
}

impl ActivitySource {
    pub fn new(
        remote: Arc<dyn RemoteTransport>,
        household_id: impl Into<String>,
        filters: ActivityFilters,
    ) -> Self {
        Self {
            remote,
            household_id: household_id.into(),
            filters,
        }
    }
}

#[async_trait]
impl PageSource for ActivitySource {
    type Item = ActivityRecord;

    async fn fetch_page(
        &self,
        before: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, SyncError> {
        let request = page_request(&self.household_id, &self.filters, before.as_ref(), limit)?;
        fetch_json(self.remote.as_ref(), request).await
    }
}

pub fn activity_paginator(
    client: QueryClient,
    remote: Arc<dyn RemoteTransport>,
    household_id: &str,
    filters: ActivityFilters,
    page_size: usize,
) -> CursorPaginator<ActivitySource> {
    let key = activity_key(household_id, &filters);
    let source = Arc::new(ActivitySource::new(remote, household_id, filters));
    CursorPaginator::new(client, key, source, page_size)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::cache::QueryMatcher;

    #[test]
    fn filters_are_part_of_the_identity() {
        let all = activity_key("h1", &ActivityFilters::default());
        let tasks_only = activity_key(
            "h1",
            &ActivityFilters {
                kind: Some("task".to_string()),
                actor_id: None,
            },
        );

        assert_ne!(all.identity(), tasks_only.identity());
        let prefix = QueryMatcher::from(&household_prefix("h1"));
        assert!(prefix.matches(all.identity()));
        assert!(prefix.matches(tasks_only.identity()));
    }

    #[test]
    fn first_page_request_has_no_cursor() {
        let request = page_request("h1", &ActivityFilters::default(), None, 20).expect("request builds");
        assert_eq!(request.path, "/activity_events");
        assert!(request.query.contains(&("limit".to_string(), "20".to_string())));
        assert!(!request.query.iter().any(|(name, _)| name == "before"));
    }

    #[test]
    fn cursor_is_sent_as_timestamp_and_id() {
        let cursor = PageCursor::new(datetime!(2026-04-01 12:30 UTC), "e17");
        let filters = ActivityFilters {
            kind: None,
            actor_id: Some("u1".to_string()),
        };
        let request = page_request("h1", &filters, Some(&cursor), 20).expect("request builds");

        assert!(request.query.contains(&("before".to_string(), "2026-04-01T12:30:00Z".to_string())));
        assert!(request.query.contains(&("before_id".to_string(), "e17".to_string())));
        assert!(request.query.contains(&("actor_id".to_string(), "eq.u1".to_string())));
    }

    #[test]
    fn record_cursor_uses_creation_time_and_id() {
        let record = ActivityRecord {
            id: "e1".to_string(),
            household_id: "h1".to_string(),
            actor_id: "u1".to_string(),
            kind: "shopping".to_string(),
            summary: "bought milk".to_string(),
            entity_id: None,
            created_at: datetime!(2026-04-01 12:30 UTC),
        };
        assert_eq!(record.cursor(), PageCursor::new(datetime!(2026-04-01 12:30 UTC), "e1"));
    }
}
