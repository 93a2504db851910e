//! End-to-end consistency properties of the cache, the mutation coordinator
//! and the change feed, run against an in-process household API.

mod support;

use std::collections::HashSet;

use hearth::application::error::SyncError;
use hearth::application::shopping::{self, AddShoppingItem, ToggleBought, UpdateShoppingItem};
use hearth::cache::{Cursored, QueryMatcher};
use hearth::domain::ids::is_temporary;
use hearth::realtime::ChannelSpec;
use hearth_api_types::{ActivityFilters, NewShoppingItem, ShoppingItemPatch};
use support::{FakeServer, item_event, session, session_with_page_size, settle};

fn milk(list_id: &str) -> NewShoppingItem {
    NewShoppingItem {
        list_id: list_id.to_string(),
        name: "Milk".to_string(),
        quantity: None,
        category_id: None,
    }
}

#[tokio::test]
async fn optimistic_create_is_visible_at_once_and_reverts_on_failure() {
    let server = FakeServer::new();
    let (session, _feed) = session(&server);
    assert!(session.shopping_list("L1").await.expect("initial load").is_empty());

    server.gate(1);
    server.fail(1, SyncError::rejected(500, "database unavailable"));
    let handle = session
        .start(AddShoppingItem::new(milk("L1")))
        .expect("mutation starts");

    let optimistic = session
        .client()
        .read(&shopping::list_key("L1"))
        .expect("optimistic entry")
        .value;
    assert_eq!(optimistic.len(), 1);
    assert_eq!(optimistic[0].name, "Milk");
    assert!(is_temporary(&optimistic[0].id), "placeholder id: {}", optimistic[0].id);

    server.release(1);
    let err = handle.settled().await.expect_err("server rejects the create");
    assert_eq!(err, SyncError::rejected(500, "database unavailable"));

    let after = session
        .client()
        .read(&shopping::list_key("L1"))
        .expect("entry kept")
        .value;
    assert!(after.is_empty());
}

#[tokio::test]
async fn confirmed_create_replaces_the_placeholder() {
    let server = FakeServer::new();
    let (session, _feed) = session(&server);
    session.shopping_list("L1").await.expect("initial load");

    let add = AddShoppingItem::new(milk("L1"));
    let temp_id = add.temp_id().to_string();
    let record = session.mutate(add).await.expect("create confirmed");

    let cached = session
        .client()
        .read(&shopping::list_key("L1"))
        .expect("entry")
        .value;
    assert_eq!(cached, vec![record]);
    assert!(cached.iter().all(|item| item.id != temp_id));
}

#[tokio::test]
async fn older_failed_toggle_does_not_clobber_newer_confirmation() {
    let server = FakeServer::new();
    let item = server.insert_item("L1", "Bread");
    let (session, _feed) = session(&server);
    session.shopping_list("L1").await.expect("initial load");

    server.gate(1);
    server.fail(1, SyncError::network("connection reset"));
    server.gate(2);

    let first = session
        .start(ToggleBought::new("L1", item.id.clone(), true))
        .expect("first toggle starts");
    server.wait_for_calls(2).await;
    let second = session
        .start(ToggleBought::new("L1", item.id.clone(), false))
        .expect("second toggle starts");
    server.wait_for_calls(3).await;

    server.release(2);
    let confirmed = second.settled().await.expect("second toggle confirmed");
    assert!(!confirmed.bought);

    server.release(1);
    first.settled().await.expect_err("first toggle fails");

    let entry = session
        .client()
        .read(&shopping::list_key("L1"))
        .expect("entry");
    assert!(!entry.value[0].bought, "rollback of the older toggle was skipped");
    assert_eq!(session.client().store().hold_count(shopping::list_key("L1").identity()), 0);
}

#[tokio::test]
async fn push_during_settle_marks_stale_once_and_refetches_once() {
    let server = FakeServer::new();
    let item = server.insert_item("L1", "Eggs");
    let (session, feed) = session(&server);
    let live = session.watch_shopping_list("L1").expect("watch list");
    live.load().await.expect("initial load");
    live.subscription().wait_open().await.expect("channel opens");
    assert_eq!(server.gets(), 1);

    let key = shopping::list_key("L1");
    let stats_before = session.client().store().stats();

    server.gate(1);
    let handle = session
        .start(ToggleBought::new("L1", item.id.clone(), true))
        .expect("toggle starts");
    server.wait_for_calls(2).await;

    let spec = ChannelSpec::filtered(shopping::TABLE, shopping::list_filter("L1"));
    assert_eq!(feed.publish(&spec, item_event(&item)), 1);
    settle().await;

    let held = session.client().read(&key).expect("entry");
    assert!(!held.is_stale, "invalidation is deferred while the toggle is in flight");
    assert!(held.value[0].bought);
    assert_eq!(server.gets(), 1);

    server.release(1);
    handle.settled().await.expect("toggle confirmed");
    settle().await;

    let stats = session.client().store().stats();
    assert_eq!(stats.stale_marks - stats_before.stale_marks, 1);
    assert!(stats.deferred_invalidations > stats_before.deferred_invalidations);
    assert_eq!(server.gets(), 2, "exactly one refetch after settle");

    let entry = session.client().read(&key).expect("entry");
    assert!(!entry.is_stale);
    assert_eq!(entry.value, server.items("L1"));
}

#[tokio::test]
async fn concurrent_reads_share_one_request() {
    let server = FakeServer::new();
    server.insert_item("L1", "Apples");
    let (session, _feed) = session(&server);

    let (a, b) = tokio::join!(session.shopping_list("L1"), session.shopping_list("L1"));

    let a = a.expect("first reader");
    let b = b.expect("second reader");
    assert_eq!(a, b);
    assert_eq!(server.gets(), 1);
    assert_eq!(session.client().multiplexer().deduplicated(), 1);
    assert_eq!(session.client().multiplexer().in_flight(), 0);
}

#[tokio::test]
async fn concurrent_readers_share_the_same_failure() {
    let server = FakeServer::new();
    server.fail(0, SyncError::rejected(503, "maintenance"));
    let (session, _feed) = session(&server);

    let (a, b) = tokio::join!(session.shopping_list("L1"), session.shopping_list("L1"));

    let expected = SyncError::rejected(503, "maintenance");
    assert_eq!(a.expect_err("first reader fails"), expected);
    assert_eq!(b.expect_err("second reader fails"), expected);
    assert_eq!(server.gets(), 1);
    assert!(session.client().read(&shopping::list_key("L1")).is_none());
}

#[tokio::test]
async fn repeated_invalidation_refetches_once() {
    let server = FakeServer::new();
    server.insert_item("L1", "Rice");
    let (session, _feed) = session(&server);
    let live = session.watch_shopping_list("L1").expect("watch list");
    live.load().await.expect("initial load");

    let key = shopping::list_key("L1");
    let first = session.client().invalidate(QueryMatcher::Exact(key.identity().clone()));
    let second = session.client().invalidate(key.identity());
    let third = session.client().invalidate(key.identity());

    assert_eq!(first, vec![key.identity().clone()]);
    assert!(second.is_empty());
    assert!(third.is_empty());
    assert!(session.client().read(&key).expect("entry").is_stale);

    settle().await;
    assert_eq!(server.gets(), 2);
    assert!(!session.client().read(&key).expect("entry").is_stale);
}

#[tokio::test]
async fn failed_update_restores_the_exact_previous_value() {
    let server = FakeServer::new();
    let item = server.insert_item("L1", "Butter");
    server.insert_item("L1", "Jam");
    let (session, _feed) = session(&server);
    session.shopping_list("L1").await.expect("initial load");

    let key = shopping::list_key("L1");
    let before = session.client().read(&key).expect("entry").value;

    server.fail(1, SyncError::rejected(409, "item was changed elsewhere"));
    let err = session
        .mutate(UpdateShoppingItem {
            list_id: "L1".to_string(),
            item_id: item.id.clone(),
            patch: ShoppingItemPatch {
                name: Some("Salted butter".to_string()),
                quantity: Some("2".to_string()),
                ..Default::default()
            },
        })
        .await
        .expect_err("update rejected");

    assert_eq!(err.kind(), "server_rejection");
    assert_eq!(session.client().read(&key).expect("entry").value, before);
}

#[tokio::test]
async fn validation_failure_touches_neither_cache_nor_server() {
    let server = FakeServer::new();
    let (session, _feed) = session(&server);

    let err = session
        .mutate(AddShoppingItem::new(NewShoppingItem {
            name: "   ".to_string(),
            ..milk("L1")
        }))
        .await
        .expect_err("blank name rejected");

    assert_eq!(err.kind(), "validation");
    assert_eq!(server.calls(), 0);
    assert!(session.client().read(&shopping::list_key("L1")).is_none());
}

#[tokio::test]
async fn interleaved_mutations_and_pushes_converge_to_server_state() {
    let server = FakeServer::new();
    let bread = server.insert_item("L1", "Bread");
    let (session, feed) = session(&server);
    let live = session.watch_shopping_list("L1").expect("watch list");
    live.load().await.expect("initial load");
    live.subscription().wait_open().await.expect("channel opens");

    server.gate(1);
    server.gate(2);
    server.fail(2, SyncError::network("offline"));
    let toggle = session
        .start(ToggleBought::new("L1", bread.id.clone(), true))
        .expect("toggle starts");
    server.wait_for_calls(2).await;
    let add = session
        .start(AddShoppingItem::new(milk("L1")))
        .expect("add starts");
    server.wait_for_calls(3).await;

    // Another device adds an item while both mutations are in flight.
    let spec = ChannelSpec::filtered(shopping::TABLE, shopping::list_filter("L1"));
    let remote_item = server.insert_item("L1", "Cheese");
    feed.publish(&spec, item_event(&remote_item));
    settle().await;

    server.release(1);
    toggle.settled().await.expect("toggle confirmed");
    server.release(2);
    add.settled().await.expect_err("add failed");
    settle().await;

    let entry = session
        .client()
        .read(&shopping::list_key("L1"))
        .expect("entry");
    assert!(!entry.is_stale);
    assert_eq!(entry.value, server.items("L1"));
    assert!(entry.value.iter().all(|item| !is_temporary(&item.id)));
}

#[tokio::test]
async fn activity_pages_move_backward_without_duplicates() {
    let server = FakeServer::new();
    server.seed_activity("H1", 25);
    let (session, _feed) = session_with_page_size(&server, 10);
    let paginator = session.activity("H1", ActivityFilters::default());

    let mut pages = paginator.load().await.expect("first page");
    // A newer event lands between page loads; it must not shift older pages.
    server.push_activity("H1", "evt-new", support::BASE_TIME + std::time::Duration::from_secs(86_400));
    while pages.has_next_page() {
        pages = paginator.fetch_next_page().await.expect("next page");
    }

    assert_eq!(pages.pages.len(), 3);
    let ids: Vec<&str> = pages.items().map(|event| event.id.as_str()).collect();
    let unique: HashSet<&str> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 25);
    assert_eq!(unique.len(), ids.len(), "no event appears twice");

    let cursors: Vec<_> = pages.items().map(Cursored::cursor).collect();
    assert!(cursors.windows(2).all(|pair| pair[0] > pair[1]), "strictly newest first");

    for window in pages.pages.windows(2) {
        let boundary = window[0].next_cursor.as_ref().expect("earlier page has a cursor");
        assert!(window[1].items.iter().all(|event| event.cursor() < *boundary));
        if let Some(next) = window[1].next_cursor.as_ref() {
            assert!(next <= boundary);
        }
    }
    assert!(pages.pages.last().expect("pages").next_cursor.is_none());
}

#[tokio::test]
async fn activity_refresh_keeps_older_pages() {
    let server = FakeServer::new();
    server.seed_activity("H1", 15);
    let (session, _feed) = session_with_page_size(&server, 10);
    let paginator = session.activity("H1", ActivityFilters::default());
    paginator.load().await.expect("first page");
    paginator.fetch_next_page().await.expect("second page");

    server.push_activity("H1", "evt-new", support::BASE_TIME + std::time::Duration::from_secs(86_400));
    let pages = paginator.refresh_first_page().await.expect("refresh");

    assert_eq!(pages.pages.len(), 2);
    assert_eq!(pages.items().next().expect("items").id, "evt-new");
    assert_eq!(pages.pages[0].items.len(), 10);
    let ids: HashSet<&str> = pages.items().map(|event| event.id.as_str()).collect();
    assert_eq!(ids.len(), pages.items().count(), "refresh never duplicates an event");
    assert!(pages.pages[1].items.iter().any(|event| event.id == "evt-000"));
}

#[tokio::test]
async fn refetch_in_flight_when_a_toggle_starts_cannot_undo_it() {
    let server = FakeServer::new();
    let item = server.insert_item("L1", "Bread");
    let (session, _feed) = session(&server);
    let live = session.watch_shopping_list("L1").expect("watch list");
    live.load().await.expect("initial load");

    // Call 1 reads the unbought item now and answers after the toggle lands.
    server.hold_response(1);
    let key = shopping::list_key("L1");
    session
        .client()
        .invalidate(QueryMatcher::Exact(key.identity().clone()));
    server.wait_for_calls(2).await;

    let toggled = session
        .mutate(ToggleBought::new("L1", item.id.clone(), true))
        .await
        .expect("toggle confirmed");
    assert!(toggled.bought);
    settle().await;

    server.release(1);
    settle().await;

    let entry = live.current().expect("entry");
    assert!(!entry.is_stale);
    assert_eq!(entry.value, server.items("L1"));
    assert!(entry.value[0].bought, "response read before the toggle was discarded");
    assert_eq!(server.gets(), 3);
}

#[tokio::test]
async fn first_load_overlapping_a_failed_create_converges_to_server_data() {
    let server = FakeServer::new();
    let eggs = server.insert_item("L1", "Eggs");
    let (session, _feed) = session(&server);
    let live = session.watch_shopping_list("L1").expect("watch list");
    let key = shopping::list_key("L1");

    server.hold_response(0);
    server.gate(1);
    server.fail(1, SyncError::network("offline"));

    let scenario = async {
        server.wait_for_calls(1).await;
        let handle = session
            .start(AddShoppingItem::new(milk("L1")))
            .expect("create starts");
        server.wait_for_calls(2).await;

        server.release(0);
        while session.client().multiplexer().is_in_flight(key.identity()) {
            tokio::task::yield_now().await;
        }
        let held = session.client().read(&key).expect("optimistic entry").value;
        assert_eq!(held.len(), 1);
        assert!(is_temporary(&held[0].id));

        server.release(1);
        handle.settled().await.expect_err("create fails");
    };
    let (loaded, ()) = tokio::join!(live.load(), scenario);

    assert_eq!(
        loaded.expect("first load"),
        vec![eggs.clone()],
        "load returns the server response, not the optimistic value"
    );
    settle().await;

    let entry = live.current().expect("refetched after rollback");
    assert_eq!(entry.value, vec![eggs]);
    assert!(!entry.is_stale);
    assert_eq!(server.gets(), 2);
}
