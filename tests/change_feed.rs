//! Change-feed subscriptions driving cache invalidation, over the in-memory
//! hub and over a real WebSocket.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hearth::application::activity;
use hearth::application::remote::RemoteTransport;
use hearth::application::session::SyncSession;
use hearth::application::shopping;
use hearth::cache::CacheConfig;
use hearth::config::Settings;
use hearth::infra::ws::WsFeedTransport;
use hearth::realtime::{ChannelSpec, ChannelState, FeedTransport, ReconnectPolicy};
use hearth_api_types::{ActivityFilters, ChangeEvent, ChangeKind, ChannelMessage};
use serde_json::json;
use support::{FakeServer, item_event, session, settle};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use url::Url;

fn list_spec(list_id: &str) -> ChannelSpec {
    ChannelSpec::filtered(shopping::TABLE, shopping::list_filter(list_id))
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

// ============================================================================
// In-memory hub
// ============================================================================

#[tokio::test]
async fn pushed_change_refetches_the_bound_list() {
    let server = FakeServer::new();
    server.insert_item("L1", "Milk");
    let (session, feed) = session(&server);
    let mut live = session.watch_shopping_list("L1").expect("watch list");
    live.load().await.expect("initial load");
    live.subscription().wait_open().await.expect("channel opens");
    let stale_marks = session.client().store().stats().stale_marks;

    let added = server.insert_item("L1", "Bread");
    feed.publish(&list_spec("L1"), item_event(&added));

    let fresh = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let entry = live.changed().await.expect("entry kept");
            if !entry.is_stale && entry.value.len() == 2 {
                break entry;
            }
        }
    })
    .await
    .expect("refetched list observed");
    assert_eq!(fresh.value, server.items("L1"));
    assert_eq!(session.client().store().stats().stale_marks - stale_marks, 1);
    assert_eq!(server.gets(), 2);
}

#[tokio::test]
async fn events_outside_the_filter_are_ignored() {
    let server = FakeServer::new();
    server.insert_item("L1", "Milk");
    let (session, feed) = session(&server);
    let live = session.watch_shopping_list("L1").expect("watch list");
    live.load().await.expect("initial load");
    live.subscription().wait_open().await.expect("channel opens");

    let mut outside = ChangeEvent::new(ChangeKind::Delete, shopping::TABLE, json!({ "id": "x" }));
    outside.filter_match = false;
    feed.publish(&list_spec("L1"), outside);
    feed.publish(
        &list_spec("L1"),
        ChangeEvent::new(ChangeKind::Insert, "tasks", json!({ "id": "t1" })),
    );
    settle().await;

    assert_eq!(server.gets(), 1);
    assert!(!live.current().expect("entry").is_stale);
}

#[tokio::test]
async fn consumers_of_one_list_share_a_channel_until_the_last_leaves() {
    let server = FakeServer::new();
    let (session, feed) = session(&server);
    let first = session.watch_shopping_list("L1").expect("first watch");
    let second = session.watch_shopping_list("L1").expect("second watch");
    first.subscription().wait_open().await.expect("channel opens");
    second.subscription().wait_open().await.expect("channel opens");

    assert_eq!(session.feed().channel_count(), 1);
    assert_eq!(feed.opens(), 1);
    assert_eq!(feed.open_channels(&list_spec("L1")), 1);

    drop(first);
    settle().await;
    assert_eq!(feed.open_channels(&list_spec("L1")), 1);
    assert_eq!(second.subscription().state(), ChannelState::Open);

    second.close();
    second.close();
    settle().await;
    assert_eq!(feed.open_channels(&list_spec("L1")), 0);
    assert_eq!(feed.closes(), 1);
    assert_eq!(session.feed().channel_count(), 0);
}

#[tokio::test]
async fn unmount_during_handshake_still_releases_the_channel() {
    let server = FakeServer::new();
    let (session, feed) = session(&server);
    feed.pause_opens();

    let live = session.watch_shopping_list("L1").expect("watch list");
    settle().await;
    assert_eq!(live.subscription().state(), ChannelState::Connecting);
    drop(live);

    feed.resume_opens();
    settle().await;
    assert_eq!(feed.opens(), 1);
    assert_eq!(feed.closes(), 1);
    assert_eq!(feed.open_channels(&list_spec("L1")), 0);
}

#[tokio::test]
async fn blank_filter_opens_nothing() {
    let server = FakeServer::new();
    let (session, feed) = session(&server);

    let handle = session
        .feed()
        .subscribe(
            ChannelSpec::filtered(shopping::TABLE, "  "),
            vec![shopping::list_key("L1").identity().clone()],
        )
        .expect("inert handle");

    assert!(handle.is_inert());
    handle.wait_open().await.expect("inert handles are ready");
    settle().await;
    assert_eq!(feed.opens(), 0);
    assert_eq!(session.feed().channel_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn lost_channel_reconnects_and_refetches() {
    let server = FakeServer::new();
    server.insert_item("L1", "Milk");
    let (session, feed) = session(&server);
    let live = session.watch_shopping_list("L1").expect("watch list");
    live.load().await.expect("initial load");
    live.subscription().wait_open().await.expect("channel opens");

    feed.fail_next_opens(1);
    assert_eq!(feed.disconnect(&list_spec("L1")), 1);
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;

    assert_eq!(feed.opens(), 2);
    assert_eq!(live.subscription().state(), ChannelState::Open);
    assert_eq!(server.gets(), 2, "missed events are covered by one refetch");
    assert!(!live.current().expect("entry").is_stale);
}

#[tokio::test]
async fn activity_push_refreshes_the_first_page() {
    let server = FakeServer::new();
    server.seed_activity("H1", 5);
    let (session, feed) = session(&server);
    let live = session
        .watch_activity("H1", ActivityFilters::default())
        .expect("watch activity");
    live.load().await.expect("first page");
    live.query().subscription().wait_open().await.expect("channel opens");

    server.push_activity("H1", "evt-new", support::BASE_TIME + Duration::from_secs(86_400));
    feed.publish(
        &ChannelSpec::filtered(activity::TABLE, activity::household_filter("H1")),
        ChangeEvent::new(ChangeKind::Insert, activity::TABLE, json!({ "id": "evt-new" })),
    );
    settle().await;

    let pages = live.query().current().expect("pages cached").value;
    assert_eq!(pages.items().next().expect("items").id, "evt-new");
    assert_eq!(pages.items().count(), 6);
}

// ============================================================================
// WebSocket transport
// ============================================================================

struct RealtimeLog {
    authorization: Option<String>,
    control: Vec<ChannelMessage>,
}

/// Accept one socket, acknowledge its join, forward pushed frames and
/// record control frames until the client leaves.
async fn realtime_server(listener: TcpListener, mut pushes: mpsc::Receiver<String>) -> RealtimeLog {
    let (stream, _) = listener.accept().await.expect("client connects");
    let authorization = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&authorization);
    let mut socket = accept_hdr_async(
        stream,
        move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            *seen.lock().expect("authorization") = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            Ok(response)
        },
    )
    .await
    .expect("websocket handshake");

    let mut control = Vec::new();
    loop {
        tokio::select! {
            Some(text) = pushes.recv() => {
                socket.send(Message::Text(text)).await.expect("push frame");
            }
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let message: ChannelMessage =
                        serde_json::from_str(&text).expect("client sends control frames");
                    if let ChannelMessage::Join { channel, .. } = &message {
                        let ack = ChannelMessage::JoinAck { channel: channel.clone() };
                        let ack = serde_json::to_string(&ack).expect("ack encodes");
                        socket.send(Message::Text(ack)).await.expect("ack frame");
                    }
                    let leaving = matches!(message, ChannelMessage::Leave { .. });
                    control.push(message);
                    if leaving {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }

    let authorization = authorization.lock().expect("authorization").clone();
    RealtimeLog {
        authorization,
        control,
    }
}

#[tokio::test]
async fn websocket_channel_joins_forwards_events_and_leaves() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (push_tx, push_rx) = mpsc::channel(4);
    let realtime = tokio::spawn(realtime_server(listener, push_rx));

    let mut remote = Settings::defaults().expect("defaults are valid").remote;
    remote.feed_url = Url::parse(&format!("ws://{addr}/realtime")).expect("feed url");
    remote.api_key = Some("secret-key".to_string());

    let server = FakeServer::new();
    let item = server.insert_item("L1", "Milk");
    let session = SyncSession::new(
        CacheConfig::default(),
        Arc::clone(&server) as Arc<dyn RemoteTransport>,
        Arc::new(WsFeedTransport::new(&remote)),
        ReconnectPolicy::default(),
        20,
    );

    let live = session.watch_shopping_list("L1").expect("watch list");
    live.load().await.expect("initial load");
    live.subscription().wait_open().await.expect("join acknowledged");

    let event = serde_json::to_string(&item_event(&item)).expect("event encodes");
    push_tx.send(event).await.expect("server task running");
    wait_until("refetch after push", || server.gets() >= 2).await;

    live.close();
    let log = tokio::time::timeout(Duration::from_secs(5), realtime)
        .await
        .expect("server sees the leave")
        .expect("server task completes");

    let channel = "realtime:shopping_items:list_id=eq.L1".to_string();
    assert_eq!(log.authorization.as_deref(), Some("Bearer secret-key"));
    assert_eq!(
        log.control,
        vec![
            ChannelMessage::Join {
                channel: channel.clone(),
                table: "shopping_items".to_string(),
                filter: Some("list_id=eq.L1".to_string()),
            },
            ChannelMessage::Leave { channel },
        ]
    );
}

#[tokio::test]
async fn websocket_open_fails_when_nothing_listens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let mut remote = Settings::defaults().expect("defaults are valid").remote;
    remote.feed_url = Url::parse(&format!("ws://{addr}/realtime")).expect("feed url");
    let transport = WsFeedTransport::new(&remote);

    let err = transport
        .open(&list_spec("L1"))
        .await
        .expect_err("connection refused");
    assert_eq!(err.kind(), "network");
}
