//! Shared fixtures: an in-process household API and session builders.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hearth::application::error::SyncError;
use hearth::application::remote::{Method, RemoteRequest, RemoteTransport};
use hearth::application::session::SyncSession;
use hearth::cache::CacheConfig;
use hearth::domain::records::apply_shopping_patch;
use hearth::realtime::{InMemoryFeed, ReconnectPolicy};
use hearth_api_types::{ActivityRecord, NewShoppingItem, ShoppingItemPatch, ShoppingItemRecord};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::datetime;
use tokio::sync::Semaphore;

pub const BASE_TIME: OffsetDateTime = datetime!(2026-03-01 08:00:00 UTC);

#[derive(Default)]
struct Rows {
    items: Vec<ShoppingItemRecord>,
    activity: Vec<ActivityRecord>,
    next_id: usize,
}

/// Canonical server state plus per-call gates and scripted failures.
///
/// Calls are numbered from zero in the order they reach the server. A gated
/// call waits for [`FakeServer::release`] before touching any state. A call
/// with a held response is answered from the state at arrival and delivered
/// only once released.
#[derive(Default)]
pub struct FakeServer {
    rows: Mutex<Rows>,
    calls: AtomicUsize,
    gets: AtomicUsize,
    gated: Mutex<HashSet<usize>>,
    held: Mutex<HashSet<usize>>,
    gates: Mutex<HashMap<usize, Arc<Semaphore>>>,
    failures: Mutex<HashMap<usize, SyncError>>,
    log: Mutex<Vec<RemoteRequest>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ------------------------------------------------------------------------
    // Seeding and inspection
    // ------------------------------------------------------------------------

    pub fn insert_item(&self, list_id: &str, name: &str) -> ShoppingItemRecord {
        let mut rows = self.rows.lock().expect("rows");
        rows.next_id += 1;
        let created_at = BASE_TIME + Duration::from_secs(rows.next_id as u64);
        let record = ShoppingItemRecord {
            id: format!("item-{}", rows.next_id),
            list_id: list_id.to_string(),
            name: name.to_string(),
            quantity: None,
            category_id: None,
            bought: false,
            created_at,
            updated_at: created_at,
        };
        rows.items.push(record.clone());
        record
    }

    pub fn items(&self, list_id: &str) -> Vec<ShoppingItemRecord> {
        self.rows
            .lock()
            .expect("rows")
            .items
            .iter()
            .filter(|item| item.list_id == list_id)
            .cloned()
            .collect()
    }

    /// Append `count` events; every third event shares the previous
    /// timestamp so ordering has to fall back to the id.
    pub fn seed_activity(&self, household_id: &str, count: usize) {
        let mut rows = self.rows.lock().expect("rows");
        let mut at = BASE_TIME;
        for n in 0..count {
            if n % 3 != 2 {
                at += Duration::from_secs(60);
            }
            rows.activity.push(ActivityRecord {
                id: format!("evt-{n:03}"),
                household_id: household_id.to_string(),
                actor_id: if n % 2 == 0 { "ana" } else { "ben" }.to_string(),
                kind: "item_added".to_string(),
                summary: format!("event {n}"),
                entity_id: None,
                created_at: at,
            });
        }
    }

    pub fn push_activity(&self, household_id: &str, id: &str, created_at: OffsetDateTime) {
        self.rows.lock().expect("rows").activity.push(ActivityRecord {
            id: id.to_string(),
            household_id: household_id.to_string(),
            actor_id: "ana".to_string(),
            kind: "task_moved".to_string(),
            summary: id.to_string(),
            entity_id: None,
            created_at,
        });
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.log.lock().expect("log").clone()
    }

    // ------------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------------

    /// Make call number `call` wait until released.
    pub fn gate(&self, call: usize) {
        self.gated.lock().expect("gated").insert(call);
    }

    /// Answer call number `call` on arrival but deliver it only when released.
    pub fn hold_response(&self, call: usize) {
        self.held.lock().expect("held").insert(call);
    }

    pub fn release(&self, call: usize) {
        self.semaphore(call).add_permits(1);
    }

    /// Answer call number `call` with `error` instead of applying it.
    pub fn fail(&self, call: usize, error: SyncError) {
        self.failures.lock().expect("failures").insert(call, error);
    }

    /// Yield until at least `count` calls have reached the server.
    pub async fn wait_for_calls(&self, count: usize) {
        for _ in 0..256 {
            if self.calls() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("server saw {} calls, expected {count}", self.calls());
    }

    async fn wait_for_release(&self, call: usize) {
        self.semaphore(call)
            .acquire()
            .await
            .expect("gate semaphore stays open")
            .forget();
    }

    fn respond(&self, call: usize, request: &RemoteRequest) -> Result<Value, SyncError> {
        let failure = self.failures.lock().expect("failures").remove(&call);
        match failure {
            Some(error) => Err(error),
            None => self.handle(request),
        }
    }

    fn semaphore(&self, call: usize) -> Arc<Semaphore> {
        Arc::clone(
            self.gates
                .lock()
                .expect("gates")
                .entry(call)
                .or_insert_with(|| Arc::new(Semaphore::new(0))),
        )
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    fn handle(&self, request: &RemoteRequest) -> Result<Value, SyncError> {
        let segments: Vec<&str> = request.path.trim_matches('/').split('/').collect();
        match (request.method, segments.as_slice()) {
            (Method::Get, ["shopping_items"]) => {
                let list_id = eq_param(request, "list_id")?;
                to_json(&self.items(&list_id))
            }
            (Method::Post, ["shopping_items"]) => {
                let body: NewShoppingItem = body(request)?;
                let mut record = self.insert_item(&body.list_id, &body.name);
                record.quantity = body.quantity;
                record.category_id = body.category_id;
                self.store_item(&record);
                to_json(&record)
            }
            (Method::Patch, ["shopping_items", id]) => {
                let patch: ShoppingItemPatch = body(request)?;
                let mut rows = self.rows.lock().expect("rows");
                let item = rows
                    .items
                    .iter_mut()
                    .find(|item| item.id == *id)
                    .ok_or_else(|| SyncError::rejected(404, "item not found"))?;
                *item = apply_shopping_patch(item, &patch);
                to_json(&*item)
            }
            (Method::Delete, ["shopping_items", id]) => {
                let mut rows = self.rows.lock().expect("rows");
                let before = rows.items.len();
                rows.items.retain(|item| item.id != *id);
                if rows.items.len() == before {
                    return Err(SyncError::rejected(404, "item not found"));
                }
                Ok(Value::Null)
            }
            (Method::Delete, ["shopping_items"]) => {
                let list_id = eq_param(request, "list_id")?;
                let mut rows = self.rows.lock().expect("rows");
                let (deleted, kept): (Vec<_>, Vec<_>) = rows
                    .items
                    .drain(..)
                    .partition(|item| item.list_id == list_id && item.bought);
                rows.items = kept;
                to_json(&deleted)
            }
            (Method::Get, ["activity_events"]) => self.activity_page(request),
            _ => Err(SyncError::rejected(404, format!("no route for {request}"))),
        }
    }

    fn store_item(&self, record: &ShoppingItemRecord) {
        let mut rows = self.rows.lock().expect("rows");
        if let Some(item) = rows.items.iter_mut().find(|item| item.id == record.id) {
            *item = record.clone();
        }
    }

    fn activity_page(&self, request: &RemoteRequest) -> Result<Value, SyncError> {
        let household_id = eq_param(request, "household_id")?;
        let limit: usize = param(request, "limit")
            .and_then(|limit| limit.parse().ok())
            .ok_or_else(|| SyncError::rejected(400, "limit is required"))?;
        let before = match param(request, "before") {
            Some(raw) => {
                let at = OffsetDateTime::parse(&raw, &Rfc3339)
                    .map_err(|err| SyncError::rejected(400, err.to_string()))?;
                let id = param(request, "before_id").unwrap_or_default();
                Some((at, id))
            }
            None => None,
        };

        let mut events: Vec<ActivityRecord> = self
            .rows
            .lock()
            .expect("rows")
            .activity
            .iter()
            .filter(|event| event.household_id == household_id)
            .filter(|event| match &before {
                Some((at, id)) => (event.created_at, event.id.as_str()) < (*at, id.as_str()),
                None => true,
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        events.truncate(limit);
        to_json(&events)
    }
}

#[async_trait]
impl RemoteTransport for FakeServer {
    async fn send(&self, request: RemoteRequest) -> Result<Value, SyncError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().expect("log").push(request.clone());
        if request.method == Method::Get {
            self.gets.fetch_add(1, Ordering::SeqCst);
        }

        let held = self.held.lock().expect("held").contains(&call);
        if held {
            let response = self.respond(call, &request);
            self.wait_for_release(call).await;
            return response;
        }
        let gated = self.gated.lock().expect("gated").contains(&call);
        if gated {
            self.wait_for_release(call).await;
        }
        self.respond(call, &request)
    }
}

fn param(request: &RemoteRequest, name: &str) -> Option<String> {
    request
        .query
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}

fn eq_param(request: &RemoteRequest, name: &str) -> Result<String, SyncError> {
    param(request, name)
        .and_then(|value| value.strip_prefix("eq.").map(str::to_string))
        .ok_or_else(|| SyncError::rejected(400, format!("{name} filter is required")))
}

fn body<T: serde::de::DeserializeOwned>(request: &RemoteRequest) -> Result<T, SyncError> {
    let value = request.body.clone().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|err| SyncError::rejected(400, err.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, SyncError> {
    serde_json::to_value(value).map_err(|err| SyncError::rejected(500, err.to_string()))
}

// ============================================================================
// Sessions
// ============================================================================

pub fn session(server: &Arc<FakeServer>) -> (SyncSession, InMemoryFeed) {
    session_with_page_size(server, 20)
}

pub fn session_with_page_size(server: &Arc<FakeServer>, page_size: usize) -> (SyncSession, InMemoryFeed) {
    let feed = InMemoryFeed::new();
    let session = SyncSession::new(
        CacheConfig::default(),
        Arc::clone(server) as Arc<dyn RemoteTransport>,
        Arc::new(feed.clone()),
        ReconnectPolicy::default(),
        page_size,
    );
    (session, feed)
}

/// Let spawned settle, dispatch and refetch tasks run to completion.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub fn item_event(record: &ShoppingItemRecord) -> hearth_api_types::ChangeEvent {
    hearth_api_types::ChangeEvent::new(
        hearth_api_types::ChangeKind::Update,
        "shopping_items",
        json!(record),
    )
}
