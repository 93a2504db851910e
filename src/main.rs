use std::{process, sync::Arc};

use hearth::{
    application::{
        error::AppError,
        remote::RemoteTransport,
        session::{LiveQuery, SyncSession},
        shopping::{AddShoppingItem, ToggleBought},
    },
    cache::CacheConfig,
    config::{self, ActivityArgs, AddItemArgs, Command, Settings, SyncArgs, ToggleItemArgs},
    infra::{error::InfraError, http::HttpTransport, telemetry, ws::WsFeedTransport},
    realtime::{FeedTransport, ReconnectPolicy},
};
use hearth_api_types::{ActivityFilters, NewShoppingItem};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use tokio::task::JoinHandle;
use tracing::{Dispatch, Level, debug, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let session = build_session(&settings)?;
    match cli_args.command {
        Command::Sync(args) => run_sync(&session, args).await,
        Command::Activity(args) => run_activity(&session, args).await,
        Command::AddItem(args) => run_add_item(&session, args).await,
        Command::ToggleItem(args) => run_toggle_item(&session, args).await,
    }
}

fn build_session(settings: &Settings) -> Result<SyncSession, AppError> {
    let remote: Arc<dyn RemoteTransport> = Arc::new(HttpTransport::new(&settings.remote)?);
    let feed: Arc<dyn FeedTransport> = Arc::new(WsFeedTransport::new(&settings.remote));
    info!(
        base_url = %settings.remote.base_url,
        feed_url = %settings.remote.feed_url,
        "Session configured"
    );
    Ok(SyncSession::new(
        CacheConfig::from(settings),
        remote,
        feed,
        ReconnectPolicy::from(&settings.realtime),
        settings.activity.page_size,
    ))
}

async fn run_sync(session: &SyncSession, args: SyncArgs) -> Result<(), AppError> {
    let gc = session.client().spawn_gc();
    let mut followers: Vec<JoinHandle<()>> = Vec::new();

    let categories = session.watch_categories(&args.household)?;
    let loaded = categories.load().await?;
    info!(household = %args.household, count = loaded.len(), "Categories loaded");
    followers.push(follow(format!("categories/{}", args.household), categories, Vec::len));

    for list_id in &args.lists {
        let list = session.watch_shopping_list(list_id)?;
        let items = list.load().await?;
        let open = items.iter().filter(|item| !item.bought).count();
        info!(list = %list_id, items = items.len(), open, "Shopping list loaded");
        followers.push(follow(format!("shopping/{list_id}"), list, Vec::len));
    }

    for board_id in &args.boards {
        let board = session.watch_task_board(board_id)?;
        let tasks = board.load().await?;
        info!(board = %board_id, tasks = tasks.len(), "Task board loaded");
        followers.push(follow(format!("tasks/{board_id}"), board, Vec::len));
    }

    let feed = session.watch_activity(&args.household, ActivityFilters::default())?;
    let pages = feed.load().await?;
    info!(events = pages.items().count(), more = pages.has_next_page(), "Activity loaded");

    info!(queries = followers.len() + 1, "Following change feed; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.map_err(InfraError::from)?;

    info!("Shutting down");
    for follower in followers {
        follower.abort();
    }
    drop(feed);
    gc.abort();
    Ok(())
}

/// Log every change of a live query until it is dropped.
fn follow<T>(label: String, mut live: LiveQuery<T>, size: fn(&T) -> usize) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = live.subscription().wait_open().await {
            warn!(query = %label, error = %err, "Change feed unavailable");
        }
        while let Some(entry) = live.changed().await {
            if entry.is_stale {
                debug!(query = %label, "Marked stale");
            } else {
                info!(query = %label, size = size(&entry.value), "Cache updated");
            }
        }
        debug!(query = %label, "Stopped following");
    })
}

async fn run_activity(session: &SyncSession, args: ActivityArgs) -> Result<(), AppError> {
    let filters = ActivityFilters {
        kind: args.kind,
        actor_id: args.actor,
    };
    let paginator = session.activity(&args.household, filters);

    let mut pages = paginator.load().await?;
    for _ in 1..args.pages {
        if !pages.has_next_page() {
            break;
        }
        pages = paginator.fetch_next_page().await?;
    }

    for event in pages.items() {
        let when = event
            .created_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| event.created_at.to_string());
        println!("{when}  {:<12} {:<12} {}", event.kind, event.actor_id, event.summary);
    }
    if pages.has_next_page() {
        info!("More events available; raise --pages to see them");
    }
    Ok(())
}

async fn run_add_item(session: &SyncSession, args: AddItemArgs) -> Result<(), AppError> {
    let existing = session.shopping_list(&args.list).await?;
    debug!(list = %args.list, items = existing.len(), "Shopping list loaded");

    let record = session
        .mutate(AddShoppingItem::new(NewShoppingItem {
            list_id: args.list,
            name: args.name,
            quantity: args.quantity,
            category_id: None,
        }))
        .await?;
    print_json(&record)
}

async fn run_toggle_item(session: &SyncSession, args: ToggleItemArgs) -> Result<(), AppError> {
    let record = session
        .mutate(ToggleBought::new(args.list, args.item, args.bought))
        .await?;
    print_json(&record)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
