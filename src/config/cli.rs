use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the hearth binary.
#[derive(Debug, Parser)]
#[command(name = "hearth", version, about = "Household sync client")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "HEARTH_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Load household data, follow the change feed and log cache changes until Ctrl-C.
    Sync(SyncArgs),
    /// Page backward through the household activity feed.
    Activity(ActivityArgs),
    /// Add an item to a shopping list.
    #[command(name = "add-item")]
    AddItem(AddItemArgs),
    /// Mark a shopping item bought or not bought.
    #[command(name = "toggle-item")]
    ToggleItem(ToggleItemArgs),
}

/// Overrides applied after file and environment sources.
#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Base URL of the household API.
    #[arg(long = "base-url", value_name = "URL", value_hint = ValueHint::Url)]
    pub base_url: Option<String>,

    /// URL of the realtime change feed.
    #[arg(long = "feed-url", value_name = "URL", value_hint = ValueHint::Url)]
    pub feed_url: Option<String>,

    /// Bearer token sent with every request.
    #[arg(long = "api-key", env = "HEARTH_API_KEY", value_name = "TOKEN", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Request timeout in seconds.
    #[arg(long = "request-timeout-seconds", value_name = "SECONDS")]
    pub request_timeout_seconds: Option<u64>,

    /// Log level filter (e.g. info, debug).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long = "log-json", value_name = "BOOL", value_parser = BoolishValueParser::new())]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct SyncArgs {
    /// Household whose categories and activity are loaded.
    #[arg(long, value_name = "ID")]
    pub household: String,

    /// Shopping list to follow; repeatable.
    #[arg(long = "list", value_name = "ID")]
    pub lists: Vec<String>,

    /// Task board to follow; repeatable.
    #[arg(long = "board", value_name = "ID")]
    pub boards: Vec<String>,
}

#[derive(Debug, Args, Clone)]
pub struct ActivityArgs {
    #[arg(long, value_name = "ID")]
    pub household: String,

    /// Number of pages to load.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub pages: u32,

    /// Only events of this kind.
    #[arg(long, value_name = "KIND")]
    pub kind: Option<String>,

    /// Only events by this household member.
    #[arg(long = "actor", value_name = "ID")]
    pub actor: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct AddItemArgs {
    #[arg(long = "list", value_name = "ID")]
    pub list: String,

    #[arg(long, value_name = "NAME")]
    pub name: String,

    #[arg(long, value_name = "QUANTITY")]
    pub quantity: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct ToggleItemArgs {
    #[arg(long = "list", value_name = "ID")]
    pub list: String,

    #[arg(long = "item", value_name = "ID")]
    pub item: String,

    #[arg(
        long,
        value_name = "BOOL",
        action = clap::ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub bought: bool,
}
