use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use feedkeep::config::{Config, StoreKind};
use feedkeep::ingest::{Ingestor, RefreshOutcome, RefreshReport};
use feedkeep::storage::SearchParams;

/// Get the config directory path (~/.config/feedkeep/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedkeep"))
}

/// Creates the config directory if needed, restricted to the current user.
fn ensure_config_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create config directory '{}'", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "feedkeep", version, about = "RSS ingestion, deduplication and search")]
struct Args {
    /// Config file (default: ~/.config/feedkeep/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Storage backend, overriding the config file
    #[arg(long, global = true, value_name = "sqlite|json")]
    store: Option<StoreKind>,

    /// Act for this subscriber: its subscriptions and its own read marks
    #[arg(long, global = true, value_name = "NAME")]
    subject: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed and store its current items
    Add { url: String },

    /// Re-fetch every feed that is due
    Refresh,

    /// List subscribed feeds
    List,

    /// Show one feed
    Show { id: String },

    /// Search stored items (unread only unless --all)
    Search {
        /// Case-insensitive substring of title, description, author or category
        #[arg(long, short)]
        query: Option<String>,

        /// Include items already read
        #[arg(long)]
        all: bool,

        /// Earliest publication day, YYYY-MM-DD (inclusive)
        #[arg(long)]
        from: Option<String>,

        /// Latest publication day, YYYY-MM-DD (inclusive)
        #[arg(long)]
        to: Option<String>,

        /// asc or desc by publication date
        #[arg(long)]
        sort: Option<String>,

        /// Page size, 1-100
        #[arg(long)]
        limit: Option<String>,

        #[arg(long)]
        offset: Option<String>,
    },

    /// Mark an item read
    Read { id: String },

    /// Mark an item unread
    Unread { id: String },

    /// Remove a feed and its items, or with --subject unsubscribe from it
    Delete { id: String },

    /// Delete every feed and item
    Nuke {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{out}");
    Ok(())
}

fn refresh_json(report: &RefreshReport) -> serde_json::Value {
    let feeds: Vec<_> = report
        .outcomes
        .iter()
        .map(|r| {
            let (status, detail) = match &r.outcome {
                RefreshOutcome::Skipped => ("skipped", json!(null)),
                RefreshOutcome::Cancelled => ("cancelled", json!(null)),
                RefreshOutcome::Refreshed(save) => ("refreshed", json!(save)),
                RefreshOutcome::Failed(e) => ("failed", json!(e.to_string())),
            };
            json!({ "feed_id": r.feed_id, "url": r.url, "status": status, "detail": detail })
        })
        .collect();

    json!({
        "refreshed": report.refreshed(),
        "skipped": report.skipped(),
        "failed": report.failed(),
        "inserted": report.inserted(),
        "feeds": feeds,
    })
}

async fn run(ingestor: &Ingestor, command: Command, cancel: &CancellationToken) -> Result<()> {
    match command {
        Command::Add { url } => {
            let report = ingestor
                .add_feed(&url, cancel)
                .await
                .with_context(|| format!("Failed to add feed '{url}'"))?;
            print_json(&report)
        }
        Command::Refresh => {
            let report = ingestor.refresh_all(cancel).await.context("Refresh failed")?;
            print_json(&refresh_json(&report))
        }
        Command::List => print_json(&ingestor.list_feeds().await?),
        Command::Show { id } => print_json(&ingestor.get_feed(&id).await?),
        Command::Search {
            query,
            all,
            from,
            to,
            sort,
            limit,
            offset,
        } => {
            let spec = SearchParams {
                query,
                unread: all.then(|| "0".to_string()),
                subject: ingestor.subject().map(str::to_string),
                from,
                to,
                sort,
                limit,
                offset,
            }
            .into_spec()?;
            print_json(&ingestor.search_items(&spec).await?)
        }
        Command::Read { id } => print_json(&ingestor.mark_item_read(&id, true).await?),
        Command::Unread { id } => print_json(&ingestor.mark_item_read(&id, false).await?),
        Command::Delete { id } => {
            ingestor.delete_feed(&id).await?;
            print_json(&json!({ "deleted": id }))
        }
        Command::Nuke { yes } => {
            if !yes {
                anyhow::bail!("Refusing to delete all data without --yes");
            }
            ingestor.nuke().await?;
            print_json(&json!({ "nuked": true }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let (config_path, config_dir) = match &args.config {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (path.clone(), dir)
        }
        None => {
            let dir = get_config_dir()?;
            ensure_config_dir(&dir)?;
            (dir.join("config.toml"), dir)
        }
    };

    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?
        .resolve_paths(&config_dir);
    if let Some(store) = args.store {
        config.store = store;
    }

    let store = config.open_store().await.context("Failed to open feed store")?;
    let mut ingestor = config.ingestor(store).context("Failed to build HTTP client")?;
    if let Some(subject) = args.subject.filter(|s| !s.is_empty()) {
        ingestor = ingestor.for_subject(subject);
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling in-flight fetches");
            ctrl_c.cancel();
        }
    });

    run(&ingestor, args.command, &cancel).await
}
