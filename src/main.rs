use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use datacache::cache::{
  AnalyticsSlot, CacheResult, CacheSource, DataCache, HistorySlot, RecentsSlot, UserStatsSlot,
};
use datacache::config::Config;
use datacache::records::HistoryItem;
use datacache::remote::MemoryStore;
use datacache::storage::{SqliteBackend, StorageManager};

#[derive(Parser, Debug)]
#[command(name = "datacache")]
#[command(about = "Inspect and exercise the analysis record cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/datacache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// User whose session is opened
  #[arg(short, long, default_value = "demo")]
  user: String,

  /// JSON file served as the remote store
  #[arg(short, long)]
  fixture: Option<PathBuf>,

  /// SQLite storage file (default: $XDG_DATA_HOME/datacache/storage.db)
  #[arg(long)]
  db: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show the first page of history
  History {
    /// Skip the cache and fetch from the remote store
    #[arg(long)]
    force: bool,
  },
  /// Show aggregate analytics
  Analytics,
  /// Show per-user counters
  Stats,
  /// Show the most recent analyses
  Recents,
  /// Load the next page of history
  More,
  /// Show storage usage against the quota
  StorageStats,
  /// List stored keys with size and last access
  StorageItems,
  /// Evict items until usage is below the warning threshold
  Cleanup,
  /// Re-encode stored values through the compression codec
  Optimize,
  /// Drop every cache of the user
  Clear,
}

fn init_logging(verbose: bool, log_dir: &Path) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_env("DATACACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  if verbose {
    tracing_subscriber::registry()
      .with(filter)
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .try_init()
      .map_err(|e| eyre!("Failed to init logging: {}", e))?;
    return Ok(None);
  }

  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;
  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, "datacache.log"));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to init logging: {}", e))?;
  Ok(Some(guard))
}

fn print_items(items: &[HistoryItem]) {
  if items.is_empty() {
    println!("(no analyses)");
  }
  for item in items {
    println!(
      "{:<12} {}  {:<22} {:<20} {:<9} {:>10.2}  {:?}",
      item.id,
      item.created_at.format("%Y-%m-%d %H:%M"),
      item.vehicle.as_deref().unwrap_or("-"),
      item.damage_type,
      item.severity.as_str(),
      item.estimated_cost,
      item.status,
    );
  }
}

fn print_source<T>(result: &CacheResult<T>) {
  let cached_at = result
    .cached_at
    .map(|at| format!(" (cached {})", at.format("%Y-%m-%d %H:%M:%S")))
    .unwrap_or_default();
  println!("\nsource: {:?}{}", result.source, cached_at);
  if result.source == CacheSource::CacheStale {
    println!("stale entry; a refresh was scheduled");
  }
  if result.source.is_degraded() {
    println!("remote store unavailable; see the log for details");
  }
}

async fn run(cache: &DataCache, storage: &StorageManager, command: Command) -> Result<()> {
  match command {
    Command::History { force } => {
      let result = cache.get_with_source::<HistorySlot>(force).await;
      print_items(&result.data);
      print_source(&result);
      if cache.has_more_history() {
        println!("more available: run `datacache more`");
      }
    }
    Command::Analytics => {
      let result = cache.get_with_source::<AnalyticsSlot>(false).await;
      let analytics = &result.data;
      println!("analyses:       {}", analytics.total_analyses);
      println!("total cost:     {:.2}", analytics.total_estimated_cost);
      println!("average cost:   {:.2}", analytics.average_cost);
      for (severity, count) in &analytics.by_severity {
        println!("  {:<12} {}", severity, count);
      }
      for (month, count) in &analytics.by_month {
        println!("  {:<12} {}", month, count);
      }
      print_source(&result);
    }
    Command::Stats => {
      let result = cache.get_with_source::<UserStatsSlot>(false).await;
      let stats = &result.data;
      println!("analyses:       {}", stats.total_analyses);
      println!("completed:      {}", stats.completed);
      println!("pending:        {}", stats.pending);
      if let Some(last) = stats.last_activity {
        println!("last activity:  {}", last.format("%Y-%m-%d %H:%M"));
      }
      print_source(&result);
    }
    Command::Recents => {
      let result = cache.get_with_source::<RecentsSlot>(false).await;
      print_items(&result.data);
      print_source(&result);
    }
    Command::More => {
      // The next page continues from the pages already loaded in this session.
      cache.get_history(false).await;
      let items = cache.load_more_history().await;
      print_items(&items);
      println!(
        "\n{} analyses loaded{}",
        items.len(),
        if cache.has_more_history() { ", more available" } else { "" }
      );
    }
    Command::StorageStats => {
      let stats = storage.get_storage_stats();
      println!("used:       {} bytes", stats.used);
      println!("available:  {} bytes", stats.available);
      println!("quota:      {} bytes", stats.quota);
      println!("usage:      {:.1}%", stats.percentage);
    }
    Command::StorageItems => {
      for item in storage.list_items() {
        println!(
          "{:>9}  {}  {}  {}",
          item.size,
          item.last_accessed.format("%Y-%m-%d %H:%M:%S"),
          if item.compressed { "z" } else { "-" },
          item.key,
        );
      }
    }
    Command::Cleanup => {
      let report = storage.cleanup_storage();
      println!(
        "evicted {} items, freed {} bytes",
        report.evicted.len(),
        report.freed
      );
    }
    Command::Optimize => {
      let count = storage.optimize_storage();
      println!("re-encoded {} items", count);
    }
    Command::Clear => {
      cache.clear_all();
      println!("cleared caches of {}", cache.user_id().unwrap_or_default());
    }
  }

  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;

  let db_path = match args.db {
    Some(path) => path,
    None => Config::default_db_path()?,
  };
  let data_dir = db_path
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_else(|| PathBuf::from("."));
  let _guard = init_logging(args.verbose, &data_dir)?;

  let backend = SqliteBackend::open(&db_path, config.storage.quota_bytes)?;
  let storage = Arc::new(StorageManager::new(Arc::new(backend), config.storage.clone()));

  let remote = match &args.fixture {
    Some(path) => MemoryStore::from_json_file(path)?,
    None => {
      warn!("No fixture given, the remote store is empty");
      MemoryStore::new()
    }
  };

  let cache = DataCache::new(Arc::new(remote), Arc::clone(&storage), &config);
  cache.start_session(&args.user);

  run(&cache, &storage, args.command).await
}
