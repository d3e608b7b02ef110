use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use paperstash::cache::{CacheSource, CacheStorage, ContentCache, NoopStorage, Payload, SqliteStorage};
use paperstash::config::{Config, LogConfig};
use paperstash::fetch::DocumentFetcher;

#[derive(Parser, Debug)]
#[command(name = "paperstash")]
#[command(about = "Local cache for paper PDFs and their locators")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/paperstash/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Cache a locator or a local file under a document id
  Put {
    id: String,
    /// Remote locator to remember
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    url: Option<String>,
    /// Local file whose bytes should be cached
    #[arg(long)]
    file: Option<PathBuf>,
  },
  /// Read a cached document
  Get {
    id: String,
    /// Where to write blob content (default: the cached filename)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Drop a cached document
  Rm { id: String },
  /// Run an eviction sweep now
  Evict,
  /// List cached documents
  Ls {
    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
  },
  /// Show cache totals
  Stats,
  /// Get a document from the cache, downloading it on a miss
  Fetch {
    id: String,
    locator: String,
    /// Where to write the document (default: the remote filename)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(&config.log)?;

  if config.cache.enabled {
    let path = config.cache.db_path()?;
    tracing::debug!("Using cache database {}", path.display());
    let storage = SqliteStorage::open_at(&path)?;
    run(build_cache(storage, &config), args.command, &config).await
  } else {
    tracing::info!("Caching disabled; every lookup will miss");
    run(build_cache(NoopStorage, &config), args.command, &config).await
  }
}

/// Set up tracing. The returned guard flushes the log file on drop.
fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = match EnvFilter::try_from_default_env() {
    Ok(filter) => filter,
    Err(_) => EnvFilter::try_new(config.filter.as_deref().unwrap_or("paperstash=info"))
      .map_err(|e| eyre!("Invalid log filter: {}", e))?,
  };

  let (file_layer, guard) = match &config.directory {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "paperstash.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  let stderr_layer = file_layer
    .is_none()
    .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(file_layer)
    .with(stderr_layer)
    .init();

  Ok(guard)
}

fn build_cache<S: CacheStorage>(storage: S, config: &Config) -> ContentCache<S> {
  ContentCache::new(storage)
    .with_policy(config.cache.eviction_policy())
    .with_normalizer(config.locators.normalizer())
    .with_schedule(config.cache.schedule())
}

async fn run<S: CacheStorage>(
  cache: ContentCache<S>,
  command: Command,
  config: &Config,
) -> Result<()> {
  let sweeper = cache.start_sweeper();

  match command {
    Command::Put { id, url, file } => {
      let payload = match (url, file) {
        (Some(url), _) => Payload::Reference(url),
        (None, Some(path)) => {
          let bytes = std::fs::read(&path)
            .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
          let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| eyre!("{} has no filename", path.display()))?;
          Payload::Blob { filename, bytes }
        }
        (None, None) => return Err(eyre!("Either --url or --file is required")),
      };
      cache.put(&id, payload).await?;
      println!("Cached {}", id);
    }
    Command::Get { id, output } => match cache.get(&id).await? {
      Some(hit) => print_payload(hit.payload, output.as_deref())?,
      None => println!("{} is not cached", id),
    },
    Command::Rm { id } => {
      if cache.remove(&id).await? {
        println!("Removed {}", id);
      } else {
        println!("{} is not cached", id);
      }
    }
    Command::Evict => {
      let evicted = cache.evict_expired().await?;
      println!("Evicted {} entries", evicted.len());
      for id in evicted {
        println!("  {}", id);
      }
    }
    Command::Ls { json } => {
      let entries = cache.entries().await?;
      if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
      } else {
        for entry in entries {
          println!(
            "{:<24} {:<9} {}  {}",
            entry.id,
            entry.kind,
            entry.last_accessed_at.format("%Y-%m-%d %H:%M"),
            entry.payload_ref
          );
        }
      }
    }
    Command::Stats => {
      let stats = cache.stats().await?;
      println!("entries:    {}", stats.entries());
      println!("references: {}", stats.references);
      println!("blobs:      {} ({} bytes)", stats.blobs, stats.blob_bytes);
      if let (Some(oldest), Some(newest)) = (stats.oldest_access, stats.newest_access) {
        println!("accessed:   {} .. {}", oldest, newest);
      }
    }
    Command::Fetch { id, locator, output } => {
      let fetcher = DocumentFetcher::new(&config.fetch)?;
      let locator = config.locators.normalizer().normalize(&locator);

      let result = cache
        .get_or_fetch(&id, || {
          let fetcher = fetcher.clone();
          let locator = locator.clone();
          async move { fetcher.fetch(&locator).await.map(Payload::from) }
        })
        .await?;

      match result.source {
        CacheSource::Cache => tracing::info!("Served {} from cache", id),
        CacheSource::Network => tracing::info!("Fetched {} from {}", id, locator),
      }
      print_payload(result.data, output.as_deref())?;
    }
  }

  if let Some(handle) = sweeper {
    handle.abort();
  }

  Ok(())
}

/// Print a locator, or write blob bytes to disk and print where they went.
fn print_payload(payload: Payload, output: Option<&Path>) -> Result<()> {
  match payload {
    Payload::Reference(locator) => println!("{}", locator),
    Payload::Blob { filename, bytes } => {
      let path = output.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(&filename));
      std::fs::write(&path, &bytes)
        .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
      println!("Wrote {} bytes to {}", bytes.len(), path.display());
    }
  }
  Ok(())
}
