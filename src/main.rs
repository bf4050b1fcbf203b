use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use stratcache::cache::TtlCache;
use stratcache::clock::SystemClock;
use stratcache::config::Config;
use stratcache::db::SqliteStore;
use stratcache::error::SyncError;
use stratcache::logging;
use stratcache::sync::{
  ConnectivityMonitor, EntityPatch, EntityType, HttpBackend, PendingQueue, SyncEngine,
};

#[derive(Parser, Debug)]
#[command(name = "stratcache")]
#[command(about = "Inspect and sync the dashboard's offline cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stratcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Entry counts and bytes held
  Stats,
  /// Print a cached payload, if present and unexpired
  Get { key: String },
  /// Show queued changes
  Pending {
    #[arg(short, long)]
    entity: Option<EntityType>,
  },
  /// Queue a change: `enqueue goal g1 '{"progress": 40}'`
  Enqueue {
    entity: EntityType,
    id: String,
    fields: String,
  },
  /// Drop queued changes for a type, or one record of it
  Clear { entity: EntityType, id: Option<String> },
  /// Shrink the cache if it is over budget
  Evict,
  /// Replay queued changes to the remote service
  Flush {
    /// Treat the network as down
    #[arg(long)]
    offline: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(config.log_dir().as_deref());

  let store = Arc::new(config.open_store()?);
  let cache = TtlCache::new(store.clone())
    .with_max_size(config.storage.max_size_bytes)
    .with_max_entry_size(config.storage.max_entry_bytes);

  match args.command {
    Command::Stats => {
      let stats = cache.stats()?;
      println!("entries:         {}", stats.entries);
      println!("pending records: {}", stats.pending_records);
      println!(
        "bytes:           {} / {}",
        stats.total_bytes,
        cache.evictor().max_size()
      );
    }
    Command::Get { key } => match cache.retrieve::<serde_json::Value>(&key) {
      Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
      None => return Err(eyre!("No live cache entry for '{}'", key)),
    },
    Command::Pending { entity } => {
      let queue = pending_queue(&store);
      let mut ledger = queue.rebuild_ledger();
      let types = entity.map_or_else(|| EntityType::ALL.to_vec(), |t| vec![t]);
      for entity_type in types {
        let batch = queue.try_list_pending(&mut ledger, entity_type)?;
        if batch.is_empty() {
          continue;
        }
        println!("{}:", entity_type);
        for (id, patches) in batch {
          for patch in patches {
            println!("  {} {}", id, serde_json::to_string(&patch.fields()?)?);
          }
        }
      }
    }
    Command::Enqueue { entity, id, fields } => {
      let value: serde_json::Value =
        serde_json::from_str(&fields).map_err(|e| eyre!("Invalid JSON fields: {}", e))?;
      let patch = EntityPatch::from_fields(entity, value)
        .map_err(|e| eyre!("Not a valid {} patch: {}", entity, e))?;
      let queue = pending_queue(&store);
      let mut ledger = queue.rebuild_ledger();
      queue.enqueue(&mut ledger, &id, patch)?;
      println!(
        "Queued {} change for {} ({} pending)",
        entity,
        id,
        ledger.state(entity).change_count()
      );
    }
    Command::Clear { entity, id } => {
      let queue = pending_queue(&store);
      let mut ledger = queue.rebuild_ledger();
      queue.clear(&mut ledger, entity, id.as_deref())?;
      println!(
        "Cleared; {} {} change(s) still pending",
        ledger.state(entity).change_count(),
        entity
      );
    }
    Command::Evict => match cache.evict_if_needed() {
      Some(report) if report.removed > 0 => println!(
        "Evicted {} entries ({} -> {} bytes)",
        report.removed, report.bytes_before, report.bytes_after
      ),
      Some(report) => println!("Within budget ({} bytes)", report.bytes_after),
      None => return Err(eyre!("Eviction failed, see log")),
    },
    Command::Flush { offline } => {
      let backend = HttpBackend::from_config(&config)?;
      let engine = SyncEngine::new(cache, Arc::new(backend), ConnectivityMonitor::new(!offline))
        .with_dispatch_timeout(config.remote.dispatch_timeout());

      let report = match engine.flush_all().await {
        Ok(report) => report,
        Err(SyncError::PartialFailure { report }) => {
          for failure in &report.failed {
            eprintln!(
              "{}: {} ({} confirmed before failing)",
              failure.entity_type, failure.reason, failure.dispatched
            );
          }
          report
        }
        Err(e) => {
          eprintln!("{} change(s) kept", engine.snapshot().total_changes());
          return Err(e.into());
        }
      };
      info!(patches = report.patches_flushed(), "Flush finished");
      for (entity_type, id) in &report.quarantined {
        eprintln!("{} {}: unreadable, moved aside", entity_type, id);
      }
      for flushed in &report.flushed {
        println!(
          "{}: {} change(s) across {} record(s)",
          flushed.entity_type, flushed.patches, flushed.entities
        );
      }
      if !report.failed.is_empty() {
        return Err(eyre!("{} entity type(s) failed to sync", report.failed.len()));
      }
    }
  }

  Ok(())
}

fn pending_queue(store: &Arc<SqliteStore>) -> PendingQueue<SqliteStore> {
  PendingQueue::new(store.clone(), Arc::new(SystemClock))
}
