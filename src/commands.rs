use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use tracing::{info, warn};

use teamsync::cache::CacheSource;
use teamsync::engine::Engine;

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
  /// Print a cached value without touching the network
  Get { key: String },
  /// Fetch a document (or a whole collection) through the cache
  Fetch {
    resource: String,
    id: Option<String>,
    /// Cache category (defaults to the resource name)
    #[arg(short, long)]
    category: Option<String>,
  },
  /// Create or replace a document
  Put {
    resource: String,
    /// JSON document
    payload: String,
    /// Document id; omit to create a new document
    #[arg(long)]
    id: Option<String>,
    #[arg(short, long)]
    category: Option<String>,
  },
  /// Delete a document
  Delete {
    resource: String,
    id: String,
    #[arg(short, long)]
    category: Option<String>,
  },
  /// Drop cached entries, all of them or one category
  Clear { category: Option<String> },
  /// List pending mutations
  Queue,
  /// Run one drain pass now
  Sync,
  /// Print cache and queue diagnostics
  Stats,
  /// Keep syncing in the background until Ctrl-C
  Run,
}

impl Command {
  /// Commands that cannot do anything useful without a document store.
  /// Writes without one are queued for a later run.
  pub fn needs_remote(&self) -> bool {
    matches!(self, Command::Fetch { .. } | Command::Sync | Command::Run)
  }
}

pub async fn execute(engine: &Engine, command: Command) -> Result<()> {
  match command {
    Command::Get { key } => match engine.get(&key) {
      Some(value) => print_json(&value)?,
      None => return Err(eyre!("{} is not cached", key)),
    },

    Command::Fetch {
      resource,
      id,
      category,
    } => {
      let category = category.unwrap_or_else(|| resource.clone());
      let result = match id {
        Some(id) => engine
          .fetch_one(&resource, &id, &category)
          .await?
          .ok_or_else(|| eyre!("{}/{} does not exist", resource, id))?,
        None => engine.fetch_collection(&resource, &category).await?,
      };
      if result.source == CacheSource::CacheStale {
        warn!("Remote store unreachable, showing cached data");
      }
      print_json(&result.data)?;
    }

    Command::Put {
      resource,
      payload,
      id,
      category,
    } => {
      let payload: Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let category = category.unwrap_or_else(|| resource.clone());
      let receipt = engine
        .upsert(&resource, id.as_deref(), payload, &category)
        .await;
      print_receipt(&resource, &receipt.id, receipt.queued);
    }

    Command::Delete {
      resource,
      id,
      category,
    } => {
      let category = category.unwrap_or_else(|| resource.clone());
      let receipt = engine.remove(&resource, &id, &category).await;
      print_receipt(&resource, &receipt.id, receipt.queued);
    }

    Command::Clear { category } => {
      let removed = engine.clear(category.as_deref());
      println!("removed {} entries", removed);
    }

    Command::Queue => {
      for item in engine.pending() {
        println!(
          "{}  {:?}  {}/{}  retries {}/{}  queued {}",
          item.id,
          item.operation,
          item.resource_type,
          item.target_id.as_deref().unwrap_or("<new>"),
          item.retry_count,
          item.max_retries,
          item.enqueued_at.to_rfc3339(),
        );
      }
    }

    Command::Sync => match engine.force_sync().await {
      Some(summary) => print_json(&summary)?,
      None => println!("sync already in progress"),
    },

    Command::Stats => print_json(&engine.stats())?,

    Command::Run => {
      let handle = engine.spawn();
      let mut events = engine.sync_events();
      info!("Running, press Ctrl-C to stop");

      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => break,
          event = events.recv() => match event {
            Ok(summary) if summary.succeeded + summary.failed > 0 => {
              println!(
                "synced {} item(s), {} dropped, {} pending",
                summary.succeeded, summary.failed, summary.remaining
              );
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
              warn!(skipped, "Missed sync notifications");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
          },
        }
      }

      handle.shutdown().await;
    }
  }

  Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  let text = serde_json::to_string_pretty(value)?;
  println!("{}", text);
  Ok(())
}

fn print_receipt(resource: &str, id: &str, queued: bool) {
  if queued {
    println!("{}/{} queued for sync", resource, id);
  } else {
    println!("{}/{} saved", resource, id);
  }
}
