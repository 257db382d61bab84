mod commands;
mod config;
mod logging;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use teamsync::clock::SystemClock;
use teamsync::engine::Engine;
use teamsync::remote::{DisconnectedRemote, HttpRemote, RemoteStore};
use teamsync::storage::{LocalStorage, NoopStorage, SqliteStorage};

#[derive(Parser, Debug)]
#[command(name = "teamsync")]
#[command(about = "Offline cache and sync queue for the team dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/teamsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Start offline: writes go straight to the queue
  #[arg(long)]
  offline: bool,

  /// Show debug logs on stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log_dir()?, args.verbose)?;

  let storage: Arc<dyn LocalStorage> = if config.storage.enabled {
    let path = config.storage_path()?;
    let storage = SqliteStorage::open(&path)
      .map_err(|e| eyre!("Failed to open state database at {}: {}", path.display(), e))?;
    Arc::new(storage)
  } else {
    Arc::new(NoopStorage)
  };

  // Local-only commands work without a configured store.
  let remote: Arc<dyn RemoteStore> = match config.remote_url()? {
    Some(url) => Arc::new(HttpRemote::new(
      url,
      config::Config::get_api_token(),
      config.remote_timeout(),
    )?),
    None if args.command.needs_remote() => {
      return Err(eyre!(
        "No document store configured. Set remote.url in ~/.config/teamsync/config.yaml"
      ));
    }
    None => Arc::new(DisconnectedRemote),
  };
  let connected = config.remote.url.is_some();

  let settings = teamsync::engine::EngineSettings {
    start_online: connected && !args.offline,
    ..config.engine_settings()
  };

  let engine = Engine::new(remote, storage, Arc::new(SystemClock), settings);
  commands::execute(&engine, args.command).await
}
