//! # Tally Sync Agent
//!
//! Headless process that keeps one device's cache converging with the
//! remote: pushes the sync queue and pulls the catalog on an interval.
//!
//! ## Usage
//! ```bash
//! # Uses tally.toml from the platform config dir plus TALLY_* overrides
//! cargo run -p tally-sync --bin tally-agent
//!
//! # Explicit config and database file
//! cargo run -p tally-sync --bin tally-agent -- --config ./tally.toml --db ./tally.db
//! ```
//!
//! Stop it with Ctrl-C; the in-flight cycle finishes first.

use directories::ProjectDirs;
use std::path::PathBuf;
use std::sync::Arc;
use tally_db::{Database, DbConfig};
use tally_sync::{remote, CoreConfig, PosCore, SyncAgent};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config_path = None;
    let mut db_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => config_path = args.next().map(PathBuf::from),
            "--db" => db_path = args.next().map(PathBuf::from),
            "--help" | "-h" => {
                println!("Usage: tally-agent [--config <tally.toml>] [--db <tally.db>]");
                return Ok(());
            }
            other => return Err(format!("unknown argument: {other}").into()),
        }
    }

    let config = CoreConfig::load(config_path)?;
    let db_path = match db_path {
        Some(path) => path,
        None => database_path()?,
    };
    info!(
        device_id = %config.device_id(),
        remote_mode = %config.remote_mode(),
        db = %db_path.display(),
        "Starting tally agent"
    );

    let db = Database::new(DbConfig::new(db_path)).await?;
    let client = remote::connect(&config.remote)?;
    let interval = config.agent_interval();
    let core = Arc::new(PosCore::new(config, db.clone(), client));

    let handle = SyncAgent::spawn(core, interval);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    handle.shutdown().await;
    db.close().await;

    Ok(())
}

/// `RUST_LOG` wins; the default keeps sqlx quiet.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `TALLY_DB_PATH`, else `tally.db` in the platform data dir.
fn database_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("TALLY_DB_PATH") {
        return Ok(PathBuf::from(path));
    }

    let dirs = ProjectDirs::from("com", "tally", "pos")
        .ok_or("could not determine the app data directory")?;
    let data_dir = dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;
    Ok(data_dir.join("tally.db"))
}
