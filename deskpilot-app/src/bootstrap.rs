use crate::config::Config;
use anyhow::{Context, Result};
use deskpilot_infra::infra::async_store::AsyncSqliteStore;
use deskpilot_infra::infra::sqlite_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over the default level.
/// Logs go to stderr so command output on stdout stays clean.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
    {
        eprintln!("Tracing already initialised: {}", e);
    }
}

pub fn open_store(config: &Config) -> Result<AsyncSqliteStore> {
    if let Some(parent) = config.store.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let store = SqliteStore::new(&config.store.path, config.store.retention)
        .with_context(|| format!("Failed to open store at {}", config.store.path.display()))?;
    Ok(AsyncSqliteStore::new(Arc::new(store)))
}
