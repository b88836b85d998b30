//! opscache - inspect the local cache and demonstrate cross-client coherence.

mod demo;
mod tables;

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use opscache_core::persistence::adapter;
use opscache_core::{
    CacheConfig, Config, FileSlot, KeyValueSlot, LocalEntryStore, PersistenceAdapter, StorageError,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Overrides `max_age` from the settings file, in seconds.
const ENV_MAX_AGE_SECS: &str = "OPSCACHE_MAX_AGE_SECS";

/// Selects a per-profile cache directory.
const ENV_PROFILE: &str = "OPSCACHE_PROFILE";

const USAGE: &str = "usage: opscache <status|clear|demo|config [set-max-age <secs>]>";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn load_config() -> Result<Config> {
    let mut config = Config::load()?;
    if let Ok(secs) = std::env::var(ENV_MAX_AGE_SECS) {
        let secs = secs
            .parse()
            .with_context(|| format!("{} must be a number of seconds", ENV_MAX_AGE_SECS))?;
        config.max_age_secs = Some(secs);
    }
    if let Ok(profile) = std::env::var(ENV_PROFILE) {
        config.profile = Some(profile);
    }
    Ok(config)
}

fn open_slot(config: &Config, cache_config: &CacheConfig) -> Result<Arc<FileSlot>> {
    let dir = config.cache_dir()?;
    let slot = FileSlot::new(&dir, &cache_config.slot_name)
        .with_context(|| format!("Failed to open cache slot in {}", dir.display()))?;
    Ok(Arc::new(slot))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = load_config()?;
    let cache_config = config.cache_config()?;

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("status") => status(&config, &cache_config),
        Some("clear") => clear(&config, &cache_config),
        Some("demo") => demo::run(cache_config).await,
        Some("config") => match (args.get(2).map(String::as_str), args.get(3)) {
            (None, _) => show_config(&config, &cache_config),
            (Some("set-max-age"), Some(secs)) => set_max_age(secs),
            _ => {
                eprintln!("{}", USAGE);
                Ok(())
            }
        },
        _ => {
            eprintln!("{}", USAGE);
            Ok(())
        }
    }
}

/// Decode the slot without touching it. `PersistenceAdapter::load` would
/// clear a corrupt slot.
fn read_store(slot: &dyn KeyValueSlot) -> Result<LocalEntryStore, StorageError> {
    match slot.read()? {
        Some(blob) => adapter::decode(&blob),
        None => Ok(LocalEntryStore::new()),
    }
}

/// Print every persisted entry with its age and status. Read-only: a corrupt
/// slot is reported and left in place.
fn status(config: &Config, cache_config: &CacheConfig) -> Result<()> {
    let slot = open_slot(config, cache_config)?;
    println!("cache slot: {}", slot.path().display());

    let store = match read_store(&*slot) {
        Ok(store) => store,
        Err(e) => {
            println!("unreadable: {}", e);
            return Ok(());
        }
    };
    if store.is_empty() {
        println!("(empty)");
        return Ok(());
    }

    let now = Utc::now();
    let max_age = chrono::Duration::from_std(cache_config.max_age)?;
    let refresh = chrono::Duration::from_std(cache_config.refresh_threshold)?;

    let mut entries: Vec<_> = store.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    for (key, entry) in entries {
        println!(
            "{:<32} {:>6} records  {:>10}  {}",
            key.to_string(),
            entry.data.len(),
            entry.age_display(now),
            entry.status(now, max_age, refresh).label()
        );
    }
    Ok(())
}

fn clear(config: &Config, cache_config: &CacheConfig) -> Result<()> {
    let slot = open_slot(config, cache_config)?;
    PersistenceAdapter::new(slot.clone()).clear()?;
    info!(path = %slot.path().display(), "Cache slot cleared");
    println!("cleared {}", slot.path().display());
    Ok(())
}

fn show_config(config: &Config, cache_config: &CacheConfig) -> Result<()> {
    println!("settings file: {}", Config::config_path()?.display());
    println!("profile: {}", config.profile.as_deref().unwrap_or("(default)"));
    println!("max age: {}s", cache_config.max_age.as_secs());
    println!("refresh threshold: {}s", cache_config.refresh_threshold.as_secs());
    println!("resubscribe backoff: {}s", cache_config.resubscribe_backoff.as_secs());
    Ok(())
}

/// Persist a new max age to the settings file. Environment overrides are not
/// written back.
fn set_max_age(secs: &str) -> Result<()> {
    let secs: u64 = secs
        .parse()
        .with_context(|| format!("'{}' is not a number of seconds", secs))?;
    let mut config = Config::load()?;
    config.max_age_secs = Some(secs);
    config.cache_config()?;
    config.save()?;
    info!(max_age_secs = secs, "Settings saved");
    println!("max age set to {}s", secs);
    Ok(())
}
