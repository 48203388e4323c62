use anyhow::{Context, Result};
use pto_ingest::LoadConfig;
use pto_query::QueryCacheConfig;
use pto_storage::StoreOptions;
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DATABASE: &str = "pto.db";
const DEFAULT_LOG_LEVEL: &str = "info";

/// On-disk configuration. Every field is optional; missing fields keep their
/// defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub database: Option<PathBuf>,
    pub query_cache_root: Option<PathBuf>,
    pub concurrent_queries: Option<usize>,
    pub immediate_query_delay_ms: Option<u64>,
    pub busy_timeout_ms: Option<u64>,
    pub load_batch_size: Option<usize>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: PathBuf,
    pub store: StoreOptions,
    pub load: LoadConfig,
    pub query: QueryCacheConfig,
    pub log_level: String,
}

/// Flag values that take precedence over file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub database: Option<PathBuf>,
    pub query_cache_root: Option<PathBuf>,
    pub debug: bool,
}

pub fn read_file_config(path: &Path) -> Result<FileConfig> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config {}", path.display()))
        }
    }
}

pub fn load_config(path: &Path, overrides: &Overrides) -> Result<Config> {
    let file = read_file_config(path)?;
    Ok(resolve_config(file, |name| std::env::var(name).ok(), overrides))
}

/// Layers defaults, then the file, then `PTO_*` environment variables, then
/// flags.
pub fn resolve_config(
    file: FileConfig,
    env: impl Fn(&str) -> Option<String>,
    overrides: &Overrides,
) -> Config {
    let env_value = |name: &str| env(name).filter(|value| !value.trim().is_empty());

    let database = overrides
        .database
        .clone()
        .or_else(|| env_value("PTO_DATABASE").map(PathBuf::from))
        .or(file.database)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE));

    let mut store = StoreOptions::default();
    if let Some(ms) = file.busy_timeout_ms {
        store.busy_timeout = Duration::from_millis(ms);
    }

    let mut load = LoadConfig::default();
    if let Some(batch_size) = file.load_batch_size {
        load.batch_size = batch_size;
    }

    let mut query = QueryCacheConfig {
        store: store.clone(),
        ..QueryCacheConfig::default()
    };
    if let Some(root) = overrides
        .query_cache_root
        .clone()
        .or_else(|| env_value("PTO_QUERY_CACHE").map(PathBuf::from))
        .or(file.query_cache_root)
    {
        query.cache_root = root;
    }
    if let Some(limit) = file.concurrent_queries {
        query.concurrent_queries = limit;
    }
    if let Some(ms) = file.immediate_query_delay_ms {
        query.immediate_delay = Duration::from_millis(ms);
    }

    let log_level = if overrides.debug {
        "debug".to_string()
    } else {
        env_value("PTO_LOG_LEVEL")
            .or(file.log_level)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    };

    Config {
        database,
        store,
        load,
        query,
        log_level,
    }
}
