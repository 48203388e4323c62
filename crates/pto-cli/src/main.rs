mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::{load_config, Config, Overrides};
use pto_core::obs_contracts::{format_set_id, parse_set_id};
use pto_core::query_contracts::{Fingerprint, QueryEntry};
use pto_ingest::{export_observation_set, load_observation_file, InternCache};
use pto_query::{QueryCache, QueryError};
use pto_storage::{InternTable, ObservationStore};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pto")]
#[command(about = "Observation store and query cache for path transparency measurements", long_about = None)]
struct Cli {
    /// JSON configuration file; missing means defaults
    #[arg(long, default_value = "ptoconfig.json")]
    config: PathBuf,
    #[arg(long)]
    database: Option<PathBuf>,
    #[arg(long)]
    query_cache: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load observation files, one observation set per file
    Load {
        /// Create the database if it does not exist yet
        #[arg(long, default_value_t = false)]
        init: bool,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Run URL-encoded queries to completion
    Query {
        /// Purge any cached entry first
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(required = true)]
        queries: Vec<String>,
    },
    /// Show one cached query, or list all of them
    Show {
        fingerprint: Option<String>,
        /// Also print this many result rows
        #[arg(long)]
        rows: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Write an observation set to stdout in observation-file form
    Cat { set_id: String },
    /// Merge a JSON metadata object into an existing observation set
    Meta { set_id: String, patch: String },
    /// List observation sets
    Sets,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = Overrides {
        database: cli.database.clone(),
        query_cache_root: cli.query_cache.clone(),
        debug: cli.debug,
    };
    let config = load_config(&cli.config, &overrides)?;
    init_logging(&config);

    let outcome = match cli.command {
        Commands::Load { init, files } => run_load(&config, init, &files),
        Commands::Query { force, queries } => run_queries(&config, force, &queries).await,
        Commands::Show {
            fingerprint,
            rows,
            offset,
        } => run_show(&config, fingerprint.as_deref(), rows, offset),
        Commands::Cat { set_id } => run_cat(&config, &set_id),
        Commands::Meta { set_id, patch } => run_meta(&config, &set_id, &patch),
        Commands::Sets => run_sets(&config),
    };
    if let Err(err) = &outcome {
        error!(event = "command_failed", error = %err);
    }
    outcome
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn open_store(config: &Config) -> Result<ObservationStore> {
    ObservationStore::open_with(&config.database, &config.store)
        .with_context(|| format!("failed to open database {}", config.database.display()))
}

fn run_load(config: &Config, init: bool, files: &[PathBuf]) -> Result<()> {
    if !init && !config.database.exists() {
        bail!(
            "database {} does not exist; pass --init to create it",
            config.database.display()
        );
    }
    let mut store = open_store(config)?;
    let conditions = InternCache::load_all(&store, InternTable::Conditions)?;
    let paths = InternCache::load_all(&store, InternTable::Paths)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for path in files {
        let input = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let report = load_observation_file(
            &mut store,
            BufReader::new(input),
            &conditions,
            &paths,
            &config.load,
        )
        .with_context(|| format!("failed to load {}", path.display()))?;
        info!(event = "file_loaded", file = %path.display(), set_id = report.set.id);
        writeln!(
            out,
            "{}\t{}\t{}",
            format_set_id(report.set.id),
            report.observation_count,
            path.display()
        )?;
    }
    Ok(())
}

async fn run_queries(config: &Config, force: bool, queries: &[String]) -> Result<()> {
    let cache = QueryCache::open(&config.database, config.query.clone())?;

    let mut pending = Vec::with_capacity(queries.len());
    for encoded in queries {
        let query = cache
            .parse(encoded)
            .with_context(|| format!("invalid query {encoded:?}"))?;
        if force {
            match cache.purge(&query) {
                Ok(()) | Err(QueryError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        let (notify, done) = oneshot::channel();
        let (entry, is_new) = cache.submit(&query, notify).await?;
        info!(event = "query_submitted", fingerprint = %entry.fingerprint, is_new);
        pending.push((entry.fingerprint, done));
    }

    let stdout = io::stdout();
    for (fingerprint, done) in pending {
        let entry = done
            .await
            .with_context(|| format!("query {fingerprint} was abandoned"))?;
        print_entry(&mut stdout.lock(), &entry)?;
    }
    Ok(())
}

fn run_show(
    config: &Config,
    fingerprint: Option<&str>,
    rows: Option<usize>,
    offset: usize,
) -> Result<()> {
    let cache = QueryCache::open(&config.database, config.query.clone())?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let Some(fingerprint) = fingerprint else {
        for entry in cache.entries()? {
            writeln!(out, "{}\t{}\t{}", entry.fingerprint, entry.state, entry.encoded)?;
        }
        return Ok(());
    };

    let fingerprint = Fingerprint::parse(fingerprint)?;
    let entry = cache
        .get(&fingerprint)?
        .ok_or_else(|| QueryError::NotFound(fingerprint.clone()))?;
    print_entry(&mut out, &entry)?;

    if let Some(count) = rows {
        let page = cache.result_page(&fingerprint, offset, count)?;
        for row in &page.rows {
            writeln!(out, "{row}")?;
        }
        if page.more {
            writeln!(out, "... more {} rows after {}", page.label, offset + count)?;
        }
    }
    Ok(())
}

fn run_cat(config: &Config, set_id: &str) -> Result<()> {
    let set_id = parse_set_id(set_id)?;
    let store = open_store(config)?;
    let stdout = io::stdout();
    export_observation_set(&store, set_id, stdout.lock())?;
    Ok(())
}

fn run_meta(config: &Config, set_id: &str, patch: &str) -> Result<()> {
    let set_id = parse_set_id(set_id)?;
    let patch = parse_metadata_patch(patch)?;
    let mut store = open_store(config)?;
    let set = store.update_set_metadata(set_id, patch)?;
    info!(event = "set_metadata_updated", set_id = set.id);
    let count = store.count_observations(set_id)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}", set.to_metadata_json(Some(count)))?;
    Ok(())
}

fn parse_metadata_patch(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw).context("metadata patch is not valid JSON")? {
        Value::Object(patch) => Ok(patch),
        _ => bail!("metadata patch must be a JSON object"),
    }
}

fn run_sets(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for set_id in store.observation_set_ids()? {
        let Some(set) = store.observation_set(set_id)? else {
            continue;
        };
        writeln!(
            out,
            "{}\t{}\t{}",
            format_set_id(set_id),
            store.count_observations(set_id)?,
            set.analyzer
        )?;
    }
    Ok(())
}

fn print_entry(out: &mut impl Write, entry: &QueryEntry) -> Result<()> {
    serde_json::to_writer(&mut *out, entry)?;
    writeln!(out)?;
    Ok(())
}
