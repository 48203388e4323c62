pub mod execute;
pub mod lease;
pub mod query;

pub use execute::{write_result, ExecutionOutput};
pub use lease::OwnerLease;
pub use query::{GroupKey, ParseError, Query, ResultMode};

use chrono::{DateTime, SubsecRound, Utc};
use pto_core::obs_contracts::RESERVED_KEY_PREFIX;
use pto_core::query_contracts::{Fingerprint, QueryEntry, QueryState};
use pto_storage::{ObservationStore, StorageError, StoreOptions};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, warn};

const DEFAULT_CACHE_ROOT: &str = "query-cache";
const DEFAULT_CONCURRENT_QUERIES: usize = 4;
const DEFAULT_IMMEDIATE_DELAY: Duration = Duration::from_secs(2);
const FOREIGN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error recorded on entries whose execution died with the process.
pub const INTERRUPTED_ERROR: &str = "interrupted before completion";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("query {0} not found")]
    NotFound(Fingerprint),
    #[error("query {fingerprint} is {state}, no result available")]
    NotReady {
        fingerprint: Fingerprint,
        state: QueryState,
    },
    #[error("metadata key {0} is reserved")]
    ReservedMetadataKey(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt result file: {0}")]
    CorruptResult(String),
    #[error("no tokio runtime available: {0}")]
    Runtime(String),
    #[error("query execution failed: {0}")]
    Execution(String),
}

#[derive(Debug, Clone)]
pub struct QueryCacheConfig {
    /// Directory holding one `<fingerprint>.ndjson` result per complete query.
    pub cache_root: PathBuf,
    /// Upper bound on execution bodies running at once.
    pub concurrent_queries: usize,
    /// How long `execute_wait_immediate` waits before returning a pending entry.
    pub immediate_delay: Duration,
    pub store: StoreOptions,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
            concurrent_queries: DEFAULT_CONCURRENT_QUERIES,
            immediate_delay: DEFAULT_IMMEDIATE_DELAY,
            store: StoreOptions::default(),
        }
    }
}

/// One page of a complete result, labelled by result mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPage {
    pub label: &'static str,
    pub rows: Vec<Value>,
    pub more: bool,
}

/// Receives the entry once it reaches a terminal state.
pub type CompletionNotify = oneshot::Sender<QueryEntry>;

struct Flight {
    entry: QueryEntry,
    waiters: Vec<CompletionNotify>,
    purged: bool,
    follow_up: Option<FollowUp>,
}

/// An execution requested after the running one was purged. It starts once
/// the purged body has finished.
struct FollowUp {
    query: Query,
    entry: QueryEntry,
    waiters: Vec<CompletionNotify>,
    purged: bool,
}

impl Flight {
    fn live_entry_mut(&mut self) -> Option<&mut QueryEntry> {
        if !self.purged {
            return Some(&mut self.entry);
        }
        self.follow_up
            .as_mut()
            .filter(|follow_up| !follow_up.purged)
            .map(|follow_up| &mut follow_up.entry)
    }
}

/// Memoizes query results by fingerprint. Each fingerprint runs at most one
/// execution body at a time; callers share it and are told when it ends.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    database: PathBuf,
    config: QueryCacheConfig,
    control: Mutex<ObservationStore>,
    in_flight: Mutex<HashMap<Fingerprint, Flight>>,
    tokens: Arc<Semaphore>,
    executions: AtomicU64,
    runtime: Handle,
    lease: OwnerLease,
}

/// What a watcher found when polling an entry another instance is running.
enum ForeignPoll {
    Pending,
    Settled(QueryEntry),
    Gone,
}

impl QueryCache {
    /// Opens the cache over the observation database at `database`. Must be
    /// called within a Tokio runtime, which later runs the executions.
    ///
    /// Instances sharing a database must share `cache_root`: each holds an
    /// owner lease there, and entries left executing by an instance whose
    /// lease is gone are marked failed. Entries a live instance is running
    /// are left alone.
    pub fn open(database: impl Into<PathBuf>, config: QueryCacheConfig) -> Result<Self, QueryError> {
        let runtime = Handle::try_current().map_err(|err| QueryError::Runtime(err.to_string()))?;
        let database = database.into();
        fs::create_dir_all(&config.cache_root)?;
        let owner_lease = OwnerLease::acquire(&config.cache_root)?;

        let control = ObservationStore::open_with(&database, &config.store)?;
        for owner in control.executing_query_owners()? {
            let live = match owner.as_deref() {
                Some(owner) => lease::owner_is_live(&config.cache_root, owner)?,
                None => false,
            };
            if live {
                continue;
            }
            let interrupted =
                control.fail_interrupted_queries(owner.as_deref(), INTERRUPTED_ERROR, now())?;
            if interrupted > 0 {
                warn!(event = "query_interrupted", owner = owner.as_deref(), count = interrupted);
            }
        }
        debug!(event = "cache_opened", owner = owner_lease.id());

        let permits = config.concurrent_queries.max(1);
        Ok(Self {
            inner: Arc::new(CacheInner {
                database,
                config,
                control: Mutex::new(control),
                in_flight: Mutex::new(HashMap::new()),
                tokens: Arc::new(Semaphore::new(permits)),
                executions: AtomicU64::new(0),
                runtime,
                lease: owner_lease,
            }),
        })
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.inner.config
    }

    /// Number of execution bodies started since open.
    pub fn executions(&self) -> u64 {
        self.inner.executions.load(Ordering::SeqCst)
    }

    pub fn parse(&self, encoded: &str) -> Result<Query, QueryError> {
        Ok(Query::parse(encoded)?)
    }

    /// Submits `query` without waiting for it.
    ///
    /// A terminal entry (complete or failed) is returned as-is and `notify`
    /// fires right away. An executing entry gains `notify` as another waiter,
    /// also when another cache instance on the same database is running it.
    /// Otherwise a new execution starts and `is_new` is true. Waiters fire
    /// once the terminal state is stored.
    ///
    /// Reads and writes the store synchronously, waiting out its busy
    /// timeout; async callers use [`Self::submit`].
    pub fn execute(
        &self,
        query: &Query,
        notify: CompletionNotify,
    ) -> Result<(QueryEntry, bool), QueryError> {
        self.inner.execute(query, notify)
    }

    /// [`Self::execute`] on the blocking pool.
    pub async fn submit(
        &self,
        query: &Query,
        notify: CompletionNotify,
    ) -> Result<(QueryEntry, bool), QueryError> {
        let cache = self.clone();
        let query = query.clone();
        tokio::task::spawn_blocking(move || cache.execute(&query, notify))
            .await
            .map_err(|err| QueryError::Runtime(err.to_string()))?
    }

    /// Submits `query`, then waits up to the configured immediate delay for
    /// it to finish. Returns the freshest entry either way.
    pub async fn execute_wait_immediate(
        &self,
        query: &Query,
    ) -> Result<(QueryEntry, bool), QueryError> {
        let (notify, done) = oneshot::channel();
        let (entry, is_new) = self.submit(query, notify).await?;
        match tokio::time::timeout(self.inner.config.immediate_delay, done).await {
            Ok(Ok(finished)) => Ok((finished, is_new)),
            _ => {
                let latest = self.get(&entry.fingerprint)?.unwrap_or(entry);
                Ok((latest, is_new))
            }
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<QueryEntry>, QueryError> {
        Ok(self.inner.lock_control().query_entry(fingerprint)?)
    }

    pub fn entries(&self) -> Result<Vec<QueryEntry>, QueryError> {
        Ok(self.inner.lock_control().query_entries()?)
    }

    pub fn purge(&self, query: &Query) -> Result<(), QueryError> {
        self.purge_fingerprint(&query.fingerprint())
    }

    /// Deletes the entry and its result whatever its state. An execution
    /// still running finishes but its result is discarded.
    pub fn purge_fingerprint(&self, fingerprint: &Fingerprint) -> Result<(), QueryError> {
        self.inner.purge(fingerprint)
    }

    /// Merges string metadata into an entry. Keys starting with `__` are
    /// reserved and rejected.
    pub fn annotate(
        &self,
        fingerprint: &Fingerprint,
        metadata: BTreeMap<String, String>,
    ) -> Result<QueryEntry, QueryError> {
        if let Some(key) = metadata
            .keys()
            .find(|key| key.starts_with(RESERVED_KEY_PREFIX))
        {
            return Err(QueryError::ReservedMetadataKey(key.clone()));
        }
        self.inner.annotate(fingerprint, metadata)
    }

    /// Rows `offset..offset + count` of a complete result, and whether more
    /// rows follow.
    pub fn result_page(
        &self,
        fingerprint: &Fingerprint,
        offset: usize,
        count: usize,
    ) -> Result<ResultPage, QueryError> {
        let entry = self
            .get(fingerprint)?
            .ok_or_else(|| QueryError::NotFound(fingerprint.clone()))?;
        if entry.state != QueryState::Complete {
            return Err(QueryError::NotReady {
                fingerprint: fingerprint.clone(),
                state: entry.state,
            });
        }

        let label = Query::parse(&entry.encoded)?.mode().label();
        let location = entry
            .result_location
            .unwrap_or_else(|| self.inner.artifact_path(fingerprint));
        let reader = BufReader::new(File::open(&location)?);

        let mut rows = Vec::new();
        let mut more = false;
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if index < offset {
                continue;
            }
            if index >= offset.saturating_add(count) {
                more = true;
                break;
            }
            let row = serde_json::from_str(&line).map_err(|err| {
                QueryError::CorruptResult(format!("{}: line {}: {err}", location.display(), index + 1))
            })?;
            rows.push(row);
        }

        Ok(ResultPage { label, rows, more })
    }

    pub fn artifact_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.inner.artifact_path(fingerprint)
    }

    /// Id this instance records on the entries it executes.
    pub fn owner_id(&self) -> &str {
        self.inner.lease.id()
    }
}

impl CacheInner {
    fn execute(
        self: &Arc<Self>,
        query: &Query,
        notify: CompletionNotify,
    ) -> Result<(QueryEntry, bool), QueryError> {
        let fingerprint = query.fingerprint();
        let mut in_flight = self.lock_in_flight();

        if let Some(flight) = in_flight.get_mut(&fingerprint) {
            if !flight.purged {
                flight.waiters.push(notify);
                debug!(event = "query_joined", fingerprint = %fingerprint);
                return Ok((flight.entry.clone(), false));
            }
            if let Some(follow_up) = flight.follow_up.as_mut() {
                if !follow_up.purged {
                    follow_up.waiters.push(notify);
                    debug!(event = "query_joined", fingerprint = %fingerprint);
                    return Ok((follow_up.entry.clone(), false));
                }
                let entry = self.placeholder(query)?;
                if entry.state.is_terminal() {
                    return Ok(settled(entry, notify));
                }
                follow_up.entry = entry.clone();
                follow_up.purged = false;
                follow_up.waiters.push(notify);
                info!(event = "query_submitted", fingerprint = %fingerprint, follow_up = true);
                return Ok((entry, true));
            }

            let entry = self.placeholder(query)?;
            if entry.state.is_terminal() {
                return Ok(settled(entry, notify));
            }
            flight.follow_up = Some(FollowUp {
                query: query.clone(),
                entry: entry.clone(),
                waiters: vec![notify],
                purged: false,
            });
            info!(event = "query_submitted", fingerprint = %fingerprint, follow_up = true);
            return Ok((entry, true));
        }

        let existing = self.lock_control().query_entry(&fingerprint)?;
        if let Some(existing) = existing {
            if existing.state.is_terminal() {
                return Ok(settled(existing, notify));
            }
            if let Some(owner) = self.live_foreign_owner(&fingerprint)? {
                debug!(event = "query_joined", fingerprint = %fingerprint, owner = %owner);
                self.watch_foreign(fingerprint, owner, notify);
                return Ok((existing, false));
            }
            // executing row nobody is running any more: rerun it
            warn!(event = "query_interrupted", fingerprint = %fingerprint);
        }

        let entry = self.placeholder(query)?;
        if entry.state.is_terminal() {
            return Ok(settled(entry, notify));
        }
        in_flight.insert(
            fingerprint.clone(),
            Flight {
                entry: entry.clone(),
                waiters: vec![notify],
                purged: false,
                follow_up: None,
            },
        );
        drop(in_flight);

        info!(event = "query_submitted", fingerprint = %fingerprint);
        self.launch(query.clone(), fingerprint);
        Ok((entry, true))
    }

    /// Stores the executing entry for a new run. If another instance settled
    /// the entry first, its terminal entry is returned instead.
    fn placeholder(&self, query: &Query) -> Result<QueryEntry, QueryError> {
        let entry = QueryEntry::executing(query.fingerprint(), query.encoded(), now());
        let control = self.lock_control();
        if control.upsert_owned_query_entry(&entry, self.lease.id())? {
            return Ok(entry);
        }
        Ok(control.query_entry(&entry.fingerprint)?.unwrap_or(entry))
    }

    /// The owner of an executing entry, when that is another instance that
    /// still holds its lease.
    fn live_foreign_owner(&self, fingerprint: &Fingerprint) -> Result<Option<String>, QueryError> {
        let owner = self.lock_control().query_entry_owner(fingerprint)?;
        match owner {
            Some(owner)
                if owner != self.lease.id()
                    && lease::owner_is_live(&self.config.cache_root, &owner)? =>
            {
                Ok(Some(owner))
            }
            _ => Ok(None),
        }
    }

    /// Polls an entry another instance is running until it settles, then
    /// forwards it to `notify`.
    fn watch_foreign(self: &Arc<Self>, fingerprint: Fingerprint, owner: String, notify: CompletionNotify) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(FOREIGN_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if notify.is_closed() {
                    return;
                }
                let poller = Arc::clone(&inner);
                let polled_fingerprint = fingerprint.clone();
                let polled_owner = owner.clone();
                let polled = tokio::task::spawn_blocking(move || {
                    poller.poll_foreign(&polled_fingerprint, &polled_owner)
                })
                .await;

                match polled {
                    Ok(Ok(ForeignPoll::Pending)) => {}
                    Ok(Ok(ForeignPoll::Settled(entry))) => {
                        let _ = notify.send(entry);
                        return;
                    }
                    Ok(Ok(ForeignPoll::Gone)) => {
                        debug!(event = "query_purged", fingerprint = %fingerprint, foreign = true);
                        return;
                    }
                    Ok(Err(err)) => {
                        warn!(event = "query_watch", fingerprint = %fingerprint, error = %err);
                    }
                    Err(err) => {
                        error!(event = "query_watch", fingerprint = %fingerprint, error = %err);
                        return;
                    }
                }
            }
        });
    }

    fn poll_foreign(&self, fingerprint: &Fingerprint, owner: &str) -> Result<ForeignPoll, QueryError> {
        let control = self.lock_control();
        let Some(entry) = control.query_entry(fingerprint)? else {
            return Ok(ForeignPoll::Gone);
        };
        if entry.state.is_terminal() {
            return Ok(ForeignPoll::Settled(entry));
        }
        if control.query_entry_owner(fingerprint)?.as_deref() != Some(owner) {
            // taken over by a rerun; keep waiting for that one
            return Ok(ForeignPoll::Pending);
        }
        if lease::owner_is_live(&self.config.cache_root, owner)? {
            return Ok(ForeignPoll::Pending);
        }

        let interrupted = control.fail_interrupted_queries(Some(owner), INTERRUPTED_ERROR, now())?;
        warn!(event = "query_interrupted", owner, count = interrupted);
        Ok(match control.query_entry(fingerprint)? {
            Some(entry) if entry.state.is_terminal() => ForeignPoll::Settled(entry),
            Some(_) => ForeignPoll::Pending,
            None => ForeignPoll::Gone,
        })
    }

    fn launch(self: &Arc<Self>, query: Query, fingerprint: Fingerprint) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            // the semaphore is never closed, so acquire only fails on shutdown
            let permit = Arc::clone(&inner.tokens).acquire_owned().await.ok();
            let worker = Arc::clone(&inner);
            let task_fingerprint = fingerprint.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let outcome = worker.run(&query, &task_fingerprint);
                worker.finish(&task_fingerprint, outcome);
            })
            .await;

            if let Err(err) = joined {
                error!(event = "query_failed", fingerprint = %fingerprint, error = %err);
                let finisher = Arc::clone(&inner);
                let _ = tokio::task::spawn_blocking(move || {
                    let outcome = Err(QueryError::Execution(format!("execution task failed: {err}")));
                    finisher.finish(&fingerprint, outcome);
                })
                .await;
            }
        });
    }

    fn run(&self, query: &Query, fingerprint: &Fingerprint) -> Result<ExecutionOutput, QueryError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.mark_started(fingerprint);
        info!(event = "query_executing", fingerprint = %fingerprint);

        let store = ObservationStore::open_with(&self.database, &self.config.store)?;
        write_result(&store, query, &self.artifact_path(fingerprint))
    }

    fn mark_started(&self, fingerprint: &Fingerprint) {
        let mut in_flight = self.lock_in_flight();
        let Some(flight) = in_flight.get_mut(fingerprint) else {
            return;
        };
        flight.entry.executed_at = Some(now());
        if flight.purged {
            return;
        }
        if let Err(err) = self.lock_control().upsert_query_entry(&flight.entry) {
            warn!(event = "query_executing", fingerprint = %fingerprint, error = %err);
        }
    }

    /// Records the terminal state, then notifies waiters and starts any
    /// follow-up execution.
    fn finish(self: &Arc<Self>, fingerprint: &Fingerprint, outcome: Result<ExecutionOutput, QueryError>) {
        let mut in_flight = self.lock_in_flight();
        let Some(flight) = in_flight.remove(fingerprint) else {
            return;
        };
        let Flight {
            entry: executing,
            waiters,
            purged,
            follow_up,
        } = flight;

        let completed_at = now();
        let artifact = self.artifact_path(fingerprint);
        let mut terminal = executing.clone();
        let transition = match outcome {
            Ok(output) => terminal.mark_complete(
                artifact.clone(),
                output.row_count,
                output.sources,
                completed_at,
            ),
            Err(err) => terminal.mark_failed(err.to_string(), completed_at),
        };
        if let Err(err) = transition {
            error!(event = "query_failed", fingerprint = %fingerprint, error = %err);
        }

        if purged {
            remove_artifact(&artifact);
            info!(event = "query_purged", fingerprint = %fingerprint, discarded = true);
        } else {
            let recorded = self.lock_control().upsert_query_entry(&terminal);
            match recorded {
                Ok(true) => {}
                Ok(false) => {
                    // another instance settled the entry first; its state stands
                    let stored = self.lock_control().query_entry(fingerprint);
                    match stored {
                        Ok(Some(stored)) => terminal = stored,
                        Ok(None) => {}
                        Err(err) => {
                            error!(event = "query_failed", fingerprint = %fingerprint, error = %err);
                        }
                    }
                    if terminal.state != QueryState::Complete {
                        remove_artifact(&artifact);
                    }
                }
                Err(err) => {
                    // the result cannot be served without its entry
                    remove_artifact(&artifact);
                    terminal = executing;
                    let _ = terminal
                        .mark_failed(format!("could not record result: {err}"), completed_at);
                    let fallback = self.lock_control().upsert_query_entry(&terminal);
                    if let Err(err) = fallback {
                        error!(event = "query_failed", fingerprint = %fingerprint, error = %err);
                    }
                }
            }
        }

        match terminal.state {
            QueryState::Complete => info!(
                event = "query_complete",
                fingerprint = %fingerprint,
                rows = terminal.row_count.unwrap_or(0),
                waiters = waiters.len()
            ),
            _ => warn!(
                event = "query_failed",
                fingerprint = %fingerprint,
                error = terminal.error.as_deref().unwrap_or_default()
            ),
        }

        for waiter in waiters {
            let _ = waiter.send(terminal.clone());
        }

        if let Some(follow_up) = follow_up {
            in_flight.insert(
                fingerprint.clone(),
                Flight {
                    entry: follow_up.entry,
                    waiters: follow_up.waiters,
                    purged: follow_up.purged,
                    follow_up: None,
                },
            );
            drop(in_flight);
            self.launch(follow_up.query, fingerprint.clone());
        }
    }

    fn purge(&self, fingerprint: &Fingerprint) -> Result<(), QueryError> {
        let mut in_flight = self.lock_in_flight();
        if let Some(flight) = in_flight.get_mut(fingerprint) {
            if !flight.purged {
                flight.purged = true;
            } else {
                match flight.follow_up.as_mut() {
                    Some(follow_up) if !follow_up.purged => follow_up.purged = true,
                    _ => return Err(QueryError::NotFound(fingerprint.clone())),
                }
            }
            self.lock_control().delete_query_entry(fingerprint)?;
            info!(event = "query_purged", fingerprint = %fingerprint, running = true);
            return Ok(());
        }

        if !self.lock_control().delete_query_entry(fingerprint)? {
            return Err(QueryError::NotFound(fingerprint.clone()));
        }
        // a new execution may only write the artifact once this one is gone
        match fs::remove_file(self.artifact_path(fingerprint)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        drop(in_flight);
        info!(event = "query_purged", fingerprint = %fingerprint);
        Ok(())
    }

    fn annotate(
        &self,
        fingerprint: &Fingerprint,
        metadata: BTreeMap<String, String>,
    ) -> Result<QueryEntry, QueryError> {
        let mut in_flight = self.lock_in_flight();
        if let Some(entry) = in_flight
            .get_mut(fingerprint)
            .and_then(Flight::live_entry_mut)
        {
            entry.metadata.extend(metadata.clone());
            if self.lock_control().upsert_query_entry(entry)? {
                return Ok(entry.clone());
            }
        }

        let control = self.lock_control();
        let mut entry = control
            .query_entry(fingerprint)?
            .ok_or_else(|| QueryError::NotFound(fingerprint.clone()))?;
        entry.metadata.extend(metadata);
        control.upsert_query_entry(&entry)?;
        Ok(entry)
    }

    fn artifact_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        artifact_path(&self.config.cache_root, fingerprint)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<Fingerprint, Flight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_control(&self) -> MutexGuard<'_, ObservationStore> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn artifact_path(cache_root: &Path, fingerprint: &Fingerprint) -> PathBuf {
    cache_root.join(format!("{fingerprint}.ndjson"))
}

fn settled(entry: QueryEntry, notify: CompletionNotify) -> (QueryEntry, bool) {
    let _ = notify.send(entry.clone());
    (entry, false)
}

fn remove_artifact(artifact: &Path) {
    if let Err(err) = fs::remove_file(artifact) {
        if err.kind() != ErrorKind::NotFound {
            warn!(event = "query_purged", path = %artifact.display(), error = %err);
        }
    }
}

fn now() -> DateTime<Utc> {
    // entries are stored at millisecond precision
    Utc::now().trunc_subsecs(3)
}
