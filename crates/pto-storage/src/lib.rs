use chrono::{DateTime, Utc};
use pto_core::obs_contracts::{path_source, path_target, Observation, ObservationSet};
use pto_core::query_contracts::{Fingerprint, QueryEntry, QueryState};
use pto_core::{format_sortable_timestamp, parse_rfc3339, ContractError};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const OBS_SCHEMA_VERSION: i64 = 3;

const OBSERVATION_INSERT_COLUMNS: &str =
    "INSERT INTO observations (set_id, time_start, time_end, path_id, condition_id, value) VALUES ";
const MAX_ROWS_PER_INSERT: usize = 128;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("{table} row for {value:?} vanished after insert conflict")]
    InternMissing { table: &'static str, value: String },
    #[error("observation set {set_id:x} not found")]
    SetNotFound { set_id: i64 },
    #[error(transparent)]
    Contract(#[from] ContractError),
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// The two uniquely-constrained string tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternTable {
    Paths,
    Conditions,
}

impl InternTable {
    pub fn as_str(self) -> &'static str {
        match self {
            InternTable::Paths => "paths",
            InternTable::Conditions => "conditions",
        }
    }

    fn select_sql(self) -> &'static str {
        match self {
            InternTable::Paths => "SELECT id FROM paths WHERE string = ?1",
            InternTable::Conditions => "SELECT id FROM conditions WHERE name = ?1",
        }
    }

    fn load_sql(self) -> &'static str {
        match self {
            InternTable::Paths => "SELECT string, id FROM paths ORDER BY id",
            InternTable::Conditions => "SELECT name, id FROM conditions ORDER BY id",
        }
    }

    fn count_sql(self) -> &'static str {
        match self {
            InternTable::Paths => "SELECT COUNT(*) FROM paths WHERE string = ?1",
            InternTable::Conditions => "SELECT COUNT(*) FROM conditions WHERE name = ?1",
        }
    }
}

/// Store surface the interning caches need. Implemented both by a plain
/// store (autocommit) and by an open transaction.
pub trait InternStore {
    fn select_interned_id(&self, table: InternTable, value: &str)
        -> Result<Option<i64>, StorageError>;

    /// Inserts `value` unless the unique constraint already holds it. Returns
    /// the new id, or `None` when another writer got there first.
    fn upsert_returning_id(&self, table: InternTable, value: &str)
        -> Result<Option<i64>, StorageError>;

    fn interned_rows(&self, table: InternTable) -> Result<Vec<(String, i64)>, StorageError>;
}

/// One observation joined with its path and condition strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationRow {
    pub set_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub path: String,
    pub source: Option<String>,
    pub target: Option<String>,
    pub condition: String,
    pub value: i64,
}

/// Row selection for streamed scans. Empty lists do not constrain; entries
/// within one list are alternatives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservationFilter {
    pub time_start: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
    pub set_ids: Vec<i64>,
    /// Exact names, or a prefix when ending in `*`.
    pub conditions: Vec<String>,
    pub path_prefixes: Vec<String>,
    pub on_path: Vec<String>,
    pub sources: Vec<String>,
    pub targets: Vec<String>,
    pub values: Vec<i64>,
}

impl ObservationFilter {
    pub fn for_set(set_id: i64) -> Self {
        Self {
            set_ids: vec![set_id],
            ..Self::default()
        }
    }

    fn where_clause(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if let Some(start) = &self.time_start {
            clauses.push("o.time_start >= ?".to_string());
            values.push(SqlValue::Text(format_sortable_timestamp(start)));
        }
        if let Some(end) = &self.time_end {
            clauses.push("o.time_end <= ?".to_string());
            values.push(SqlValue::Text(format_sortable_timestamp(end)));
        }
        if !self.set_ids.is_empty() {
            clauses.push(in_list("o.set_id", self.set_ids.len()));
            values.extend(self.set_ids.iter().map(|id| SqlValue::Integer(*id)));
        }
        if !self.conditions.is_empty() {
            let mut alternatives = Vec::new();
            for condition in &self.conditions {
                match condition.strip_suffix('*') {
                    Some(prefix) => {
                        alternatives.push("substr(c.name, 1, ?) = ?".to_string());
                        values.push(SqlValue::Integer(prefix.chars().count() as i64));
                        values.push(SqlValue::Text(prefix.to_string()));
                    }
                    None => {
                        alternatives.push("c.name = ?".to_string());
                        values.push(SqlValue::Text(condition.clone()));
                    }
                }
            }
            clauses.push(format!("({})", alternatives.join(" OR ")));
        }
        if !self.path_prefixes.is_empty() {
            let alternatives = self
                .path_prefixes
                .iter()
                .map(|prefix| {
                    values.push(SqlValue::Integer(prefix.chars().count() as i64));
                    values.push(SqlValue::Text(prefix.clone()));
                    "substr(p.string, 1, ?) = ?"
                })
                .collect::<Vec<_>>();
            clauses.push(format!("({})", alternatives.join(" OR ")));
        }
        if !self.on_path.is_empty() {
            let alternatives = self
                .on_path
                .iter()
                .map(|element| {
                    values.push(SqlValue::Text(element.clone()));
                    "instr(p.string, ?) > 0"
                })
                .collect::<Vec<_>>();
            clauses.push(format!("({})", alternatives.join(" OR ")));
        }
        if !self.sources.is_empty() {
            clauses.push(in_list("p.source", self.sources.len()));
            values.extend(self.sources.iter().cloned().map(SqlValue::Text));
        }
        if !self.targets.is_empty() {
            clauses.push(in_list("p.target", self.targets.len()));
            values.extend(self.targets.iter().cloned().map(SqlValue::Text));
        }
        if !self.values.is_empty() {
            clauses.push(in_list("o.value", self.values.len()));
            values.extend(self.values.iter().map(|value| SqlValue::Integer(*value)));
        }

        if clauses.is_empty() {
            (String::new(), values)
        } else {
            (format!("WHERE {}", clauses.join(" AND ")), values)
        }
    }
}

fn in_list(column: &str, len: usize) -> String {
    format!("{column} IN ({})", vec!["?"; len].join(", "))
}

pub struct ObservationStore {
    conn: Connection,
}

impl ObservationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with(path, &StoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(options.busy_timeout)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        Self::configure(conn, options)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn, &StoreOptions::default())
    }

    fn configure(conn: Connection, options: &StoreOptions) -> Result<Self, StorageError> {
        conn.busy_timeout(options.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let mut store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&mut self) -> Result<(), StorageError> {
        if self.schema_version()? == OBS_SCHEMA_VERSION {
            return Ok(());
        }

        // concurrent openers serialize here and re-read the version
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut current: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > OBS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: OBS_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_observation_schema.sql");
            tx.execute_batch(sql)?;
            tx.execute_batch("PRAGMA user_version = 1;")?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_query_cache.sql");
            tx.execute_batch(sql)?;
            tx.execute_batch("PRAGMA user_version = 2;")?;
            current = 2;
        }

        if current < 3 {
            let sql = include_str!("../migrations/0003_set_conditions_and_owners.sql");
            tx.execute_batch(sql)?;
            tx.execute_batch("PRAGMA user_version = 3;")?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Runs `work` inside one write transaction. The transaction commits only
    /// if `work` returns `Ok`; any error rolls everything back.
    pub fn transaction<T, E, F>(&mut self, work: F) -> Result<T, E>
    where
        F: FnOnce(&StoreTransaction<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let scoped = StoreTransaction { tx };
        let value = work(&scoped)?;
        scoped.tx.commit().map_err(StorageError::from)?;
        Ok(value)
    }

    pub fn observation_set(&self, set_id: i64) -> Result<Option<ObservationSet>, StorageError> {
        select_observation_set(&self.conn, set_id)
    }

    /// Applies a metadata update to a set that is already stored. Provenance
    /// keys may not change, and a `_conditions` declaration must still cover
    /// every condition the set's observations use.
    pub fn update_set_metadata(
        &mut self,
        set_id: i64,
        patch: Map<String, Value>,
    ) -> Result<ObservationSet, StorageError> {
        self.transaction(|tx| -> Result<ObservationSet, StorageError> {
            let mut set = select_observation_set(&tx.tx, set_id)?
                .ok_or(StorageError::SetNotFound { set_id })?;
            set.apply_metadata_update(patch)?;
            let used = tx.condition_names_for_set(set_id)?;
            set.verify_conditions(used.iter().map(String::as_str))?;
            tx.update_observation_set(&set)?;
            Ok(set)
        })
    }

    pub fn observation_set_ids(&self) -> Result<Vec<i64>, StorageError> {
        let mut statement = self
            .conn
            .prepare("SELECT id FROM observation_sets ORDER BY id ASC")?;
        let rows = statement.query_map([], |row| row.get::<_, i64>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn count_observations(&self, set_id: i64) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM observations WHERE set_id = ?1",
            [set_id],
            |row| row.get(0),
        )?)
    }

    pub fn observations_for_set(&self, set_id: i64) -> Result<Vec<Observation>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, set_id, time_start, time_end, path_id, condition_id, value
            FROM observations
            WHERE set_id = ?1
            ORDER BY id ASC
            ",
        )?;
        let rows = statement.query_map([set_id], |row| {
            Ok(Observation {
                id: row.get(0)?,
                set_id: row.get(1)?,
                start: timestamp_column(row, 2)?,
                end: timestamp_column(row, 3)?,
                path_id: row.get(4)?,
                condition_id: row.get(5)?,
                value: row.get(6)?,
            })
        })?;

        let mut observations = Vec::new();
        for row in rows {
            observations.push(row?);
        }
        Ok(observations)
    }

    /// Deletes a set together with its observations.
    pub fn delete_observation_set(&self, set_id: i64) -> Result<bool, StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM observation_sets WHERE id = ?1", [set_id])?;
        Ok(changes > 0)
    }

    pub fn interned_row_count(&self, table: InternTable, value: &str) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row(table.count_sql(), [value], |row| row.get(0))?)
    }

    /// Streams every observation matching `filter` to `visit`, in insertion
    /// order, without materializing the result set. Returns the row count.
    pub fn scan_observations<E, F>(&self, filter: &ObservationFilter, mut visit: F) -> Result<u64, E>
    where
        F: FnMut(ObservationRow) -> Result<(), E>,
        E: From<StorageError>,
    {
        let (where_clause, values) = filter.where_clause();
        let sql = format!(
            "
            SELECT o.set_id, o.time_start, o.time_end, p.string, p.source, p.target, c.name, o.value
            FROM observations o
            JOIN paths p ON p.id = o.path_id
            JOIN conditions c ON c.id = o.condition_id
            {where_clause}
            ORDER BY o.id ASC
            "
        );

        let mut statement = self.conn.prepare(&sql).map_err(StorageError::from)?;
        let mut rows = statement
            .query(params_from_iter(values.iter()))
            .map_err(StorageError::from)?;

        let mut count = 0;
        while let Some(row) = rows.next().map_err(StorageError::from)? {
            let observation = observation_row(row).map_err(StorageError::from)?;
            visit(observation)?;
            count += 1;
        }
        Ok(count)
    }

    /// Writes `entry` unless that would move a stored terminal entry to a
    /// different state. Returns whether a row was written.
    pub fn upsert_query_entry(&self, entry: &QueryEntry) -> Result<bool, StorageError> {
        self.write_query_entry(entry, None)
    }

    /// Like [`Self::upsert_query_entry`], also recording which cache instance
    /// is responsible for the entry while it executes.
    pub fn upsert_owned_query_entry(
        &self,
        entry: &QueryEntry,
        owner: &str,
    ) -> Result<bool, StorageError> {
        self.write_query_entry(entry, Some(owner))
    }

    fn write_query_entry(&self, entry: &QueryEntry, owner: Option<&str>) -> Result<bool, StorageError> {
        let sources_json = serde_json::to_string(&entry.sources)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let metadata_json = serde_json::to_string(&entry.metadata)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let result_location = entry
            .result_location
            .as_ref()
            .map(|location| location.to_string_lossy().into_owned());

        // terminal rows only accept rewrites in the same state (annotations)
        let changes = self.conn.execute(
            "
            INSERT INTO query_entries (
                fingerprint,
                encoded,
                state,
                error,
                result_location,
                row_count,
                sources_json,
                metadata_json,
                created_at,
                executed_at,
                completed_at,
                owner
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(fingerprint) DO UPDATE SET
                encoded=excluded.encoded,
                state=excluded.state,
                error=excluded.error,
                result_location=excluded.result_location,
                row_count=excluded.row_count,
                sources_json=excluded.sources_json,
                metadata_json=excluded.metadata_json,
                created_at=excluded.created_at,
                executed_at=excluded.executed_at,
                completed_at=excluded.completed_at,
                owner=COALESCE(excluded.owner, query_entries.owner)
            WHERE query_entries.state = ?13 OR query_entries.state = excluded.state
            ",
            params![
                entry.fingerprint.as_str(),
                entry.encoded,
                entry.state.as_str(),
                entry.error,
                result_location,
                entry.row_count.map(|count| count as i64),
                sources_json,
                metadata_json,
                format_sortable_timestamp(&entry.created_at),
                entry.executed_at.as_ref().map(format_sortable_timestamp),
                entry.completed_at.as_ref().map(format_sortable_timestamp),
                owner,
                QueryState::Executing.as_str(),
            ],
        )?;

        Ok(changes > 0)
    }

    pub fn query_entry_owner(&self, fingerprint: &Fingerprint) -> Result<Option<String>, StorageError> {
        let owner = self
            .conn
            .query_row(
                "SELECT owner FROM query_entries WHERE fingerprint = ?1",
                [fingerprint.as_str()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(owner.flatten())
    }

    /// Distinct owners of entries still marked executing; `None` stands for
    /// rows written before owners were recorded.
    pub fn executing_query_owners(&self) -> Result<Vec<Option<String>>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT DISTINCT owner FROM query_entries WHERE state = ?1 ORDER BY owner",
        )?;
        let rows = statement.query_map([QueryState::Executing.as_str()], |row| {
            row.get::<_, Option<String>>(0)
        })?;

        let mut owners = Vec::new();
        for row in rows {
            owners.push(row?);
        }
        Ok(owners)
    }

    pub fn query_entry(&self, fingerprint: &Fingerprint) -> Result<Option<QueryEntry>, StorageError> {
        let entry = self
            .conn
            .query_row(
                "
                SELECT fingerprint, encoded, state, error, result_location, row_count,
                       sources_json, metadata_json, created_at, executed_at, completed_at
                FROM query_entries
                WHERE fingerprint = ?1
                ",
                [fingerprint.as_str()],
                query_entry_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn query_entries(&self) -> Result<Vec<QueryEntry>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT fingerprint, encoded, state, error, result_location, row_count,
                   sources_json, metadata_json, created_at, executed_at, completed_at
            FROM query_entries
            ORDER BY created_at ASC, fingerprint ASC
            ",
        )?;
        let rows = statement.query_map([], query_entry_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn delete_query_entry(&self, fingerprint: &Fingerprint) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "DELETE FROM query_entries WHERE fingerprint = ?1",
            [fingerprint.as_str()],
        )?;
        Ok(changes > 0)
    }

    /// Moves the executing entries of `owner` to failed. Only valid once that
    /// owner is known to be gone; `None` matches rows without an owner.
    pub fn fail_interrupted_queries(
        &self,
        owner: Option<&str>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "
            UPDATE query_entries
            SET state = ?1, error = ?2, completed_at = ?3
            WHERE state = ?4 AND owner IS ?5
            ",
            params![
                QueryState::Failed.as_str(),
                error,
                format_sortable_timestamp(&now),
                QueryState::Executing.as_str(),
                owner,
            ],
        )?)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

impl InternStore for ObservationStore {
    fn select_interned_id(
        &self,
        table: InternTable,
        value: &str,
    ) -> Result<Option<i64>, StorageError> {
        select_interned_id(&self.conn, table, value)
    }

    fn upsert_returning_id(
        &self,
        table: InternTable,
        value: &str,
    ) -> Result<Option<i64>, StorageError> {
        upsert_interned(&self.conn, table, value)
    }

    fn interned_rows(&self, table: InternTable) -> Result<Vec<(String, i64)>, StorageError> {
        interned_rows(&self.conn, table)
    }
}

/// Write access inside [`ObservationStore::transaction`].
pub struct StoreTransaction<'a> {
    tx: Transaction<'a>,
}

impl StoreTransaction<'_> {
    /// Inserts `set` and returns the id the store assigned; `set.id` is ignored.
    pub fn insert_observation_set(&self, set: &ObservationSet) -> Result<i64, StorageError> {
        let (sources_json, conditions_json, metadata_json) = set_json(set)?;
        self.tx.execute(
            "
            INSERT INTO observation_sets (
                sources_json, analyzer, conditions_json, metadata_json, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                sources_json,
                set.analyzer,
                conditions_json,
                metadata_json,
                format_sortable_timestamp(&set.created_at),
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn update_observation_set(&self, set: &ObservationSet) -> Result<(), StorageError> {
        let (sources_json, conditions_json, metadata_json) = set_json(set)?;
        self.tx.execute(
            "
            UPDATE observation_sets
            SET sources_json = ?1, analyzer = ?2, conditions_json = ?3, metadata_json = ?4
            WHERE id = ?5
            ",
            params![sources_json, set.analyzer, conditions_json, metadata_json, set.id],
        )?;
        Ok(())
    }

    pub fn condition_names_for_set(&self, set_id: i64) -> Result<Vec<String>, StorageError> {
        let mut statement = self.tx.prepare(
            "
            SELECT DISTINCT c.name
            FROM observations o
            JOIN conditions c ON c.id = o.condition_id
            WHERE o.set_id = ?1
            ORDER BY c.name
            ",
        )?;
        let rows = statement.query_map([set_id], |row| row.get::<_, String>(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Appends observations with multi-row inserts. Observation ids are
    /// assigned by the store; the `id` field of each input is ignored.
    pub fn append_observations(&self, observations: &[Observation]) -> Result<usize, StorageError> {
        for chunk in observations.chunks(MAX_ROWS_PER_INSERT) {
            let mut statement = self.tx.prepare_cached(&observation_insert_sql(chunk.len()))?;
            let mut values = Vec::with_capacity(chunk.len() * 6);
            for observation in chunk {
                values.push(SqlValue::Integer(observation.set_id));
                values.push(SqlValue::Text(format_sortable_timestamp(&observation.start)));
                values.push(SqlValue::Text(format_sortable_timestamp(&observation.end)));
                values.push(SqlValue::Integer(observation.path_id));
                values.push(SqlValue::Integer(observation.condition_id));
                values.push(SqlValue::Integer(observation.value));
            }
            statement.execute(params_from_iter(values.iter()))?;
        }
        Ok(observations.len())
    }
}

impl InternStore for StoreTransaction<'_> {
    fn select_interned_id(
        &self,
        table: InternTable,
        value: &str,
    ) -> Result<Option<i64>, StorageError> {
        select_interned_id(&self.tx, table, value)
    }

    fn upsert_returning_id(
        &self,
        table: InternTable,
        value: &str,
    ) -> Result<Option<i64>, StorageError> {
        upsert_interned(&self.tx, table, value)
    }

    fn interned_rows(&self, table: InternTable) -> Result<Vec<(String, i64)>, StorageError> {
        interned_rows(&self.tx, table)
    }
}

fn select_interned_id(
    conn: &Connection,
    table: InternTable,
    value: &str,
) -> Result<Option<i64>, StorageError> {
    let mut statement = conn.prepare_cached(table.select_sql())?;
    Ok(statement
        .query_row([value], |row| row.get::<_, i64>(0))
        .optional()?)
}

fn upsert_interned(
    conn: &Connection,
    table: InternTable,
    value: &str,
) -> Result<Option<i64>, StorageError> {
    let id = match table {
        InternTable::Paths => {
            let mut statement = conn.prepare_cached(
                "
                INSERT INTO paths (string, source, target) VALUES (?1, ?2, ?3)
                ON CONFLICT(string) DO NOTHING
                RETURNING id
                ",
            )?;
            statement
                .query_row(
                    params![value, path_source(value), path_target(value)],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
        }
        InternTable::Conditions => {
            let mut statement = conn.prepare_cached(
                "
                INSERT INTO conditions (name) VALUES (?1)
                ON CONFLICT(name) DO NOTHING
                RETURNING id
                ",
            )?;
            statement
                .query_row([value], |row| row.get::<_, i64>(0))
                .optional()?
        }
    };
    Ok(id)
}

fn interned_rows(conn: &Connection, table: InternTable) -> Result<Vec<(String, i64)>, StorageError> {
    let mut statement = conn.prepare(table.load_sql())?;
    let rows = statement.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn observation_insert_sql(rows: usize) -> String {
    let mut sql = String::from(OBSERVATION_INSERT_COLUMNS);
    for index in 0..rows {
        if index > 0 {
            sql.push_str(", ");
        }
        sql.push_str("(?, ?, ?, ?, ?, ?)");
    }
    sql
}

fn set_json(set: &ObservationSet) -> Result<(String, String, String), StorageError> {
    let sources_json = serde_json::to_string(&set.sources)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let conditions_json = serde_json::to_string(&set.conditions)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let metadata_json = serde_json::to_string(&set.metadata)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    Ok((sources_json, conditions_json, metadata_json))
}

fn select_observation_set(
    conn: &Connection,
    set_id: i64,
) -> Result<Option<ObservationSet>, StorageError> {
    let set = conn
        .query_row(
            "
            SELECT id, sources_json, analyzer, conditions_json, metadata_json, created_at
            FROM observation_sets
            WHERE id = ?1
            ",
            [set_id],
            |row| {
                Ok(ObservationSet {
                    id: row.get(0)?,
                    sources: json_column(row, 1)?,
                    analyzer: row.get(2)?,
                    conditions: json_column(row, 3)?,
                    metadata: json_column(row, 4)?,
                    created_at: timestamp_column(row, 5)?,
                })
            },
        )
        .optional()?;
    Ok(set)
}

fn observation_row(row: &Row<'_>) -> rusqlite::Result<ObservationRow> {
    Ok(ObservationRow {
        set_id: row.get(0)?,
        start: timestamp_column(row, 1)?,
        end: timestamp_column(row, 2)?,
        path: row.get(3)?,
        source: row.get(4)?,
        target: row.get(5)?,
        condition: row.get(6)?,
        value: row.get(7)?,
    })
}

fn query_entry_row(row: &Row<'_>) -> rusqlite::Result<QueryEntry> {
    let fingerprint_raw: String = row.get(0)?;
    let fingerprint = Fingerprint::parse(&fingerprint_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
    })?;
    let state_raw: String = row.get(2)?;
    let state = QueryState::parse(&state_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            Box::new(StorageError::Serialization(format!(
                "invalid query state: {state_raw}"
            ))),
        )
    })?;
    let sources: Vec<i64> = json_column(row, 6)?;
    let metadata: BTreeMap<String, String> = json_column(row, 7)?;

    Ok(QueryEntry {
        fingerprint,
        encoded: row.get(1)?,
        state,
        error: row.get(3)?,
        result_location: row.get::<_, Option<String>>(4)?.map(PathBuf::from),
        row_count: row.get::<_, Option<i64>>(5)?.map(|count| count.max(0) as u64),
        sources,
        metadata,
        created_at: timestamp_column(row, 8)?,
        executed_at: optional_timestamp_column(row, 9)?,
        completed_at: optional_timestamp_column(row, 10)?,
    })
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
    })
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_timestamp(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
    })
}

fn optional_timestamp_column(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(index)? {
        Some(raw) => parse_timestamp(&raw).map(Some).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
        }),
        None => Ok(None),
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    parse_rfc3339(value).map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn intern(store: &impl InternStore, table: InternTable, value: &str) -> i64 {
        match store.upsert_returning_id(table, value).expect("upsert") {
            Some(id) => id,
            None => store
                .select_interned_id(table, value)
                .expect("select")
                .expect("present"),
        }
    }

    fn seed_set(store: &mut ObservationStore, rows: &[(u32, &str, &str, i64)]) -> i64 {
        store
            .transaction(|tx| -> Result<i64, StorageError> {
                let mut set = ObservationSet::placeholder(ts(0));
                set.analyzer = "https://analyzer.example/test".to_string();
                let set_id = tx.insert_observation_set(&set)?;

                let mut observations = Vec::new();
                for (hour, path, condition, value) in rows {
                    observations.push(Observation {
                        id: 0,
                        set_id,
                        start: ts(*hour),
                        end: ts(*hour + 1),
                        path_id: intern(tx, InternTable::Paths, path),
                        condition_id: intern(tx, InternTable::Conditions, condition),
                        value: *value,
                    });
                }
                tx.append_observations(&observations)?;
                Ok(set_id)
            })
            .expect("seed set")
    }

    #[test]
    fn migration_creates_observation_tables() {
        let db = ObservationStore::open_in_memory().expect("open db");

        for table in [
            "conditions",
            "paths",
            "observation_sets",
            "observations",
            "query_entries",
        ] {
            assert!(db.table_exists(table).expect("table check"));
        }

        assert_eq!(
            db.schema_version().expect("schema version"),
            OBS_SCHEMA_VERSION
        );
    }

    #[test]
    fn reopening_file_store_keeps_schema_and_rows() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("obs.db");
        {
            let store = ObservationStore::open(&path).expect("open db");
            assert_eq!(
                store
                    .upsert_returning_id(InternTable::Conditions, "pto.test.ok")
                    .expect("insert"),
                Some(1)
            );
        }

        let store = ObservationStore::open(&path).expect("reopen db");
        assert_eq!(store.schema_version().expect("version"), OBS_SCHEMA_VERSION);
        assert_eq!(
            store
                .select_interned_id(InternTable::Conditions, "pto.test.ok")
                .expect("select"),
            Some(1)
        );
    }

    #[test]
    fn upsert_reports_conflict_instead_of_duplicating() {
        let store = ObservationStore::open_in_memory().expect("open db");
        let first = store
            .upsert_returning_id(InternTable::Paths, "10.0.0.1 * 10.0.0.2")
            .expect("insert")
            .expect("new id");
        let second = store
            .upsert_returning_id(InternTable::Paths, "10.0.0.1 * 10.0.0.2")
            .expect("conflict is not an error");

        assert_eq!(second, None);
        assert_eq!(
            store
                .select_interned_id(InternTable::Paths, "10.0.0.1 * 10.0.0.2")
                .expect("select"),
            Some(first)
        );
        assert_eq!(
            store
                .interned_row_count(InternTable::Paths, "10.0.0.1 * 10.0.0.2")
                .expect("count"),
            1
        );

        let rows = store.interned_rows(InternTable::Paths).expect("load all");
        assert_eq!(rows, vec![("10.0.0.1 * 10.0.0.2".to_string(), first)]);
    }

    #[test]
    fn failed_transaction_rolls_back_every_row() {
        let mut store = ObservationStore::open_in_memory().expect("open db");

        let result = store.transaction(|tx| -> Result<(), StorageError> {
            let set_id = tx.insert_observation_set(&ObservationSet::placeholder(ts(0)))?;
            let path_id = intern(tx, InternTable::Paths, "a * b");
            let condition_id = intern(tx, InternTable::Conditions, "pto.test.ok");
            tx.append_observations(&[Observation {
                id: 0,
                set_id,
                start: ts(1),
                end: ts(2),
                path_id,
                condition_id,
                value: 0,
            }])?;
            Err(StorageError::Serialization("forced".to_string()))
        });

        assert!(result.is_err());
        assert!(store.observation_set_ids().expect("ids").is_empty());
        assert_eq!(
            store
                .interned_row_count(InternTable::Paths, "a * b")
                .expect("count"),
            0
        );
    }

    #[test]
    fn set_metadata_roundtrip_and_cascading_delete() {
        let mut store = ObservationStore::open_in_memory().expect("open db");
        let set_id = seed_set(&mut store, &[(1, "a * b", "pto.test.ok", 0)]);

        store
            .transaction(|tx| -> Result<(), StorageError> {
                let mut set = ObservationSet::placeholder(ts(0));
                set.id = set_id;
                set.sources = vec!["https://raw.example/1".to_string()];
                set.analyzer = "https://analyzer.example/test".to_string();
                set.metadata.insert("description".to_string(), json!("d"));
                tx.update_observation_set(&set)
            })
            .expect("update");

        let loaded = store
            .observation_set(set_id)
            .expect("select")
            .expect("present");
        assert_eq!(loaded.sources, vec!["https://raw.example/1".to_string()]);
        assert_eq!(loaded.metadata.get("description"), Some(&json!("d")));
        assert_eq!(loaded.created_at, ts(0));
        assert_eq!(store.count_observations(set_id).expect("count"), 1);

        assert!(store.delete_observation_set(set_id).expect("delete"));
        assert_eq!(store.count_observations(set_id).expect("count"), 0);
        assert!(store.observation_set(set_id).expect("select").is_none());
    }

    #[test]
    fn bulk_append_spans_multiple_statements() {
        let mut store = ObservationStore::open_in_memory().expect("open db");
        let rows = (0..(MAX_ROWS_PER_INSERT * 2 + 5))
            .map(|index| (1, "a * b", "pto.test.ok", index as i64))
            .collect::<Vec<_>>();
        let set_id = seed_set(&mut store, &rows);

        let stored = store.observations_for_set(set_id).expect("observations");
        assert_eq!(stored.len(), rows.len());
        assert_eq!(stored.last().map(|obs| obs.value), Some(rows.len() as i64 - 1));
    }

    #[test]
    fn scan_applies_every_filter_kind() {
        let mut store = ObservationStore::open_in_memory().expect("open db");
        let first = seed_set(
            &mut store,
            &[
                (1, "10.0.0.1 * 10.0.0.2", "ecn.connectivity.works", 0),
                (2, "10.0.0.1 * 10.0.0.3", "ecn.connectivity.broken", 1),
                (5, "10.9.9.9 * 10.0.0.2", "tcp.option.sack", 2),
            ],
        );
        let second = seed_set(&mut store, &[(3, "10.0.0.1 * 10.0.0.2", "ecn.negotiated", 0)]);

        let collect = |filter: ObservationFilter| -> Vec<ObservationRow> {
            let mut rows = Vec::new();
            store
                .scan_observations(&filter, |row| -> Result<(), StorageError> {
                    rows.push(row);
                    Ok(())
                })
                .expect("scan");
            rows
        };

        assert_eq!(collect(ObservationFilter::default()).len(), 4);
        assert_eq!(collect(ObservationFilter::for_set(second)).len(), 1);

        let by_time = collect(ObservationFilter {
            time_start: Some(ts(1)),
            time_end: Some(ts(4)),
            ..ObservationFilter::default()
        });
        assert_eq!(by_time.len(), 3);

        let by_wildcard = collect(ObservationFilter {
            conditions: vec!["ecn.connectivity.*".to_string()],
            ..ObservationFilter::default()
        });
        assert_eq!(by_wildcard.len(), 2);
        assert!(by_wildcard.iter().all(|row| row.set_id == first));

        let by_prefix = collect(ObservationFilter {
            path_prefixes: vec!["10.0.0.1 ".to_string()],
            targets: vec!["10.0.0.2".to_string()],
            ..ObservationFilter::default()
        });
        assert_eq!(by_prefix.len(), 2);
        assert_eq!(by_prefix[0].source.as_deref(), Some("10.0.0.1"));

        let by_value = collect(ObservationFilter {
            values: vec![2],
            on_path: vec!["9.9".to_string()],
            ..ObservationFilter::default()
        });
        assert_eq!(by_value.len(), 1);
        assert_eq!(by_value[0].condition, "tcp.option.sack");
    }

    #[test]
    fn query_entries_roundtrip_and_interrupted_recovery() {
        let store = ObservationStore::open_in_memory().expect("open db");
        let mut complete = QueryEntry::executing(Fingerprint::of_encoded("a"), "a", ts(0));
        complete
            .mark_complete(PathBuf::from("/cache/a.ndjson"), 4, vec![1, 2], ts(1))
            .expect("complete");
        complete
            .metadata
            .insert("_ext_ref".to_string(), "doi:1".to_string());
        store.upsert_query_entry(&complete).expect("upsert complete");

        let executing = QueryEntry::executing(Fingerprint::of_encoded("b"), "b", ts(0));
        store.upsert_query_entry(&executing).expect("upsert executing");
        let live = QueryEntry::executing(Fingerprint::of_encoded("c"), "c", ts(0));
        assert!(store
            .upsert_owned_query_entry(&live, "owner-live")
            .expect("upsert owned"));

        assert_eq!(
            store
                .query_entry(&complete.fingerprint)
                .expect("select")
                .expect("present"),
            complete
        );

        assert_eq!(
            store.executing_query_owners().expect("owners"),
            vec![None, Some("owner-live".to_string())]
        );
        let failed = store
            .fail_interrupted_queries(None, "interrupted", ts(2))
            .expect("recover");
        assert_eq!(failed, 1);
        assert_eq!(
            store
                .query_entry(&live.fingerprint)
                .expect("select")
                .expect("present")
                .state,
            QueryState::Executing
        );
        assert_eq!(
            store.query_entry_owner(&live.fingerprint).expect("owner").as_deref(),
            Some("owner-live")
        );
        let recovered = store
            .query_entry(&executing.fingerprint)
            .expect("select")
            .expect("present");
        assert_eq!(recovered.state, QueryState::Failed);
        assert_eq!(recovered.error.as_deref(), Some("interrupted"));

        assert_eq!(store.query_entries().expect("list").len(), 3);
        assert!(store
            .delete_query_entry(&executing.fingerprint)
            .expect("delete"));
        assert!(!store
            .delete_query_entry(&executing.fingerprint)
            .expect("second delete"));
    }

    #[test]
    fn terminal_entries_keep_their_state() {
        let store = ObservationStore::open_in_memory().expect("open db");
        let executing = QueryEntry::executing(Fingerprint::of_encoded("q"), "q", ts(0));
        assert!(store
            .upsert_owned_query_entry(&executing, "owner-a")
            .expect("placeholder"));

        let mut failed = executing.clone();
        failed.mark_failed("interrupted", ts(1)).expect("fail");
        assert!(store.upsert_query_entry(&failed).expect("fail row"));

        let mut complete = executing.clone();
        complete
            .mark_complete(PathBuf::from("/cache/q.ndjson"), 2, vec![1], ts(2))
            .expect("complete");
        assert!(!store.upsert_query_entry(&complete).expect("guarded write"));
        assert!(!store
            .upsert_owned_query_entry(&executing, "owner-b")
            .expect("guarded placeholder"));

        let stored = store
            .query_entry(&executing.fingerprint)
            .expect("select")
            .expect("present");
        assert_eq!(stored, failed);
        assert_eq!(
            store.query_entry_owner(&executing.fingerprint).expect("owner").as_deref(),
            Some("owner-a")
        );

        let mut annotated = failed.clone();
        annotated
            .metadata
            .insert("note".to_string(), "rerun later".to_string());
        assert!(store.upsert_query_entry(&annotated).expect("annotate"));
    }

    #[test]
    fn set_metadata_update_checks_provenance_and_conditions() {
        let mut store = ObservationStore::open_in_memory().expect("open db");
        let set_id = seed_set(
            &mut store,
            &[
                (1, "a * b", "ecn.connectivity.works", 0),
                (2, "a * c", "ecn.connectivity.broken", 0),
            ],
        );

        let mut patch = Map::new();
        patch.insert("description".to_string(), json!("second pass"));
        patch.insert(
            "_conditions".to_string(),
            json!(["ecn.connectivity.works", "ecn.connectivity.broken"]),
        );
        let updated = store.update_set_metadata(set_id, patch).expect("update");
        assert_eq!(updated.conditions.len(), 2);

        let loaded = store
            .observation_set(set_id)
            .expect("select")
            .expect("present");
        assert_eq!(loaded, updated);
        assert_eq!(loaded.metadata.get("description"), Some(&json!("second pass")));

        let mut narrowing = Map::new();
        narrowing.insert("_conditions".to_string(), json!(["ecn.connectivity.works"]));
        let err = store
            .update_set_metadata(set_id, narrowing)
            .expect_err("drops a used condition");
        assert!(matches!(
            err,
            StorageError::Contract(ContractError::UndeclaredCondition { ref condition })
                if condition == "ecn.connectivity.broken"
        ));

        let mut moved = Map::new();
        moved.insert("_analyzer".to_string(), json!("https://elsewhere"));
        let err = store
            .update_set_metadata(set_id, moved)
            .expect_err("analyzer is fixed");
        assert!(matches!(
            err,
            StorageError::Contract(ContractError::ImmutableMetadata { .. })
        ));
        assert_eq!(
            store.observation_set(set_id).expect("select").expect("present"),
            loaded
        );

        let err = store
            .update_set_metadata(set_id + 100, Map::new())
            .expect_err("missing set");
        assert!(matches!(err, StorageError::SetNotFound { .. }));
    }
}
