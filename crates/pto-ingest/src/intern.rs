use pto_storage::{InternStore, InternTable, StorageError};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Process-wide insert-or-get cache from a path or condition string to its
/// store id. Shared by reference between ingestion jobs; it only ever grows.
#[derive(Debug)]
pub struct InternCache {
    table: InternTable,
    ids: RwLock<HashMap<String, i64>>,
}

impl InternCache {
    pub fn new(table: InternTable) -> Self {
        Self {
            table,
            ids: RwLock::new(HashMap::new()),
        }
    }

    pub fn paths() -> Self {
        Self::new(InternTable::Paths)
    }

    pub fn conditions() -> Self {
        Self::new(InternTable::Conditions)
    }

    /// Builds a cache holding every row already in `table`.
    pub fn load_all(store: &impl InternStore, table: InternTable) -> Result<Self, StorageError> {
        let cache = Self::new(table);
        cache.preload(store)?;
        Ok(cache)
    }

    /// Bulk-reads the backing table into the mapping. Returns the number of
    /// rows read.
    pub fn preload(&self, store: &impl InternStore) -> Result<usize, StorageError> {
        let rows = store.interned_rows(self.table)?;
        let count = rows.len();
        self.write_ids().extend(rows);
        info!(event = "intern_preload", table = self.table.as_str(), count);
        Ok(count)
    }

    pub fn table(&self) -> InternTable {
        self.table
    }

    pub fn get(&self, candidate: &str) -> Option<i64> {
        self.read_ids().get(candidate).copied()
    }

    pub fn len(&self) -> usize {
        self.read_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves `candidate` against a store whose writes are already durable
    /// (autocommit) and caches the id right away.
    pub fn ensure(&self, store: &impl InternStore, candidate: &str) -> Result<i64, StorageError> {
        if let Some(id) = self.get(candidate) {
            return Ok(id);
        }
        let id = resolve(store, self.table, candidate)?;
        self.write_ids().entry(candidate.to_string()).or_insert(id);
        Ok(id)
    }

    /// Starts a resolution scope for use inside a store transaction. Ids found
    /// or minted in the scope reach the shared mapping only through
    /// [`StagedIntern::publish`], which callers invoke after commit.
    pub fn staged(&self) -> StagedIntern<'_> {
        StagedIntern {
            cache: self,
            pending: HashMap::new(),
        }
    }

    fn read_ids(&self) -> RwLockReadGuard<'_, HashMap<String, i64>> {
        // entries are only ever inserted whole, so a poisoned map is still valid
        self.ids.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_ids(&self) -> RwLockWriteGuard<'_, HashMap<String, i64>> {
        self.ids.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Ids resolved inside one uncommitted transaction.
#[derive(Debug)]
pub struct StagedIntern<'a> {
    cache: &'a InternCache,
    pending: HashMap<String, i64>,
}

impl StagedIntern<'_> {
    pub fn ensure(&mut self, store: &impl InternStore, candidate: &str) -> Result<i64, StorageError> {
        if let Some(id) = self.cache.get(candidate) {
            return Ok(id);
        }
        if let Some(id) = self.pending.get(candidate) {
            return Ok(*id);
        }
        let id = resolve(store, self.cache.table, candidate)?;
        self.pending.insert(candidate.to_string(), id);
        Ok(id)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn publish(self) {
        if self.pending.is_empty() {
            return;
        }
        let mut ids = self.cache.write_ids();
        for (candidate, id) in self.pending {
            ids.entry(candidate).or_insert(id);
        }
    }
}

fn resolve(store: &impl InternStore, table: InternTable, candidate: &str) -> Result<i64, StorageError> {
    if let Some(id) = store.select_interned_id(table, candidate)? {
        return Ok(id);
    }
    if let Some(id) = store.upsert_returning_id(table, candidate)? {
        debug!(event = "intern_insert", table = table.as_str(), id);
        return Ok(id);
    }
    // lost the insert race; the winner's row is committed
    store
        .select_interned_id(table, candidate)?
        .ok_or_else(|| StorageError::InternMissing {
            table: table.as_str(),
            value: candidate.to_string(),
        })
}
