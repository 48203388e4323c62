pub mod export;
pub mod intern;

pub use export::{export_observation_set, ExportError};
pub use intern::{InternCache, StagedIntern};

use chrono::{SubsecRound, Utc};
use pto_core::obs_contracts::{parse_obs_line, ObsLine, Observation, ObservationSet};
use pto_core::ContractError;
use pto_storage::{ObservationStore, StorageError, StoreTransaction};
use std::collections::BTreeSet;
use std::io::BufRead;
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_BATCH_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("line {line}: {source}")]
    Line { line: usize, source: ContractError },
    #[error("line {line}: storage error: {source}")]
    LineStorage { line: usize, source: StorageError },
    #[error("line {line}: read error: {source}")]
    Io { line: usize, source: std::io::Error },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl LoadError {
    /// The 1-indexed input line the load aborted at, if the failure was tied
    /// to one.
    pub fn line(&self) -> Option<usize> {
        match self {
            LoadError::Line { line, .. }
            | LoadError::LineStorage { line, .. }
            | LoadError::Io { line, .. } => Some(*line),
            LoadError::Storage(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Observations buffered before each bulk append.
    pub batch_size: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub set: ObservationSet,
    pub observation_count: usize,
    pub line_count: usize,
}

/// Loads one observation file as a new observation set, all or nothing.
///
/// Every line is either a metadata patch object or an observation array.
/// Paths and conditions are resolved through the shared caches; ids minted
/// here become visible to other loads only once this file's transaction has
/// committed. On error nothing from the file persists and the error carries
/// the 1-indexed line it happened on.
///
/// Once a `_conditions` declaration is in effect, every observation of the
/// file must use a declared condition, including observations that came
/// before the declaration.
pub fn load_observation_file<R: BufRead>(
    store: &mut ObservationStore,
    input: R,
    conditions: &InternCache,
    paths: &InternCache,
    config: &LoadConfig,
) -> Result<LoadReport, LoadError> {
    let batch_size = config.batch_size.max(1);
    // the store keeps millisecond precision
    let created_at = Utc::now().trunc_subsecs(3);

    let outcome = store.transaction(|tx| -> Result<_, LoadError> {
        let mut condition_ids = conditions.staged();
        let mut path_ids = paths.staged();

        let mut set = ObservationSet::placeholder(created_at);
        set.id = tx.insert_observation_set(&set)?;
        debug!(event = "set_created", set_id = set.id);

        let mut batch = Vec::with_capacity(batch_size);
        let mut observation_count = 0;
        let mut line_count = 0;
        let mut used_conditions = BTreeSet::new();

        for (index, line) in input.lines().enumerate() {
            let line_no = index + 1;
            line_count = line_no;
            let line = line.map_err(|source| LoadError::Io {
                line: line_no,
                source,
            })?;
            let parsed = parse_obs_line(&line).map_err(|source| LoadError::Line {
                line: line_no,
                source,
            })?;

            match parsed {
                None => continue,
                Some(ObsLine::Metadata(patch)) => {
                    let at_line = |source| LoadError::Line {
                        line: line_no,
                        source,
                    };
                    set.apply_metadata_patch(patch).map_err(at_line)?;
                    set.verify_conditions(used_conditions.iter().map(String::as_str))
                        .map_err(at_line)?;
                    tx.update_observation_set(&set)
                        .map_err(|source| LoadError::LineStorage {
                            line: line_no,
                            source,
                        })?;
                    debug!(event = "metadata_patch", set_id = set.id, line = line_no);
                }
                Some(ObsLine::Observation(raw)) => {
                    set.verify_conditions([raw.condition.as_str()])
                        .map_err(|source| LoadError::Line {
                            line: line_no,
                            source,
                        })?;
                    if !used_conditions.contains(&raw.condition) {
                        used_conditions.insert(raw.condition.clone());
                    }
                    let at_line = |source| LoadError::LineStorage {
                        line: line_no,
                        source,
                    };
                    let path_id = path_ids.ensure(tx, &raw.path).map_err(at_line)?;
                    let condition_id = condition_ids
                        .ensure(tx, &raw.condition)
                        .map_err(at_line)?;
                    batch.push(Observation {
                        id: 0,
                        set_id: set.id,
                        start: raw.start,
                        end: raw.end,
                        path_id,
                        condition_id,
                        value: raw.value,
                    });
                    if batch.len() >= batch_size {
                        observation_count += flush(tx, &mut batch, line_no)?;
                    }
                }
            }
        }
        observation_count += flush(tx, &mut batch, line_count)?;

        Ok((
            LoadReport {
                set,
                observation_count,
                line_count,
            },
            condition_ids,
            path_ids,
        ))
    });

    match outcome {
        Ok((report, condition_ids, path_ids)) => {
            condition_ids.publish();
            path_ids.publish();
            info!(
                event = "set_loaded",
                set_id = report.set.id,
                observations = report.observation_count,
                lines = report.line_count
            );
            Ok(report)
        }
        Err(err) => {
            warn!(event = "load_failed", line = err.line(), error = %err);
            Err(err)
        }
    }
}

fn flush(
    tx: &StoreTransaction<'_>,
    batch: &mut Vec<Observation>,
    line: usize,
) -> Result<usize, LoadError> {
    if batch.is_empty() {
        return Ok(0);
    }
    let appended = tx
        .append_observations(batch)
        .map_err(|source| LoadError::LineStorage { line, source })?;
    batch.clear();
    Ok(appended)
}
