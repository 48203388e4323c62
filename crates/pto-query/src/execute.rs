use crate::query::{Query, ResultMode};
use crate::QueryError;
use pto_core::obs_contracts::{format_set_id, observation_wire_row};
use pto_storage::{ObservationRow, ObservationStore};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// What a finished execution recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub row_count: u64,
    /// Distinct ids of the sets that contributed matching observations.
    pub sources: Vec<i64>,
}

#[derive(Default)]
struct GroupTally {
    count: u64,
    targets: BTreeSet<String>,
}

/// Streams the observations `query` selects and writes its NDJSON result to
/// `artifact`. The file only appears at `artifact` once fully written and
/// synced; a failed run leaves nothing behind.
pub fn write_result(
    store: &ObservationStore,
    query: &Query,
    artifact: &Path,
) -> Result<ExecutionOutput, QueryError> {
    let staging = staging_path(artifact);
    match write_staged(store, query, &staging) {
        Ok(output) => {
            fs::rename(&staging, artifact)?;
            Ok(output)
        }
        Err(err) => {
            let _ = fs::remove_file(&staging);
            Err(err)
        }
    }
}

fn staging_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_staged(
    store: &ObservationStore,
    query: &Query,
    staging: &Path,
) -> Result<ExecutionOutput, QueryError> {
    let file = File::create(staging)?;
    let mut out = BufWriter::new(file);
    let filter = query.filter();
    let mut sources = BTreeSet::new();

    let row_count = match query.mode() {
        ResultMode::Observations => store.scan_observations(&filter, |row| {
            sources.insert(row.set_id);
            let line = observation_wire_row(
                row.set_id,
                &row.start,
                &row.end,
                &row.path,
                &row.condition,
                row.value,
            );
            write_line(&mut out, &line)
        })?,
        ResultMode::Sets => {
            store.scan_observations(&filter, |row| -> Result<(), QueryError> {
                sources.insert(row.set_id);
                Ok(())
            })?;
            for set_id in &sources {
                write_line(&mut out, &Value::from(format_set_id(*set_id)))?;
            }
            sources.len() as u64
        }
        ResultMode::Groups => {
            let mut tallies: BTreeMap<Vec<String>, GroupTally> = BTreeMap::new();
            store.scan_observations(&filter, |row| -> Result<(), QueryError> {
                sources.insert(row.set_id);
                tally(&mut tallies, query, row);
                Ok(())
            })?;
            for (labels, group) in &tallies {
                let count = if query.count_targets() {
                    group.targets.len() as u64
                } else {
                    group.count
                };
                let mut line = labels.iter().cloned().map(Value::from).collect::<Vec<_>>();
                line.push(Value::from(count));
                write_line(&mut out, &Value::Array(line))?;
            }
            tallies.len() as u64
        }
    };

    out.flush()?;
    out.get_ref().sync_all()?;

    Ok(ExecutionOutput {
        row_count,
        sources: sources.into_iter().collect(),
    })
}

fn tally(tallies: &mut BTreeMap<Vec<String>, GroupTally>, query: &Query, row: ObservationRow) {
    let labels = query
        .groups()
        .iter()
        .map(|group| group.label_for(&row))
        .collect::<Vec<_>>();
    let group = tallies.entry(labels).or_default();
    group.count += 1;
    if query.count_targets() {
        if let Some(target) = row.target {
            group.targets.insert(target);
        }
    }
}

fn write_line(out: &mut impl Write, value: &Value) -> Result<(), QueryError> {
    serde_json::to_writer(&mut *out, value)
        .map_err(|err| QueryError::Execution(format!("encode result row: {err}")))?;
    out.write_all(b"\n")?;
    Ok(())
}
