use pto_core::obs_contracts::observation_wire_row;
use pto_storage::{ObservationFilter, ObservationStore, StorageError};
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("observation set {set_id:x} not found")]
    NotFound { set_id: i64 },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("write error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes a set back out in observation-file form: its metadata object on
/// the first line, then one array per observation. The output loads again
/// as an equivalent set. Returns the number of observations written.
pub fn export_observation_set<W: Write>(
    store: &ObservationStore,
    set_id: i64,
    mut out: W,
) -> Result<u64, ExportError> {
    let set = store
        .observation_set(set_id)?
        .ok_or(ExportError::NotFound { set_id })?;
    let count = store.count_observations(set_id)?;
    writeln!(out, "{}", set.to_metadata_json(Some(count)))?;

    let written = store.scan_observations(
        &ObservationFilter::for_set(set_id),
        |row| -> Result<(), ExportError> {
            let line = observation_wire_row(
                row.set_id,
                &row.start,
                &row.end,
                &row.path,
                &row.condition,
                row.value,
            );
            writeln!(out, "{line}")?;
            Ok(())
        },
    )?;
    out.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{load_observation_file, InternCache, LoadConfig};
    use serde_json::Value;

    #[test]
    fn exported_set_reloads_as_equivalent_set() {
        let mut store = ObservationStore::open_in_memory().expect("open db");
        let conditions = InternCache::conditions();
        let paths = InternCache::paths();
        let input = concat!(
            "{\"_sources\":[\"https://raw.example/a\"],\"_analyzer\":\"https://an.example/x\",\"description\":\"d\"}\n",
            "[0,\"2020-01-01T00:00:00Z\",\"2020-01-01T00:00:01Z\",\"10.0.0.1 * 10.0.0.2\",\"pto.test.ok\"]\n",
            "[0,\"2020-01-01T00:00:02Z\",\"2020-01-01T00:00:03.5Z\",\"10.0.0.1 * 10.0.0.3\",\"pto.test.ok\",\"4\"]\n",
        );
        let original = load_observation_file(
            &mut store,
            input.as_bytes(),
            &conditions,
            &paths,
            &LoadConfig::default(),
        )
        .expect("load");

        let mut exported = Vec::new();
        let written =
            export_observation_set(&store, original.set.id, &mut exported).expect("export");
        assert_eq!(written, 2);

        let text = String::from_utf8(exported).expect("utf8");
        let mut lines = text.lines();
        let metadata: Value =
            serde_json::from_str(lines.next().expect("metadata line")).expect("json");
        assert_eq!(metadata["__obs_count"], 2);
        assert_eq!(metadata["description"], "d");
        let second: Value = serde_json::from_str(lines.nth(1).expect("row")).expect("json");
        assert_eq!(second[2], "2020-01-01T00:00:03.500Z");
        assert_eq!(second[5], 4);

        let reloaded = load_observation_file(
            &mut store,
            text.as_bytes(),
            &conditions,
            &paths,
            &LoadConfig::default(),
        )
        .expect("reload");
        assert_ne!(reloaded.set.id, original.set.id);
        assert_eq!(reloaded.set.sources, original.set.sources);
        assert_eq!(reloaded.set.analyzer, original.set.analyzer);
        assert_eq!(reloaded.set.metadata, original.set.metadata);

        let strip = |set_id| {
            store
                .observations_for_set(set_id)
                .expect("observations")
                .into_iter()
                .map(|obs| (obs.start, obs.end, obs.path_id, obs.condition_id, obs.value))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(original.set.id), strip(reloaded.set.id));
    }

    #[test]
    fn missing_set_is_reported() {
        let store = ObservationStore::open_in_memory().expect("open db");
        let err = export_observation_set(&store, 0x2a, Vec::new()).expect_err("missing");
        assert!(matches!(err, ExportError::NotFound { set_id: 0x2a }));
        assert_eq!(err.to_string(), "observation set 2a not found");
    }
}
