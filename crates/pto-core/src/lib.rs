pub mod obs_contracts;
pub mod query_contracts;

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("line must start with '{{' or '[', found {found:?}")]
    UnknownLineKind { found: char },
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("observation requires 5 or 6 elements, found {found}")]
    ObservationArity { found: usize },
    #[error("invalid observation field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("{value} not parseable as time")]
    InvalidTimestamp { value: String },
    #[error("invalid temporal range: end must be >= start")]
    InvalidTemporalRange,
    #[error("invalid metadata key {key}: {reason}")]
    InvalidMetadata { key: String, reason: String },
    #[error("metadata key {key} cannot change once the set exists")]
    ImmutableMetadata { key: String },
    #[error("observation has condition {condition} not declared in set")]
    UndeclaredCondition { condition: String },
    #[error("invalid set id {value}")]
    InvalidSetId { value: String },
    #[error("invalid fingerprint {value}")]
    InvalidFingerprint { value: String },
    #[error("invalid query state transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

/// Strict RFC 3339 parsing, used for the timestamps inside observation files.
pub fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, ContractError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|_| ContractError::InvalidTimestamp {
            value: value.to_string(),
        })
}

/// Lenient parsing for user-supplied times: RFC 3339, an ISO date, a
/// PostgreSQL-style `YYYY-MM-DD HH:MM:SS+HH` timestamp, or epoch seconds.
pub fn parse_time(value: &str) -> Result<DateTime<Utc>, ContractError> {
    let trimmed = value.trim();
    let invalid = || ContractError::InvalidTimestamp {
        value: value.to_string(),
    };

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
        return Ok(Utc.from_utc_datetime(&midnight));
    }

    if let Ok(timestamp) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%#z") {
        return Ok(timestamp.with_timezone(&Utc));
    }

    let epoch = trimmed.parse::<f64>().map_err(|_| invalid())?;
    if !epoch.is_finite() {
        return Err(invalid());
    }
    let seconds = epoch.floor();
    let nanos = ((epoch - seconds) * 1e9).round().min(999_999_999.0) as u32;
    Utc.timestamp_opt(seconds as i64, nanos)
        .single()
        .ok_or_else(invalid)
}

/// Fixed-width UTC rendering (millisecond precision). Lexicographic order of
/// the output matches chronological order, which the store relies on.
pub fn format_sortable_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn format_wire_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
