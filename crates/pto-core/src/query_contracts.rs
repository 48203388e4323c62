use crate::{sha256_hex, ContractError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Stable identifier of a canonical query: lowercase hex SHA-256 of its
/// canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_encoded(encoded: &str) -> Self {
        Self(sha256_hex(encoded.as_bytes()))
    }

    pub fn parse(value: &str) -> Result<Self, ContractError> {
        let value = value.trim();
        let well_formed = value.len() == 64
            && value
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
        if !well_formed {
            return Err(ContractError::InvalidFingerprint {
                value: value.to_string(),
            });
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Executing,
    Complete,
    Failed,
}

impl QueryState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryState::Executing => "executing",
            QueryState::Complete => "complete",
            QueryState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "executing" => Some(QueryState::Executing),
            "complete" => Some(QueryState::Complete),
            "failed" => Some(QueryState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueryState::Complete | QueryState::Failed)
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEntry {
    pub fingerprint: Fingerprint,
    pub encoded: String,
    pub state: QueryState,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result_location: Option<PathBuf>,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub sources: Vec<i64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueryEntry {
    pub fn executing(fingerprint: Fingerprint, encoded: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint,
            encoded: encoded.into(),
            state: QueryState::Executing,
            error: None,
            result_location: None,
            row_count: None,
            sources: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            executed_at: None,
            completed_at: None,
        }
    }

    pub fn mark_complete(
        &mut self,
        result_location: PathBuf,
        row_count: u64,
        sources: Vec<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), ContractError> {
        self.ensure_executing(QueryState::Complete)?;
        self.state = QueryState::Complete;
        self.result_location = Some(result_location);
        self.row_count = Some(row_count);
        self.sources = sources;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ContractError> {
        self.ensure_executing(QueryState::Failed)?;
        self.state = QueryState::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        Ok(())
    }

    fn ensure_executing(&self, to: QueryState) -> Result<(), ContractError> {
        if self.state != QueryState::Executing {
            return Err(ContractError::InvalidTransition {
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        Ok(())
    }
}
