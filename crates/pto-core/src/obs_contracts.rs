use crate::{format_wire_timestamp, parse_rfc3339, ContractError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const METADATA_SOURCES_KEY: &str = "_sources";
pub const METADATA_ANALYZER_KEY: &str = "_analyzer";
pub const METADATA_CONDITIONS_KEY: &str = "_conditions";
pub const RESERVED_KEY_PREFIX: &str = "__";
const PATH_WILDCARD: &str = "*";

/// A measurement route: whitespace-separated path elements, `*` standing for
/// any number of unknown hops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    pub id: i64,
    pub string: String,
    pub source: Option<String>,
    pub target: Option<String>,
}

impl Path {
    pub fn new(id: i64, string: impl Into<String>) -> Self {
        let string = string.into();
        Self {
            id,
            source: path_source(&string).map(str::to_string),
            target: path_target(&string).map(str::to_string),
            string,
        }
    }
}

pub fn path_source(path: &str) -> Option<&str> {
    path.split_whitespace()
        .next()
        .filter(|element| *element != PATH_WILDCARD)
}

pub fn path_target(path: &str) -> Option<&str> {
    path.split_whitespace()
        .next_back()
        .filter(|element| *element != PATH_WILDCARD)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub id: i64,
    pub name: String,
}

impl Condition {
    pub fn feature(&self) -> &str {
        condition_feature(&self.name)
    }
}

/// The leading namespace of a condition name (`pto` for `pto.test.color.red`).
pub fn condition_feature(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSet {
    pub id: i64,
    pub sources: Vec<String>,
    pub analyzer: String,
    /// Conditions the set may use; empty means undeclared and unchecked.
    #[serde(default)]
    pub conditions: Vec<String>,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl ObservationSet {
    /// An empty set, inserted before any file content is known so the
    /// observations that follow have an id to reference.
    pub fn placeholder(created_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            sources: Vec::new(),
            analyzer: String::new(),
            conditions: Vec::new(),
            metadata: BTreeMap::new(),
            created_at,
        }
    }

    pub fn apply_metadata_patch(&mut self, patch: Map<String, Value>) -> Result<(), ContractError> {
        for (key, value) in patch {
            if key.starts_with(RESERVED_KEY_PREFIX) {
                continue;
            }
            match key.as_str() {
                METADATA_SOURCES_KEY => {
                    self.sources = string_list(&key, value)?;
                }
                METADATA_CONDITIONS_KEY => {
                    self.conditions = string_list(&key, value)?;
                }
                METADATA_ANALYZER_KEY => match value {
                    Value::String(analyzer) => self.analyzer = analyzer,
                    _ => {
                        return Err(ContractError::InvalidMetadata {
                            key,
                            reason: "expected a string".to_string(),
                        })
                    }
                },
                _ => {
                    self.metadata.insert(key, value);
                }
            }
        }
        Ok(())
    }

    /// Metadata update on a set that already exists. `_sources` and
    /// `_analyzer` may be restated but not changed; everything else follows
    /// the in-file patch rules.
    pub fn apply_metadata_update(&mut self, patch: Map<String, Value>) -> Result<(), ContractError> {
        let mut staged = self.clone();
        staged.apply_metadata_patch(patch)?;
        if staged.sources != self.sources {
            return Err(ContractError::ImmutableMetadata {
                key: METADATA_SOURCES_KEY.to_string(),
            });
        }
        if staged.analyzer != self.analyzer {
            return Err(ContractError::ImmutableMetadata {
                key: METADATA_ANALYZER_KEY.to_string(),
            });
        }
        *self = staged;
        Ok(())
    }

    pub fn declares_condition(&self, name: &str) -> bool {
        self.conditions.is_empty() || self.conditions.iter().any(|declared| declared == name)
    }

    /// Errors on the first of `used` that the declaration leaves out.
    pub fn verify_conditions<'a>(
        &self,
        used: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ContractError> {
        match used.into_iter().find(|name| !self.declares_condition(name)) {
            Some(condition) => Err(ContractError::UndeclaredCondition {
                condition: condition.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Metadata object in observation-file form, with server-side `__` keys.
    pub fn to_metadata_json(&self, obs_count: Option<i64>) -> Value {
        let mut object = Map::new();
        for (key, value) in &self.metadata {
            object.insert(key.clone(), value.clone());
        }
        object.insert(
            METADATA_SOURCES_KEY.to_string(),
            Value::from(self.sources.clone()),
        );
        object.insert(
            METADATA_ANALYZER_KEY.to_string(),
            Value::from(self.analyzer.clone()),
        );
        if !self.conditions.is_empty() {
            object.insert(
                METADATA_CONDITIONS_KEY.to_string(),
                Value::from(self.conditions.clone()),
            );
        }
        object.insert("__id".to_string(), Value::from(format_set_id(self.id)));
        object.insert(
            "__created".to_string(),
            Value::from(format_wire_timestamp(&self.created_at)),
        );
        if let Some(count) = obs_count {
            object.insert("__obs_count".to_string(), Value::from(count));
        }
        Value::Object(object)
    }
}

fn string_list(key: &str, value: Value) -> Result<Vec<String>, ContractError> {
    let invalid = || ContractError::InvalidMetadata {
        key: key.to_string(),
        reason: "expected a string or an array of strings".to_string(),
    };
    match value {
        Value::String(single) => Ok(vec![single]),
        Value::Array(values) => values
            .into_iter()
            .map(|value| match value {
                Value::String(item) => Ok(item),
                _ => Err(invalid()),
            })
            .collect(),
        _ => Err(invalid()),
    }
}

pub fn format_set_id(id: i64) -> String {
    format!("{id:x}")
}

pub fn parse_set_id(value: &str) -> Result<i64, ContractError> {
    i64::from_str_radix(value.trim(), 16).map_err(|_| ContractError::InvalidSetId {
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub set_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub path_id: i64,
    pub condition_id: i64,
    pub value: i64,
}

/// An observation as it appears in a file, before path and condition are
/// resolved to ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObservation {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub path: String,
    pub condition: String,
    pub value: i64,
}

impl RawObservation {
    pub fn parse_json(raw: &str) -> Result<Self, ContractError> {
        let elements: Vec<Value> =
            serde_json::from_str(raw).map_err(|err| ContractError::InvalidJson(err.to_string()))?;
        if !(5..=6).contains(&elements.len()) {
            return Err(ContractError::ObservationArity {
                found: elements.len(),
            });
        }

        // element 0 is the producer's set reference; the loader assigns its own
        if elements[0].is_array() || elements[0].is_object() {
            return Err(ContractError::InvalidField {
                field: "flags",
                reason: "expected a scalar".to_string(),
            });
        }

        let start = parse_rfc3339(string_field(&elements[1], "start")?)?;
        let end = parse_rfc3339(string_field(&elements[2], "end")?)?;
        if start > end {
            return Err(ContractError::InvalidTemporalRange);
        }

        let path = non_empty_field(&elements[3], "path")?;
        let condition = non_empty_field(&elements[4], "condition")?;
        let value = match elements.get(5) {
            Some(value) => parse_value(value)?,
            None => 0,
        };

        Ok(Self {
            start,
            end,
            path,
            condition,
            value,
        })
    }
}

fn string_field<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, ContractError> {
    value.as_str().ok_or_else(|| ContractError::InvalidField {
        field,
        reason: "expected a string".to_string(),
    })
}

fn non_empty_field(value: &Value, field: &'static str) -> Result<String, ContractError> {
    let text = string_field(value, field)?.trim();
    if text.is_empty() {
        return Err(ContractError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(text.to_string())
}

fn parse_value(value: &Value) -> Result<i64, ContractError> {
    let invalid = |reason: String| ContractError::InvalidField {
        field: "value",
        reason,
    };
    match value {
        Value::Null => Ok(0),
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| invalid(format!("{number} is not an integer"))),
        Value::String(text) if text.trim().is_empty() => Ok(0),
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(format!("{text:?} is not an integer"))),
        _ => Err(invalid("expected an integer".to_string())),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObsLine {
    Metadata(Map<String, Value>),
    Observation(RawObservation),
}

/// Classifies one line of an observation file. Blank lines yield `None`.
pub fn parse_obs_line(line: &str) -> Result<Option<ObsLine>, ContractError> {
    let trimmed = line.trim();
    let Some(first) = trimmed.chars().next() else {
        return Ok(None);
    };
    match first {
        '{' => serde_json::from_str::<Map<String, Value>>(trimmed)
            .map(|patch| Some(ObsLine::Metadata(patch)))
            .map_err(|err| ContractError::InvalidJson(err.to_string())),
        '[' => RawObservation::parse_json(trimmed).map(|obs| Some(ObsLine::Observation(obs))),
        found => Err(ContractError::UnknownLineKind { found }),
    }
}

/// One observation rendered as an observation-file array.
pub fn observation_wire_row(
    set_id: i64,
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
    path: &str,
    condition: &str,
    value: i64,
) -> Value {
    Value::Array(vec![
        Value::from(format_set_id(set_id)),
        Value::from(format_wire_timestamp(start)),
        Value::from(format_wire_timestamp(end)),
        Value::from(path),
        Value::from(condition),
        Value::from(value),
    ])
}
