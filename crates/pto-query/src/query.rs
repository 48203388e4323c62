use chrono::{DateTime, Datelike, Duration, SubsecRound, TimeZone, Timelike, Utc};
use pto_core::obs_contracts::{condition_feature, format_set_id, parse_set_id};
use pto_core::query_contracts::Fingerprint;
use pto_core::{format_wire_timestamp, parse_time};
use pto_storage::{ObservationFilter, ObservationRow};
use thiserror::Error;
use url::form_urlencoded;

pub const MAX_GROUPS: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed query segment {0:?}")]
    Malformed(String),
    #[error("unknown query parameter {0}")]
    UnknownParameter(String),
    #[error("query missing mandatory {0} parameter")]
    MissingParameter(&'static str),
    #[error("query parameter {0} given more than once")]
    Repeated(&'static str),
    #[error("invalid {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
    #[error("unsupported group name {0}")]
    UnknownGroup(String),
    #[error("unsupported option {0}")]
    UnknownOption(String),
    #[error("group by more than two dimensions not supported")]
    TooManyGroups,
}

/// A grouping dimension for aggregate results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupKey {
    Year,
    Month,
    Week,
    Day,
    Hour,
    WeekDay,
    DayHour,
    Condition,
    Feature,
    Source,
    Target,
    Value,
}

impl GroupKey {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupKey::Year => "year",
            GroupKey::Month => "month",
            GroupKey::Week => "week",
            GroupKey::Day => "day",
            GroupKey::Hour => "hour",
            GroupKey::WeekDay => "week_day",
            GroupKey::DayHour => "day_hour",
            GroupKey::Condition => "condition",
            GroupKey::Feature => "feature",
            GroupKey::Source => "source",
            GroupKey::Target => "target",
            GroupKey::Value => "value",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let key = match value {
            "year" => GroupKey::Year,
            "month" => GroupKey::Month,
            "week" => GroupKey::Week,
            "day" => GroupKey::Day,
            "hour" => GroupKey::Hour,
            "week_day" => GroupKey::WeekDay,
            "day_hour" => GroupKey::DayHour,
            "condition" => GroupKey::Condition,
            "feature" => GroupKey::Feature,
            "source" => GroupKey::Source,
            "target" => GroupKey::Target,
            "value" => GroupKey::Value,
            _ => return None,
        };
        Some(key)
    }

    /// The group label of `row` along this dimension. Calendar groups bucket
    /// on the observation start time; weeks start on Monday and week days
    /// count from Sunday as 0.
    pub fn label_for(self, row: &ObservationRow) -> String {
        let start = &row.start;
        match self {
            GroupKey::Year => truncated(start, |ts| {
                Utc.with_ymd_and_hms(ts.year(), 1, 1, 0, 0, 0).single()
            }),
            GroupKey::Month => truncated(start, |ts| {
                Utc.with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0).single()
            }),
            GroupKey::Week => truncated(start, |ts| {
                let days_back = i64::from(ts.weekday().num_days_from_monday());
                let monday = ts.date_naive() - Duration::days(days_back);
                monday
                    .and_hms_opt(0, 0, 0)
                    .map(|midnight| Utc.from_utc_datetime(&midnight))
            }),
            GroupKey::Day => truncated(start, |ts| {
                ts.date_naive()
                    .and_hms_opt(0, 0, 0)
                    .map(|midnight| Utc.from_utc_datetime(&midnight))
            }),
            GroupKey::Hour => truncated(start, |ts| {
                Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
                    .single()
            }),
            GroupKey::WeekDay => start.weekday().num_days_from_sunday().to_string(),
            GroupKey::DayHour => start.hour().to_string(),
            GroupKey::Condition => row.condition.clone(),
            GroupKey::Feature => condition_feature(&row.condition).to_string(),
            GroupKey::Source => row.source.clone().unwrap_or_default(),
            GroupKey::Target => row.target.clone().unwrap_or_default(),
            GroupKey::Value => row.value.to_string(),
        }
    }
}

fn truncated(
    timestamp: &DateTime<Utc>,
    truncate: impl FnOnce(&DateTime<Utc>) -> Option<DateTime<Utc>>,
) -> String {
    let bucket = truncate(timestamp).unwrap_or(*timestamp);
    format_wire_timestamp(&bucket)
}

/// What a query's result artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultMode {
    /// `[group0, (group1,) count]` rows.
    Groups,
    /// Distinct contributing set ids.
    Sets,
    /// Matching observations in observation-file form.
    Observations,
}

impl ResultMode {
    pub fn label(self) -> &'static str {
        match self {
            ResultMode::Groups => "groups",
            ResultMode::Sets => "sets",
            ResultMode::Observations => "obs",
        }
    }
}

/// A parsed query in canonical form: every list sorted and de-duplicated,
/// times truncated to milliseconds with start <= end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    time_start: DateTime<Utc>,
    time_end: DateTime<Utc>,
    sets: Vec<i64>,
    conditions: Vec<String>,
    path_prefixes: Vec<String>,
    on_path: Vec<String>,
    sources: Vec<String>,
    targets: Vec<String>,
    values: Vec<i64>,
    groups: Vec<GroupKey>,
    sets_only: bool,
    count_targets: bool,
}

impl Query {
    /// Decodes a URL-encoded parameter string (a leading `?` is allowed).
    pub fn parse(encoded: &str) -> Result<Self, ParseError> {
        let encoded = encoded.trim();
        let encoded = encoded.strip_prefix('?').unwrap_or(encoded);
        if let Some(segment) = encoded
            .split('&')
            .find(|segment| !segment.is_empty() && !segment.contains('='))
        {
            return Err(ParseError::Malformed(segment.to_string()));
        }

        let mut time_start = None;
        let mut time_end = None;
        let mut query = Query {
            time_start: DateTime::<Utc>::MIN_UTC,
            time_end: DateTime::<Utc>::MIN_UTC,
            sets: Vec::new(),
            conditions: Vec::new(),
            path_prefixes: Vec::new(),
            on_path: Vec::new(),
            sources: Vec::new(),
            targets: Vec::new(),
            values: Vec::new(),
            groups: Vec::new(),
            sets_only: false,
            count_targets: false,
        };

        for (name, value) in form_urlencoded::parse(encoded.as_bytes()) {
            let value = value.trim();
            match name.as_ref() {
                "time_start" => set_time(&mut time_start, "time_start", value)?,
                "time_end" => set_time(&mut time_end, "time_end", value)?,
                "set" => query.sets.push(parse_set_id(value).map_err(|err| {
                    ParseError::InvalidValue {
                        name: "set",
                        reason: err.to_string(),
                    }
                })?),
                "condition" => query.conditions.push(non_empty("condition", value)?),
                "path_prefix" => query.path_prefixes.push(non_empty("path_prefix", value)?),
                "on_path" => query.on_path.push(non_empty("on_path", value)?),
                "source" => query.sources.push(non_empty("source", value)?),
                "target" => query.targets.push(non_empty("target", value)?),
                "value" => query.values.push(value.parse::<i64>().map_err(|_| {
                    ParseError::InvalidValue {
                        name: "value",
                        reason: format!("{value:?} is not an integer"),
                    }
                })?),
                "group" => query.groups.push(
                    GroupKey::parse(value)
                        .ok_or_else(|| ParseError::UnknownGroup(value.to_string()))?,
                ),
                "option" => match value {
                    "sets_only" => query.sets_only = true,
                    "count_targets" => query.count_targets = true,
                    other => return Err(ParseError::UnknownOption(other.to_string())),
                },
                other => return Err(ParseError::UnknownParameter(other.to_string())),
            }
        }

        let time_start = time_start.ok_or(ParseError::MissingParameter("time_start"))?;
        let time_end = time_end.ok_or(ParseError::MissingParameter("time_end"))?;
        if time_start > time_end {
            query.time_start = time_end;
            query.time_end = time_start;
        } else {
            query.time_start = time_start;
            query.time_end = time_end;
        }

        for list in [
            &mut query.conditions,
            &mut query.path_prefixes,
            &mut query.on_path,
            &mut query.sources,
            &mut query.targets,
        ] {
            list.sort();
            list.dedup();
        }
        query.sets.sort_unstable();
        query.sets.dedup();
        query.values.sort_unstable();
        query.values.dedup();
        query.groups.sort_by_key(|group| group.as_str());
        query.groups.dedup();
        if query.groups.len() > MAX_GROUPS {
            return Err(ParseError::TooManyGroups);
        }

        Ok(query)
    }

    /// Canonical URL-encoded form. Equal queries encode identically no matter
    /// how their parameters were ordered on input.
    pub fn encoded(&self) -> String {
        let mut form = form_urlencoded::Serializer::new(String::new());
        form.append_pair("time_start", &format_wire_timestamp(&self.time_start));
        form.append_pair("time_end", &format_wire_timestamp(&self.time_end));
        for set in &self.sets {
            form.append_pair("set", &format_set_id(*set));
        }
        for (name, list) in [
            ("condition", &self.conditions),
            ("path_prefix", &self.path_prefixes),
            ("on_path", &self.on_path),
            ("source", &self.sources),
            ("target", &self.targets),
        ] {
            for value in list {
                form.append_pair(name, value);
            }
        }
        for value in &self.values {
            form.append_pair("value", &value.to_string());
        }
        for group in &self.groups {
            form.append_pair("group", group.as_str());
        }
        if self.sets_only {
            form.append_pair("option", "sets_only");
        }
        if self.count_targets {
            form.append_pair("option", "count_targets");
        }
        form.finish()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_encoded(&self.encoded())
    }

    pub fn mode(&self) -> ResultMode {
        if !self.groups.is_empty() {
            ResultMode::Groups
        } else if self.sets_only {
            ResultMode::Sets
        } else {
            ResultMode::Observations
        }
    }

    pub fn groups(&self) -> &[GroupKey] {
        &self.groups
    }

    pub fn count_targets(&self) -> bool {
        self.count_targets
    }

    pub fn time_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.time_start, self.time_end)
    }

    pub fn filter(&self) -> ObservationFilter {
        ObservationFilter {
            time_start: Some(self.time_start),
            time_end: Some(self.time_end),
            set_ids: self.sets.clone(),
            conditions: self.conditions.clone(),
            path_prefixes: self.path_prefixes.clone(),
            on_path: self.on_path.clone(),
            sources: self.sources.clone(),
            targets: self.targets.clone(),
            values: self.values.clone(),
        }
    }
}

fn set_time(
    slot: &mut Option<DateTime<Utc>>,
    name: &'static str,
    value: &str,
) -> Result<(), ParseError> {
    if slot.is_some() {
        return Err(ParseError::Repeated(name));
    }
    if value.is_empty() {
        return Err(ParseError::MissingParameter(name));
    }
    let parsed = parse_time(value).map_err(|err| ParseError::InvalidValue {
        name,
        reason: err.to_string(),
    })?;
    *slot = Some(parsed.trunc_subsecs(3));
    Ok(())
}

fn non_empty(name: &'static str, value: &str) -> Result<String, ParseError> {
    if value.is_empty() {
        return Err(ParseError::InvalidValue {
            name,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(value.to_string())
}
