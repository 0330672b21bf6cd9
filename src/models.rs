//! Core data models used throughout the harvester.
//!
//! These types describe a harvest job ([`HarvestContext`], [`HarvestWindow`]),
//! the records parsed out of a response page ([`RawRecord`]), and the rows
//! persisted in SQLite ([`Identifier`], [`Service`]).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;

use crate::error::HarvestError;

/// Datestamp granularity a repository accepts for `from`/`until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// `YYYY-MM-DD`
    Day,
    /// `YYYY-MM-DDThh:mm:ssZ`
    Seconds,
}

impl Granularity {
    pub const DAY: &'static str = "YYYY-MM-DD";
    pub const SECONDS: &'static str = "YYYY-MM-DDThh:mm:ssZ";

    /// Format a timestamp the way the repository expects it.
    pub fn format(&self, ts: &DateTime<Utc>) -> String {
        match self {
            Granularity::Day => ts.format("%Y-%m-%d").to_string(),
            Granularity::Seconds => ts.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => Self::DAY,
            Granularity::Seconds => Self::SECONDS,
        }
    }
}

impl FromStr for Granularity {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            Self::DAY => Ok(Granularity::Day),
            Self::SECONDS => Ok(Granularity::Seconds),
            other => Err(HarvestError::config(format!(
                "invalid granularity: '{}'. Must be {} or {}",
                other,
                Self::DAY,
                Self::SECONDS
            ))),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse an OAI-PMH datestamp.
///
/// Accepts day (`2021-03-04`) and second (`2021-03-04T05:06:07Z`)
/// granularity. Day values are taken as midnight UTC.
pub fn parse_datestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Stored timestamps are Unix seconds.
pub fn from_unix(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}

/// Identifies a recurring harvest job. Immutable for the duration of a session.
#[derive(Debug, Clone)]
pub struct HarvestContext {
    /// Target name from the configuration (also the service name).
    pub name: String,
    /// Base URL of the OAI-PMH endpoint.
    pub endpoint: String,
    pub metadata_prefix: String,
    pub set_spec: Option<String>,
    pub granularity: Granularity,
    /// Drop records flagged deleted instead of passing them through.
    pub ignore_deleted: bool,
    alias: Option<String>,
}

impl HarvestContext {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        metadata_prefix: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            metadata_prefix: metadata_prefix.into(),
            set_spec: None,
            granularity: Granularity::Seconds,
            ignore_deleted: false,
            alias: None,
        }
    }

    pub fn with_set(mut self, set_spec: Option<String>) -> Self {
        self.set_spec = set_spec.filter(|s| !s.is_empty());
        self
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn ignore_deleted(mut self, ignore: bool) -> Self {
        self.ignore_deleted = ignore;
        self
    }

    pub fn with_alias(mut self, alias: Option<String>) -> Self {
        self.alias = alias;
        self
    }

    /// Stable key for the per-job checkpoint row.
    ///
    /// Defaults to `"{url}-{metadata_prefix}-{set}"`.
    pub fn alias(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => format!(
                "{}-{}-{}",
                self.endpoint,
                self.metadata_prefix,
                self.set_spec.as_deref().unwrap_or("None")
            ),
        }
    }
}

/// Date window for a session. Frozen once the first request is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestWindow {
    pub from_date: Option<DateTime<Utc>>,
    pub until_date: Option<DateTime<Utc>>,
}

impl HarvestWindow {
    pub fn new(from_date: Option<DateTime<Utc>>, until_date: Option<DateTime<Utc>>) -> Self {
        Self {
            from_date,
            until_date,
        }
    }
}

/// The `<header>` of a harvested record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub identifier: String,
    /// `None` when the repository omitted the datestamp.
    pub datestamp: Option<DateTime<Utc>>,
    pub set_specs: Vec<String>,
    pub deleted: bool,
}

/// One `<record>` element as it came off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub header: RecordHeader,
    /// Inner XML of the `<metadata>` element, if present.
    pub metadata: Option<String>,
}

/// Canonical ingested record, one row in `identifiers`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identifier {
    /// External identifier, unique across all harvests.
    pub id: String,
    pub service_id: i64,
    /// The record's own datestamp.
    pub id_time: Option<DateTime<Utc>>,
    /// Wall clock time of the first successful ingestion.
    pub harvest_time: DateTime<Utc>,
    /// Decoded metadata payload; `None` for deletion tombstones.
    pub metadata: Option<serde_json::Value>,
    pub deleted: bool,
}

/// A harvested repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub url: String,
}
