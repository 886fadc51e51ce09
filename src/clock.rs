//! Timestamp normalization and human-relative ages.
//!
//! Every aggregation pass captures a single [`RunContext`] and threads it
//! through all age computations so that every age shown in one report is
//! measured against the same instant.
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};

/// Canonical zoned timestamp used across the model.
pub type Timestamp = DateTime<FixedOffset>;

/// Timestamp as delivered by an upstream system, possibly without a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTimestamp {
    Naive(NaiveDateTime),
    Zoned(Timestamp),
}

impl From<NaiveDateTime> for RawTimestamp {
    fn from(value: NaiveDateTime) -> Self {
        RawTimestamp::Naive(value)
    }
}

impl From<Timestamp> for RawTimestamp {
    fn from(value: Timestamp) -> Self {
        RawTimestamp::Zoned(value)
    }
}

impl From<DateTime<Utc>> for RawTimestamp {
    fn from(value: DateTime<Utc>) -> Self {
        RawTimestamp::Zoned(value.into())
    }
}

/// Attach UTC to zone-less timestamps; zoned input is returned unchanged.
pub fn normalize(ts: impl Into<RawTimestamp>) -> Timestamp {
    match ts.into() {
        RawTimestamp::Zoned(zoned) => zoned,
        RawTimestamp::Naive(naive) => Utc.from_utc_datetime(&naive).into(),
    }
}

/// Parse an upstream timestamp string. RFC 3339 is tried first, then the
/// zone-less ISO forms some APIs emit.
pub fn parse_timestamp(raw: &str) -> Result<Timestamp, chrono::ParseError> {
    let raw = raw.trim();
    match DateTime::parse_from_rfc3339(raw) {
        Ok(zoned) => Ok(zoned),
        Err(rfc_err) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .map(|naive| normalize(naive))
            .map_err(|_| rfc_err),
    }
}

pub(crate) fn de_timestamp<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

pub(crate) fn de_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<Timestamp>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Run-scoped clock snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    pub now: DateTime<Utc>,
}

impl RunContext {
    /// Snapshot the wall clock. Called once at the start of each pass.
    pub fn capture() -> Self {
        Self { now: Utc::now() }
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    pub fn age(&self, ts: &Timestamp) -> String {
        age_of(ts, self.now)
    }

    pub fn elapsed(&self, ts: &Timestamp) -> Duration {
        elapsed(ts, self.now)
    }
}

/// `now - ts`, clamped to zero for timestamps in the future (clock skew).
pub fn elapsed(ts: &Timestamp, now: DateTime<Utc>) -> Duration {
    let delta = now.signed_duration_since(ts.with_timezone(&Utc));
    if delta < Duration::zero() {
        Duration::zero()
    } else {
        delta
    }
}

pub fn age_of(ts: &Timestamp, now: DateTime<Utc>) -> String {
    natural_time(elapsed(ts, now))
}

/// "now", "5 minutes ago", "a day ago", ...
pub fn natural_time(delta: Duration) -> String {
    let delta = natural_delta(delta);
    if delta == "a moment" {
        "now".to_string()
    } else {
        format!("{} ago", delta)
    }
}

/// Coarse English rendering of a non-negative duration.
pub fn natural_delta(delta: Duration) -> String {
    let total = delta.num_seconds().max(0);
    let days = total / 86_400;
    let seconds = total % 86_400;
    let years = days / 365;
    let days_in_year = days % 365;
    let months = (days_in_year as f64 / 30.5) as i64;

    if years == 0 && days == 0 {
        return match seconds {
            0 => "a moment".to_string(),
            1 => "a second".to_string(),
            2..=59 => format!("{} seconds", seconds),
            60..=119 => "a minute".to_string(),
            120..=3599 => format!("{} minutes", seconds / 60),
            3600..=7199 => "an hour".to_string(),
            _ => format!("{} hours", seconds / 3600),
        };
    }

    if years == 0 {
        return match (days, months) {
            (1, _) => "a day".to_string(),
            (_, 0) => format!("{} days", days),
            (_, 1) => "a month".to_string(),
            _ => format!("{} months", months),
        };
    }

    if years == 1 {
        return match (months, days_in_year) {
            (0, 0) => "1 year".to_string(),
            (0, 1) => "1 year, 1 day".to_string(),
            (0, d) => format!("1 year, {} days", d),
            (1, _) => "1 year, 1 month".to_string(),
            (m, _) => format!("1 year, {} months", m),
        };
    }

    format!("{} years", years)
}
