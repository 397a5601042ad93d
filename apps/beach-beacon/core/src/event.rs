use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use time::OffsetDateTime;

/// Identifier of a published refresh event.
///
/// Ordered by issue time first and by the per-process sequence second, so two
/// events issued within the same millisecond still compare strictly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    issued_ms: u64,
    seq: u64,
}

impl EventId {
    pub fn issued_ms(&self) -> u64 {
        self.issued_ms
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.issued_ms, self.seq)
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// How a consumer should compare the refreshed URL against its own resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Exact,
    Prefix,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Exact => "exact",
            MatchMode::Prefix => "prefix",
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action reported to push clients when the caller does not pick one.
pub const DEFAULT_ACTION: &str = "refresh";

/// Request to announce that a resource changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshNotice {
    pub url: String,
    pub match_mode: MatchMode,
    pub action: String,
}

impl RefreshNotice {
    pub fn new(url: impl Into<String>, match_mode: MatchMode) -> Self {
        Self {
            url: url.into(),
            match_mode,
            action: DEFAULT_ACTION.to_string(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }
}

/// A published "resource changed" notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub resource_url: String,
    pub match_mode: MatchMode,
    pub action: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

/// Issues strictly increasing [`EventId`]s for the lifetime of a hub.
///
/// The millisecond component never moves backwards even if the wall clock
/// does, and the sequence increments on every call.
#[derive(Debug, Default)]
pub(crate) struct EventIdGenerator {
    last_ms: u64,
    seq: u64,
}

impl EventIdGenerator {
    pub(crate) fn next(&mut self, now: OffsetDateTime) -> EventId {
        let issued_ms = unix_millis(now).max(self.last_ms);
        self.last_ms = issued_ms;
        self.seq += 1;
        EventId {
            issued_ms,
            seq: self.seq,
        }
    }
}

fn unix_millis(at: OffsetDateTime) -> u64 {
    u64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(0)
}
