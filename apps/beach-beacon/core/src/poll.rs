use serde::Serialize;
use time::OffsetDateTime;

use crate::event::{Event, MatchMode};
use crate::hub::BroadcastHub;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Update(Event),
    NoUpdate,
}

/// Body returned to pull-mode callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PollResponse {
    Refresh {
        id: String,
        url: String,
        #[serde(rename = "match")]
        match_mode: MatchMode,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    #[serde(rename = "none")]
    Idle,
}

impl From<PollOutcome> for PollResponse {
    fn from(outcome: PollOutcome) -> Self {
        match outcome {
            PollOutcome::Update(event) => PollResponse::Refresh {
                id: event.id.to_string(),
                url: event.resource_url,
                match_mode: event.match_mode,
                timestamp: event.issued_at,
            },
            PollOutcome::NoUpdate => PollResponse::Idle,
        }
    }
}

/// Stateless pull surface over the hub's retained event.
///
/// Callers keep the id of the last event they saw and hand it back; any id
/// other than the retained one (including an empty or garbage id) yields the
/// retained event.
#[derive(Clone)]
pub struct PollGateway {
    hub: BroadcastHub,
}

impl PollGateway {
    pub fn new(hub: BroadcastHub) -> Self {
        Self { hub }
    }

    pub fn poll(&self, since_id: &str) -> PollOutcome {
        match self.hub.retained() {
            Some(event) if event.id.to_string() != since_id => PollOutcome::Update(event),
            _ => PollOutcome::NoUpdate,
        }
    }
}
