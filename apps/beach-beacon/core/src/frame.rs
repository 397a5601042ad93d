//! Push frames, independent of the transport that renders them.
//!
//! A frame is either a named event with a JSON payload or a heartbeat that
//! carries no data. The server turns these into event-stream records; the hub
//! only needs to build them once per broadcast and hand clones to every sink.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::FrameError;
use crate::event::Event;

pub const CONNECTED_EVENT: &str = "connected";
pub const REFRESH_EVENT: &str = "refresh";
/// Text of the comment line sent as a heartbeat.
pub const HEARTBEAT_COMMENT: &str = "heartbeat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Named event; `data` is the serialized JSON payload, shared between
    /// every connection a broadcast reaches.
    Event { name: &'static str, data: Arc<str> },
    /// Liveness signal that conforming consumers ignore.
    Heartbeat,
}

#[derive(Serialize)]
struct ConnectedPayload<'a> {
    #[serde(rename = "clientId")]
    client_id: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    time: OffsetDateTime,
}

#[derive(Serialize)]
struct RefreshPayload<'a> {
    action: &'a str,
    url: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

impl Frame {
    fn event<T: Serialize>(name: &'static str, payload: &T) -> Result<Self, FrameError> {
        let data = serde_json::to_string(payload)?;
        Ok(Frame::Event {
            name,
            data: data.into(),
        })
    }

    pub fn connected(client_id: &str, time: OffsetDateTime) -> Result<Self, FrameError> {
        Self::event(CONNECTED_EVENT, &ConnectedPayload { client_id, time })
    }

    pub fn refresh(event: &Event) -> Result<Self, FrameError> {
        Self::event(
            REFRESH_EVENT,
            &RefreshPayload {
                action: &event.action,
                url: &event.resource_url,
                timestamp: event.issued_at,
            },
        )
    }

    pub fn heartbeat() -> Self {
        Frame::Heartbeat
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Heartbeat)
    }

    pub fn name(&self) -> Option<&'static str> {
        match self {
            Frame::Event { name, .. } => Some(name),
            Frame::Heartbeat => None,
        }
    }

    pub fn data(&self) -> Option<&str> {
        match self {
            Frame::Event { data, .. } => Some(data),
            Frame::Heartbeat => None,
        }
    }

    /// Payload size in bytes, used for delivery accounting.
    pub fn payload_len(&self) -> usize {
        self.data().map_or(0, str::len)
    }
}
