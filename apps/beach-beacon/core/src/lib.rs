//! Shared primitives for the Beach beacon service: a hub that tells browser
//! clients a resource changed, over long-lived event streams (push) and a
//! stateless "anything new since X" query (pull).
//!
//! ```text
//!   publish(url) ──► BroadcastHub ──► retained slot ◄── PollGateway::poll(since_id)
//!                        │
//!                        └─► ConnectionRegistry ──► sink.write(frame) per client
//!                                 │                    (failures evicted)
//!                                 └─► HeartbeatScheduler, one timer per client
//! ```

pub mod error;
pub mod event;
pub mod frame;
pub mod heartbeat;
pub mod hub;
pub mod poll;
pub mod registry;
pub mod sink;

pub use error::{FrameError, HubError, WriteFailure};
pub use event::{Event, EventId, MatchMode, RefreshNotice, DEFAULT_ACTION};
pub use frame::{Frame, CONNECTED_EVENT, HEARTBEAT_COMMENT, REFRESH_EVENT};
pub use heartbeat::{HeartbeatHandle, HeartbeatScheduler, DEFAULT_HEARTBEAT_INTERVAL};
pub use hub::{BroadcastHub, HubConfig, Publication};
pub use poll::{PollGateway, PollOutcome, PollResponse};
pub use registry::{BroadcastReport, Connection, ConnectionInfo, ConnectionRegistry, Eviction};
pub use sink::{Delivery, EventSink};
