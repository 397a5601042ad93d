use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::event::{Event, EventIdGenerator, MatchMode, RefreshNotice};
use crate::frame::Frame;
use crate::heartbeat::{Beat, HeartbeatHandle, HeartbeatScheduler, DEFAULT_HEARTBEAT_INTERVAL};
use crate::registry::{BroadcastReport, Connection, ConnectionInfo, ConnectionRegistry};
use crate::sink::{Delivery, EventSink};

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub heartbeat_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// A published event together with how its fan-out went.
#[derive(Debug, Clone)]
pub struct Publication {
    pub event: Event,
    pub report: BroadcastReport,
    pub connections: usize,
}

/// Registry of push clients plus the single retained event.
///
/// Cloning is cheap and every clone shares the same state. All mutations of
/// the registry and the retained slot happen under one lock; sink writes are
/// non-blocking, so they are issued while holding it.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubShared>,
}

struct HubShared {
    state: Mutex<HubState>,
    heartbeat: HeartbeatScheduler,
}

struct HubState {
    registry: ConnectionRegistry,
    retained: Option<Event>,
    ids: EventIdGenerator,
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubShared {
                state: Mutex::new(HubState {
                    registry: ConnectionRegistry::new(),
                    retained: None,
                    ids: EventIdGenerator::default(),
                }),
                heartbeat: HeartbeatScheduler::new(config.heartbeat_interval),
            }),
        }
    }

    /// Complete the handshake for `id`: emit the `connected` frame, then
    /// store the connection and start its heartbeat. An existing connection
    /// with the same id is retired first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(
        &self,
        id: impl Into<String>,
        sink: impl EventSink,
    ) -> Result<Connection, HubError> {
        let id = id.into();
        let connected_at = OffsetDateTime::now_utc();

        let hello = Frame::connected(&id, connected_at)?;
        if let Delivery::Failed(reason) = sink.write(&hello) {
            warn!(client_id = %id, %reason, "push client dropped before handshake completed");
            return Err(HubError::Handshake {
                client_id: id,
                reason,
            });
        }

        let mut state = self.inner.state.lock();
        let (connection, retired) = state.registry.register(id, Box::new(sink), connected_at);
        let heartbeat = self.start_heartbeat(&connection);
        state.registry.attach_heartbeat(&connection, heartbeat);
        let connections = state.registry.count();
        drop(state);

        info!(
            client_id = %connection.id(),
            replaced = retired.is_some(),
            connections,
            "push client connected"
        );
        Ok(connection)
    }

    /// Remove whatever is registered under `id`. Idempotent.
    pub fn unregister(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let removed = state.registry.unregister(id);
        let connections = state.registry.count();
        drop(state);

        if removed {
            info!(client_id = %id, connections, "push client unregistered");
        }
        removed
    }

    /// Transport-close path: remove `connection` unless it has already been
    /// replaced or evicted.
    pub fn release(&self, connection: &Connection) -> bool {
        let mut state = self.inner.state.lock();
        let removed = state.registry.release(connection);
        let connections = state.registry.count();
        drop(state);

        if removed {
            info!(client_id = %connection.id(), connections, "push client disconnected");
        }
        removed
    }

    pub fn publish(&self, url: impl Into<String>, match_mode: MatchMode) -> Result<Event, HubError> {
        self.broadcast(RefreshNotice::new(url, match_mode))
            .map(|publication| publication.event)
    }

    /// Issue a new event, make it the retained one and push it to every
    /// connection. Connections whose sink fails are evicted; delivery to the
    /// rest continues.
    pub fn broadcast(&self, notice: RefreshNotice) -> Result<Publication, HubError> {
        let mut state = self.inner.state.lock();
        let issued_at = OffsetDateTime::now_utc();
        let event = Event {
            id: state.ids.next(issued_at),
            resource_url: notice.url,
            match_mode: notice.match_mode,
            action: notice.action,
            issued_at,
        };
        let frame = Frame::refresh(&event)?;

        state.retained = Some(event.clone());
        let report = state.registry.deliver_all(&frame);
        let connections = state.registry.count();
        drop(state);

        for eviction in &report.evicted {
            warn!(
                client_id = %eviction.client_id,
                reason = %eviction.reason,
                "push write failed; connection evicted"
            );
        }
        info!(
            event_id = %event.id,
            url = %event.resource_url,
            match_mode = %event.match_mode,
            delivered = report.delivered,
            bytes = report.bytes,
            evicted = report.evicted.len(),
            connections,
            "refresh broadcast"
        );

        Ok(Publication {
            event,
            report,
            connections,
        })
    }

    /// The most recently published event, if any.
    pub fn retained(&self) -> Option<Event> {
        self.inner.state.lock().retained.clone()
    }

    pub fn count(&self) -> usize {
        self.inner.state.lock().registry.count()
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.inner.state.lock().registry.list()
    }

    /// Cancel every heartbeat and drop every connection. The retained event is
    /// kept so pollers still see the latest state.
    pub fn shutdown(&self) -> usize {
        let closed = self.inner.state.lock().registry.clear();
        info!(closed, "broadcast hub shut down");
        closed
    }

    fn start_heartbeat(&self, connection: &Connection) -> HeartbeatHandle {
        let hub: Weak<HubShared> = Arc::downgrade(&self.inner);
        let connection = connection.clone();
        self.inner.heartbeat.start(move || match hub.upgrade() {
            Some(shared) => shared.beat(&connection),
            None => Beat::Stop,
        })
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl HubShared {
    fn beat(&self, connection: &Connection) -> Beat {
        let mut state = self.state.lock();
        let delivery = state.registry.write_to(connection, &Frame::heartbeat());
        match delivery {
            None => Beat::Stop,
            Some(Delivery::Delivered) => {
                debug!(client_id = %connection.id(), "heartbeat sent");
                Beat::Continue
            }
            Some(Delivery::Failed(reason)) => {
                state.registry.release(connection);
                let connections = state.registry.count();
                drop(state);
                warn!(
                    client_id = %connection.id(),
                    %reason,
                    connections,
                    "heartbeat write failed; connection evicted"
                );
                Beat::Stop
            }
        }
    }
}
