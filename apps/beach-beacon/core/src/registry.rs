use std::collections::HashMap;

use serde::Serialize;
use slab::Slab;
use time::OffsetDateTime;

use crate::error::WriteFailure;
use crate::frame::Frame;
use crate::heartbeat::HeartbeatHandle;
use crate::sink::{Delivery, EventSink};

/// One registration of a push client.
///
/// Two registrations under the same client id are told apart by their serial,
/// so a stale handle can never remove the connection that replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    id: String,
    serial: u64,
    connected_at: OffsetDateTime,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connected_at(&self) -> OffsetDateTime {
        self.connected_at
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            connected_at: self.connected_at,
        }
    }
}

/// Administrative view of a connection; carries no transport handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub client_id: String,
    pub reason: WriteFailure,
}

/// Result of writing one frame to every registered connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub bytes: usize,
    pub evicted: Vec<Eviction>,
}

struct ConnectionEntry {
    connection: Connection,
    sink: Box<dyn EventSink>,
    heartbeat: Option<HeartbeatHandle>,
}

impl ConnectionEntry {
    /// Tear down everything tied to this registration. Dropping the sink
    /// closes the transport's read side.
    fn retire(mut self) -> Connection {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        self.connection
    }
}

/// Live push connections keyed by client id.
///
/// Not synchronised on its own; [`crate::BroadcastHub`] keeps it behind the
/// same lock as the retained event.
#[derive(Default)]
pub struct ConnectionRegistry {
    slab: Slab<ConnectionEntry>,
    index: HashMap<String, usize>,
    next_serial: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection, retiring any existing entry for the same id.
    /// Returns the new registration and the retired one, if any.
    pub fn register(
        &mut self,
        id: String,
        sink: Box<dyn EventSink>,
        connected_at: OffsetDateTime,
    ) -> (Connection, Option<Connection>) {
        let retired = self.remove(&id);

        self.next_serial += 1;
        let connection = Connection {
            id: id.clone(),
            serial: self.next_serial,
            connected_at,
        };
        let key = self.slab.insert(ConnectionEntry {
            connection: connection.clone(),
            sink,
            heartbeat: None,
        });
        self.index.insert(id, key);

        (connection, retired)
    }

    /// Store the heartbeat timer for `connection`. A handle for a registration
    /// that is no longer current is cancelled on the spot.
    pub fn attach_heartbeat(&mut self, connection: &Connection, heartbeat: HeartbeatHandle) {
        match self.entry_mut(connection) {
            Some(entry) => {
                if let Some(previous) = entry.heartbeat.replace(heartbeat) {
                    previous.cancel();
                }
            }
            None => heartbeat.cancel(),
        }
    }

    /// Remove whatever is registered under `id`. No-op if absent.
    pub fn unregister(&mut self, id: &str) -> bool {
        self.remove(id).is_some()
    }

    /// Remove `connection` only if it is still the current registration for
    /// its id.
    pub fn release(&mut self, connection: &Connection) -> bool {
        if !self.is_current(connection) {
            return false;
        }
        self.remove(&connection.id).is_some()
    }

    pub fn is_current(&self, connection: &Connection) -> bool {
        self.index
            .get(&connection.id)
            .and_then(|key| self.slab.get(*key))
            .is_some_and(|entry| entry.connection.serial == connection.serial)
    }

    /// Write a frame to one connection. `None` when it is no longer current.
    pub fn write_to(&self, connection: &Connection, frame: &Frame) -> Option<Delivery> {
        let key = *self.index.get(&connection.id)?;
        let entry = self.slab.get(key)?;
        if entry.connection.serial != connection.serial {
            return None;
        }
        Some(entry.sink.write(frame))
    }

    /// Write `frame` to every connection in registry order. Connections whose
    /// sink fails are removed after the pass; the rest are unaffected.
    pub fn deliver_all(&mut self, frame: &Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for (key, entry) in self.slab.iter() {
            report.attempted += 1;
            match entry.sink.write(frame) {
                Delivery::Delivered => {
                    report.delivered += 1;
                    report.bytes += frame.payload_len();
                }
                Delivery::Failed(reason) => failed.push((key, reason)),
            }
        }

        for (key, reason) in failed {
            let entry = self.slab.remove(key);
            self.index.remove(&entry.connection.id);
            let connection = entry.retire();
            report.evicted.push(Eviction {
                client_id: connection.id,
                reason,
            });
        }

        report
    }

    pub fn count(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.slab
            .iter()
            .map(|(_, entry)| entry.connection.info())
            .collect()
    }

    /// Retire every connection. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.slab.len();
        self.index.clear();
        for entry in self.slab.drain() {
            entry.retire();
        }
        removed
    }

    fn remove(&mut self, id: &str) -> Option<Connection> {
        let key = self.index.remove(id)?;
        Some(self.slab.remove(key).retire())
    }

    fn entry_mut(&mut self, connection: &Connection) -> Option<&mut ConnectionEntry> {
        let key = *self.index.get(&connection.id)?;
        self.slab
            .get_mut(key)
            .filter(|entry| entry.connection.serial == connection.serial)
    }
}
