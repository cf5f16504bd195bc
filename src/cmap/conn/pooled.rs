use std::{
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use derive_where::derive_where;

use super::{Connection, PendingConnection};
use crate::{
    cmap::{manager::PoolManager, CmapEventEmitter},
    event::cmap::{ConnectionClosedEvent, ConnectionClosedReason},
    runtime::AsyncStream,
};

/// A [`Connection`] owned by a pool. Dropping one while it is checked out returns it to the
/// pool.
#[derive_where(Debug)]
pub(crate) struct PooledConnection {
    connection: Connection,
    location: Location,
    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,
}

/// Where a pooled connection currently is.
#[derive(Debug)]
enum Location {
    /// Not yet handed to anyone, or closed.
    Detached,

    /// Sitting in the pool since the given instant.
    Available(Instant),

    /// Lent out. The manager takes it back on drop.
    CheckedOut(PoolManager),
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }
}

impl PooledConnection {
    pub(crate) fn new(pending: PendingConnection, stream: AsyncStream) -> Self {
        let PendingConnection {
            id,
            address,
            generation,
            event_emitter,
            time_created,
        } = pending;
        Self {
            connection: Connection::new(address, stream, id, generation, time_created),
            location: Location::Detached,
            event_emitter,
        }
    }

    /// Records that the connection is back in the pool.
    pub(crate) fn park(&mut self) {
        self.location = Location::Available(Instant::now());
    }

    /// Records that the connection has been lent out through `manager`.
    pub(crate) fn lend(&mut self, manager: PoolManager) {
        self.location = Location::CheckedOut(manager);
    }

    /// Whether the connection has been sitting in the pool for `max_idle_time` or longer.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match (&self.location, max_idle_time) {
            (Location::Available(since), Some(limit)) => since.elapsed() >= limit,
            _ => false,
        }
    }

    /// Whether the pool has been cleared since the connection was created.
    pub(crate) fn is_stale(&self, current_generation: u32) -> bool {
        self.connection.generation != current_generation
    }

    pub(crate) fn supports_sessions(&self) -> bool {
        self.connection
            .stream_description
            .as_ref()
            .is_some_and(|description| description.logical_session_timeout.is_some())
    }

    /// Closes the connection for good.
    pub(crate) fn close(mut self, reason: ConnectionClosedReason) {
        self.location = Location::Detached;
        self.emit_closed(reason);
    }

    fn emit_closed(&self, reason: ConnectionClosedReason) {
        self.event_emitter.emit_event(|| {
            ConnectionClosedEvent {
                address: self.connection.address.clone(),
                connection_id: self.connection.id,
                reason,
            }
            .into()
        });
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Location::CheckedOut(manager) =
            std::mem::replace(&mut self.location, Location::Detached)
        else {
            return;
        };

        let returned = Self {
            connection: self.connection.take(),
            location: Location::Detached,
            event_emitter: self.event_emitter.clone(),
        };
        if let Err(orphan) = manager.check_in(returned) {
            orphan.emit_closed(ConnectionClosedReason::PoolClosed);
        }
    }
}
