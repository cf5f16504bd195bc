//! Connection pool events: pools opening, clearing and closing, and connections moving in and
//! out of them.

use std::{sync::Arc, time::Duration};

use crate::{
    bson::oid::ObjectId,
    options::ServerAddress,
    trace::{
        connection::ConnectionTracingEventEmitter,
        trace_enabled,
        CONNECTION_TRACING_EVENT_TARGET,
    },
};

/// Pool settings reported by [`PoolCreatedEvent`].
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct ConnectionPoolOptions {
    /// Idle connections older than this get closed.
    pub max_idle_time: Option<Duration>,

    /// Upper bound on open connections, checked out or not.
    pub max_pool_size: Option<u32>,

    /// Connections kept open in the background.
    pub min_pool_size: Option<u32>,
}

/// A server was added and got a pool. Checkouts fail until the pool is marked ready.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The pool's server.
    pub address: ServerAddress,

    /// Settings the pool uses.
    pub options: Option<ConnectionPoolOptions>,
}

/// A check found the server reachable, so the pool now hands out connections.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PoolReadyEvent {
    /// The pool's server.
    pub address: ServerAddress,
}

/// The server was marked unknown. Existing connections became stale and the pool paused.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The pool's server.
    pub address: ServerAddress,
}

/// The server left the topology, or the client shut down.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The pool's server.
    pub address: ServerAddress,
}

/// The pool started opening a connection.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The pool's server.
    pub address: ServerAddress,

    /// Numbered from 1 within each pool. Later events for this connection carry the same id.
    pub connection_id: u32,
}

/// A new connection finished its handshake and authentication.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The pool's server.
    pub address: ServerAddress,

    /// See [`ConnectionCreatedEvent::connection_id`].
    pub connection_id: u32,

    /// Time spent between creation and readiness.
    pub duration: Duration,
}

/// A connection was closed.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The pool's server.
    pub address: ServerAddress,

    /// See [`ConnectionCreatedEvent::connection_id`].
    pub connection_id: u32,

    /// What closed it.
    pub reason: ConnectionClosedReason,
}

/// See [`ConnectionClosedEvent::reason`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// Created before the last pool clear.
    Stale,

    /// Unused for longer than the pool's `max_idle_time`.
    Idle,

    /// Reading or writing failed.
    Error,

    /// Dropped mid-operation, so its stream could hold a partial message.
    Dropped,

    /// Its pool closed.
    PoolClosed,
}

/// An operation asked the pool for a connection.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The pool's server.
    pub address: ServerAddress,
}

/// An operation did not get a connection.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The pool's server.
    pub address: ServerAddress,

    /// What went wrong.
    pub reason: ConnectionCheckoutFailedReason,

    /// Time from the request to the failure.
    pub duration: Duration,
}

/// See [`ConnectionCheckoutFailedEvent::reason`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// The pool was paused or closed, before or during the wait.
    PoolClosed,

    /// `wait_queue_timeout` passed first.
    Timeout,

    /// Opening a new connection failed.
    ConnectionError,
}

/// An operation got a connection.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The pool's server.
    pub address: ServerAddress,

    /// See [`ConnectionCreatedEvent::connection_id`].
    pub connection_id: u32,

    /// Time from the request to the checkout.
    pub duration: Duration,
}

/// An operation returned its connection.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The pool's server.
    pub address: ServerAddress,

    /// See [`ConnectionCreatedEvent::connection_id`].
    pub connection_id: u32,
}

/// Receives connection pool events. Register one with
/// [`ClientOptions::cmap_event_handler`](crate::options::ClientOptions::cmap_event_handler).
///
/// ```rust
/// # use std::sync::{
/// #     atomic::{AtomicU32, Ordering},
/// #     Arc,
/// # };
/// #
/// # use mongodb_core::{
/// #     event::cmap::{CmapEventHandler, ConnectionCheckedOutEvent},
/// #     options::ClientOptions,
/// # };
/// #[derive(Default)]
/// struct CheckoutCounter(AtomicU32);
///
/// impl CmapEventHandler for CheckoutCounter {
///     fn handle_connection_checked_out_event(&self, _event: ConnectionCheckedOutEvent) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
/// }
///
/// let handler: Arc<dyn CmapEventHandler> = Arc::new(CheckoutCounter::default());
/// let options = ClientOptions::builder().cmap_event_handler(handler).build();
/// ```
#[allow(missing_docs)]
pub trait CmapEventHandler: Send + Sync {
    fn handle_pool_created_event(&self, _event: PoolCreatedEvent) {}

    fn handle_pool_ready_event(&self, _event: PoolReadyEvent) {}

    fn handle_pool_cleared_event(&self, _event: PoolClearedEvent) {}

    fn handle_pool_closed_event(&self, _event: PoolClosedEvent) {}

    fn handle_connection_created_event(&self, _event: ConnectionCreatedEvent) {}

    fn handle_connection_ready_event(&self, _event: ConnectionReadyEvent) {}

    fn handle_connection_closed_event(&self, _event: ConnectionClosedEvent) {}

    fn handle_connection_checkout_started_event(&self, _event: ConnectionCheckoutStartedEvent) {}

    fn handle_connection_checkout_failed_event(&self, _event: ConnectionCheckoutFailedEvent) {}

    fn handle_connection_checked_out_event(&self, _event: ConnectionCheckedOutEvent) {}

    fn handle_connection_checked_in_event(&self, _event: ConnectionCheckedInEvent) {}
}

#[derive(Clone, Debug, PartialEq, derive_more::From)]
pub(crate) enum CmapEvent {
    PoolCreated(PoolCreatedEvent),
    PoolReady(PoolReadyEvent),
    PoolCleared(PoolClearedEvent),
    PoolClosed(PoolClosedEvent),
    ConnectionCreated(ConnectionCreatedEvent),
    ConnectionReady(ConnectionReadyEvent),
    ConnectionClosed(ConnectionClosedEvent),
    ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent),
    ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent),
    ConnectionCheckedOut(ConnectionCheckedOutEvent),
    ConnectionCheckedIn(ConnectionCheckedInEvent),
}

impl CmapEvent {
    pub(crate) fn dispatch(self, to: &dyn CmapEventHandler) {
        use CmapEvent::*;
        match self {
            PoolCreated(event) => to.handle_pool_created_event(event),
            PoolReady(event) => to.handle_pool_ready_event(event),
            PoolCleared(event) => to.handle_pool_cleared_event(event),
            PoolClosed(event) => to.handle_pool_closed_event(event),
            ConnectionCreated(event) => to.handle_connection_created_event(event),
            ConnectionReady(event) => to.handle_connection_ready_event(event),
            ConnectionClosed(event) => to.handle_connection_closed_event(event),
            ConnectionCheckoutStarted(event) => to.handle_connection_checkout_started_event(event),
            ConnectionCheckoutFailed(event) => to.handle_connection_checkout_failed_event(event),
            ConnectionCheckedOut(event) => to.handle_connection_checked_out_event(event),
            ConnectionCheckedIn(event) => to.handle_connection_checked_in_event(event),
        }
    }
}

/// Sends pool events to the application's handler and to `tracing`.
#[derive(Clone)]
pub(crate) struct CmapEventEmitter {
    handler: Option<Arc<dyn CmapEventHandler>>,
    tracer: ConnectionTracingEventEmitter,
}

impl CmapEventEmitter {
    pub(crate) fn new(handler: Option<Arc<dyn CmapEventHandler>>, topology_id: ObjectId) -> Self {
        Self {
            handler,
            tracer: ConnectionTracingEventEmitter::new(topology_id),
        }
    }

    pub(crate) fn emit_event(&self, make: impl FnOnce() -> CmapEvent) {
        let tracer = trace_enabled!(CONNECTION_TRACING_EVENT_TARGET)
            .then_some(&self.tracer as &dyn CmapEventHandler);
        super::deliver(self.handler.as_deref(), tracer, make, |event, to| {
            event.dispatch(to)
        });
    }
}
