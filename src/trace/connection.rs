use std::time::Duration;

use crate::{
    bson::oid::ObjectId,
    event::cmap::{
        CmapEventHandler,
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionCheckoutFailedEvent,
        ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionCreatedEvent,
        ConnectionReadyEvent,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolCreatedEvent,
        PoolReadyEvent,
    },
    options::ServerAddress,
    trace::{trace_debug, CONNECTION_TRACING_EVENT_TARGET},
};

/// Logs pool and connection lifecycle events.
#[derive(Clone)]
pub(crate) struct ConnectionTracingEventEmitter {
    topology_id: ObjectId,
}

/// The fields a pool or connection log line may carry beyond its server.
#[derive(Default)]
struct Details {
    connection_id: Option<u32>,
    reason: Option<&'static str>,
    duration: Option<Duration>,
}

impl ConnectionTracingEventEmitter {
    pub(crate) fn new(topology_id: ObjectId) -> Self {
        Self { topology_id }
    }

    fn log(&self, address: &ServerAddress, message: &str, details: Details) {
        trace_debug!(
            CONNECTION_TRACING_EVENT_TARGET,
            self.topology_id,
            server = address,
            message,
            driverConnectionId = details.connection_id,
            reason = details.reason,
            durationMS = details.duration.map(|duration| duration.as_millis()),
        );
    }
}

impl CmapEventHandler for ConnectionTracingEventEmitter {
    fn handle_pool_created_event(&self, event: PoolCreatedEvent) {
        let options = event.options.unwrap_or_default();
        trace_debug!(
            CONNECTION_TRACING_EVENT_TARGET,
            self.topology_id,
            server = event.address,
            "Connection pool created",
            maxIdleTimeMS = options.max_idle_time.map(|idle| idle.as_millis()),
            maxPoolSize = options.max_pool_size,
            minPoolSize = options.min_pool_size,
        );
    }

    fn handle_pool_ready_event(&self, event: PoolReadyEvent) {
        self.log(&event.address, "Connection pool ready", Details::default());
    }

    fn handle_pool_cleared_event(&self, event: PoolClearedEvent) {
        self.log(&event.address, "Connection pool cleared", Details::default());
    }

    fn handle_pool_closed_event(&self, event: PoolClosedEvent) {
        self.log(&event.address, "Connection pool closed", Details::default());
    }

    fn handle_connection_created_event(&self, event: ConnectionCreatedEvent) {
        let details = Details {
            connection_id: Some(event.connection_id),
            ..Default::default()
        };
        self.log(&event.address, "Connection created", details);
    }

    fn handle_connection_ready_event(&self, event: ConnectionReadyEvent) {
        let details = Details {
            connection_id: Some(event.connection_id),
            duration: Some(event.duration),
            ..Default::default()
        };
        self.log(&event.address, "Connection ready", details);
    }

    fn handle_connection_closed_event(&self, event: ConnectionClosedEvent) {
        let details = Details {
            connection_id: Some(event.connection_id),
            reason: Some(closed_reason(event.reason)),
            ..Default::default()
        };
        self.log(&event.address, "Connection closed", details);
    }

    fn handle_connection_checkout_started_event(&self, event: ConnectionCheckoutStartedEvent) {
        self.log(&event.address, "Connection checkout started", Details::default());
    }

    fn handle_connection_checkout_failed_event(&self, event: ConnectionCheckoutFailedEvent) {
        let details = Details {
            reason: Some(checkout_failed_reason(event.reason)),
            duration: Some(event.duration),
            ..Default::default()
        };
        self.log(&event.address, "Connection checkout failed", details);
    }

    fn handle_connection_checked_out_event(&self, event: ConnectionCheckedOutEvent) {
        let details = Details {
            connection_id: Some(event.connection_id),
            duration: Some(event.duration),
            ..Default::default()
        };
        self.log(&event.address, "Connection checked out", details);
    }

    fn handle_connection_checked_in_event(&self, event: ConnectionCheckedInEvent) {
        let details = Details {
            connection_id: Some(event.connection_id),
            ..Default::default()
        };
        self.log(&event.address, "Connection checked in", details);
    }
}

fn closed_reason(reason: ConnectionClosedReason) -> &'static str {
    match reason {
        ConnectionClosedReason::Stale => "Connection belongs to a generation the pool has cleared",
        ConnectionClosedReason::Idle => "Connection sat unused in the pool past the max idle time",
        ConnectionClosedReason::Error => "Connection failed while in use",
        ConnectionClosedReason::Dropped => "Connection was dropped with an operation in flight",
        ConnectionClosedReason::PoolClosed => "Connection pool was closed",
    }
}

fn checkout_failed_reason(reason: ConnectionCheckoutFailedReason) -> &'static str {
    match reason {
        ConnectionCheckoutFailedReason::PoolClosed => "Connection pool was closed",
        ConnectionCheckoutFailedReason::Timeout => {
            "No connection became available before the wait queue timeout"
        }
        ConnectionCheckoutFailedReason::ConnectionError => "Establishing a new connection failed",
    }
}
