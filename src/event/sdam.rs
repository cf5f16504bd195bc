//! Server discovery and monitoring events: how the client's picture of the deployment changes
//! and what its monitors observe.

use std::{sync::Arc, time::Duration};

use crate::{
    bson::{oid::ObjectId, Document},
    error::Error,
    options::ServerAddress,
    trace::{topology::TopologyTracingEventEmitter, trace_enabled, TOPOLOGY_TRACING_EVENT_TARGET},
};

pub use crate::sdam::{ServerDescription, TopologyDescription, TopologyType};

/// A monitor check or an application error changed what is known about a server.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The server whose description changed.
    pub address: ServerAddress,

    /// The topology the server belongs to.
    pub topology_id: ObjectId,

    /// The description before the change.
    pub previous_description: ServerDescription,

    /// The description after the change.
    pub new_description: ServerDescription,
}

/// A server was added to the topology and its monitor started.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The added server.
    pub address: ServerAddress,

    /// The topology it was added to.
    pub topology_id: ObjectId,
}

/// A server left the topology, or the topology closed.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The removed server.
    pub address: ServerAddress,

    /// The topology it was removed from.
    pub topology_id: ObjectId,
}

/// Emitted after every change to the topology description, following the server events that
/// caused it.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The topology that changed.
    pub topology_id: ObjectId,

    /// The description before the change.
    pub previous_description: TopologyDescription,

    /// The description after the change.
    pub new_description: TopologyDescription,
}

/// The client created its topology. Always the first SDAM event.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// Identifies this topology in every later event.
    pub topology_id: ObjectId,
}

/// The topology closed, after `Client::shutdown` or once every handle to the client dropped.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The closed topology.
    pub topology_id: ObjectId,
}

/// A monitor sent `hello` to its server.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The checked server.
    pub server_address: ServerAddress,

    /// The monitoring connection's id. Monitors number their connections on their own.
    pub driver_connection_id: u32,
}

/// A monitor's `hello` got a reply.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// Time from sending `hello` to reading the reply.
    pub duration: Duration,

    /// The `hello` reply.
    pub reply: Document,

    /// The checked server.
    pub server_address: ServerAddress,

    /// The monitoring connection's id.
    pub driver_connection_id: u32,
}

/// A monitor's `hello` failed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// Time from starting the check to the failure.
    pub duration: Duration,

    /// Why the check failed.
    pub failure: Error,

    /// The checked server.
    pub server_address: ServerAddress,

    /// The monitoring connection's id.
    pub driver_connection_id: u32,
}

#[derive(Clone, Debug, derive_more::From)]
pub(crate) enum SdamEvent {
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

impl SdamEvent {
    pub(crate) fn dispatch(self, to: &dyn SdamEventHandler) {
        use SdamEvent::*;
        match self {
            ServerDescriptionChanged(event) => to.handle_server_description_changed_event(*event),
            ServerOpening(event) => to.handle_server_opening_event(event),
            ServerClosed(event) => to.handle_server_closed_event(event),
            TopologyDescriptionChanged(event) => {
                to.handle_topology_description_changed_event(*event)
            }
            TopologyOpening(event) => to.handle_topology_opening_event(event),
            TopologyClosed(event) => to.handle_topology_closed_event(event),
            ServerHeartbeatStarted(event) => to.handle_server_heartbeat_started_event(event),
            ServerHeartbeatSucceeded(event) => to.handle_server_heartbeat_succeeded_event(event),
            ServerHeartbeatFailed(event) => to.handle_server_heartbeat_failed_event(event),
        }
    }
}

/// Receives SDAM events. Register one with
/// [`ClientOptions::sdam_event_handler`](crate::options::ClientOptions::sdam_event_handler).
///
/// ```rust
/// # use std::sync::Arc;
/// #
/// # use mongodb_core::{
/// #     event::sdam::{SdamEventHandler, ServerHeartbeatFailedEvent},
/// #     options::ClientOptions,
/// # };
/// struct HeartbeatAlarm;
///
/// impl SdamEventHandler for HeartbeatAlarm {
///     fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {
///         eprintln!("{} missed a heartbeat: {}", event.server_address, event.failure);
///     }
/// }
///
/// let handler: Arc<dyn SdamEventHandler> = Arc::new(HeartbeatAlarm);
/// let options = ClientOptions::builder().sdam_event_handler(handler).build();
/// ```
#[allow(missing_docs)]
pub trait SdamEventHandler: Send + Sync {
    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {}

    fn handle_server_opening_event(&self, _event: ServerOpeningEvent) {}

    fn handle_server_closed_event(&self, _event: ServerClosedEvent) {}

    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {}

    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {}

    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {}

    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}
}

/// Sends SDAM events to the application's handler and to `tracing`.
#[derive(Clone)]
pub(crate) struct SdamEventEmitter {
    handler: Option<Arc<dyn SdamEventHandler>>,
    tracer: TopologyTracingEventEmitter,
}

impl SdamEventEmitter {
    pub(crate) fn new(
        handler: Option<Arc<dyn SdamEventHandler>>,
        topology_id: ObjectId,
        max_document_length_bytes: Option<usize>,
    ) -> Self {
        Self {
            handler,
            tracer: TopologyTracingEventEmitter::new(topology_id, max_document_length_bytes),
        }
    }

    /// Whether an emitted event would reach anyone.
    pub(crate) fn is_listening(&self) -> bool {
        self.handler.is_some() || trace_enabled!(TOPOLOGY_TRACING_EVENT_TARGET)
    }

    pub(crate) fn emit_event(&self, make: impl FnOnce() -> SdamEvent) {
        let tracer = trace_enabled!(TOPOLOGY_TRACING_EVENT_TARGET)
            .then_some(&self.tracer as &dyn SdamEventHandler);
        super::deliver(self.handler.as_deref(), tracer, make, |event, to| {
            event.dispatch(to)
        });
    }
}
