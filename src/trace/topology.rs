use std::time::Duration;

use crate::{
    bson::oid::ObjectId,
    event::sdam::{
        SdamEventHandler,
        ServerClosedEvent,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    options::ServerAddress,
    trace::{
        render_error,
        serialize_command_or_reply,
        trace_debug,
        DEFAULT_MAX_DOCUMENT_LENGTH_BYTES,
        TOPOLOGY_TRACING_EVENT_TARGET,
    },
};

/// Logs topology changes and monitor heartbeats. Server description changes are covered by the
/// topology description change that follows them.
#[derive(Clone)]
pub(crate) struct TopologyTracingEventEmitter {
    max_document_length_bytes: usize,
    topology_id: ObjectId,
}

impl TopologyTracingEventEmitter {
    pub(crate) fn new(topology_id: ObjectId, max_document_length_bytes: Option<usize>) -> Self {
        Self {
            max_document_length_bytes: max_document_length_bytes
                .unwrap_or(DEFAULT_MAX_DOCUMENT_LENGTH_BYTES),
            topology_id,
        }
    }

    fn heartbeat(
        &self,
        address: &ServerAddress,
        connection_id: u32,
        message: &str,
        outcome: Option<(Duration, String)>,
    ) {
        let (duration, outcome) = outcome.unzip();
        trace_debug!(
            TOPOLOGY_TRACING_EVENT_TARGET,
            self.topology_id,
            server = address,
            message,
            driverConnectionId = connection_id,
            outcome = outcome,
            durationMS = duration.map(|duration| duration.as_millis()),
        );
    }
}

impl SdamEventHandler for TopologyTracingEventEmitter {
    fn handle_server_opening_event(&self, event: ServerOpeningEvent) {
        trace_debug!(
            TOPOLOGY_TRACING_EVENT_TARGET,
            self.topology_id,
            server = event.address,
            "Starting server monitoring",
        );
    }

    fn handle_server_closed_event(&self, event: ServerClosedEvent) {
        trace_debug!(
            TOPOLOGY_TRACING_EVENT_TARGET,
            self.topology_id,
            server = event.address,
            "Stopped server monitoring",
        );
    }

    fn handle_topology_description_changed_event(&self, event: TopologyDescriptionChangedEvent) {
        trace_debug!(
            TOPOLOGY_TRACING_EVENT_TARGET,
            self.topology_id,
            "Topology description changed",
            previousDescription = event.previous_description.to_string(),
            newDescription = event.new_description.to_string(),
        );
    }

    fn handle_topology_opening_event(&self, _: TopologyOpeningEvent) {
        trace_debug!(
            TOPOLOGY_TRACING_EVENT_TARGET,
            self.topology_id,
            "Starting topology monitoring"
        );
    }

    fn handle_topology_closed_event(&self, _: TopologyClosedEvent) {
        trace_debug!(
            TOPOLOGY_TRACING_EVENT_TARGET,
            self.topology_id,
            "Stopped topology monitoring"
        );
    }

    fn handle_server_heartbeat_started_event(&self, event: ServerHeartbeatStartedEvent) {
        self.heartbeat(
            &event.server_address,
            event.driver_connection_id,
            "Server heartbeat started",
            None,
        );
    }

    fn handle_server_heartbeat_succeeded_event(&self, event: ServerHeartbeatSucceededEvent) {
        let reply = serialize_command_or_reply(&event.reply, self.max_document_length_bytes);
        self.heartbeat(
            &event.server_address,
            event.driver_connection_id,
            "Server heartbeat succeeded",
            Some((event.duration, reply)),
        );
    }

    fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {
        let failure = render_error(&event.failure, self.max_document_length_bytes);
        self.heartbeat(
            &event.server_address,
            event.driver_connection_id,
            "Server heartbeat failed",
            Some((event.duration, failure)),
        );
    }
}
