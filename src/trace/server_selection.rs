use std::time::Instant;

use crate::{
    bson::oid::ObjectId,
    error::Error,
    options::ServerAddress,
    sdam::TopologyDescription,
    selection_criteria::SelectionCriteria,
    trace::{
        render_error,
        trace_debug,
        trace_enabled,
        DEFAULT_MAX_DOCUMENT_LENGTH_BYTES,
        SERVER_SELECTION_TRACING_EVENT_TARGET,
    },
};

/// Logs the progress of one server selection.
pub(crate) struct SelectionTrace<'a> {
    topology_id: ObjectId,
    criteria: &'a SelectionCriteria,
    operation: &'a str,
    deadline: Instant,
}

impl<'a> SelectionTrace<'a> {
    pub(crate) fn new(
        topology_id: ObjectId,
        criteria: &'a SelectionCriteria,
        operation: &'a str,
        deadline: Instant,
    ) -> Self {
        Self {
            topology_id,
            criteria,
            operation,
            deadline,
        }
    }

    pub(crate) fn started(&self, description: &TopologyDescription) {
        if trace_enabled!(SERVER_SELECTION_TRACING_EVENT_TARGET) {
            trace_debug!(
                SERVER_SELECTION_TRACING_EVENT_TARGET,
                self.topology_id,
                "Server selection started",
                operation = self.operation,
                selector = self.criteria.to_string(),
                topologyDescription = description.to_string(),
            );
        }
    }

    pub(crate) fn succeeded(&self, description: &TopologyDescription, address: &ServerAddress) {
        if trace_enabled!(SERVER_SELECTION_TRACING_EVENT_TARGET) {
            trace_debug!(
                SERVER_SELECTION_TRACING_EVENT_TARGET,
                self.topology_id,
                server = address,
                "Server selection succeeded",
                operation = self.operation,
                selector = self.criteria.to_string(),
                topologyDescription = description.to_string(),
            );
        }
    }

    pub(crate) fn failed(&self, description: &TopologyDescription, error: &Error) {
        if trace_enabled!(SERVER_SELECTION_TRACING_EVENT_TARGET) {
            trace_debug!(
                SERVER_SELECTION_TRACING_EVENT_TARGET,
                self.topology_id,
                "Server selection failed",
                operation = self.operation,
                selector = self.criteria.to_string(),
                topologyDescription = description.to_string(),
                failure = render_error(error, DEFAULT_MAX_DOCUMENT_LENGTH_BYTES),
            );
        }
    }

    /// Logged at `INFO` the first time a pass finds no suitable server.
    pub(crate) fn waiting(&self, description: &TopologyDescription) {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        tracing::info!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            topologyId = self.topology_id.to_hex(),
            operation = self.operation,
            selector = %self.criteria,
            topologyDescription = %description,
            remainingTimeMS = remaining.as_millis(),
            "Waiting for suitable server to become available",
        );
    }
}
