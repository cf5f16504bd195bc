use std::time::Duration;

use crate::{
    bson::{oid::ObjectId, Document},
    cmap::ConnectionInfo,
    event::command::{
        CommandEventHandler,
        CommandFailedEvent,
        CommandStartedEvent,
        CommandSucceededEvent,
    },
    trace::{
        render_error,
        serialize_command_or_reply,
        trace_debug,
        COMMAND_TRACING_EVENT_TARGET,
        DEFAULT_MAX_DOCUMENT_LENGTH_BYTES,
    },
};

/// Logs every command the client sends, along with how it ended.
pub(crate) struct CommandTracingEventEmitter {
    max_document_length_bytes: usize,
    topology_id: ObjectId,
}

/// What a command log line says about the command itself.
struct Line<'a> {
    message: &'static str,
    command_name: &'a str,
    request_id: i32,
    connection: &'a ConnectionInfo,
    database: Option<&'a str>,
    body: Option<String>,
    duration: Option<Duration>,
}

impl CommandTracingEventEmitter {
    pub(crate) fn new(max_document_length_bytes: Option<usize>, topology_id: ObjectId) -> Self {
        Self {
            max_document_length_bytes: max_document_length_bytes
                .unwrap_or(DEFAULT_MAX_DOCUMENT_LENGTH_BYTES),
            topology_id,
        }
    }

    fn render(&self, document: &Document) -> String {
        serialize_command_or_reply(document, self.max_document_length_bytes)
    }

    fn log(&self, line: Line<'_>) {
        trace_debug!(
            COMMAND_TRACING_EVENT_TARGET,
            self.topology_id,
            server = line.connection.address,
            line.message,
            commandName = line.command_name,
            requestId = line.request_id,
            driverConnectionId = line.connection.id,
            serverConnectionId = line.connection.server_id,
            databaseName = line.database,
            body = line.body,
            durationMS = line.duration.map(|duration| duration.as_millis()),
        );
    }
}

impl CommandEventHandler for CommandTracingEventEmitter {
    fn handle_command_started_event(&self, event: CommandStartedEvent) {
        self.log(Line {
            message: "Command started",
            command_name: &event.command_name,
            request_id: event.request_id,
            connection: &event.connection,
            database: Some(&event.db),
            body: Some(self.render(&event.command)),
            duration: None,
        });
    }

    fn handle_command_succeeded_event(&self, event: CommandSucceededEvent) {
        self.log(Line {
            message: "Command succeeded",
            command_name: &event.command_name,
            request_id: event.request_id,
            connection: &event.connection,
            database: None,
            body: Some(self.render(&event.reply)),
            duration: Some(event.duration),
        });
    }

    fn handle_command_failed_event(&self, event: CommandFailedEvent) {
        self.log(Line {
            message: "Command failed",
            command_name: &event.command_name,
            request_id: event.request_id,
            connection: &event.connection,
            database: None,
            body: Some(render_error(&event.failure, self.max_document_length_bytes)),
            duration: Some(event.duration),
        });
    }
}
