//! Command monitoring: one started event per command sent, followed by exactly one succeeded or
//! failed event with the same `request_id`.

use std::time::Duration;

use crate::{bson::Document, cmap::ConnectionInfo, error::Error};

/// A command is about to be written to a connection. Authentication commands and `hello` carrying
/// credentials are reported with an empty body.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandStartedEvent {
    /// The command body, including `$db` and session fields.
    pub command: Document,

    /// Database the command targets.
    pub db: String,

    /// The command's first key, e.g. `"insert"`.
    pub command_name: String,

    /// Wire request id. Pairs this event with the one that completes it.
    pub request_id: i32,

    /// Where the command goes.
    pub connection: ConnectionInfo,
}

/// The server replied with `ok: 1`. Write errors inside the reply still count as success here.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandSucceededEvent {
    /// Round trip time, from writing the command to decoding the reply.
    pub duration: Duration,

    /// The decoded reply. Empty for redacted commands.
    pub reply: Document,

    /// See [`CommandStartedEvent::command_name`].
    pub command_name: String,

    /// See [`CommandStartedEvent::request_id`].
    pub request_id: i32,

    /// Where the command ran.
    pub connection: ConnectionInfo,
}

/// The command failed: a network or timeout error, or a reply with `ok: 0`.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandFailedEvent {
    /// Time until the failure was seen.
    pub duration: Duration,

    /// See [`CommandStartedEvent::command_name`].
    pub command_name: String,

    /// The error, as the operation will see it.
    pub failure: Error,

    /// See [`CommandStartedEvent::request_id`].
    pub request_id: i32,

    /// Where the command ran.
    pub connection: ConnectionInfo,
}

/// Receives command events. Register one with
/// [`ClientOptions::command_event_handler`](crate::options::ClientOptions::command_event_handler).
///
/// ```rust
/// # use std::{sync::{Arc, Mutex}, time::Duration};
/// #
/// # use mongodb_core::{
/// #     event::command::{CommandEventHandler, CommandSucceededEvent},
/// #     options::ClientOptions,
/// # };
/// #[derive(Default)]
/// struct SlowestCommand(Mutex<Option<(String, Duration)>>);
///
/// impl CommandEventHandler for SlowestCommand {
///     fn handle_command_succeeded_event(&self, event: CommandSucceededEvent) {
///         let mut slowest = self.0.lock().unwrap();
///         if slowest.as_ref().is_none_or(|(_, duration)| event.duration > *duration) {
///             *slowest = Some((event.command_name, event.duration));
///         }
///     }
/// }
///
/// let handler: Arc<dyn CommandEventHandler> = Arc::new(SlowestCommand::default());
/// let options = ClientOptions::builder().command_event_handler(handler).build();
/// ```
#[allow(missing_docs)]
pub trait CommandEventHandler: Send + Sync {
    fn handle_command_started_event(&self, _event: CommandStartedEvent) {}

    fn handle_command_succeeded_event(&self, _event: CommandSucceededEvent) {}

    fn handle_command_failed_event(&self, _event: CommandFailedEvent) {}
}

#[derive(Clone, Debug, derive_more::From)]
pub(crate) enum CommandEvent {
    Started(CommandStartedEvent),
    Succeeded(CommandSucceededEvent),
    Failed(CommandFailedEvent),
}

impl CommandEvent {
    pub(crate) fn dispatch(self, to: &dyn CommandEventHandler) {
        match self {
            Self::Started(event) => to.handle_command_started_event(event),
            Self::Succeeded(event) => to.handle_command_succeeded_event(event),
            Self::Failed(event) => to.handle_command_failed_event(event),
        }
    }
}
