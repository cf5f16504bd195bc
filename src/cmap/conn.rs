mod command;
pub(crate) mod pooled;
mod stream_description;
pub(crate) mod wire;

use std::time::Instant;

use derive_where::derive_where;
use tokio::io::BufStream;

use self::wire::{next_request_id, Message, Query, Reply};
use crate::{
    bson::{doc, Document},
    error::{Error, Result},
    event::cmap::CmapEventEmitter,
    options::ServerAddress,
    runtime::AsyncStream,
};
pub(crate) use command::{Command, RawCommandResponse};
pub(crate) use stream_description::StreamDescription;

/// User-facing information about a connection to the database.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// A driver-generated identifier that uniquely identifies the connection.
    pub id: u32,

    /// A server-generated identifier that uniquely identifies the connection. Available on
    /// servers that report a `connectionId` in their handshake reply.
    pub server_id: Option<i64>,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

/// A wrapper around Stream that contains all the CMAP information needed to maintain a connection.
#[derive_where(Debug)]
pub(crate) struct Connection {
    /// Driver-generated ID for the connection.
    pub(crate) id: u32,

    /// Server-generated ID for the connection.
    pub(crate) server_id: Option<i64>,

    pub(crate) address: ServerAddress,

    /// The pool generation the connection was created in.
    pub(crate) generation: u32,

    pub(crate) time_created: Instant,

    /// The cached StreamDescription from the connection's handshake.
    pub(crate) stream_description: Option<StreamDescription>,

    /// Whether or not a command is currently being run on this connection. This is set to `true`
    /// right before sending bytes to the server and set back to `false` once a full response has
    /// been read. A connection dropped while this is set has an unknown protocol state.
    command_executing: bool,

    /// Stores a network error encountered while reading or writing. Once set, the connection is
    /// closed instead of being returned to its pool.
    pub(crate) error: Option<Error>,

    #[derive_where(skip)]
    stream: BufStream<AsyncStream>,
}

impl Connection {
    pub(crate) fn new(
        address: ServerAddress,
        stream: AsyncStream,
        id: u32,
        generation: u32,
        time_created: Instant,
    ) -> Self {
        Self {
            id,
            server_id: None,
            address,
            generation,
            time_created,
            stream_description: None,
            command_executing: false,
            error: None,
            stream: BufStream::new(stream),
        }
    }

    /// Creates a connection used only by a server monitor. It has no pool and emits no CMAP
    /// events.
    pub(crate) fn new_monitoring(address: ServerAddress, stream: AsyncStream, id: u32) -> Self {
        Self::new(address, stream, id, 0, Instant::now())
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Whether the connection has seen a network error, leaving it unusable.
    pub(crate) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    /// Whether a command was in flight when this connection was last touched. A connection in
    /// this state must not be reused.
    pub(crate) fn is_executing(&self) -> bool {
        self.command_executing
    }

    /// Gets the connection's StreamDescription.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description
            .as_ref()
            .ok_or_else(|| Error::internal("Stream checked out but not handshaked"))
    }

    fn max_message_size_bytes(&self) -> Option<i32> {
        self.stream_description
            .as_ref()
            .map(|sd| sd.max_message_size_bytes)
    }

    fn uses_op_msg(&self) -> bool {
        self.stream_description
            .as_ref()
            .is_some_and(StreamDescription::supports_op_msg)
    }

    /// Executes a `Command` and returns a `RawCommandResponse` containing the result from the
    /// server.
    ///
    /// An `Ok(...)` result simply means the server received the command and that the driver
    /// received the response; it does not imply anything about the success of the command
    /// itself. Commands sent before the handshake has completed, or to servers that predate
    /// OP_MSG, are sent as OP_QUERY.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
    ) -> Result<RawCommandResponse> {
        if let Some(ref error) = self.error {
            return Err(Error::internal(format!(
                "attempted to send a command on connection {} after it errored: {error}",
                self.id
            )));
        }

        let request_id = request_id.into().unwrap_or_else(next_request_id);
        let max_message_size = self.max_message_size_bytes();
        let use_op_msg = self.uses_op_msg();

        self.command_executing = true;
        let write_result = if use_op_msg {
            Message::from_command(&command, Some(request_id))
                .write_to(&mut self.stream, max_message_size)
                .await
        } else {
            Query::command(&command.target_db, command.to_document(), Some(request_id))
                .write_to(&mut self.stream)
                .await
        };
        if let Err(error) = write_result {
            self.command_executing = false;
            if error.is_network_error() {
                self.error = Some(error.clone());
            }
            return Err(error);
        }

        if use_op_msg && command.more_to_come {
            self.command_executing = false;
            return Ok(RawCommandResponse::from_document(
                self.address.clone(),
                doc! { "ok": 1 },
            ));
        }

        let read_result = self
            .read_reply(use_op_msg, max_message_size)
            .await
            .and_then(|(response_to, body)| {
                if response_to == request_id {
                    Ok(body)
                } else {
                    Err(Error::invalid_response(format!(
                        "expected a response to request {request_id}, got a response to \
                         {response_to}"
                    )))
                }
            });
        self.command_executing = false;

        match read_result {
            Ok(body) => Ok(RawCommandResponse::from_document(self.address.clone(), body)),
            Err(error) => {
                // Any failure while reading leaves the stream position unknown.
                self.error = Some(error.clone());
                Err(error)
            }
        }
    }

    async fn read_reply(
        &mut self,
        use_op_msg: bool,
        max_message_size: Option<i32>,
    ) -> Result<(i32, Document)> {
        if use_op_msg {
            let message = Message::read_from(&mut self.stream, max_message_size).await?;
            Ok((message.response_to, message.document_payload))
        } else {
            let reply = Reply::read_from(&mut self.stream, max_message_size).await?;
            let response_to = reply.response_to;
            Ok((response_to, reply.into_command_document()?))
        }
    }

    /// Nullify the inner state and return it in a new `Connection`. The original is left with a
    /// null stream.
    pub(crate) fn take(&mut self) -> Connection {
        Connection {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
            generation: self.generation,
            time_created: self.time_created,
            stream_description: self.stream_description.take(),
            command_executing: self.command_executing,
            error: self.error.take(),
            stream: std::mem::replace(&mut self.stream, BufStream::new(AsyncStream::Null)),
        }
    }
}

/// A connection a pool has counted but not yet opened.
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,
    pub(crate) event_emitter: CmapEventEmitter,
    pub(crate) time_created: Instant,
}
