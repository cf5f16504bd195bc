use std::time::Duration;

use crate::{hello::HelloReply, sdam::ServerType};

/// Wire version 6 brought OP_MSG, sessions and retryable writes.
const OP_MSG_WIRE_VERSION: i32 = 6;

/// What a connection learned about its server from the handshake. Operations size batches and
/// pick features from this rather than from the topology, which may have moved on.
#[derive(Debug, Clone)]
pub(crate) struct StreamDescription {
    /// The server's type at handshake time.
    pub(crate) initial_server_type: ServerType,

    pub(crate) max_wire_version: Option<i32>,

    /// Mechanisms the server offered for the handshake's `saslSupportedMechs` user.
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// `None` when the server does not support sessions.
    pub(crate) logical_session_timeout: Option<Duration>,

    pub(crate) max_bson_object_size: i64,

    /// Writes per `insert`, `update` or `delete` command.
    pub(crate) max_write_batch_size: i64,

    pub(crate) max_message_size_bytes: i32,
}

impl StreamDescription {
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let hello = &reply.command_response;
        let logical_session_timeout = hello
            .logical_session_timeout_minutes
            .and_then(|minutes| u64::try_from(minutes).ok())
            .map(|minutes| Duration::from_secs(60 * minutes));
        Self {
            initial_server_type: hello.server_type(),
            max_wire_version: hello.max_wire_version,
            sasl_supported_mechs: hello.sasl_supported_mechs.clone(),
            logical_session_timeout,
            max_bson_object_size: hello.max_bson_object_size,
            max_write_batch_size: hello.max_write_batch_size.unwrap_or(100_000),
            max_message_size_bytes: hello.max_message_size_bytes,
        }
    }

    fn wire_version_at_least(&self, version: i32) -> bool {
        self.max_wire_version.is_some_and(|max| max >= version)
    }

    /// Standalones never retry writes, and neither do servers without sessions.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.initial_server_type != ServerType::Standalone
            && self.logical_session_timeout.is_some()
            && self.wire_version_at_least(OP_MSG_WIRE_VERSION)
    }

    /// Older servers only understand OP_QUERY.
    pub(crate) fn supports_op_msg(&self) -> bool {
        self.wire_version_at_least(OP_MSG_WIRE_VERSION)
    }

    #[cfg(test)]
    pub(crate) fn with_wire_version(max_wire_version: i32) -> Self {
        Self {
            initial_server_type: ServerType::RsPrimary,
            max_wire_version: Some(max_wire_version),
            sasl_supported_mechs: None,
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            max_bson_object_size: 16 * 1024 * 1024,
            max_write_batch_size: 100_000,
            max_message_size_bytes: 48_000_000,
        }
    }
}
