//! Structured `tracing` output. Each emitter implements the same handler trait applications use,
//! so it receives exactly the events a registered handler would.

pub(crate) mod command;
pub(crate) mod connection;
pub(crate) mod server_selection;
pub(crate) mod topology;

use crate::{
    bson::{Bson, Document},
    error::Error,
};

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongodb_core::command";
pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_core::connection";
pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str = "mongodb_core::server_selection";
pub(crate) const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongodb_core::topology";

pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

/// Whether `DEBUG` events for the given target would be recorded by the current subscriber.
macro_rules! trace_enabled {
    ($target:expr) => {
        tracing::enabled!(target: $target, tracing::Level::DEBUG)
    };
}
pub(crate) use trace_enabled;

/// Emits a `DEBUG` event on `target` tagged with the topology id. A leading `server = address`
/// argument also tags it with that server's host and port.
macro_rules! trace_debug {
    (
        $target:expr,
        $topology_id:expr,
        server = $address:expr,
        $message:expr $(, $field:ident = $value:expr)* $(,)?
    ) => {{
        let address: &$crate::options::ServerAddress = &$address;
        tracing::debug!(
            target: $target,
            topologyId = $topology_id.to_hex(),
            serverHost = address.host(),
            serverPort = address.port(),
            $($field = $value,)*
            "{}",
            $message
        )
    }};
    ($target:expr, $topology_id:expr, $message:expr $(, $field:ident = $value:expr)* $(,)?) => {
        tracing::debug!(
            target: $target,
            topologyId = $topology_id.to_hex(),
            $($field = $value,)*
            "{}",
            $message
        )
    };
}
pub(crate) use trace_debug;

/// The error's message, cut down to `max_length` bytes.
pub(crate) fn render_error(error: &Error, max_length: usize) -> String {
    let mut rendered = error.to_string();
    truncate_on_char_boundary(&mut rendered, max_length);
    rendered
}

/// Renders a command or reply as relaxed extended JSON, cut down to `max_length` bytes.
pub(crate) fn serialize_command_or_reply(doc: &Document, max_length: usize) -> String {
    let mut ext_json = Bson::Document(doc.clone()).to_string();
    truncate_on_char_boundary(&mut ext_json, max_length);
    ext_json
}

/// Cuts `s` to at most `max_len` bytes without splitting a character and appends `...` when
/// anything was removed.
pub(crate) fn truncate_on_char_boundary(s: &mut String, max_len: usize) {
    if s.len() <= max_len {
        return;
    }
    let cut = (0..=max_len)
        .rev()
        .find(|&index| s.is_char_boundary(index))
        .unwrap_or(0);
    s.truncate(cut);
    s.push_str("...");
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{serialize_command_or_reply, truncate_on_char_boundary};
    use crate::doc;

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut s = "aé".repeat(4);
        truncate_on_char_boundary(&mut s, 2);
        assert_eq!(s, "a...");

        let mut short = "short".to_string();
        truncate_on_char_boundary(&mut short, 10);
        assert_eq!(short, "short");
    }

    #[test]
    fn long_documents_are_cut() {
        let payload = "x".repeat(2000);
        let rendered = serialize_command_or_reply(&doc! { "insert": payload }, 100);
        assert_eq!(rendered.len(), 103);
        assert!(rendered.ends_with("..."));
    }
}
