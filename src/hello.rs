use crate::{
    bson::{doc, oid::ObjectId, Bson, DateTime, Document},
    bson_util,
    client::session::ClusterTime,
    cmap::{conn::wire::DEFAULT_MAX_MESSAGE_SIZE_BYTES, Command, Connection},
    error::Result,
    sdam::ServerType,
    selection_criteria::TagSet,
};

/// The legacy version of the `hello` command which was deprecated in 5.0.
/// To limit usages of the legacy name in the codebase, this constant should be used
/// wherever possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";
pub(crate) const LEGACY_HELLO_COMMAND_NAME_LOWERCASE: &str = "ismaster";

/// Construct a hello or legacy hello command, depending on the circumstances.
///
/// If the server indicated `helloOk: true`, then `hello` will be used. Otherwise, legacy hello
/// will be used, and if it's unknown whether the server supports hello, the command also will
/// contain `helloOk: true`.
pub(crate) fn hello_command(hello_ok: Option<bool>) -> Command {
    let (body, command_name) = if matches!(hello_ok, Some(true)) {
        (doc! { "hello": 1 }, "hello")
    } else {
        let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        (body, LEGACY_HELLO_COMMAND_NAME)
    };

    Command::new(command_name, "admin", body)
}

/// Execute a hello or legacy hello command.
pub(crate) async fn run_hello(conn: &mut Connection, command: Command) -> Result<HelloReply> {
    let response_result = conn.send_command(command, None).await;
    response_result.and_then(|raw_response| raw_response.into_hello_reply())
}

#[derive(Debug, Clone)]
pub(crate) struct HelloReply {
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: Document,
    pub(crate) cluster_time: Option<ClusterTime>,
}

/// The fields of a `hello` reply that discovery and connections use.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub is_writable_primary: Option<bool>,

    /// Legacy name for `is_writable_primary` field.
    pub is_master: Option<bool>,

    /// Whether or not the server supports using the `hello` command for monitoring instead
    /// of the legacy hello command.
    pub hello_ok: Option<bool>,

    /// The list of all hosts.
    pub hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a mongos.
    pub msg: Option<String>,

    /// The address of the server that returned this `HelloCommandResponse`.
    pub me: Option<String>,

    /// The current replica set config version.
    pub set_version: Option<i32>,

    /// The name of the current replica set.
    pub set_name: Option<String>,

    /// Whether the server is hidden.
    pub hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub arbiter_only: Option<bool>,

    /// Whether the server is a replica set.
    pub is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub election_id: Option<ObjectId>,

    /// The address of current primary member of the replica set.
    pub primary: Option<String>,

    /// A list of SASL mechanisms used to create the user's credential(s).
    pub sasl_supported_mechs: Option<Vec<String>>,

    /// The maximum permitted size of a BSON object in bytes.
    pub max_bson_object_size: i64,

    /// The maximum number of write operations permitted in a write batch.
    pub max_write_batch_size: Option<i64>,

    /// The maximum permitted size of a BSON wire protocol message.
    pub max_message_size_bytes: i32,

    /// The server-generated ID for the connection the "hello" command was run on.
    pub connection_id: Option<i64>,
}

const DEFAULT_MAX_BSON_OBJECT_SIZE: i64 = 16 * 1024 * 1024;

fn opt_bool(doc: &Document, key: &str) -> Option<bool> {
    doc.get(key).and_then(Bson::as_bool)
}

fn opt_string(doc: &Document, key: &str) -> Option<String> {
    doc.get_str(key).ok().map(str::to_string)
}

fn opt_i64(doc: &Document, key: &str) -> Option<i64> {
    doc.get(key).and_then(bson_util::get_int)
}

fn opt_i32(doc: &Document, key: &str) -> Option<i32> {
    opt_i64(doc, key).and_then(|v| i32::try_from(v).ok())
}

fn opt_string_list(doc: &Document, key: &str) -> Option<Vec<String>> {
    doc.get_array(key).ok().map(|values| {
        values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

impl HelloCommandResponse {
    /// Reads the fields the driver uses out of a successful hello reply. Unknown fields are
    /// ignored and size limits fall back to the server defaults when absent.
    pub(crate) fn from_document(doc: &Document) -> Result<Self> {
        let tags = match doc.get_document("tags") {
            Ok(tags) => Some(
                tags.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect(),
            ),
            Err(_) => None,
        };
        let last_write = match doc.get_document("lastWrite") {
            Ok(last_write) => Some(LastWrite {
                last_write_date: *last_write.get_datetime("lastWriteDate")?,
            }),
            Err(_) => None,
        };

        Ok(Self {
            is_writable_primary: opt_bool(doc, "isWritablePrimary"),
            is_master: opt_bool(doc, LEGACY_HELLO_COMMAND_NAME_LOWERCASE),
            hello_ok: opt_bool(doc, "helloOk"),
            hosts: opt_string_list(doc, "hosts"),
            passives: opt_string_list(doc, "passives"),
            arbiters: opt_string_list(doc, "arbiters"),
            msg: opt_string(doc, "msg"),
            me: opt_string(doc, "me"),
            set_version: opt_i32(doc, "setVersion"),
            set_name: opt_string(doc, "setName"),
            hidden: opt_bool(doc, "hidden"),
            secondary: opt_bool(doc, "secondary"),
            arbiter_only: opt_bool(doc, "arbiterOnly"),
            is_replica_set: opt_bool(doc, "isreplicaset"),
            logical_session_timeout_minutes: opt_i64(doc, "logicalSessionTimeoutMinutes"),
            last_write,
            min_wire_version: opt_i32(doc, "minWireVersion"),
            max_wire_version: opt_i32(doc, "maxWireVersion"),
            tags,
            election_id: doc.get_object_id("electionId").ok(),
            primary: opt_string(doc, "primary"),
            sasl_supported_mechs: opt_string_list(doc, "saslSupportedMechs"),
            max_bson_object_size: opt_i64(doc, "maxBsonObjectSize")
                .unwrap_or(DEFAULT_MAX_BSON_OBJECT_SIZE),
            max_write_batch_size: opt_i64(doc, "maxWriteBatchSize"),
            max_message_size_bytes: opt_i32(doc, "maxMessageSizeBytes")
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES),
            connection_id: opt_i64(doc, "connectionId"),
        })
    }

    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LastWrite {
    pub last_write_date: DateTime,
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{hello_command, HelloCommandResponse};
    use crate::{bson::doc, sdam::ServerType};

    #[test]
    fn legacy_hello_until_server_says_hello_ok() {
        let first = hello_command(None).to_document();
        assert_eq!(first.first_key(), Some("isMaster"));
        assert_eq!(first.get_bool("helloOk"), Ok(true));

        let known_legacy = hello_command(Some(false)).to_document();
        assert!(!known_legacy.contains_key("helloOk"));

        let modern = hello_command(Some(true)).to_document();
        assert_eq!(modern.first_key(), Some("hello"));
        assert_eq!(modern.get_str("$db"), Ok("admin"));
    }

    #[test]
    fn classifies_server_types() {
        let cases = vec![
            (doc! { "ok": 1, "msg": "isdbgrid" }, ServerType::Mongos),
            (
                doc! { "ok": 1, "setName": "rs", "isWritablePrimary": true },
                ServerType::RsPrimary,
            ),
            (
                doc! { "ok": 1, "setName": "rs", "ismaster": true, "hidden": true },
                ServerType::RsOther,
            ),
            (
                doc! { "ok": 1, "setName": "rs", "secondary": true },
                ServerType::RsSecondary,
            ),
            (
                doc! { "ok": 1, "setName": "rs", "arbiterOnly": true },
                ServerType::RsArbiter,
            ),
            (doc! { "ok": 1, "isreplicaset": true }, ServerType::RsGhost),
            (doc! { "ok": 1, "ismaster": true }, ServerType::Standalone),
        ];
        for (reply, expected) in cases {
            let response = HelloCommandResponse::from_document(&reply).unwrap();
            assert_eq!(response.server_type(), expected, "{reply}");
        }
    }

    #[test]
    fn parses_members_and_limits() {
        let response = HelloCommandResponse::from_document(&doc! {
            "ok": 1,
            "setName": "rs",
            "hosts": vec!["a:27017", "b:27017"],
            "tags": doc! { "dc": "ny" },
            "maxWireVersion": 17,
            "maxWriteBatchSize": 100_000,
            "logicalSessionTimeoutMinutes": 30,
        })
        .unwrap();
        assert_eq!(
            response.hosts,
            Some(vec!["a:27017".to_string(), "b:27017".to_string()])
        );
        assert_eq!(response.tags.unwrap().get("dc").map(String::as_str), Some("ny"));
        assert_eq!(response.max_wire_version, Some(17));
        assert_eq!(response.max_bson_object_size, 16 * 1024 * 1024);
        assert_eq!(response.logical_session_timeout_minutes, Some(30));
    }
}
