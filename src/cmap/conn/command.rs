use super::wire::DocumentSequence;
use crate::{
    bson::{Bson, Document},
    bson_util,
    client::session::{ClientSession, ClusterTime},
    concern::{ReadConcernInternal, WriteConcern},
    error::{CommandError, Error, ErrorKind, Result},
    hello::{HelloCommandResponse, HelloReply},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// Driver-side model of a database command.
#[derive(Clone, Debug, Default)]
pub(crate) struct Command {
    pub(crate) name: String,

    pub(crate) target_db: String,

    pub(crate) exhaust_allowed: bool,

    /// The server will not reply to this command.
    pub(crate) more_to_come: bool,

    pub(crate) body: Document,

    pub(crate) document_sequences: Vec<DocumentSequence>,

    pub(crate) lsid: Option<Document>,

    cluster_time: Option<ClusterTime>,

    read_preference: Option<ReadPreference>,

    pub(crate) txn_number: Option<i64>,

    start_transaction: Option<bool>,

    autocommit: Option<bool>,

    read_concern: Option<ReadConcernInternal>,

    write_concern: Option<Document>,

    recovery_token: Option<Document>,
}

impl Command {
    pub(crate) fn new(name: impl ToString, target_db: impl ToString, body: Document) -> Self {
        Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            body,
            ..Default::default()
        }
    }

    pub(crate) fn add_document_sequence(
        &mut self,
        identifier: impl ToString,
        documents: Vec<Document>,
    ) {
        self.document_sequences.push(DocumentSequence {
            identifier: identifier.to_string(),
            documents,
        });
    }

    pub(crate) fn set_session(&mut self, session: &ClientSession) {
        self.lsid = Some(session.id().clone())
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        self.cluster_time = Some(cluster_time.clone());
    }

    pub(crate) fn set_recovery_token(&mut self, recovery_token: &Document) {
        self.recovery_token = Some(recovery_token.clone());
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.txn_number = Some(txn_number);
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.read_preference = Some(read_preference);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.start_transaction = Some(true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.autocommit = Some(false);
    }

    pub(crate) fn set_read_concern(&mut self, read_concern: ReadConcernInternal) {
        self.read_concern = Some(read_concern);
    }

    /// Attaches `write_concern` unless it is empty.
    pub(crate) fn set_write_concern(&mut self, write_concern: &WriteConcern) -> Result<()> {
        self.write_concern = if write_concern.is_empty() {
            None
        } else {
            Some(write_concern.to_document()?)
        };
        Ok(())
    }

    pub(crate) fn clear_read_concern(&mut self) {
        self.read_concern = None;
    }

    /// Adds `afterClusterTime` to the read concern when the session has observed an operation
    /// time. The level, if any, is left alone.
    pub(crate) fn set_after_cluster_time(&mut self, session: &ClientSession) {
        if let Some(operation_time) = session.operation_time() {
            self.read_concern
                .get_or_insert_with(ReadConcernInternal::default)
                .after_cluster_time = Some(operation_time);
        }
    }

    /// The document sent as the OP_MSG body section: the command body followed by the generic
    /// command arguments.
    pub(crate) fn to_document(&self) -> Document {
        let mut doc = self.body.clone();
        doc.insert("$db", self.target_db.as_str());
        if let Some(ref lsid) = self.lsid {
            doc.insert("lsid", lsid.clone());
        }
        if let Some(ref cluster_time) = self.cluster_time {
            doc.insert("$clusterTime", cluster_time.to_document());
        }
        if let Some(ref read_preference) = self.read_preference {
            doc.insert("$readPreference", read_preference.to_document());
        }
        if let Some(txn_number) = self.txn_number {
            doc.insert("txnNumber", Bson::Int64(txn_number));
        }
        if let Some(start_transaction) = self.start_transaction {
            doc.insert("startTransaction", start_transaction);
        }
        if let Some(autocommit) = self.autocommit {
            doc.insert("autocommit", autocommit);
        }
        if let Some(ref read_concern) = self.read_concern {
            let read_concern = read_concern.to_document();
            if !read_concern.is_empty() {
                doc.insert("readConcern", read_concern);
            }
        }
        if let Some(ref write_concern) = self.write_concern {
            doc.insert("writeConcern", write_concern.clone());
        }
        if let Some(ref recovery_token) = self.recovery_token {
            doc.insert("recoveryToken", recovery_token.clone());
        }
        doc
    }

    /// The full command as reported to command monitoring, with each document sequence folded
    /// back into the body as an array.
    pub(crate) fn to_monitoring_document(&self) -> Document {
        let mut doc = self.to_document();
        for sequence in &self.document_sequences {
            doc.insert(
                sequence.identifier.as_str(),
                bson_util::to_bson_array(&sequence.documents),
            );
        }
        doc
    }
}

/// A reply to a command, as received from a server.
#[derive(Debug, Clone)]
pub(crate) struct RawCommandResponse {
    pub(crate) source: ServerAddress,
    body: Document,
}

impl RawCommandResponse {
    #[cfg(test)]
    pub(crate) fn with_document_and_address(source: ServerAddress, body: Document) -> Self {
        Self { source, body }
    }

    pub(crate) fn from_document(source: ServerAddress, body: Document) -> Self {
        Self { source, body }
    }

    pub(crate) fn body(&self) -> &Document {
        &self.body
    }

    pub(crate) fn into_body(self) -> Document {
        self.body
    }

    /// Whether the reply reports `ok: 1`.
    pub(crate) fn is_success(&self) -> bool {
        self.body.get("ok").and_then(bson_util::get_int) == Some(1)
    }

    /// The `$clusterTime` gossiped by the server, if it sent a well-formed one.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.body
            .get_document("$clusterTime")
            .ok()
            .and_then(|doc| ClusterTime::from_document(doc).ok())
    }

    pub(crate) fn error_labels(&self) -> Option<Vec<String>> {
        self.body.get_array("errorLabels").ok().map(|labels| {
            labels
                .iter()
                .filter_map(|label| label.as_str().map(str::to_string))
                .collect()
        })
    }

    /// Converts an `ok: 0` reply into a command error carrying the reply's error labels.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        Err(Error::new(
            ErrorKind::Command(CommandError::from_response(&self.body)),
            self.error_labels(),
        ))
    }

    /// The reply body of an authentication step; an unsuccessful reply is reported as an
    /// authentication failure for `mechanism_name`.
    pub(crate) fn auth_response_body(&self, mechanism_name: &str) -> Result<&Document> {
        if self.is_success() {
            return Ok(&self.body);
        }
        let reason = self
            .body
            .get_str("errmsg")
            .unwrap_or("authentication failed");
        Err(Error::authentication_error(mechanism_name, reason))
    }

    pub(crate) fn into_hello_reply(self) -> Result<HelloReply> {
        self.validate()?;
        let command_response = HelloCommandResponse::from_document(&self.body)?;
        let cluster_time = self.cluster_time();
        Ok(HelloReply {
            command_response,
            cluster_time,
            raw_command_response: self.body,
        })
    }

    /// The address of the server that sent this response.
    pub(crate) fn source_address(&self) -> &ServerAddress {
        &self.source
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{Command, RawCommandResponse};
    use crate::{
        bson::{doc, Bson, Timestamp},
        concern::{ReadConcernInternal, ReadConcernLevel, WriteConcern},
        error::ErrorKind,
        options::ServerAddress,
    };

    fn address() -> ServerAddress {
        ServerAddress::Tcp {
            host: "localhost".to_string(),
            port: Some(27017),
        }
    }

    #[test]
    fn generic_arguments_follow_the_body() {
        let mut command = Command::new("find", "db", doc! { "find": "coll", "filter": doc! {} });
        command.set_txn_number(3);
        command.set_start_transaction();
        command.set_autocommit();
        command.set_read_concern(ReadConcernInternal {
            level: Some(ReadConcernLevel::Majority),
            after_cluster_time: Some(Timestamp {
                time: 1,
                increment: 2,
            }),
        });

        let doc = command.to_document();
        let keys: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "find",
                "filter",
                "$db",
                "txnNumber",
                "startTransaction",
                "autocommit",
                "readConcern"
            ]
        );
        assert_eq!(doc.get("txnNumber"), Some(&Bson::Int64(3)));
        assert_eq!(doc.get_bool("autocommit"), Ok(false));
    }

    #[test]
    fn empty_write_concern_is_omitted() {
        let mut command = Command::new("insert", "db", doc! { "insert": "coll" });
        command.set_write_concern(&WriteConcern::default()).unwrap();
        assert!(!command.to_document().contains_key("writeConcern"));

        command.set_write_concern(&WriteConcern::majority()).unwrap();
        assert_eq!(
            command.to_document().get_document("writeConcern"),
            Ok(&doc! { "w": "majority" })
        );
    }

    #[test]
    fn failed_reply_becomes_command_error_with_labels() {
        let response = RawCommandResponse::with_document_and_address(
            address(),
            doc! {
                "ok": 0.0,
                "code": 10107,
                "codeName": "NotWritablePrimary",
                "errmsg": "not primary",
                "errorLabels": vec!["RetryableWriteError"],
            },
        );
        assert!(!response.is_success());
        let err = response.validate().unwrap_err();
        assert!(err.is_not_writable_primary());
        assert!(err.contains_label("RetryableWriteError"));
        match *err.kind {
            ErrorKind::Command(ref e) => assert_eq!(e.code_name, "NotWritablePrimary"),
            ref other => panic!("expected command error, got {other:?}"),
        }
    }

    #[test]
    fn auth_failures_name_the_mechanism() {
        let response = RawCommandResponse::with_document_and_address(
            address(),
            doc! { "ok": 0, "errmsg": "bad auth" },
        );
        let err = response.auth_response_body("SCRAM-SHA-256").unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::Authentication { .. }));
        assert!(err.to_string().contains("SCRAM-SHA-256"));
    }
}
