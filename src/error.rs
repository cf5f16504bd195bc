//! The crate's [`Error`] type and the server error codes it classifies.

use std::{collections::HashSet, fmt, io, sync::Arc};

use thiserror::Error;

use crate::{
    bson::{Bson, Document, ValueAccessError},
    bson_util,
    options::ServerAddress,
    results::BulkWriteResult,
    sdam::ServerType,
};

/// Codes meaning the node is not (or no longer) a writable primary.
const NOT_WRITABLE_PRIMARY: &[i32] = &[10107, 13435, 10058];
/// Codes meaning the node is starting up, shutting down or rolling back.
const RECOVERING: &[i32] = &[11600, 11602, 13436, 189, 91];
const SHUTTING_DOWN: &[i32] = &[11600, 91];
const RETRYABLE_READ: &[i32] = &[
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 134, 262,
];
const RETRYABLE_WRITE: &[i32] = &[11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262];
/// MaxTimeMSExpired, WriteConcernFailed and ShutdownInProgress leave a commit's outcome unknown.
const COMMIT_OUTCOME_UNKNOWN: &[i32] = &[50, 64, 91];
const DUPLICATE_KEY: &[i32] = &[11000, 11001, 12582];

/// Label carried by errors after which a write may safely be sent again.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// Label carried by errors after which the whole transaction may be run again.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Label carried by `commitTransaction` failures after which the commit may or may not have
/// been applied.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// Shorthand for results whose error is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in this crate.
///
/// The [`ErrorKind`] is boxed so results stay small. I/O errors sit behind an `Arc` so that an
/// error can be cloned and handed to several waiters.
#[derive(Clone, Debug, Error)]
#[error("{kind} (labels: {labels:?})")]
#[non_exhaustive]
pub struct Error {
    /// What went wrong.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,
}

impl Error {
    /// Builds an error from `kind`. Labels of an embedded write concern error are merged in.
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut all_labels: HashSet<String> = labels.into_iter().flatten().collect();
        if let Some(wc_error) = kind.write_concern_error() {
            all_labels.extend(wc_error.labels.iter().cloned());
        }
        Self {
            kind: Box::new(kind),
            labels: all_labels,
        }
    }

    pub(crate) fn pool_cleared_error(address: &ServerAddress, cause: &Error) -> Self {
        ErrorKind::ConnectionPoolCleared {
            message: format!("connection pool for {address} was cleared after an error: {cause}"),
        }
        .into()
    }

    pub(crate) fn authentication_error(mechanism: &str, reason: &str) -> Self {
        ErrorKind::Authentication {
            message: format!("{mechanism} failure: {reason}"),
        }
        .into()
    }

    pub(crate) fn invalid_authentication_response(mechanism: &str) -> Self {
        Self::authentication_error(mechanism, "invalid server response")
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn transaction(message: impl Into<String>) -> Self {
        ErrorKind::Transaction {
            message: message.into(),
        }
        .into()
    }

    /// The labels attached to this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether the error carries `label`.
    pub fn contains_label(&self, label: impl AsRef<str>) -> bool {
        self.labels.contains(label.as_ref())
    }

    pub(crate) fn add_label(&mut self, label: impl AsRef<str>) {
        self.labels.insert(label.as_ref().to_owned());
    }

    /// The server's error code. Write errors count, unlike for [`Error::sdam_code`].
    pub(crate) fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(e)) => Some(e.code),
            _ => self.sdam_code(),
        }
    }

    /// The code that decides how the topology reacts: a command error's code or a write concern
    /// error's code. Plain write errors say nothing about the server's state.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(e) => Some(e.code),
            kind => kind.write_concern_error().map(|e| e.code),
        }
    }

    fn has_sdam_code_in(&self, codes: &[i32]) -> bool {
        self.sdam_code().is_some_and(|code| codes.contains(&code))
    }

    /// Whether the I/O failed or the pool was cleared underneath the operation.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        match self.kind.as_ref() {
            ErrorKind::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        self.is_network_error() && !self.is_network_timeout()
    }

    pub(crate) fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    pub(crate) fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    /// Whether the server produced this error, as opposed to the client or the network.
    pub(crate) fn is_server_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Authentication { .. }
                | ErrorKind::BulkWrite(_)
                | ErrorKind::Command(_)
                | ErrorKind::Write(_)
        )
    }

    /// Whether the node reported that it is not a writable primary.
    pub fn is_not_writable_primary(&self) -> bool {
        self.has_sdam_code_in(NOT_WRITABLE_PRIMARY)
    }

    /// Whether the node reported that it is recovering.
    pub fn is_recovering(&self) -> bool {
        self.has_sdam_code_in(RECOVERING)
    }

    /// Whether the node reported that it is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.has_sdam_code_in(SHUTTING_DOWN)
    }

    /// Whether the node's role changed under the operation ("not writable primary" or
    /// "node is recovering").
    pub fn is_state_change_error(&self) -> bool {
        self.is_not_writable_primary() || self.is_recovering()
    }

    /// Whether a read that failed with this error may be sent again.
    pub fn is_read_retryable(&self) -> bool {
        self.is_network_error() || self.has_sdam_code_in(RETRYABLE_READ)
    }

    /// Whether a write that failed with this error may be sent again.
    pub fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether the client has to attach [`RETRYABLE_WRITE_ERROR`] itself. Servers newer than
    /// wire version 8 label their own errors, leaving only network errors to the client.
    pub(crate) fn should_add_retryable_write_label(
        &self,
        max_wire_version: i32,
        server_type: Option<ServerType>,
    ) -> bool {
        if self.is_network_error() {
            return true;
        }
        if max_wire_version > 8 {
            return false;
        }
        let from_mongos_wc = server_type == Some(ServerType::Mongos)
            && self.kind.write_concern_error().is_some();
        !from_mongos_wc && self.has_sdam_code_in(RETRYABLE_WRITE)
    }

    pub(crate) fn should_add_unknown_transaction_commit_result_label(&self) -> bool {
        !self.contains_label(TRANSIENT_TRANSACTION_ERROR)
            && (self.is_network_error()
                || matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
                || self.is_write_retryable()
                || self.has_sdam_code_in(COMMIT_OUTCOME_UNKNOWN))
    }

    /// Whether a unique index rejected the write. For bulk writes, the first write error decides.
    pub fn is_duplicate_key(&self) -> bool {
        let code = match self.kind.as_ref() {
            ErrorKind::BulkWrite(failure) => failure
                .write_errors
                .as_deref()
                .and_then(<[BulkWriteError]>::first)
                .map(|e| e.code),
            ErrorKind::Write(WriteFailure::WriteError(e)) => Some(e.code),
            ErrorKind::Command(e) => Some(e.code),
            _ => None,
        };
        code.is_some_and(|code| DUPLICATE_KEY.contains(&code))
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self::new(err.into(), None::<Vec<String>>)
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<io::ErrorKind> for ErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        io::Error::from(kind).into()
    }
}

impl From<ValueAccessError> for ErrorKind {
    fn from(err: ValueAccessError) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

/// The categories of [`Error`].
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The caller passed something unusable.
    #[error("invalid argument: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// A connection could not be authenticated.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// A value could not be turned into BSON.
    #[error("BSON encoding failed: {message}")]
    #[non_exhaustive]
    BsonEncode { message: String },

    /// Bytes did not form a valid BSON document.
    #[error("BSON decoding failed: {message}")]
    #[non_exhaustive]
    BsonDecode { message: String },

    /// Some writes of a bulk write or `insert_many` failed. The failure records what was
    /// applied.
    #[error("bulk write failed: {0:?}")]
    BulkWrite(BulkWriteFailure),

    /// The server answered with `ok: 0`.
    #[error("command failed: {0}")]
    Command(CommandError),

    #[error("internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Reading from or writing to a socket failed.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Another operation's failure cleared the pool this one was using.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// The server's reply could not be understood.
    #[error("invalid server reply: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// No suitable server was found in time.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// No connection to `address` freed up within the wait queue timeout.
    #[error("timed out waiting for a connection to {address}")]
    #[non_exhaustive]
    WaitQueueTimeout { address: ServerAddress },

    /// The deployment cannot run sessions.
    #[error("the deployment does not support sessions")]
    SessionsNotSupported,

    #[error("{message}")]
    #[non_exhaustive]
    InvalidTlsConfig { message: String },

    /// A single-document write failed.
    #[error("write failed: {0:?}")]
    Write(WriteFailure),

    /// A transaction method was called in the wrong state.
    #[error("{message}")]
    #[non_exhaustive]
    Transaction { message: String },

    /// The server is too old for what was asked of it.
    #[error("incompatible server: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// The client was used after [`Client::shutdown`](crate::Client::shutdown).
    #[error("the client has been shut down")]
    Shutdown,
}

impl ErrorKind {
    fn write_concern_error(&self) -> Option<&WriteConcernError> {
        match self {
            Self::BulkWrite(failure) => failure.write_concern_error.as_ref(),
            Self::Write(WriteFailure::WriteConcernError(e)) => Some(e),
            _ => None,
        }
    }
}

fn code_field(doc: &Document) -> i32 {
    doc.get("code")
        .and_then(bson_util::get_int)
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or_default()
}

fn text_field(doc: &Document, key: &str) -> Option<String> {
    doc.get_str(key).ok().map(str::to_owned)
}

/// The body of an `ok: 0` reply.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct CommandError {
    /// Numeric error code.
    pub code: i32,

    /// Symbolic name of `code`.
    pub code_name: String,

    /// Human-readable description.
    pub message: String,
}

impl CommandError {
    pub(crate) fn from_response(body: &Document) -> Self {
        Self {
            code: code_field(body),
            code_name: text_field(body, "codeName").unwrap_or_default(),
            message: text_field(body, "errmsg").unwrap_or_default(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code_name, self.code, self.message)
    }
}

/// The write was applied but the requested write concern was not satisfied.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Numeric error code.
    pub code: i32,

    /// Symbolic name of `code`.
    pub code_name: String,

    /// Human-readable description.
    pub message: String,

    /// The server's `errInfo`, if any.
    pub details: Option<Document>,

    /// Labels the server put on the write concern error itself.
    pub(crate) labels: Vec<String>,
}

impl WriteConcernError {
    pub(crate) fn from_document(doc: &Document) -> Self {
        let labels = match doc.get_array("errorLabels") {
            Ok(labels) => labels
                .iter()
                .filter_map(Bson::as_str)
                .map(str::to_owned)
                .collect(),
            Err(_) => Vec::new(),
        };
        Self {
            code: code_field(doc),
            code_name: text_field(doc, "codeName").unwrap_or_default(),
            message: text_field(doc, "errmsg").unwrap_or_default(),
            details: doc.get_document("errInfo").ok().cloned(),
            labels,
        }
    }
}

/// A single-document write that the server rejected.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct WriteError {
    /// Numeric error code.
    pub code: i32,

    /// Symbolic name of `code`. Not every server sends one.
    pub code_name: Option<String>,

    /// Human-readable description.
    pub message: String,

    /// The server's `errInfo`, such as a failed validation.
    pub details: Option<Document>,
}

/// One rejected write of a bulk write or an `insert_many`.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct BulkWriteError {
    /// Position of the rejected write among those submitted.
    pub index: usize,

    /// Numeric error code.
    pub code: i32,

    /// Symbolic name of `code`, when sent.
    pub code_name: Option<String>,

    /// Human-readable description.
    pub message: String,

    /// The server's `errInfo`, if any.
    pub details: Option<Document>,
}

impl BulkWriteError {
    pub(crate) fn from_document(doc: &Document) -> Self {
        Self {
            index: doc
                .get("index")
                .and_then(bson_util::get_u64)
                .and_then(|index| usize::try_from(index).ok())
                .unwrap_or_default(),
            code: code_field(doc),
            code_name: text_field(doc, "codeName"),
            message: text_field(doc, "errmsg").unwrap_or_default(),
            details: doc.get_document("errInfo").ok().cloned(),
        }
    }
}

impl From<BulkWriteError> for WriteError {
    fn from(error: BulkWriteError) -> Self {
        let BulkWriteError {
            code,
            code_name,
            message,
            details,
            ..
        } = error;
        Self {
            code,
            code_name,
            message,
            details,
        }
    }
}

/// Everything that went wrong in a bulk write, next to what went right.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct BulkWriteFailure {
    /// Rejected writes, ordered by index.
    pub write_errors: Option<Vec<BulkWriteError>>,

    /// The write concern failure, if there was one.
    pub write_concern_error: Option<WriteConcernError>,

    /// The writes the server acknowledged.
    pub partial_result: BulkWriteResult,
}

/// Why a single-document write failed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteFailure {
    /// The write concern could not be satisfied.
    WriteConcernError(WriteConcernError),

    /// The server rejected the write itself.
    WriteError(WriteError),
}

/// Turns a bulk failure into the single failure the one-document write methods report: the first
/// write error if any, the write concern error otherwise. Other errors pass through.
pub(crate) fn convert_bulk_errors(error: Error) -> Error {
    let Error { kind, labels } = error;
    let failure = match *kind {
        ErrorKind::BulkWrite(failure) => failure,
        other => {
            return Error {
                kind: Box::new(other),
                labels,
            }
        }
    };

    let first_write_error = failure.write_errors.and_then(|errors| errors.into_iter().next());
    let single = match (first_write_error, failure.write_concern_error) {
        (Some(error), _) => WriteFailure::WriteError(error.into()),
        (None, Some(wc_error)) => WriteFailure::WriteConcernError(wc_error),
        (None, None) => return Error::invalid_response("bulk write failure without any errors"),
    };
    Error::new(ErrorKind::Write(single), Some(labels))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::doc;

    fn command_error(code: i32) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: String::new(),
        })
        .into()
    }

    #[test]
    fn classifies_state_change_codes() {
        assert!(command_error(10107).is_not_writable_primary());
        assert!(command_error(10107).is_state_change_error());
        assert!(command_error(11602).is_recovering());
        assert!(command_error(91).is_shutting_down());
        assert!(!command_error(11000).is_state_change_error());
    }

    #[test]
    fn network_errors_are_read_retryable() {
        let err: Error = io::ErrorKind::ConnectionReset.into();
        assert!(err.is_network_error());
        assert!(err.is_non_timeout_network_error());
        assert!(err.is_read_retryable());
        assert!(command_error(262).is_read_retryable());
        assert!(!command_error(2).is_read_retryable());

        let timeout: Error = io::ErrorKind::TimedOut.into();
        assert!(timeout.is_network_timeout());
        assert!(!timeout.is_non_timeout_network_error());
    }

    #[test]
    fn retryable_write_label_depends_on_wire_version() {
        assert!(command_error(91).should_add_retryable_write_label(8, None));
        assert!(!command_error(91).should_add_retryable_write_label(9, None));

        let network: Error = io::ErrorKind::BrokenPipe.into();
        assert!(network.should_add_retryable_write_label(13, None));
    }

    #[test]
    fn write_concern_error_labels_are_merged() {
        let wc_error = WriteConcernError::from_document(&doc! {
            "code": 91,
            "codeName": "ShutdownInProgress",
            "errmsg": "shutting down",
            "errorLabels": vec!["RetryableWriteError"],
        });
        let err: Error = ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)).into();
        assert!(err.is_write_retryable());
        assert_eq!(err.code(), Some(91));
        assert_eq!(err.sdam_code(), Some(91));
    }

    #[test]
    fn write_error_codes_are_ignored_by_sdam() {
        let err: Error = ErrorKind::Write(WriteFailure::WriteError(WriteError {
            code: 10107,
            code_name: None,
            message: "not primary".to_string(),
            details: None,
        }))
        .into();
        assert_eq!(err.code(), Some(10107));
        assert_eq!(err.sdam_code(), None);
        assert!(!err.is_not_writable_primary());
    }

    #[test]
    fn duplicate_key_detection() {
        let bulk = BulkWriteFailure {
            write_errors: Some(vec![BulkWriteError::from_document(&doc! {
                "index": 1,
                "code": 11000,
                "errmsg": "E11000 duplicate key error",
            })]),
            write_concern_error: None,
            partial_result: Default::default(),
        };
        let err: Error = ErrorKind::BulkWrite(bulk).into();
        assert!(err.is_duplicate_key());

        let converted = convert_bulk_errors(err);
        match *converted.kind {
            ErrorKind::Write(WriteFailure::WriteError(ref e)) => assert_eq!(e.code, 11000),
            ref other => panic!("expected write error, got {other:?}"),
        }
        assert!(converted.is_duplicate_key());
        assert!(!command_error(2).is_duplicate_key());
    }

    #[test]
    fn unknown_commit_result_label() {
        let err: Error = io::ErrorKind::ConnectionReset.into();
        assert!(err.should_add_unknown_transaction_commit_result_label());
        assert!(command_error(50).should_add_unknown_transaction_commit_result_label());
        assert!(!command_error(2).should_add_unknown_transaction_commit_result_label());

        let mut transient = command_error(50);
        transient.add_label(TRANSIENT_TRANSACTION_ERROR);
        assert!(!transient.should_add_unknown_transaction_commit_result_label());
    }
}
