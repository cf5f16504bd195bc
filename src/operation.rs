mod aggregate;
mod count;
mod count_documents;
mod delete;
mod distinct;
mod end_transaction;
mod find;
mod find_and_modify;
mod get_more;
mod insert;
pub(crate) mod run_command;
mod update;

#[cfg(test)]
mod test;

use std::{collections::VecDeque, time::Duration};

use crate::{
    bson::{Bson, Document},
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{
        BulkWriteError,
        BulkWriteFailure,
        Error,
        ErrorKind,
        Result,
        WriteConcernError,
        WriteFailure,
    },
    options::{ServerAddress, WriteConcern},
    results::BulkWriteResult,
    selection_criteria::SelectionCriteria,
    Namespace,
};

pub(crate) use aggregate::Aggregate;
pub(crate) use count::Count;
pub(crate) use count_documents::CountDocuments;
pub(crate) use delete::{Delete, DeleteStatement};
pub(crate) use distinct::Distinct;
pub(crate) use end_transaction::{AbortTransaction, CommitTransaction};
pub(crate) use find::Find;
pub(crate) use find_and_modify::{FindAndModify, FindAndModifyOptions, Modification};
pub(crate) use get_more::GetMore;
pub(crate) use insert::Insert;
pub(crate) use run_command::RunCommand;
pub(crate) use update::{Update, UpdateStatement};

/// Room left in a batched write for everything except the documents themselves.
const COMMAND_OVERHEAD_SIZE: usize = 16_000;

/// A command the executor can run: it builds the command for a connection, interprets the
/// reply, and tells the executor how to route and retry it.
///
/// Every method is required so that wrappers forward all of them. Operations implement
/// [`OperationWithDefaults`] instead.
pub(crate) trait Operation {
    type O;

    /// The command name, which is also the first key of the body.
    const NAME: &'static str;

    /// Called once per attempt, with the description of the connection it will be sent on.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Gets the error of a failed attempt. May turn it into an output.
    fn handle_error(&self, error: Error) -> Result<Self::O>;

    /// `None` lets the executor fall back to the session's pinned server or the primary.
    fn selection_criteria(&self) -> Option<&SelectionCriteria>;

    fn is_acknowledged(&self) -> bool;

    fn write_concern(&self) -> Option<&WriteConcern>;

    /// Whether the server accepts `readConcern` on this command.
    fn supports_read_concern(&self, description: &StreamDescription) -> bool;

    fn supports_sessions(&self) -> bool;

    fn retryability(&self) -> Retryability;

    /// Prepares the operation for its second attempt.
    fn update_for_retry(&mut self);

    /// Sent as `maxTimeMS`. Also stretches the client-side reply deadline.
    fn max_time(&self) -> Option<Duration>;

    fn name(&self) -> &str;
}

/// [`Operation`] with the common answers filled in: no selection criteria, no write concern, no
/// read concern, sessions supported and no retries.
pub(crate) trait OperationWithDefaults {
    type O;

    const NAME: &'static str;

    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    fn is_acknowledged(&self) -> bool {
        self.write_concern().is_none_or(WriteConcern::is_acknowledged)
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        None
    }

    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        false
    }

    fn supports_sessions(&self) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    fn update_for_retry(&mut self) {}

    fn max_time(&self) -> Option<Duration> {
        None
    }

    fn name(&self) -> &str {
        Self::NAME
    }
}

impl<T: OperationWithDefaults> Operation for T {
    type O = T::O;
    const NAME: &'static str = T::NAME;

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.build(description)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        self.handle_response(response, description)
    }

    fn handle_error(&self, error: Error) -> Result<Self::O> {
        self.handle_error(error)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria()
    }

    fn is_acknowledged(&self) -> bool {
        self.is_acknowledged()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern()
    }

    fn supports_read_concern(&self, description: &StreamDescription) -> bool {
        self.supports_read_concern(description)
    }

    fn supports_sessions(&self) -> bool {
        self.supports_sessions()
    }

    fn retryability(&self) -> Retryability {
        self.retryability()
    }

    fn update_for_retry(&mut self) {
        self.update_for_retry()
    }

    fn max_time(&self) -> Option<Duration> {
        self.max_time()
    }

    fn name(&self) -> &str {
        self.name()
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

impl Retryability {
    /// Returns this level of retryability in tandem with the client options.
    pub(crate) fn with_options(self, retry_reads: bool, retry_writes: bool) -> Self {
        match self {
            Self::Write if retry_writes => Self::Write,
            Self::Read if retry_reads => Self::Read,
            _ => Self::None,
        }
    }

    /// Whether this level of retryability can retry the given error.
    pub(crate) fn can_retry_error(&self, error: &Error) -> bool {
        match self {
            Self::Write => error.is_write_retryable(),
            Self::Read => error.is_read_retryable(),
            Self::None => false,
        }
    }
}

/// Adds `maxTimeMS` to a command body.
pub(crate) fn append_max_time(body: &mut Document, max_time: Option<Duration>) -> Result<()> {
    if let Some(max_time) = max_time {
        let millis = i64::try_from(max_time.as_millis())
            .map_err(|_| Error::invalid_argument("maxTime does not fit in an i64"))?;
        body.insert("maxTimeMS", millis);
    }
    Ok(())
}

/// Adds `bypassDocumentValidation: true` when requested. The flag is never sent as false.
pub(crate) fn append_bypass_document_validation(body: &mut Document, bypass: Option<bool>) {
    if bypass == Some(true) {
        body.insert("bypassDocumentValidation", true);
    }
}

pub(crate) fn append_comment(body: &mut Document, comment: Option<&Bson>) {
    if let Some(comment) = comment {
        body.insert("comment", comment.clone());
    }
}

/// Writes the write concern into the command unless it is empty.
pub(crate) fn append_write_concern(
    command: &mut Command,
    write_concern: Option<&WriteConcern>,
) -> Result<()> {
    if let Some(write_concern) = write_concern {
        command.set_write_concern(write_concern)?;
    }
    Ok(())
}

/// Counts how many of `statements` fit into one write command for the connected server, given
/// both the server's batch size limit and its message size limit.
pub(crate) fn batch_split(
    statements: &[Document],
    description: &StreamDescription,
) -> Result<usize> {
    let max_count = usize::try_from(description.max_write_batch_size).unwrap_or(usize::MAX);
    let max_doc_size = usize::try_from(description.max_bson_object_size).unwrap_or(usize::MAX);
    let max_payload = usize::try_from(description.max_message_size_bytes)
        .unwrap_or(usize::MAX)
        .saturating_sub(COMMAND_OVERHEAD_SIZE);

    let mut size = 0;
    let mut count = 0;
    for (i, statement) in statements.iter().enumerate().take(max_count) {
        let doc_size = bson_util::doc_size_bytes(statement)?;
        if doc_size > max_doc_size {
            return Err(ErrorKind::InvalidArgument {
                message: format!(
                    "document at index {i} is {doc_size} bytes, larger than the maximum of \
                     {max_doc_size}"
                ),
            }
            .into());
        }
        if count > 0 && size + doc_size > max_payload {
            break;
        }
        size += doc_size;
        count += 1;
    }

    if count == 0 {
        return Err(Error::invalid_argument("no statements provided to write command"));
    }
    Ok(count)
}

/// The parts of a write command reply shared by insert, update and delete.
#[derive(Debug, Default)]
pub(crate) struct WriteResponseBody {
    pub(crate) n: u64,
    pub(crate) n_modified: u64,
    pub(crate) upserted: Vec<(usize, Bson)>,
    write_errors: Option<Vec<BulkWriteError>>,
    write_concern_error: Option<WriteConcernError>,
    labels: Option<Vec<String>>,
}

impl WriteResponseBody {
    pub(crate) fn parse(response: &RawCommandResponse) -> Result<Self> {
        let body = response.body();
        let count = |key: &str| {
            body.get(key)
                .and_then(bson_util::get_u64)
                .unwrap_or_default()
        };

        let upserted = match body.get_array("upserted") {
            Ok(upserted) => upserted
                .iter()
                .filter_map(Bson::as_document)
                .map(|entry| {
                    let index = entry
                        .get("index")
                        .and_then(bson_util::get_u64)
                        .and_then(|i| usize::try_from(i).ok())
                        .ok_or_else(|| Error::invalid_response("upserted entry missing index"))?;
                    let id = entry.get("_id").cloned().unwrap_or(Bson::Null);
                    Ok((index, id))
                })
                .collect::<Result<Vec<_>>>()?,
            Err(_) => Vec::new(),
        };

        let write_errors = body.get_array("writeErrors").ok().map(|errors| {
            let mut errors: Vec<_> = errors
                .iter()
                .filter_map(Bson::as_document)
                .map(BulkWriteError::from_document)
                .collect();
            errors.sort_by_key(|e| e.index);
            errors
        });

        Ok(Self {
            n: count("n"),
            n_modified: count("nModified"),
            upserted,
            write_errors,
            write_concern_error: body
                .get_document("writeConcernError")
                .ok()
                .map(WriteConcernError::from_document),
            labels: response.error_labels(),
        })
    }

    pub(crate) fn first_error_index(&self) -> Option<usize> {
        self.write_errors
            .as_ref()
            .and_then(|errors| errors.first())
            .map(|e| e.index)
    }

    pub(crate) fn is_error_index(&self, index: usize) -> bool {
        self.write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|e| e.index == index))
    }

    /// Returns `result` as-is when the reply reports no errors, or a bulk write error carrying
    /// `result` as the partial result otherwise.
    pub(crate) fn into_result(self, result: BulkWriteResult) -> Result<BulkWriteResult> {
        if self.write_errors.is_none() && self.write_concern_error.is_none() {
            return Ok(result);
        }

        let failure = BulkWriteFailure {
            write_errors: self.write_errors,
            write_concern_error: self.write_concern_error,
            partial_result: result,
        };
        Err(Error::new(ErrorKind::BulkWrite(failure), self.labels))
    }
}

/// Body of a reply that can carry a write concern error but not write errors.
pub(crate) fn validate_write_concern_only(response: &RawCommandResponse) -> Result<()> {
    match response.body().get_document("writeConcernError") {
        Ok(wc_error) => {
            let wc_error = WriteConcernError::from_document(wc_error);
            Err(Error::new(
                ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)),
                response.error_labels(),
            ))
        }
        Err(_) => Ok(()),
    }
}

/// Where a server-side cursor lives, as needed to keep iterating or to kill it.
#[derive(Debug, Clone)]
pub(crate) struct CursorInformation {
    pub(crate) ns: Namespace,
    pub(crate) address: ServerAddress,
    pub(crate) id: i64,
    pub(crate) batch_size: Option<u32>,
}

/// The first batch of a cursor-returning command.
#[derive(Debug)]
pub(crate) struct CursorSpecification {
    pub(crate) info: CursorInformation,
    pub(crate) initial_buffer: VecDeque<Document>,
}

impl CursorSpecification {
    /// Reads the `cursor` document of a `find` or `aggregate` reply.
    pub(crate) fn from_response(
        response: &RawCommandResponse,
        batch_size: Option<u32>,
    ) -> Result<Self> {
        let cursor = response
            .body()
            .get_document("cursor")
            .map_err(|_| Error::invalid_response("reply is missing a cursor document"))?;
        let (id, ns, batch) = parse_cursor_document(cursor, "firstBatch")?;
        Ok(Self {
            info: CursorInformation {
                ns,
                address: response.source_address().clone(),
                id,
                batch_size,
            },
            initial_buffer: batch,
        })
    }
}

/// Extracts `(id, ns, batch)` from a reply's `cursor` document.
pub(crate) fn parse_cursor_document(
    cursor: &Document,
    batch_key: &str,
) -> Result<(i64, Namespace, VecDeque<Document>)> {
    let id = cursor
        .get("id")
        .and_then(bson_util::get_int)
        .ok_or_else(|| Error::invalid_response("cursor document is missing an id"))?;
    let ns = cursor
        .get_str("ns")
        .ok()
        .and_then(|ns| ns.parse::<Namespace>().ok())
        .ok_or_else(|| Error::invalid_response("cursor document has no valid namespace"))?;
    let batch = cursor
        .get_array(batch_key)
        .map_err(|_| Error::invalid_response(format!("cursor document is missing {batch_key}")))?
        .iter()
        .map(|doc| {
            doc.as_document()
                .cloned()
                .ok_or_else(|| Error::invalid_response("cursor batch entry is not a document"))
        })
        .collect::<Result<VecDeque<_>>>()?;
    Ok((id, ns, batch))
}
