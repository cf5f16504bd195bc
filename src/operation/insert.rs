use crate::{
    bson::{doc, Bson, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    operation::{
        append_bypass_document_validation,
        append_comment,
        append_write_concern,
        batch_split,
        OperationWithDefaults,
        Retryability,
        WriteResponseBody,
    },
    options::{BulkWriteOptions, WriteConcern},
    results::BulkWriteResult,
    Namespace,
};

/// Inserts as many of `documents` as fit into one command. Each document must already carry an
/// `_id`; `n_attempted` reports how many were sent so the caller can issue the rest.
#[derive(Debug)]
pub(crate) struct Insert<'a> {
    ns: Namespace,
    documents: &'a [Document],
    options: BulkWriteOptions,
    pub(crate) n_attempted: usize,
}

impl<'a> Insert<'a> {
    pub(crate) fn new(ns: Namespace, documents: &'a [Document], options: BulkWriteOptions) -> Self {
        Self {
            ns,
            documents,
            options,
            n_attempted: 0,
        }
    }

    fn ordered(&self) -> bool {
        self.options.ordered.unwrap_or(true)
    }
}

impl OperationWithDefaults for Insert<'_> {
    type O = BulkWriteResult;

    const NAME: &'static str = "insert";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.n_attempted = batch_split(self.documents, description)?;

        let mut body = doc! {
            "insert": self.ns.coll.clone(),
            "ordered": self.ordered(),
        };
        append_bypass_document_validation(&mut body, self.options.bypass_document_validation);
        append_comment(&mut body, self.options.comment.as_ref());

        let mut command = Command::new(Self::NAME, &self.ns.db, body);
        append_write_concern(&mut command, self.write_concern())?;
        command.add_document_sequence(
            "documents",
            self.documents[..self.n_attempted].to_vec(),
        );
        command.more_to_come = !self.is_acknowledged();
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body = WriteResponseBody::parse(&response)?;

        // An ordered insert stops at its first error, so nothing after it was applied.
        let applied = match body.first_error_index() {
            Some(index) if self.ordered() => index,
            _ => self.n_attempted,
        };
        let inserted_ids = self.documents[..applied.min(self.n_attempted)]
            .iter()
            .enumerate()
            .filter(|(i, _)| !body.is_error_index(*i))
            .map(|(i, doc)| (i, doc.get("_id").cloned().unwrap_or(Bson::Null)))
            .collect();

        let result = BulkWriteResult {
            inserted_count: body.n,
            inserted_ids,
            ..Default::default()
        };
        body.into_result(result)
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}
