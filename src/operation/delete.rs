use crate::{
    bson::{doc, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    operation::{
        append_comment,
        append_write_concern,
        batch_split,
        OperationWithDefaults,
        Retryability,
        WriteResponseBody,
    },
    options::{BulkWriteOptions, Collation, Hint, WriteConcern},
    results::BulkWriteResult,
    Namespace,
};

/// One entry of a `delete` command's `deletes` array.
#[derive(Clone, Debug)]
pub(crate) struct DeleteStatement {
    pub(crate) filter: Document,
    /// Deletes every match when false, at most one document when true.
    pub(crate) single: bool,
    pub(crate) collation: Option<Collation>,
    pub(crate) hint: Option<Hint>,
}

impl DeleteStatement {
    fn to_document(&self) -> Document {
        let mut doc = doc! {
            "q": self.filter.clone(),
            "limit": if self.single { 1 } else { 0 },
        };
        if let Some(ref collation) = self.collation {
            doc.insert("collation", collation.to_document());
        }
        if let Some(ref hint) = self.hint {
            doc.insert("hint", hint.to_bson());
        }
        doc
    }
}

#[derive(Debug)]
pub(crate) struct Delete<'a> {
    ns: Namespace,
    statements: &'a [DeleteStatement],
    options: BulkWriteOptions,
    pub(crate) n_attempted: usize,
}

impl<'a> Delete<'a> {
    pub(crate) fn new(
        ns: Namespace,
        statements: &'a [DeleteStatement],
        options: BulkWriteOptions,
    ) -> Self {
        Self {
            ns,
            statements,
            options,
            n_attempted: 0,
        }
    }
}

impl OperationWithDefaults for Delete<'_> {
    type O = BulkWriteResult;

    const NAME: &'static str = "delete";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        let statements: Vec<Document> = self
            .statements
            .iter()
            .map(DeleteStatement::to_document)
            .collect();
        self.n_attempted = batch_split(&statements, description)?;

        let mut body = doc! {
            "delete": self.ns.coll.clone(),
            "ordered": self.options.ordered.unwrap_or(true),
        };
        append_comment(&mut body, self.options.comment.as_ref());

        let mut command = Command::new(Self::NAME, &self.ns.db, body);
        append_write_concern(&mut command, self.write_concern())?;
        command.add_document_sequence(
            "deletes",
            statements.into_iter().take(self.n_attempted).collect(),
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
        let result = BulkWriteResult {
            deleted_count: body.n,
            ..Default::default()
        };
        body.into_result(result)
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        if self.statements.iter().any(|s| !s.single) {
            Retryability::None
        } else {
            Retryability::Write
        }
    }
}
