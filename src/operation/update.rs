use crate::{
    bson::{doc, Document},
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
    options::{BulkWriteOptions, Collation, Hint, UpdateModifications, WriteConcern},
    results::BulkWriteResult,
    Namespace,
};

/// One entry of an `update` command's `updates` array.
#[derive(Clone, Debug)]
pub(crate) struct UpdateStatement {
    pub(crate) filter: Document,
    pub(crate) update: UpdateModifications,
    pub(crate) multi: bool,
    pub(crate) upsert: Option<bool>,
    pub(crate) array_filters: Option<Vec<Document>>,
    pub(crate) collation: Option<Collation>,
    pub(crate) hint: Option<Hint>,
}

impl UpdateStatement {
    fn to_document(&self) -> Document {
        let mut doc = doc! {
            "q": self.filter.clone(),
            "u": self.update.to_bson(),
        };
        if self.multi {
            doc.insert("multi", true);
        }
        if let Some(upsert) = self.upsert {
            doc.insert("upsert", upsert);
        }
        if let Some(ref array_filters) = self.array_filters {
            doc.insert("arrayFilters", array_filters.clone());
        }
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
pub(crate) struct Update<'a> {
    ns: Namespace,
    statements: &'a [UpdateStatement],
    options: BulkWriteOptions,
    pub(crate) n_attempted: usize,
}

impl<'a> Update<'a> {
    pub(crate) fn new(
        ns: Namespace,
        statements: &'a [UpdateStatement],
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

impl OperationWithDefaults for Update<'_> {
    type O = BulkWriteResult;

    const NAME: &'static str = "update";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        let statements: Vec<Document> = self
            .statements
            .iter()
            .map(UpdateStatement::to_document)
            .collect();
        self.n_attempted = batch_split(&statements, description)?;

        let mut body = doc! {
            "update": self.ns.coll.clone(),
            "ordered": self.options.ordered.unwrap_or(true),
        };
        append_bypass_document_validation(&mut body, self.options.bypass_document_validation);
        append_comment(&mut body, self.options.comment.as_ref());

        let mut command = Command::new(Self::NAME, &self.ns.db, body);
        append_write_concern(&mut command, self.write_concern())?;
        command.add_document_sequence(
            "updates",
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

        let upserted_count = body.upserted.len() as u64;
        let result = BulkWriteResult {
            matched_count: body.n.saturating_sub(upserted_count),
            modified_count: body.n_modified,
            upserted_count,
            upserted_ids: body.upserted.iter().cloned().collect(),
            ..Default::default()
        };
        body.into_result(result)
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        if self.statements.iter().any(|s| s.multi) {
            Retryability::None
        } else {
            Retryability::Write
        }
    }
}
