use std::time::Duration;

use crate::{
    bson::{doc, Document},
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{
        append_bypass_document_validation,
        append_comment,
        append_max_time,
        append_write_concern,
        CursorSpecification,
        OperationWithDefaults,
        Retryability,
    },
    options::{AggregateOptions, Hint, SelectionCriteria, WriteConcern},
    Namespace,
};

/// An aggregation pipeline over a collection, returning a cursor over its output.
#[derive(Debug)]
pub(crate) struct Aggregate {
    ns: Namespace,
    pipeline: Vec<Document>,
    options: AggregateOptions,
}

impl Aggregate {
    pub(crate) fn new(
        ns: Namespace,
        pipeline: impl IntoIterator<Item = Document>,
        options: Option<AggregateOptions>,
    ) -> Self {
        Self {
            ns,
            pipeline: pipeline.into_iter().collect(),
            options: options.unwrap_or_default(),
        }
    }

    /// A final `$out` or `$merge` stage makes the pipeline a write.
    fn writes(&self) -> bool {
        let last_stage = self.pipeline.last().and_then(bson_util::first_key);
        matches!(last_stage, Some("$out" | "$merge"))
    }
}

impl OperationWithDefaults for Aggregate {
    type O = CursorSpecification;

    const NAME: &'static str = "aggregate";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let options = &self.options;
        let mut cursor = Document::new();
        // Writing pipelines return nothing in the first batch.
        if let (Some(batch_size), false) = (options.batch_size, self.writes()) {
            let batch_size = i32::try_from(batch_size)
                .map_err(|_| Error::invalid_argument("batch size does not fit in an i32"))?;
            cursor.insert("batchSize", batch_size);
        }

        let mut body = doc! {
            "aggregate": self.ns.coll.as_str(),
            "pipeline": bson_util::to_bson_array(&self.pipeline),
            "cursor": cursor,
        };
        if let Some(allow_disk_use) = options.allow_disk_use {
            body.insert("allowDiskUse", allow_disk_use);
        }
        if let Some(collation) = &options.collation {
            body.insert("collation", collation.to_document());
        }
        if let Some(hint) = options.hint.as_ref().map(Hint::to_bson) {
            body.insert("hint", hint);
        }
        append_bypass_document_validation(&mut body, options.bypass_document_validation);
        append_max_time(&mut body, options.max_time)?;
        append_comment(&mut body, options.comment.as_ref());

        let mut command = Command::new(Self::NAME, &self.ns.db, body);
        if let Some(read_concern) = &options.read_concern {
            command.set_read_concern(read_concern.clone().into());
        }
        append_write_concern(&mut command, self.write_concern())?;
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<CursorSpecification> {
        CursorSpecification::from_response(&response, self.options.batch_size)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options.selection_criteria.as_ref()
    }

    /// Only writing pipelines take a write concern.
    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .write_concern
            .as_ref()
            .filter(|_| self.writes())
    }

    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        if self.writes() {
            Retryability::None
        } else {
            Retryability::Read
        }
    }

    fn max_time(&self) -> Option<Duration> {
        self.options.max_time
    }
}
