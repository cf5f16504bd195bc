use std::time::Duration;

use crate::{
    bson::{doc, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{
        append_comment,
        append_max_time,
        CursorSpecification,
        OperationWithDefaults,
        Retryability,
    },
    options::{FindOptions, SelectionCriteria},
    Namespace,
};

#[derive(Debug)]
pub(crate) struct Find {
    ns: Namespace,
    filter: Document,
    options: Option<Box<FindOptions>>,
}

impl Find {
    pub(crate) fn new(ns: Namespace, filter: Document, options: Option<FindOptions>) -> Self {
        Self {
            ns,
            filter,
            options: options.map(Box::new),
        }
    }
}

impl OperationWithDefaults for Find {
    type O = CursorSpecification;

    const NAME: &'static str = "find";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            "find": self.ns.coll.clone(),
            "filter": self.filter.clone(),
        };

        let mut read_concern = None;
        if let Some(ref options) = self.options {
            // A negative limit asks for a single batch of at most |limit| documents.
            match options.limit {
                Some(limit) if limit < 0 => {
                    body.insert("limit", limit.saturating_neg());
                    body.insert("singleBatch", true);
                }
                Some(limit) if limit > 0 => {
                    body.insert("limit", limit);
                }
                _ => {}
            }

            if let Some(batch_size) = options.batch_size {
                let batch_size = i32::try_from(batch_size).map_err(|_| {
                    Error::invalid_argument("the batch size must fit into a signed 32-bit integer")
                })?;
                body.insert("batchSize", batch_size);
            }
            if let Some(ref projection) = options.projection {
                body.insert("projection", projection.clone());
            }
            if let Some(ref sort) = options.sort {
                body.insert("sort", sort.clone());
            }
            if let Some(skip) = options.skip {
                body.insert("skip", i64::try_from(skip).unwrap_or(i64::MAX));
            }
            if let Some(ref hint) = options.hint {
                body.insert("hint", hint.to_bson());
            }
            if let Some(ref collation) = options.collation {
                body.insert("collation", collation.to_document());
            }
            for (key, flag) in [
                ("allowDiskUse", options.allow_disk_use),
                ("allowPartialResults", options.allow_partial_results),
                ("noCursorTimeout", options.no_cursor_timeout),
            ] {
                if let Some(flag) = flag {
                    body.insert(key, flag);
                }
            }
            append_max_time(&mut body, options.max_time)?;
            append_comment(&mut body, options.comment.as_ref());
            read_concern = options.read_concern.clone();
        }

        let mut command = Command::new(Self::NAME, &self.ns.db, body);
        if let Some(read_concern) = read_concern {
            command.set_read_concern(read_concern.into());
        }
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let batch_size = self.options.as_ref().and_then(|o| o.batch_size);
        CursorSpecification::from_response(&response, batch_size)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|opts| opts.selection_criteria.as_ref())
    }

    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }

    fn max_time(&self) -> Option<Duration> {
        self.options.as_ref().and_then(|o| o.max_time)
    }
}
