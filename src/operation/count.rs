use std::time::Duration;

use crate::{
    bson::doc,
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{append_comment, append_max_time, OperationWithDefaults, Retryability},
    options::{EstimatedDocumentCountOptions, SelectionCriteria},
    Namespace,
};

/// `count` without a filter. The server answers from collection metadata, so the result can be
/// off after an unclean shutdown or inside a sharded cluster with orphaned documents.
#[derive(Debug)]
pub(crate) struct Count {
    ns: Namespace,
    options: EstimatedDocumentCountOptions,
}

impl Count {
    pub(crate) fn new(ns: Namespace, options: Option<EstimatedDocumentCountOptions>) -> Self {
        Self {
            ns,
            options: options.unwrap_or_default(),
        }
    }
}

impl OperationWithDefaults for Count {
    type O = u64;

    const NAME: &'static str = "count";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! { "count": self.ns.coll.as_str() };
        append_max_time(&mut body, self.options.max_time)?;
        append_comment(&mut body, self.options.comment.as_ref());

        let mut command = Command::new(Self::NAME, &self.ns.db, body);
        if let Some(read_concern) = &self.options.read_concern {
            command.set_read_concern(read_concern.clone().into());
        }
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<u64> {
        let n = response.body().get("n").and_then(bson_util::get_u64);
        n.ok_or_else(|| Error::invalid_response("count reply has no numeric n"))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options.selection_criteria.as_ref()
    }

    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }

    fn max_time(&self) -> Option<Duration> {
        self.options.max_time
    }
}
