use std::time::Duration;

use crate::{
    bson::{doc, Bson, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{append_comment, append_max_time, OperationWithDefaults, Retryability},
    options::{DistinctOptions, SelectionCriteria},
    Namespace,
};

/// The distinct values of one field across the documents matching a filter.
#[derive(Debug)]
pub(crate) struct Distinct {
    ns: Namespace,
    key: String,
    filter: Document,
    options: DistinctOptions,
}

impl Distinct {
    pub(crate) fn new(
        ns: Namespace,
        key: String,
        filter: Document,
        options: Option<DistinctOptions>,
    ) -> Self {
        Self {
            ns,
            key,
            filter,
            options: options.unwrap_or_default(),
        }
    }
}

impl OperationWithDefaults for Distinct {
    type O = Vec<Bson>;

    const NAME: &'static str = "distinct";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            "distinct": self.ns.coll.as_str(),
            "key": self.key.as_str(),
            "query": self.filter.clone(),
        };
        if let Some(collation) = &self.options.collation {
            body.insert("collation", collation.to_document());
        }
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
    ) -> Result<Vec<Bson>> {
        let Some(Bson::Array(values)) = response.into_body().remove("values") else {
            return Err(Error::invalid_response("distinct reply has no values array"));
        };
        Ok(values)
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
