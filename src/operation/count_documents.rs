use std::time::Duration;

use crate::{
    bson::{doc, Document},
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{Aggregate, OperationWithDefaults, Retryability},
    options::{AggregateOptions, CountOptions, SelectionCriteria},
    Namespace,
};

/// Counts matching documents with an aggregation, which unlike the `count` command is accurate
/// on sharded clusters and inside transactions.
#[derive(Debug)]
pub(crate) struct CountDocuments {
    aggregate: Aggregate,
}

impl CountDocuments {
    pub(crate) fn new(
        ns: Namespace,
        filter: Document,
        options: Option<CountOptions>,
    ) -> Result<Self> {
        let mut pipeline = vec![doc! { "$match": filter }];

        if let Some(skip) = options.as_ref().and_then(|opts| opts.skip) {
            let skip = i64::try_from(skip).map_err(|_| {
                Error::invalid_argument("skip must fit into a signed 64-bit integer")
            })?;
            pipeline.push(doc! { "$skip": skip });
        }
        if let Some(limit) = options.as_ref().and_then(|opts| opts.limit) {
            let limit = i64::try_from(limit).map_err(|_| {
                Error::invalid_argument("limit must fit into a signed 64-bit integer")
            })?;
            pipeline.push(doc! { "$limit": limit });
        }
        pipeline.push(doc! {
            "$group": doc! {
                "_id": 1,
                "n": doc! { "$sum": 1 },
            }
        });

        let aggregate_options = options.map(|opts| AggregateOptions {
            hint: opts.hint,
            max_time: opts.max_time,
            collation: opts.collation,
            selection_criteria: opts.selection_criteria,
            read_concern: opts.read_concern,
            comment: opts.comment,
            ..Default::default()
        });

        Ok(Self {
            aggregate: Aggregate::new(ns, pipeline, aggregate_options),
        })
    }
}

impl OperationWithDefaults for CountDocuments {
    type O = u64;

    const NAME: &'static str = Aggregate::NAME;

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.aggregate.build(description)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        let mut cursor = self.aggregate.handle_response(response, description)?;

        // An empty collection produces no $group output at all.
        let Some(first) = cursor.initial_buffer.pop_front() else {
            return Ok(0);
        };
        first
            .get("n")
            .and_then(bson_util::get_u64)
            .ok_or_else(|| Error::invalid_response("count result is missing n"))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.aggregate.selection_criteria()
    }

    fn supports_read_concern(&self, description: &StreamDescription) -> bool {
        self.aggregate.supports_read_concern(description)
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }

    fn max_time(&self) -> Option<Duration> {
        self.aggregate.max_time()
    }
}
