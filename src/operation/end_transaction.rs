//! `commitTransaction` and `abortTransaction`. Both run against `admin`, retry as writes, and
//! go to the mongos the transaction is pinned to, if any.

use std::time::Duration;

use crate::{
    bson::doc,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    operation::{
        append_max_time,
        append_write_concern,
        validate_write_concern_only,
        OperationWithDefaults,
        Retryability,
    },
    options::{Acknowledgment, TransactionOptions, WriteConcern},
    selection_criteria::SelectionCriteria,
};

/// Write concern timeout for retried commits that did not ask for one.
const RETRY_W_TIMEOUT: Duration = Duration::from_secs(10);

fn end_command(
    name: &'static str,
    max_time: Option<Duration>,
    write_concern: Option<&WriteConcern>,
) -> Result<Command> {
    let mut body = doc! { name: 1 };
    append_max_time(&mut body, max_time)?;
    let mut command = Command::new(name, "admin", body);
    append_write_concern(&mut command, write_concern)?;
    Ok(command)
}

pub(crate) struct CommitTransaction {
    options: TransactionOptions,
    pinned: Option<SelectionCriteria>,
}

impl CommitTransaction {
    pub(crate) fn new(
        options: Option<TransactionOptions>,
        pinned: Option<SelectionCriteria>,
    ) -> Self {
        Self {
            options: options.unwrap_or_default(),
            pinned,
        }
    }
}

impl OperationWithDefaults for CommitTransaction {
    type O = ();

    const NAME: &'static str = "commitTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        end_command(Self::NAME, self.max_time(), self.write_concern())
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<()> {
        validate_write_concern_only(&response)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.pinned.as_ref()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    /// A commit sent again, by the executor or by the application, must not be acknowledged by
    /// fewer nodes than the first attempt may have reached.
    fn update_for_retry(&mut self) {
        let write_concern = self.options.write_concern.get_or_insert_with(Default::default);
        write_concern.w = Some(Acknowledgment::Majority);
        write_concern.w_timeout.get_or_insert(RETRY_W_TIMEOUT);
    }

    fn max_time(&self) -> Option<Duration> {
        self.options.max_commit_time
    }
}

pub(crate) struct AbortTransaction {
    write_concern: Option<WriteConcern>,
    pinned: Option<SelectionCriteria>,
}

impl AbortTransaction {
    pub(crate) fn new(
        write_concern: Option<WriteConcern>,
        pinned: Option<SelectionCriteria>,
    ) -> Self {
        Self {
            write_concern,
            pinned,
        }
    }
}

impl OperationWithDefaults for AbortTransaction {
    type O = ();

    const NAME: &'static str = "abortTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        end_command(Self::NAME, None, self.write_concern())
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<()> {
        validate_write_concern_only(&response)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.pinned.as_ref()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}
