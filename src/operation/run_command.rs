use crate::{
    bson::Document,
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    operation::OperationWithDefaults,
    selection_criteria::SelectionCriteria,
};

/// An arbitrary command document, sent as given. Its first key names it.
#[derive(Debug, Clone)]
pub(crate) struct RunCommand {
    db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
}

impl RunCommand {
    /// Fails on an empty document, which names no command.
    pub(crate) fn new(
        db: String,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Result<Self> {
        if bson_util::first_key(&command).is_none() {
            return Err(Error::invalid_argument("cannot run an empty command document"));
        }
        Ok(Self {
            db,
            command,
            selection_criteria,
        })
    }
}

impl OperationWithDefaults for RunCommand {
    type O = Document;

    /// Placeholder; [`name`](Self::name) reports the command's own name.
    const NAME: &'static str = "$genericRunCommand";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(self.name(), &self.db, self.command.clone()))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Document> {
        Ok(response.into_body())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    /// `endSessions` names its sessions in the body and must not carry an `lsid` of its own. A
    /// body that already has one is sent as is.
    fn supports_sessions(&self) -> bool {
        !self.name().eq_ignore_ascii_case("endSessions") && !self.command.contains_key("lsid")
    }

    fn name(&self) -> &str {
        bson_util::first_key(&self.command).unwrap_or_default()
    }
}
