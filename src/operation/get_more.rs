use crate::{
    bson::doc,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{parse_cursor_document, CursorInformation, OperationWithDefaults},
    options::SelectionCriteria,
    results::GetMoreResult,
};

/// The next batch of a cursor. Always runs on the server holding the cursor.
#[derive(Debug)]
pub(crate) struct GetMore {
    cursor: CursorInformation,
    pinned: SelectionCriteria,
}

impl GetMore {
    pub(crate) fn new(cursor: CursorInformation) -> Self {
        Self {
            pinned: SelectionCriteria::from_address(cursor.address.clone()),
            cursor,
        }
    }
}

impl OperationWithDefaults for GetMore {
    type O = GetMoreResult;

    const NAME: &'static str = "getMore";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let ns = &self.cursor.ns;
        let mut body = doc! {
            "getMore": self.cursor.id,
            "collection": ns.coll.as_str(),
        };
        // Zero leaves the batch size to the server.
        match self.cursor.batch_size.map(i32::try_from) {
            None | Some(Ok(0)) => {}
            Some(Ok(batch_size)) => {
                body.insert("batchSize", batch_size);
            }
            Some(Err(_)) => {
                return Err(Error::invalid_argument("batch size does not fit in an i32"));
            }
        }
        Ok(Command::new(Self::NAME, &ns.db, body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<GetMoreResult> {
        let cursor = response
            .body()
            .get_document("cursor")
            .map_err(|_| Error::invalid_response("getMore reply has no cursor document"))?;
        let (id, _, batch) = parse_cursor_document(cursor, "nextBatch")?;
        Ok(GetMoreResult {
            batch,
            exhausted: id == 0,
            id,
        })
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.pinned)
    }
}
