use std::time::Duration;

use crate::{
    bson::{doc, Bson, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{
        append_bypass_document_validation,
        append_comment,
        append_max_time,
        append_write_concern,
        validate_write_concern_only,
        OperationWithDefaults,
        Retryability,
    },
    options::{
        Collation,
        FindOneAndDeleteOptions,
        FindOneAndReplaceOptions,
        FindOneAndUpdateOptions,
        Hint,
        ReturnDocument,
        UpdateModifications,
        WriteConcern,
    },
    Namespace,
};

/// What happens to the matched document.
#[derive(Clone, Debug)]
pub(crate) enum Modification {
    Delete,
    Update(UpdateModifications),
    Replace(Document),
}

/// The union of the three `find_one_and_*` option sets.
#[derive(Clone, Debug, Default)]
pub(crate) struct FindAndModifyOptions {
    sort: Option<Document>,
    return_document: Option<ReturnDocument>,
    projection: Option<Document>,
    upsert: Option<bool>,
    bypass_document_validation: Option<bool>,
    pub(crate) write_concern: Option<WriteConcern>,
    array_filters: Option<Vec<Document>>,
    max_time: Option<Duration>,
    collation: Option<Collation>,
    hint: Option<Hint>,
    comment: Option<Bson>,
}

impl From<FindOneAndDeleteOptions> for FindAndModifyOptions {
    fn from(options: FindOneAndDeleteOptions) -> Self {
        Self {
            max_time: options.max_time,
            projection: options.projection,
            sort: options.sort,
            write_concern: options.write_concern,
            collation: options.collation,
            hint: options.hint,
            comment: options.comment,
            ..Default::default()
        }
    }
}

impl From<FindOneAndReplaceOptions> for FindAndModifyOptions {
    fn from(options: FindOneAndReplaceOptions) -> Self {
        Self {
            bypass_document_validation: options.bypass_document_validation,
            max_time: options.max_time,
            projection: options.projection,
            return_document: options.return_document,
            sort: options.sort,
            upsert: options.upsert,
            write_concern: options.write_concern,
            collation: options.collation,
            hint: options.hint,
            comment: options.comment,
            array_filters: None,
        }
    }
}

impl From<FindOneAndUpdateOptions> for FindAndModifyOptions {
    fn from(options: FindOneAndUpdateOptions) -> Self {
        Self {
            array_filters: options.array_filters,
            bypass_document_validation: options.bypass_document_validation,
            max_time: options.max_time,
            projection: options.projection,
            return_document: options.return_document,
            sort: options.sort,
            upsert: options.upsert,
            write_concern: options.write_concern,
            collation: options.collation,
            hint: options.hint,
            comment: options.comment,
        }
    }
}

/// The `findAndModify` command behind the `find_one_and_*` methods. Returns the matched document
/// as it was before the change, or after it when `return_document` says so.
#[derive(Debug)]
pub(crate) struct FindAndModify {
    ns: Namespace,
    query: Document,
    modification: Modification,
    options: FindAndModifyOptions,
}

impl FindAndModify {
    pub(crate) fn new(
        ns: Namespace,
        query: Document,
        modification: Modification,
        options: Option<impl Into<FindAndModifyOptions>>,
    ) -> Self {
        Self {
            ns,
            query,
            modification,
            options: options.map(Into::into).unwrap_or_default(),
        }
    }
}

impl OperationWithDefaults for FindAndModify {
    type O = Option<Document>;

    const NAME: &'static str = "findAndModify";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            "findAndModify": self.ns.coll.as_str(),
            "query": self.query.clone(),
        };
        match &self.modification {
            Modification::Delete => body.insert("remove", true),
            Modification::Update(update) => body.insert("update", update.to_bson()),
            Modification::Replace(replacement) => body.insert("update", replacement.clone()),
        };

        let options = &self.options;
        let return_new = (options.return_document == Some(ReturnDocument::After)).then_some(true);
        let optional: [(&str, Option<Bson>); 7] = [
            ("new", return_new.map(Bson::from)),
            ("sort", options.sort.clone().map(Bson::from)),
            ("fields", options.projection.clone().map(Bson::from)),
            ("upsert", options.upsert.map(Bson::from)),
            ("arrayFilters", options.array_filters.clone().map(Bson::from)),
            ("collation", options.collation.as_ref().map(|c| Bson::from(c.to_document()))),
            ("hint", options.hint.as_ref().map(Hint::to_bson)),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                body.insert(key, value);
            }
        }
        append_bypass_document_validation(&mut body, options.bypass_document_validation);
        append_max_time(&mut body, options.max_time)?;
        append_comment(&mut body, options.comment.as_ref());

        let mut command = Command::new(Self::NAME, &self.ns.db, body);
        append_write_concern(&mut command, self.write_concern())?;
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        validate_write_concern_only(&response)?;
        match response.into_body().remove("value") {
            Some(Bson::Document(document)) => Ok(Some(document)),
            Some(Bson::Null) | None => Ok(None),
            Some(other) => Err(Error::invalid_response(format!(
                "findAndModify returned a value that is not a document: {other:?}"
            ))),
        }
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    fn max_time(&self) -> Option<Duration> {
        self.options.max_time
    }
}
