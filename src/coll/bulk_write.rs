use std::collections::HashSet;

use crate::{
    bson::{oid::ObjectId, Document},
    bson_util,
    error::{BulkWriteError, BulkWriteFailure, Error, ErrorKind, Result, WriteConcernError},
    operation::{Delete, DeleteStatement, Insert, Update, UpdateStatement},
    options::{BulkWriteOptions, Collation, Hint, UpdateModifications},
    results::BulkWriteResult,
    ClientSession,
    Collection,
};

/// A single write in a [`Collection::bulk_write`] request.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum WriteModel {
    /// Inserts a document. An `_id` is generated if the document has none.
    InsertOne {
        /// The document to insert.
        document: Document,
    },

    /// Updates at most one document matching `filter`.
    UpdateOne {
        /// The filter selecting the document to update.
        filter: Document,
        /// The update operators or pipeline to apply.
        update: UpdateModifications,
        /// Whether to insert a document if nothing matches.
        upsert: Option<bool>,
        /// Filters choosing which array elements the update applies to.
        array_filters: Option<Vec<Document>>,
        /// The collation to use.
        collation: Option<Collation>,
        /// The index to use.
        hint: Option<Hint>,
    },

    /// Updates every document matching `filter`.
    UpdateMany {
        /// The filter selecting the documents to update.
        filter: Document,
        /// The update operators or pipeline to apply.
        update: UpdateModifications,
        /// Whether to insert a document if nothing matches.
        upsert: Option<bool>,
        /// Filters choosing which array elements the update applies to.
        array_filters: Option<Vec<Document>>,
        /// The collation to use.
        collation: Option<Collation>,
        /// The index to use.
        hint: Option<Hint>,
    },

    /// Replaces at most one document matching `filter`.
    ReplaceOne {
        /// The filter selecting the document to replace.
        filter: Document,
        /// The new document. It must not contain update operators.
        replacement: Document,
        /// Whether to insert the replacement if nothing matches.
        upsert: Option<bool>,
        /// The collation to use.
        collation: Option<Collation>,
        /// The index to use.
        hint: Option<Hint>,
    },

    /// Deletes at most one document matching `filter`.
    DeleteOne {
        /// The filter selecting the document to delete.
        filter: Document,
        /// The collation to use.
        collation: Option<Collation>,
        /// The index to use.
        hint: Option<Hint>,
    },

    /// Deletes every document matching `filter`.
    DeleteMany {
        /// The filter selecting the documents to delete.
        filter: Document,
        /// The collation to use.
        collation: Option<Collation>,
        /// The index to use.
        hint: Option<Hint>,
    },
}

impl WriteModel {
    /// Shorthand for an [`InsertOne`](WriteModel::InsertOne) model.
    pub fn insert_one(document: Document) -> Self {
        Self::InsertOne { document }
    }

    /// Shorthand for an [`UpdateOne`](WriteModel::UpdateOne) model without options.
    pub fn update_one(filter: Document, update: impl Into<UpdateModifications>) -> Self {
        Self::UpdateOne {
            filter,
            update: update.into(),
            upsert: None,
            array_filters: None,
            collation: None,
            hint: None,
        }
    }

    /// Shorthand for an [`UpdateMany`](WriteModel::UpdateMany) model without options.
    pub fn update_many(filter: Document, update: impl Into<UpdateModifications>) -> Self {
        Self::UpdateMany {
            filter,
            update: update.into(),
            upsert: None,
            array_filters: None,
            collation: None,
            hint: None,
        }
    }

    /// Shorthand for a [`ReplaceOne`](WriteModel::ReplaceOne) model without options.
    pub fn replace_one(filter: Document, replacement: Document) -> Self {
        Self::ReplaceOne {
            filter,
            replacement,
            upsert: None,
            collation: None,
            hint: None,
        }
    }

    /// Shorthand for a [`DeleteOne`](WriteModel::DeleteOne) model without options.
    pub fn delete_one(filter: Document) -> Self {
        Self::DeleteOne {
            filter,
            collation: None,
            hint: None,
        }
    }

    /// Shorthand for a [`DeleteMany`](WriteModel::DeleteMany) model without options.
    pub fn delete_many(filter: Document) -> Self {
        Self::DeleteMany {
            filter,
            collation: None,
            hint: None,
        }
    }

    fn kind(&self) -> WriteKind {
        match self {
            Self::InsertOne { .. } => WriteKind::Insert,
            Self::UpdateOne { .. } | Self::UpdateMany { .. } | Self::ReplaceOne { .. } => {
                WriteKind::Update
            }
            Self::DeleteOne { .. } | Self::DeleteMany { .. } => WriteKind::Delete,
        }
    }
}

/// The write command a model is sent with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug)]
enum Statements {
    Insert(Vec<Document>),
    Update(Vec<UpdateStatement>),
    Delete(Vec<DeleteStatement>),
}

impl Statements {
    fn new(kind: WriteKind) -> Self {
        match kind {
            WriteKind::Insert => Self::Insert(Vec::new()),
            WriteKind::Update => Self::Update(Vec::new()),
            WriteKind::Delete => Self::Delete(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Insert(docs) => docs.len(),
            Self::Update(statements) => statements.len(),
            Self::Delete(statements) => statements.len(),
        }
    }

    fn push(&mut self, model: WriteModel) -> Result<()> {
        match (self, model) {
            (Self::Insert(docs), WriteModel::InsertOne { mut document }) => {
                bson_util::storage_key_check(&document)?;
                if !document.contains_key("_id") {
                    document.insert_first("_id", ObjectId::new());
                }
                docs.push(document);
            }
            (
                Self::Update(statements),
                WriteModel::UpdateOne {
                    filter,
                    update,
                    upsert,
                    array_filters,
                    collation,
                    hint,
                },
            ) => {
                check_update(&update)?;
                statements.push(UpdateStatement {
                    filter,
                    update,
                    multi: false,
                    upsert,
                    array_filters,
                    collation,
                    hint,
                });
            }
            (
                Self::Update(statements),
                WriteModel::UpdateMany {
                    filter,
                    update,
                    upsert,
                    array_filters,
                    collation,
                    hint,
                },
            ) => {
                check_update(&update)?;
                statements.push(UpdateStatement {
                    filter,
                    update,
                    multi: true,
                    upsert,
                    array_filters,
                    collation,
                    hint,
                });
            }
            (
                Self::Update(statements),
                WriteModel::ReplaceOne {
                    filter,
                    replacement,
                    upsert,
                    collation,
                    hint,
                },
            ) => {
                bson_util::replacement_document_check(&replacement)?;
                statements.push(UpdateStatement {
                    filter,
                    update: UpdateModifications::Document(replacement),
                    multi: false,
                    upsert,
                    array_filters: None,
                    collation,
                    hint,
                });
            }
            (
                Self::Delete(statements),
                WriteModel::DeleteOne {
                    filter,
                    collation,
                    hint,
                },
            ) => statements.push(DeleteStatement {
                filter,
                single: true,
                collation,
                hint,
            }),
            (
                Self::Delete(statements),
                WriteModel::DeleteMany {
                    filter,
                    collation,
                    hint,
                },
            ) => statements.push(DeleteStatement {
                filter,
                single: false,
                collation,
                hint,
            }),
            _ => return Err(Error::internal("write model added to a batch of another kind")),
        }
        Ok(())
    }
}

pub(crate) fn check_update(update: &UpdateModifications) -> Result<()> {
    match update {
        UpdateModifications::Document(update) => bson_util::update_document_check(update),
        UpdateModifications::Pipeline(_) => Ok(()),
    }
}

/// Models sent with one write command (split further if the server's limits require it), along
/// with the index of each model in the original request.
#[derive(Debug)]
pub(crate) struct Batch {
    statements: Statements,
    indexes: Vec<usize>,
}

impl Batch {
    fn new(kind: WriteKind) -> Self {
        Self {
            statements: Statements::new(kind),
            indexes: Vec::new(),
        }
    }

    fn kind(&self) -> WriteKind {
        match self.statements {
            Statements::Insert(_) => WriteKind::Insert,
            Statements::Update(_) => WriteKind::Update,
            Statements::Delete(_) => WriteKind::Delete,
        }
    }

    fn push(&mut self, index: usize, model: WriteModel) -> Result<()> {
        self.statements.push(model)?;
        self.indexes.push(index);
        Ok(())
    }
}

/// Groups models into batches. Ordered requests keep their order, so only runs of consecutive
/// same-kind models share a batch. Unordered requests get one batch per kind, in order of each
/// kind's first appearance.
pub(crate) fn into_batches(
    models: impl IntoIterator<Item = WriteModel>,
    ordered: bool,
) -> Result<Vec<Batch>> {
    let mut batches: Vec<Batch> = Vec::new();
    for (index, model) in models.into_iter().enumerate() {
        let kind = model.kind();
        let position = if ordered {
            batches
                .last()
                .filter(|batch| batch.kind() == kind)
                .map(|_| batches.len() - 1)
        } else {
            batches.iter().position(|batch| batch.kind() == kind)
        };
        let batch = match position {
            Some(position) => &mut batches[position],
            None => {
                batches.push(Batch::new(kind));
                let last = batches.len() - 1;
                &mut batches[last]
            }
        };
        batch.push(index, model)?;
    }

    if batches.is_empty() {
        return Err(Error::invalid_argument("no write models provided"));
    }
    Ok(batches)
}

/// Errors collected across batches, with indexes already mapped to model positions.
#[derive(Debug, Default)]
struct Failures {
    write_errors: Vec<BulkWriteError>,
    write_concern_error: Option<WriteConcernError>,
    labels: HashSet<String>,
}

impl Failures {
    fn into_result(self, result: BulkWriteResult) -> Result<BulkWriteResult> {
        if self.write_errors.is_empty() && self.write_concern_error.is_none() {
            return Ok(result);
        }
        let mut write_errors = self.write_errors;
        write_errors.sort_by_key(|error| error.index);
        let failure = BulkWriteFailure {
            write_errors: (!write_errors.is_empty()).then_some(write_errors),
            write_concern_error: self.write_concern_error,
            partial_result: result,
        };
        Err(Error::new(ErrorKind::BulkWrite(failure), Some(self.labels)))
    }
}

impl Collection {
    /// Runs every batch, sending each in as many commands as the server's limits require.
    pub(crate) async fn execute_batches(
        &self,
        batches: Vec<Batch>,
        options: BulkWriteOptions,
        mut session: Option<&mut ClientSession>,
    ) -> Result<BulkWriteResult> {
        let ordered = options.ordered.unwrap_or(true);
        let mut result = BulkWriteResult::default();
        let mut failures = Failures::default();

        for batch in batches {
            let mut offset = 0;
            while offset < batch.statements.len() {
                let (outcome, n_attempted) = self
                    .execute_statements(
                        &batch.statements,
                        offset,
                        &options,
                        session.as_deref_mut(),
                    )
                    .await;
                let index_map = batch
                    .indexes
                    .get(offset..offset + n_attempted)
                    .unwrap_or_default();

                match outcome {
                    Ok(batch_result) => result.merge(batch_result, index_map),
                    Err(error) => {
                        let labels = error.labels().clone();
                        let ErrorKind::BulkWrite(failure) = *error.kind else {
                            return Err(error);
                        };
                        result.merge(failure.partial_result, index_map);
                        let had_write_errors = failure.write_errors.is_some();
                        for write_error in failure.write_errors.into_iter().flatten() {
                            let index = index_map
                                .get(write_error.index)
                                .copied()
                                .unwrap_or(write_error.index);
                            failures.write_errors.push(BulkWriteError {
                                index,
                                ..write_error
                            });
                        }
                        if let Some(wc_error) = failure.write_concern_error {
                            failures.write_concern_error = Some(wc_error);
                        }
                        failures.labels.extend(labels);

                        if ordered && had_write_errors {
                            return failures.into_result(result);
                        }
                    }
                }
                offset += n_attempted.max(1);
            }
        }

        failures.into_result(result)
    }

    /// Sends the statements of a batch starting at `offset` in one command. Returns the outcome
    /// and how many statements the command carried.
    async fn execute_statements(
        &self,
        statements: &Statements,
        offset: usize,
        options: &BulkWriteOptions,
        session: Option<&mut ClientSession>,
    ) -> (Result<BulkWriteResult>, usize) {
        let client = self.client();
        match statements {
            Statements::Insert(docs) => {
                let mut op = Insert::new(self.namespace(), &docs[offset..], options.clone());
                let outcome = client.execute_operation_by_ref(&mut op, session).await;
                (outcome, op.n_attempted)
            }
            Statements::Update(updates) => {
                let mut op = Update::new(self.namespace(), &updates[offset..], options.clone());
                let outcome = client.execute_operation_by_ref(&mut op, session).await;
                (outcome, op.n_attempted)
            }
            Statements::Delete(deletes) => {
                let mut op = Delete::new(self.namespace(), &deletes[offset..], options.clone());
                let outcome = client.execute_operation_by_ref(&mut op, session).await;
                (outcome, op.n_attempted)
            }
        }
    }
}
