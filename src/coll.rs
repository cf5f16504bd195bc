mod bulk_write;
pub mod options;

use std::{fmt, str::FromStr, sync::Arc};

use futures_util::StreamExt;

pub use self::bulk_write::WriteModel;
use self::{bulk_write::into_batches, options::*};
use crate::{
    bson::{Bson, Document},
    bson_util,
    concern::{ReadConcern, WriteConcern},
    error::{convert_bulk_errors, Error, Result},
    operation::{
        Aggregate,
        Count,
        CountDocuments,
        Delete,
        DeleteStatement,
        Distinct,
        Find,
        FindAndModify,
        FindAndModifyOptions,
        Modification,
        Update,
        UpdateStatement,
    },
    results::{
        BulkWriteResult,
        DeleteResult,
        InsertManyResult,
        InsertOneResult,
        UpdateResult,
    },
    selection_criteria::SelectionCriteria,
    Client,
    ClientSession,
    Cursor,
    Database,
    SessionCursor,
};

/// A handle to one collection, used for CRUD and aggregation.
///
/// Get one from [`Database::collection`]. Handles are reference counted, so cloning one is cheap
/// and clones can be moved into other tasks. Each operation also has a `_with_session` form that
/// runs it in a [`ClientSession`], which is how operations join a transaction.
///
/// ```rust,no_run
/// # use mongodb_core::{bson::doc, error::Result, Client};
/// # async fn run() -> Result<()> {
/// let client = Client::with_uri_str("mongodb://localhost:27017").await?;
/// let orders = client.database("shop").collection("orders");
///
/// orders.insert_one(doc! { "sku": "A-1", "qty": 2 }, None).await?;
/// let pending = orders
///     .count_documents(doc! { "status": "pending" }, None)
///     .await?;
/// # let _ = pending;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

#[derive(Debug)]
struct CollectionInner {
    db: Database,
    name: String,
    selection_criteria: Option<SelectionCriteria>,
    read_concern: Option<ReadConcern>,
    write_concern: Option<WriteConcern>,
}

impl Collection {
    pub(crate) fn new(db: Database, name: &str, options: Option<CollectionOptions>) -> Self {
        let CollectionOptions {
            selection_criteria,
            read_concern,
            write_concern,
        } = options.unwrap_or_default();
        let inner = CollectionInner {
            selection_criteria: selection_criteria.or_else(|| db.selection_criteria().cloned()),
            read_concern: read_concern.or_else(|| db.read_concern().cloned()),
            write_concern: write_concern.or_else(|| db.write_concern().cloned()),
            name: name.to_owned(),
            db,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The client this collection belongs to.
    pub fn client(&self) -> &Client {
        self.inner.db.client()
    }

    /// The collection's name, without the database.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The database and collection name, e.g. `shop.orders`.
    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.inner.db.name(), self.name())
    }

    /// Where reads go unless an operation says otherwise.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.selection_criteria.as_ref()
    }

    /// The read concern attached to reads unless an operation says otherwise.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.read_concern.as_ref()
    }

    /// The write concern attached to writes unless an operation says otherwise.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.write_concern.as_ref()
    }

    async fn run_bulk_write(
        &self,
        models: impl IntoIterator<Item = WriteModel>,
        mut options: Option<BulkWriteOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<BulkWriteResult> {
        resolve_write_concern_with_session!(self, options, session.as_ref())?;
        let options = options.unwrap_or_default();
        let batches = into_batches(models, options.ordered.unwrap_or(true))?;
        self.execute_batches(batches, options, session).await
    }

    /// Runs a mixed list of writes, packed into as few `insert`, `update` and `delete` commands
    /// as their order allows.
    ///
    /// Ordered writes (the default) stop at the first rejected model; unordered ones try every
    /// model. A failure comes back as [`ErrorKind::BulkWrite`](crate::error::ErrorKind::BulkWrite),
    /// whose partial result and error indexes refer to positions in `models`.
    pub async fn bulk_write(
        &self,
        models: impl IntoIterator<Item = WriteModel>,
        options: impl Into<Option<BulkWriteOptions>>,
    ) -> Result<BulkWriteResult> {
        self.run_bulk_write(models, options.into(), None).await
    }

    /// [`Collection::bulk_write`] within `session`.
    pub async fn bulk_write_with_session(
        &self,
        models: impl IntoIterator<Item = WriteModel>,
        options: impl Into<Option<BulkWriteOptions>>,
        session: &mut ClientSession,
    ) -> Result<BulkWriteResult> {
        self.run_bulk_write(models, options.into(), Some(session))
            .await
    }

    async fn run_insert_many(
        &self,
        docs: impl IntoIterator<Item = Document>,
        options: Option<InsertManyOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<InsertManyResult> {
        let models = docs.into_iter().map(WriteModel::insert_one);
        let result = self
            .run_bulk_write(models, options.map(Into::into), session)
            .await?;
        Ok(InsertManyResult::from_bulk_result(result))
    }

    /// Inserts `docs`, generating an `ObjectId` `_id` for any document without one. Retried
    /// once after a retryable error when retryable writes are on.
    pub async fn insert_many(
        &self,
        docs: impl IntoIterator<Item = Document>,
        options: impl Into<Option<InsertManyOptions>>,
    ) -> Result<InsertManyResult> {
        self.run_insert_many(docs, options.into(), None).await
    }

    /// [`Collection::insert_many`] within `session`.
    pub async fn insert_many_with_session(
        &self,
        docs: impl IntoIterator<Item = Document>,
        options: impl Into<Option<InsertManyOptions>>,
        session: &mut ClientSession,
    ) -> Result<InsertManyResult> {
        self.run_insert_many(docs, options.into(), Some(session))
            .await
    }

    async fn run_insert_one(
        &self,
        doc: Document,
        options: Option<InsertOneOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<InsertOneResult> {
        let model = WriteModel::insert_one(doc);
        match self
            .run_bulk_write([model], options.map(Into::into), session)
            .await
        {
            Ok(result) => Ok(InsertOneResult::from_bulk_result(result)),
            Err(error) => Err(convert_bulk_errors(error)),
        }
    }

    /// Inserts `doc`. The `_id` it was stored under, generated if missing, is in the result.
    /// Retried once after a retryable error when retryable writes are on.
    pub async fn insert_one(
        &self,
        doc: Document,
        options: impl Into<Option<InsertOneOptions>>,
    ) -> Result<InsertOneResult> {
        self.run_insert_one(doc, options.into(), None).await
    }

    /// [`Collection::insert_one`] within `session`.
    pub async fn insert_one_with_session(
        &self,
        doc: Document,
        options: impl Into<Option<InsertOneOptions>>,
        session: &mut ClientSession,
    ) -> Result<InsertOneResult> {
        self.run_insert_one(doc, options.into(), Some(session))
            .await
    }

    async fn run_update(
        &self,
        filter: Document,
        update: UpdateModifications,
        multi: bool,
        mut options: Option<UpdateOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<UpdateResult> {
        resolve_write_concern_with_session!(self, options, session.as_ref())?;
        let UpdateOptions {
            array_filters,
            bypass_document_validation,
            upsert,
            collation,
            hint,
            write_concern,
            comment,
        } = options.unwrap_or_default();

        let statements = [UpdateStatement {
            filter,
            update,
            multi,
            upsert,
            array_filters,
            collation,
            hint,
        }];
        let write_options = BulkWriteOptions {
            bypass_document_validation,
            write_concern,
            comment,
            ..Default::default()
        };
        let op = Update::new(self.namespace(), &statements, write_options);
        match self.client().execute_operation(op, session).await {
            Ok(result) => Ok(UpdateResult::from_bulk_result(result)),
            Err(error) => Err(convert_bulk_errors(error)),
        }
    }

    /// Applies `update` (operators or a pipeline) to the first document matching `filter`.
    /// Retried once after a retryable error when retryable writes are on.
    pub async fn update_one(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        let update = update.into();
        bulk_write::check_update(&update)?;
        self.run_update(filter, update, false, options.into(), None)
            .await
    }

    /// [`Collection::update_one`] within `session`.
    pub async fn update_one_with_session(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
        options: impl Into<Option<UpdateOptions>>,
        session: &mut ClientSession,
    ) -> Result<UpdateResult> {
        let update = update.into();
        bulk_write::check_update(&update)?;
        self.run_update(filter, update, false, options.into(), Some(session))
            .await
    }

    /// Applies `update` to every document matching `filter`. Never retried.
    pub async fn update_many(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        let update = update.into();
        bulk_write::check_update(&update)?;
        self.run_update(filter, update, true, options.into(), None)
            .await
    }

    /// [`Collection::update_many`] within `session`.
    pub async fn update_many_with_session(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
        options: impl Into<Option<UpdateOptions>>,
        session: &mut ClientSession,
    ) -> Result<UpdateResult> {
        let update = update.into();
        bulk_write::check_update(&update)?;
        self.run_update(filter, update, true, options.into(), Some(session))
            .await
    }

    /// Swaps the first document matching `filter` for `replacement`, which must not contain
    /// update operators. Retried once after a retryable error when retryable writes are on.
    pub async fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        options: impl Into<Option<ReplaceOptions>>,
    ) -> Result<UpdateResult> {
        bson_util::replacement_document_check(&replacement)?;
        let options = options.into().map(UpdateOptions::from);
        self.run_update(filter, replacement.into(), false, options, None)
            .await
    }

    /// [`Collection::replace_one`] within `session`.
    pub async fn replace_one_with_session(
        &self,
        filter: Document,
        replacement: Document,
        options: impl Into<Option<ReplaceOptions>>,
        session: &mut ClientSession,
    ) -> Result<UpdateResult> {
        bson_util::replacement_document_check(&replacement)?;
        let options = options.into().map(UpdateOptions::from);
        self.run_update(filter, replacement.into(), false, options, Some(session))
            .await
    }

    async fn run_delete(
        &self,
        filter: Document,
        single: bool,
        mut options: Option<DeleteOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<DeleteResult> {
        resolve_write_concern_with_session!(self, options, session.as_ref())?;
        let DeleteOptions {
            collation,
            hint,
            write_concern,
            comment,
        } = options.unwrap_or_default();

        let statements = [DeleteStatement {
            filter,
            single,
            collation,
            hint,
        }];
        let write_options = BulkWriteOptions {
            write_concern,
            comment,
            ..Default::default()
        };
        let op = Delete::new(self.namespace(), &statements, write_options);
        match self.client().execute_operation(op, session).await {
            Ok(result) => Ok(DeleteResult {
                deleted_count: result.deleted_count,
            }),
            Err(error) => Err(convert_bulk_errors(error)),
        }
    }

    /// Removes the first document matching `filter`. Retried once after a retryable error when
    /// retryable writes are on.
    pub async fn delete_one(
        &self,
        filter: Document,
        options: impl Into<Option<DeleteOptions>>,
    ) -> Result<DeleteResult> {
        self.run_delete(filter, true, options.into(), None).await
    }

    /// [`Collection::delete_one`] within `session`.
    pub async fn delete_one_with_session(
        &self,
        filter: Document,
        options: impl Into<Option<DeleteOptions>>,
        session: &mut ClientSession,
    ) -> Result<DeleteResult> {
        self.run_delete(filter, true, options.into(), Some(session))
            .await
    }

    /// Removes every document matching `filter`. Never retried.
    pub async fn delete_many(
        &self,
        filter: Document,
        options: impl Into<Option<DeleteOptions>>,
    ) -> Result<DeleteResult> {
        self.run_delete(filter, false, options.into(), None).await
    }

    /// [`Collection::delete_many`] within `session`.
    pub async fn delete_many_with_session(
        &self,
        filter: Document,
        options: impl Into<Option<DeleteOptions>>,
        session: &mut ClientSession,
    ) -> Result<DeleteResult> {
        self.run_delete(filter, false, options.into(), Some(session))
            .await
    }

    async fn run_find_and_modify(
        &self,
        filter: Document,
        modification: Modification,
        options: Option<impl Into<FindAndModifyOptions>>,
        session: Option<&mut ClientSession>,
    ) -> Result<Option<Document>> {
        let mut options: Option<FindAndModifyOptions> = options.map(Into::into);
        resolve_write_concern_with_session!(self, options, session.as_ref())?;
        let op = FindAndModify::new(self.namespace(), filter, modification, options);
        self.client().execute_operation(op, session).await
    }

    /// Removes the first document matching `filter` and returns it. Retried once after a
    /// retryable error when retryable writes are on.
    pub async fn find_one_and_delete(
        &self,
        filter: Document,
        options: impl Into<Option<FindOneAndDeleteOptions>>,
    ) -> Result<Option<Document>> {
        self.run_find_and_modify(filter, Modification::Delete, options.into(), None)
            .await
    }

    /// [`Collection::find_one_and_delete`] within `session`.
    pub async fn find_one_and_delete_with_session(
        &self,
        filter: Document,
        options: impl Into<Option<FindOneAndDeleteOptions>>,
        session: &mut ClientSession,
    ) -> Result<Option<Document>> {
        self.run_find_and_modify(filter, Modification::Delete, options.into(), Some(session))
            .await
    }

    /// Swaps the first document matching `filter` for `replacement`, returning the document as
    /// it was before unless the options ask for the result.
    pub async fn find_one_and_replace(
        &self,
        filter: Document,
        replacement: Document,
        options: impl Into<Option<FindOneAndReplaceOptions>>,
    ) -> Result<Option<Document>> {
        bson_util::replacement_document_check(&replacement)?;
        let modification = Modification::Replace(replacement);
        self.run_find_and_modify(filter, modification, options.into(), None)
            .await
    }

    /// [`Collection::find_one_and_replace`] within `session`.
    pub async fn find_one_and_replace_with_session(
        &self,
        filter: Document,
        replacement: Document,
        options: impl Into<Option<FindOneAndReplaceOptions>>,
        session: &mut ClientSession,
    ) -> Result<Option<Document>> {
        bson_util::replacement_document_check(&replacement)?;
        let modification = Modification::Replace(replacement);
        self.run_find_and_modify(filter, modification, options.into(), Some(session))
            .await
    }

    /// Applies `update` to the first document matching `filter`, returning the document as it
    /// was before unless the options ask for the result.
    pub async fn find_one_and_update(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
        options: impl Into<Option<FindOneAndUpdateOptions>>,
    ) -> Result<Option<Document>> {
        let update = update.into();
        bulk_write::check_update(&update)?;
        self.run_find_and_modify(filter, Modification::Update(update), options.into(), None)
            .await
    }

    /// [`Collection::find_one_and_update`] within `session`.
    pub async fn find_one_and_update_with_session(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
        options: impl Into<Option<FindOneAndUpdateOptions>>,
        session: &mut ClientSession,
    ) -> Result<Option<Document>> {
        let update = update.into();
        bulk_write::check_update(&update)?;
        let modification = Modification::Update(update);
        self.run_find_and_modify(filter, modification, options.into(), Some(session))
            .await
    }

    fn inherit_aggregate_options(
        &self,
        mut options: Option<AggregateOptions>,
        session: Option<&ClientSession>,
    ) -> Result<Option<AggregateOptions>> {
        resolve_read_concern_with_session!(self, options, session)?;
        resolve_write_concern_with_session!(self, options, session)?;
        resolve_selection_criteria_with_session!(self, options, session);
        Ok(options)
    }

    /// Runs `pipeline` over the collection. A `$out` or `$merge` stage turns it into a write,
    /// which is sent to the primary.
    pub async fn aggregate(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<AggregateOptions>>,
    ) -> Result<Cursor> {
        let options = self.inherit_aggregate_options(options.into(), None)?;
        let op = Aggregate::new(self.namespace(), pipeline, options);
        self.client().execute_cursor_operation(op).await
    }

    /// [`Collection::aggregate`] within `session`.
    pub async fn aggregate_with_session(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<AggregateOptions>>,
        session: &mut ClientSession,
    ) -> Result<SessionCursor> {
        let options = self.inherit_aggregate_options(options.into(), Some(&*session))?;
        let op = Aggregate::new(self.namespace(), pipeline, options);
        self.client()
            .execute_session_cursor_operation(op, session)
            .await
    }

    async fn run_distinct(
        &self,
        field_name: &str,
        filter: Document,
        mut options: Option<DistinctOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<Vec<Bson>> {
        resolve_read_concern_with_session!(self, options, session.as_ref())?;
        resolve_selection_criteria_with_session!(self, options, session.as_ref());
        let op = Distinct::new(self.namespace(), field_name.to_owned(), filter, options);
        self.client().execute_operation(op, session).await
    }

    /// The distinct values of `field_name` among documents matching `filter`.
    pub async fn distinct(
        &self,
        field_name: impl AsRef<str>,
        filter: Document,
        options: impl Into<Option<DistinctOptions>>,
    ) -> Result<Vec<Bson>> {
        self.run_distinct(field_name.as_ref(), filter, options.into(), None)
            .await
    }

    /// [`Collection::distinct`] within `session`.
    pub async fn distinct_with_session(
        &self,
        field_name: impl AsRef<str>,
        filter: Document,
        options: impl Into<Option<DistinctOptions>>,
        session: &mut ClientSession,
    ) -> Result<Vec<Bson>> {
        self.run_distinct(field_name.as_ref(), filter, options.into(), Some(session))
            .await
    }

    async fn run_count_documents(
        &self,
        filter: Document,
        mut options: Option<CountOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<u64> {
        resolve_read_concern_with_session!(self, options, session.as_ref())?;
        resolve_selection_criteria_with_session!(self, options, session.as_ref());
        let op = CountDocuments::new(self.namespace(), filter, options)?;
        self.client().execute_operation(op, session).await
    }

    /// The exact number of documents matching `filter`, counted by an aggregation.
    pub async fn count_documents(
        &self,
        filter: Document,
        options: impl Into<Option<CountOptions>>,
    ) -> Result<u64> {
        self.run_count_documents(filter, options.into(), None).await
    }

    /// [`Collection::count_documents`] within `session`.
    pub async fn count_documents_with_session(
        &self,
        filter: Document,
        options: impl Into<Option<CountOptions>>,
        session: &mut ClientSession,
    ) -> Result<u64> {
        self.run_count_documents(filter, options.into(), Some(session))
            .await
    }

    /// The collection's document count as recorded in its metadata. Fast, but may be off after
    /// an unclean shutdown or while orphaned documents exist on a sharded cluster.
    pub async fn estimated_document_count(
        &self,
        options: impl Into<Option<EstimatedDocumentCountOptions>>,
    ) -> Result<u64> {
        let mut options = options.into();
        resolve_options!(self, options, [read_concern, selection_criteria]);
        let op = Count::new(self.namespace(), options);
        self.client().execute_operation(op, None).await
    }

    fn inherit_find_options(
        &self,
        mut options: Option<FindOptions>,
        session: Option<&ClientSession>,
    ) -> Result<Option<FindOptions>> {
        resolve_read_concern_with_session!(self, options, session)?;
        resolve_selection_criteria_with_session!(self, options, session);
        Ok(options)
    }

    /// A cursor over the documents matching `filter`.
    pub async fn find(
        &self,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Cursor> {
        let options = self.inherit_find_options(options.into(), None)?;
        let op = Find::new(self.namespace(), filter, options);
        self.client().execute_cursor_operation(op).await
    }

    /// [`Collection::find`] within `session`. The cursor has to be advanced with the same
    /// session.
    pub async fn find_with_session(
        &self,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
        session: &mut ClientSession,
    ) -> Result<SessionCursor> {
        let options = self.inherit_find_options(options.into(), Some(&*session))?;
        let op = Find::new(self.namespace(), filter, options);
        self.client()
            .execute_session_cursor_operation(op, session)
            .await
    }

    /// The first document matching `filter`, if there is one.
    pub async fn find_one(
        &self,
        filter: Document,
        options: impl Into<Option<FindOneOptions>>,
    ) -> Result<Option<Document>> {
        let options = FindOptions::from(options.into().unwrap_or_default());
        let mut cursor = self.find(filter, options).await?;
        cursor.next().await.transpose()
    }

    /// [`Collection::find_one`] within `session`.
    pub async fn find_one_with_session(
        &self,
        filter: Document,
        options: impl Into<Option<FindOneOptions>>,
        session: &mut ClientSession,
    ) -> Result<Option<Document>> {
        let options = FindOptions::from(options.into().unwrap_or_default());
        let mut cursor = self.find_with_session(filter, options, session).await?;
        cursor.next(session).await.transpose()
    }
}

/// A fully qualified collection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// The database part.
    pub db: String,

    /// The collection part, which may itself contain dots.
    pub coll: String,
}

impl Namespace {
    /// Pairs a database name with a collection name.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    /// Splits at the first `.`; both sides have to be non-empty.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::invalid_argument(format!(
                "\"{s}\" is not a namespace of the form db.collection"
            ))),
        }
    }
}
