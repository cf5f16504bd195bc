use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::{
    bson::{Bson, Document},
    concern::{ReadConcern, WriteConcern},
    options::Collation,
    selection_criteria::SelectionCriteria,
};

/// Defaults for every operation run through a [`Collection`](crate::Collection). Anything left
/// unset is inherited from the [`Database`](crate::Database) the collection came from.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct CollectionOptions {
    /// Where reads are routed.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Read concern attached to reads.
    pub read_concern: Option<ReadConcern>,

    /// Write concern attached to writes.
    pub write_concern: Option<WriteConcern>,
}

/// Which version of the document a `find_one_and_replace` or `find_one_and_update` hands back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReturnDocument {
    /// The document as it is after the modification.
    After,
    /// The document as it was before the modification. This is what the server returns by
    /// default.
    Before,
}

/// An index the server should use to satisfy a query, given either by its key pattern or by its
/// name.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Hint {
    /// The index's key pattern, e.g. `{ "a": 1 }`.
    Keys(Document),
    /// The index's name.
    Name(String),
}

impl Hint {
    pub(crate) fn to_bson(&self) -> Bson {
        match self {
            Self::Keys(keys) => keys.clone().into(),
            Self::Name(name) => name.as_str().into(),
        }
    }
}

/// Options for [`Collection::insert_one`](crate::Collection::insert_one).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct InsertOneOptions {
    /// Skip schema validation on the server. Only sent when `Some(true)`.
    pub bypass_document_validation: Option<bool>,

    /// Overrides the collection's write concern. Not allowed inside a transaction.
    pub write_concern: Option<WriteConcern>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,
}

/// Options for [`Collection::insert_many`](crate::Collection::insert_many).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct InsertManyOptions {
    /// Skip schema validation on the server. Only sent when `Some(true)`.
    pub bypass_document_validation: Option<bool>,

    /// Stop at the first failed insert (the default) or attempt every document regardless.
    pub ordered: Option<bool>,

    /// Overrides the collection's write concern. Not allowed inside a transaction.
    pub write_concern: Option<WriteConcern>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,
}

/// Options for [`Collection::bulk_write`](crate::Collection::bulk_write).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct BulkWriteOptions {
    /// Run the models in the given order and stop at the first failure (the default), or group
    /// them by kind and run every group.
    pub ordered: Option<bool>,

    /// Skip schema validation on the server. Only sent when `Some(true)`.
    pub bypass_document_validation: Option<bool>,

    /// Overrides the collection's write concern. Not allowed inside a transaction.
    pub write_concern: Option<WriteConcern>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,
}

impl From<InsertManyOptions> for BulkWriteOptions {
    fn from(insert: InsertManyOptions) -> Self {
        let InsertManyOptions {
            bypass_document_validation,
            ordered,
            write_concern,
            comment,
        } = insert;
        Self {
            ordered,
            bypass_document_validation,
            write_concern,
            comment,
        }
    }
}

impl From<InsertOneOptions> for BulkWriteOptions {
    fn from(insert: InsertOneOptions) -> Self {
        let InsertOneOptions {
            bypass_document_validation,
            write_concern,
            comment,
        } = insert;
        Self {
            ordered: None,
            bypass_document_validation,
            write_concern,
            comment,
        }
    }
}

/// The change an update applies: either a document of update operators such as `$set`, or an
/// aggregation pipeline.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum UpdateModifications {
    /// Update operators. Every top-level key must start with `$`.
    Document(Document),

    /// Pipeline stages applied to each matched document.
    Pipeline(Vec<Document>),
}

impl UpdateModifications {
    pub(crate) fn to_bson(&self) -> Bson {
        match self {
            Self::Document(operators) => operators.clone().into(),
            Self::Pipeline(stages) => stages.clone().into(),
        }
    }
}

impl From<Document> for UpdateModifications {
    fn from(operators: Document) -> Self {
        Self::Document(operators)
    }
}

impl From<Vec<Document>> for UpdateModifications {
    fn from(stages: Vec<Document>) -> Self {
        Self::Pipeline(stages)
    }
}

/// Options for [`Collection::update_one`](crate::Collection::update_one) and
/// [`Collection::update_many`](crate::Collection::update_many).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct UpdateOptions {
    /// Selects which array elements positional `$[<identifier>]` operators touch.
    pub array_filters: Option<Vec<Document>>,

    /// Skip schema validation on the server. Only sent when `Some(true)`.
    pub bypass_document_validation: Option<bool>,

    /// Insert a new document when the filter matches nothing.
    pub upsert: Option<bool>,

    /// Rules for comparing strings, such as letter case and accents.
    pub collation: Option<Collation>,

    /// Index used to find the documents to update.
    pub hint: Option<Hint>,

    /// Overrides the collection's write concern. Not allowed inside a transaction.
    pub write_concern: Option<WriteConcern>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,
}

impl From<ReplaceOptions> for UpdateOptions {
    fn from(replace: ReplaceOptions) -> Self {
        let ReplaceOptions {
            bypass_document_validation,
            upsert,
            collation,
            hint,
            write_concern,
            comment,
        } = replace;
        Self {
            array_filters: None,
            bypass_document_validation,
            upsert,
            collation,
            hint,
            write_concern,
            comment,
        }
    }
}

/// Options for [`Collection::replace_one`](crate::Collection::replace_one).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct ReplaceOptions {
    /// Skip schema validation on the server. Only sent when `Some(true)`.
    pub bypass_document_validation: Option<bool>,

    /// Insert the replacement when the filter matches nothing.
    pub upsert: Option<bool>,

    /// Rules for comparing strings, such as letter case and accents.
    pub collation: Option<Collation>,

    /// Index used to find the document to replace.
    pub hint: Option<Hint>,

    /// Overrides the collection's write concern. Not allowed inside a transaction.
    pub write_concern: Option<WriteConcern>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,
}

/// Options for [`Collection::delete_one`](crate::Collection::delete_one) and
/// [`Collection::delete_many`](crate::Collection::delete_many).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct DeleteOptions {
    /// Rules for comparing strings, such as letter case and accents.
    pub collation: Option<Collation>,

    /// Overrides the collection's write concern. Not allowed inside a transaction.
    pub write_concern: Option<WriteConcern>,

    /// Index used to find the documents to delete.
    pub hint: Option<Hint>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,
}

/// Options for [`Collection::find_one_and_delete`](crate::Collection::find_one_and_delete).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct FindOneAndDeleteOptions {
    /// Server-side time limit, sent as `maxTimeMS`. The client waits this long (plus a short
    /// grace period) before giving up on the reply.
    pub max_time: Option<Duration>,

    /// Fields to include in or exclude from the returned document.
    pub projection: Option<Document>,

    /// Decides which document is deleted when the filter matches several.
    pub sort: Option<Document>,

    /// Overrides the collection's write concern. Not allowed inside a transaction.
    pub write_concern: Option<WriteConcern>,

    /// Rules for comparing strings, such as letter case and accents.
    pub collation: Option<Collation>,

    /// Index the server should use.
    pub hint: Option<Hint>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,
}

/// Options for [`Collection::find_one_and_replace`](crate::Collection::find_one_and_replace).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct FindOneAndReplaceOptions {
    /// Skip schema validation on the server. Only sent when `Some(true)`.
    pub bypass_document_validation: Option<bool>,

    /// Server-side time limit, sent as `maxTimeMS`.
    pub max_time: Option<Duration>,

    /// Fields to include in or exclude from the returned document.
    pub projection: Option<Document>,

    /// Return the document as it was before the replacement (the default) or after it.
    pub return_document: Option<ReturnDocument>,

    /// Decides which document is replaced when the filter matches several.
    pub sort: Option<Document>,

    /// Insert the replacement when the filter matches nothing.
    pub upsert: Option<bool>,

    /// Overrides the collection's write concern. Not allowed inside a transaction.
    pub write_concern: Option<WriteConcern>,

    /// Rules for comparing strings, such as letter case and accents.
    pub collation: Option<Collation>,

    /// Index the server should use.
    pub hint: Option<Hint>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,
}

/// Options for [`Collection::find_one_and_update`](crate::Collection::find_one_and_update).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct FindOneAndUpdateOptions {
    /// Selects which array elements positional `$[<identifier>]` operators touch.
    pub array_filters: Option<Vec<Document>>,

    /// Skip schema validation on the server. Only sent when `Some(true)`.
    pub bypass_document_validation: Option<bool>,

    /// Server-side time limit, sent as `maxTimeMS`.
    pub max_time: Option<Duration>,

    /// Fields to include in or exclude from the returned document.
    pub projection: Option<Document>,

    /// Return the document as it was before the update (the default) or after it.
    pub return_document: Option<ReturnDocument>,

    /// Decides which document is updated when the filter matches several.
    pub sort: Option<Document>,

    /// Insert a new document when the filter matches nothing.
    pub upsert: Option<bool>,

    /// Overrides the collection's write concern. Not allowed inside a transaction.
    pub write_concern: Option<WriteConcern>,

    /// Rules for comparing strings, such as letter case and accents.
    pub collation: Option<Collation>,

    /// Index the server should use.
    pub hint: Option<Hint>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,
}

/// Options for [`Collection::aggregate`](crate::Collection::aggregate).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct AggregateOptions {
    /// Let stages that exceed the server's memory limit spill to disk.
    pub allow_disk_use: Option<bool>,

    /// How many documents each `getMore` asks for. This only changes the number of round trips,
    /// never which documents the cursor yields.
    pub batch_size: Option<u32>,

    /// Skip schema validation for `$out`/`$merge` stages. Only sent when `Some(true)`.
    pub bypass_document_validation: Option<bool>,

    /// Rules for comparing strings, such as letter case and accents.
    pub collation: Option<Collation>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,

    /// Index the server should use.
    pub hint: Option<Hint>,

    /// Server-side time limit, sent as `maxTimeMS`.
    pub max_time: Option<Duration>,

    /// Overrides the collection's read concern.
    pub read_concern: Option<ReadConcern>,

    /// Overrides the collection's selection criteria.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Overrides the collection's write concern for pipelines that write.
    pub write_concern: Option<WriteConcern>,
}

/// Options for [`Collection::count_documents`](crate::Collection::count_documents).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct CountOptions {
    /// Index the server should use.
    pub hint: Option<Hint>,

    /// Stop counting after this many matches.
    pub limit: Option<u64>,

    /// Server-side time limit, sent as `maxTimeMS`.
    pub max_time: Option<Duration>,

    /// Matches to pass over before counting starts.
    pub skip: Option<u64>,

    /// Rules for comparing strings, such as letter case and accents.
    pub collation: Option<Collation>,

    /// Overrides the collection's selection criteria.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Overrides the collection's read concern.
    pub read_concern: Option<ReadConcern>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,
}

/// Options for
/// [`Collection::estimated_document_count`](crate::Collection::estimated_document_count).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct EstimatedDocumentCountOptions {
    /// Server-side time limit, sent as `maxTimeMS`.
    pub max_time: Option<Duration>,

    /// Overrides the collection's selection criteria.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Overrides the collection's read concern.
    pub read_concern: Option<ReadConcern>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,
}

/// Options for [`Collection::distinct`](crate::Collection::distinct).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct DistinctOptions {
    /// Server-side time limit, sent as `maxTimeMS`.
    pub max_time: Option<Duration>,

    /// Overrides the collection's selection criteria.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Overrides the collection's read concern.
    pub read_concern: Option<ReadConcern>,

    /// Rules for comparing strings, such as letter case and accents.
    pub collation: Option<Collation>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,
}

/// Options for [`Collection::find`](crate::Collection::find).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct FindOptions {
    /// Let blocking sorts that exceed the server's memory limit spill to disk.
    pub allow_disk_use: Option<bool>,

    /// On a sharded cluster, return what the reachable shards have instead of failing when some
    /// are down.
    pub allow_partial_results: Option<bool>,

    /// How many documents the first reply and each `getMore` carry. This only changes the number
    /// of round trips, never which documents the cursor yields.
    pub batch_size: Option<u32>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,

    /// Index the server should use.
    pub hint: Option<Hint>,

    /// The most documents to return. A negative value asks for a single batch of at most that
    /// many documents, after which the server closes the cursor.
    pub limit: Option<i64>,

    /// Server-side time limit, sent as `maxTimeMS`.
    pub max_time: Option<Duration>,

    /// Keep the server-side cursor open even when it sits idle.
    pub no_cursor_timeout: Option<bool>,

    /// Fields to include in or exclude from the returned documents.
    pub projection: Option<Document>,

    /// Overrides the collection's read concern.
    pub read_concern: Option<ReadConcern>,

    /// Overrides the collection's selection criteria.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Matches to pass over before returning documents.
    pub skip: Option<u64>,

    /// Order of the returned documents.
    pub sort: Option<Document>,

    /// Rules for comparing strings, such as letter case and accents.
    pub collation: Option<Collation>,
}

impl From<FindOneOptions> for FindOptions {
    fn from(find_one: FindOneOptions) -> Self {
        let FindOneOptions {
            allow_partial_results,
            collation,
            comment,
            hint,
            max_time,
            projection,
            read_concern,
            selection_criteria,
            skip,
            sort,
        } = find_one;
        Self {
            allow_partial_results,
            collation,
            comment,
            hint,
            max_time,
            projection,
            read_concern,
            selection_criteria,
            skip,
            sort,
            // A single batch of one document; the server closes the cursor afterwards.
            limit: Some(-1),
            ..Default::default()
        }
    }
}

/// Options for [`Collection::find_one`](crate::Collection::find_one).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct FindOneOptions {
    /// On a sharded cluster, return what the reachable shards have instead of failing when some
    /// are down.
    pub allow_partial_results: Option<bool>,

    /// Rules for comparing strings, such as letter case and accents.
    pub collation: Option<Collation>,

    /// An arbitrary value echoed into the server's logs and profiler output.
    pub comment: Option<Bson>,

    /// Index the server should use.
    pub hint: Option<Hint>,

    /// Server-side time limit, sent as `maxTimeMS`.
    pub max_time: Option<Duration>,

    /// Fields to include in or exclude from the returned document.
    pub projection: Option<Document>,

    /// Overrides the collection's read concern.
    pub read_concern: Option<ReadConcern>,

    /// Overrides the collection's selection criteria.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Matches to pass over before returning one.
    pub skip: Option<u64>,

    /// Decides which document is returned when the filter matches several.
    pub sort: Option<Document>,
}
