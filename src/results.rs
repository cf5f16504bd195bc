//! Contains the types of results returned by CRUD operations.

use std::collections::{HashMap, VecDeque};

use crate::bson::{Bson, Document};

/// The result of a [`Collection::insert_one`](../struct.Collection.html#method.insert_one)
/// operation.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct InsertOneResult {
    /// The `_id` field of the document inserted.
    pub inserted_id: Bson,
}

impl InsertOneResult {
    pub(crate) fn from_bulk_result(result: BulkWriteResult) -> Self {
        Self {
            inserted_id: result.inserted_ids.get(&0).cloned().unwrap_or(Bson::Null),
        }
    }
}

/// The result of a [`Collection::insert_many`](../struct.Collection.html#method.insert_many)
/// operation.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct InsertManyResult {
    /// The `_id` field of the documents inserted, keyed by their index in the input.
    pub inserted_ids: HashMap<usize, Bson>,
}

impl InsertManyResult {
    pub(crate) fn from_bulk_result(result: BulkWriteResult) -> Self {
        Self {
            inserted_ids: result.inserted_ids,
        }
    }
}

/// The result of a [`Collection::update_one`](../struct.Collection.html#method.update_one),
/// [`Collection::update_many`](../struct.Collection.html#method.update_many) or
/// [`Collection::replace_one`](../struct.Collection.html#method.replace_one) operation.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct UpdateResult {
    /// The number of documents that matched the filter.
    pub matched_count: u64,
    /// The number of documents that were modified by the operation.
    pub modified_count: u64,
    /// The `_id` field of the upserted document.
    pub upserted_id: Option<Bson>,
}

impl UpdateResult {
    pub(crate) fn from_bulk_result(result: BulkWriteResult) -> Self {
        Self {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_ids.get(&0).cloned(),
        }
    }
}

/// The result of a [`Collection::delete_one`](../struct.Collection.html#method.delete_one) or
/// [`Collection::delete_many`](../struct.Collection.html#method.delete_many) operation.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct DeleteResult {
    /// The number of documents deleted by the operation.
    pub deleted_count: u64,
}

/// The result of a [`Collection::bulk_write`](../struct.Collection.html#method.bulk_write)
/// operation. Indexes refer to positions in the list of models passed in.
///
/// When a bulk write fails, the writes that were applied are reported through the
/// `partial_result` of the returned [`BulkWriteFailure`](crate::error::BulkWriteFailure).
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct BulkWriteResult {
    /// The number of documents inserted.
    pub inserted_count: u64,

    /// The number of documents matched by update and replace models.
    pub matched_count: u64,

    /// The number of documents modified by update and replace models.
    pub modified_count: u64,

    /// The number of documents deleted.
    pub deleted_count: u64,

    /// The number of documents upserted.
    pub upserted_count: u64,

    /// The `_id` of each inserted document, keyed by model index.
    pub inserted_ids: HashMap<usize, Bson>,

    /// The `_id` of each upserted document, keyed by model index.
    pub upserted_ids: HashMap<usize, Bson>,
}

impl BulkWriteResult {
    /// Folds the result of one batch into this result. `index_map` translates batch-relative
    /// indexes to model indexes.
    pub(crate) fn merge(&mut self, other: BulkWriteResult, index_map: &[usize]) {
        let translate = |i: usize| index_map.get(i).copied().unwrap_or(i);

        self.inserted_count += other.inserted_count;
        self.matched_count += other.matched_count;
        self.modified_count += other.modified_count;
        self.deleted_count += other.deleted_count;
        self.upserted_count += other.upserted_count;
        self.inserted_ids.extend(
            other
                .inserted_ids
                .into_iter()
                .map(|(i, id)| (translate(i), id)),
        );
        self.upserted_ids.extend(
            other
                .upserted_ids
                .into_iter()
                .map(|(i, id)| (translate(i), id)),
        );
    }
}

#[derive(Debug, Clone)]
pub(crate) struct GetMoreResult {
    pub(crate) batch: VecDeque<Document>,
    pub(crate) exhausted: bool,
    pub(crate) id: i64,
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::BulkWriteResult;
    use crate::bson::Bson;

    #[test]
    fn merge_translates_batch_indexes() {
        let mut total = BulkWriteResult {
            inserted_count: 1,
            inserted_ids: [(0, Bson::Int32(1))].into_iter().collect(),
            ..Default::default()
        };

        let batch = BulkWriteResult {
            inserted_count: 2,
            inserted_ids: [(0, Bson::Int32(2)), (1, Bson::Int32(3))]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        total.merge(batch, &[2, 5]);

        assert_eq!(total.inserted_count, 3);
        assert_eq!(total.inserted_ids.get(&2), Some(&Bson::Int32(2)));
        assert_eq!(total.inserted_ids.get(&5), Some(&Bson::Int32(3)));
    }
}
