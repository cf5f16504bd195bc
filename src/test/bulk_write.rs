use std::collections::HashSet;

use pretty_assertions::assert_eq;

use super::{client_with_events, MockServer};
use crate::{
    bson::{doc, Bson, Document},
    error::{BulkWriteFailure, ErrorKind},
    options::{BulkWriteOptions, InsertManyOptions},
    WriteModel,
};

/// Answers `insert` commands the way a collection with a unique `_id` index would: duplicates
/// produce code 11000 write errors, and an ordered insert stops at the first one.
fn unique_index_handler() -> impl FnMut(&Document) -> super::MockReply + Send + 'static {
    let mut seen = HashSet::new();
    move |command| {
        if command.first_key() != Some("insert") {
            return doc! { "ok": 1 }.into();
        }
        let ordered = command.get_bool("ordered").unwrap_or(true);
        let mut n = 0;
        let mut write_errors = Vec::new();
        for (index, document) in command.get_array("documents").unwrap().iter().enumerate() {
            let id = format!("{:?}", document.as_document().unwrap().get("_id"));
            if seen.insert(id) {
                n += 1;
            } else {
                write_errors.push(doc! {
                    "index": index as i32,
                    "code": 11000,
                    "errmsg": "E11000 duplicate key error",
                });
                if ordered {
                    break;
                }
            }
        }
        let mut reply = doc! { "n": n, "ok": 1 };
        if !write_errors.is_empty() {
            reply.insert("writeErrors", write_errors);
        }
        reply.into()
    }
}

fn expect_bulk_failure(kind: ErrorKind) -> BulkWriteFailure {
    match kind {
        ErrorKind::BulkWrite(failure) => failure,
        other => panic!("expected a bulk write failure, got {other:?}"),
    }
}

#[tokio::test]
async fn ordered_insert_stops_at_the_first_duplicate() {
    let server = MockServer::start().await;
    server.set_handler(unique_index_handler());
    let (client, events) = client_with_events(&server);

    let docs = vec![doc! { "_id": 1 }, doc! { "_id": 1 }, doc! { "_id": 2 }];
    let error = client
        .database("db")
        .collection("coll")
        .insert_many(docs, None)
        .await
        .unwrap_err();

    let failure = expect_bulk_failure(*error.kind);
    assert_eq!(failure.partial_result.inserted_count, 1);
    let write_errors = failure.write_errors.unwrap();
    assert_eq!(write_errors.len(), 1);
    assert_eq!(write_errors[0].index, 1);
    assert_eq!(write_errors[0].code, 11000);
    assert_eq!(
        events.started("insert")[0].command.get_bool("ordered"),
        Ok(true)
    );
}

#[tokio::test]
async fn unordered_insert_continues_past_duplicates() {
    let server = MockServer::start().await;
    server.set_handler(unique_index_handler());
    let (client, _) = client_with_events(&server);

    let docs = vec![doc! { "_id": 1 }, doc! { "_id": 1 }, doc! { "_id": 2 }];
    let options = InsertManyOptions::builder().ordered(false).build();
    let error = client
        .database("db")
        .collection("coll")
        .insert_many(docs, options)
        .await
        .unwrap_err();

    let failure = expect_bulk_failure(*error.kind);
    assert_eq!(failure.partial_result.inserted_count, 2);
    let mut inserted: Vec<_> = failure.partial_result.inserted_ids.into_keys().collect();
    inserted.sort_unstable();
    assert_eq!(inserted, vec![0, 2]);
}

#[tokio::test]
async fn insert_many_reports_ids_by_position() {
    let server = MockServer::start().await;
    server.set_handler(unique_index_handler());
    let (client, _) = client_with_events(&server);

    let result = client
        .database("db")
        .collection("coll")
        .insert_many(vec![doc! { "_id": "a" }, doc! { "x": 1 }], None)
        .await
        .unwrap();

    assert_eq!(result.inserted_ids.len(), 2);
    assert_eq!(result.inserted_ids[&0], Bson::from("a"));
    assert!(matches!(result.inserted_ids[&1], Bson::ObjectId(_)));
}

#[tokio::test]
async fn unordered_mixed_models_are_grouped_by_kind() {
    let server = MockServer::start().await;
    server.set_handler(|command| match command.first_key() {
        Some("insert") => doc! { "n": 3, "ok": 1 }.into(),
        Some("delete") => doc! { "n": 1, "ok": 1 }.into(),
        Some("update") => doc! {
            "n": 0,
            "nModified": 0,
            "writeErrors": vec![doc! { "index": 0, "code": 2, "errmsg": "bad update" }],
            "ok": 1,
        }
        .into(),
        _ => doc! { "ok": 1 }.into(),
    });
    let (client, _) = client_with_events(&server);

    let models = vec![
        WriteModel::insert_one(doc! { "x": 1 }),
        WriteModel::insert_one(doc! { "x": 2 }),
        WriteModel::delete_one(doc! { "x": 1 }),
        WriteModel::update_one(doc! { "x": 2 }, doc! { "$set": doc! { "y": 1 } }),
        WriteModel::insert_one(doc! { "x": 3 }),
    ];
    let options = BulkWriteOptions::builder().ordered(false).build();
    let error = client
        .database("db")
        .collection("coll")
        .bulk_write(models, options)
        .await
        .unwrap_err();

    assert_eq!(server.received_names(), vec!["insert", "delete", "update"]);
    assert_eq!(
        server.received("insert")[0]
            .get_array("documents")
            .unwrap()
            .len(),
        3
    );

    let failure = expect_bulk_failure(*error.kind);
    let write_errors = failure.write_errors.unwrap();
    assert_eq!(write_errors.len(), 1);
    assert_eq!(write_errors[0].index, 3);
    assert_eq!(failure.partial_result.inserted_count, 3);
    assert_eq!(failure.partial_result.deleted_count, 1);
    let mut inserted: Vec<_> = failure.partial_result.inserted_ids.into_keys().collect();
    inserted.sort_unstable();
    assert_eq!(inserted, vec![0, 1, 4]);
}

#[tokio::test]
async fn ordered_mixed_models_stop_after_a_failed_batch() {
    let server = MockServer::start().await;
    server.set_handler(|command| match command.first_key() {
        Some("delete") => doc! {
            "n": 0,
            "writeErrors": vec![doc! { "index": 0, "code": 2, "errmsg": "bad delete" }],
            "ok": 1,
        }
        .into(),
        _ => doc! { "n": 1, "ok": 1 }.into(),
    });
    let (client, _) = client_with_events(&server);

    let models = vec![
        WriteModel::insert_one(doc! { "x": 1 }),
        WriteModel::delete_one(doc! { "x": 1 }),
        WriteModel::insert_one(doc! { "x": 2 }),
    ];
    let error = client
        .database("db")
        .collection("coll")
        .bulk_write(models, None)
        .await
        .unwrap_err();

    assert_eq!(server.received_names(), vec!["insert", "delete"]);
    let failure = expect_bulk_failure(*error.kind);
    assert_eq!(failure.write_errors.unwrap()[0].index, 1);
    assert_eq!(failure.partial_result.inserted_count, 1);
}

#[tokio::test]
async fn upserted_ids_map_to_model_positions() {
    let server = MockServer::start().await;
    server.set_handler(|command| match command.first_key() {
        Some("update") => doc! {
            "n": 2,
            "nModified": 1,
            "upserted": vec![doc! { "index": 1, "_id": "new" }],
            "ok": 1,
        }
        .into(),
        _ => doc! { "n": 1, "ok": 1 }.into(),
    });
    let (client, _) = client_with_events(&server);

    let models = vec![
        WriteModel::insert_one(doc! { "x": 1 }),
        WriteModel::update_one(doc! { "x": 1 }, doc! { "$set": doc! { "y": 1 } }),
        WriteModel::replace_one(doc! { "x": 9 }, doc! { "x": 10 }),
    ];
    let result = client
        .database("db")
        .collection("coll")
        .bulk_write(models, None)
        .await
        .unwrap();

    assert_eq!(result.inserted_count, 1);
    assert_eq!(result.upserted_count, 1);
    assert_eq!(result.matched_count, 1);
    assert_eq!(result.modified_count, 1);
    assert_eq!(result.upserted_ids.get(&2), Some(&Bson::from("new")));
}

#[tokio::test]
async fn invalid_models_are_rejected_before_sending() {
    let server = MockServer::start().await;
    let (client, _) = client_with_events(&server);
    let coll = client.database("db").collection("coll");

    let error = coll.bulk_write(Vec::<WriteModel>::new(), None).await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));

    let models = vec![
        WriteModel::insert_one(doc! { "x": 1 }),
        WriteModel::replace_one(doc! {}, doc! { "$set": doc! { "x": 1 } }),
    ];
    let error = coll.bulk_write(models, None).await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
    assert!(server.received_names().is_empty());
}
