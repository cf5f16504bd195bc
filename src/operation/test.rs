use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, Bson, Document},
    cmap::{RawCommandResponse, StreamDescription},
    error::{ErrorKind, WriteFailure},
    operation::{
        CommitTransaction,
        CountDocuments,
        Delete,
        DeleteStatement,
        Find,
        FindAndModify,
        GetMore,
        Insert,
        Modification,
        Operation,
        Retryability,
        RunCommand,
        Update,
        UpdateStatement,
    },
    options::{
        Acknowledgment,
        BulkWriteOptions,
        CountOptions,
        FindOneAndUpdateOptions,
        FindOptions,
        ReturnDocument,
        ServerAddress,
        WriteConcern,
    },
    Namespace,
};

fn ns() -> Namespace {
    Namespace::new("test_db", "test_coll")
}

fn response(body: Document) -> RawCommandResponse {
    RawCommandResponse::with_document_and_address(ServerAddress::default(), body)
}

fn documents_with_ids(count: i32) -> Vec<Document> {
    (0..count).map(|i| doc! { "_id": i, "x": i }).collect()
}

#[test]
fn insert_build_uses_document_sequence() {
    let documents = documents_with_ids(3);
    let options = BulkWriteOptions {
        ordered: Some(false),
        write_concern: Some(WriteConcern::builder().journal(true).build()),
        ..Default::default()
    };
    let mut op = Insert::new(ns(), &documents, options);

    let description = StreamDescription::with_wire_version(17);
    let command = op.build(&description).unwrap();

    assert_eq!(command.name, "insert");
    assert_eq!(command.target_db, "test_db");
    assert_eq!(command.body.get_str("insert").unwrap(), "test_coll");
    assert_eq!(command.body.get_bool("ordered").unwrap(), false);
    assert!(!command.body.contains_key("documents"));
    assert_eq!(command.document_sequences.len(), 1);
    assert_eq!(command.document_sequences[0].identifier, "documents");
    assert_eq!(command.document_sequences[0].documents, documents);
    assert!(!command.more_to_come);
    assert_eq!(op.n_attempted, 3);
}

#[test]
fn bypass_document_validation_only_sent_when_true() {
    let documents = documents_with_ids(1);
    let description = StreamDescription::with_wire_version(17);

    for (bypass, expected) in [(None, None), (Some(false), None), (Some(true), Some(true))] {
        let options = BulkWriteOptions {
            bypass_document_validation: bypass,
            ..Default::default()
        };
        let command = Insert::new(ns(), &documents, options)
            .build(&description)
            .unwrap();
        assert_eq!(
            command.body.get_bool("bypassDocumentValidation").ok(),
            expected
        );
    }
}

#[test]
fn insert_splits_at_max_write_batch_size() {
    let documents = documents_with_ids(5);
    let mut description = StreamDescription::with_wire_version(17);
    description.max_write_batch_size = 2;

    let mut op = Insert::new(ns(), &documents, BulkWriteOptions::default());
    let command = op.build(&description).unwrap();

    assert_eq!(op.n_attempted, 2);
    assert_eq!(command.document_sequences[0].documents.len(), 2);
}

#[test]
fn insert_rejects_oversized_document() {
    let documents = vec![doc! { "_id": 1, "big": "x".repeat(200) }];
    let mut description = StreamDescription::with_wire_version(17);
    description.max_bson_object_size = 100;

    let mut op = Insert::new(ns(), &documents, BulkWriteOptions::default());
    let error = op.build(&description).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
}

#[test]
fn unacknowledged_insert_sets_more_to_come() {
    let documents = documents_with_ids(1);
    let options = BulkWriteOptions {
        write_concern: Some(WriteConcern::unacknowledged()),
        ..Default::default()
    };
    let mut op = Insert::new(ns(), &documents, options);
    let command = op.build(&StreamDescription::with_wire_version(17)).unwrap();

    assert!(command.more_to_come);
}

#[test]
fn ordered_insert_stops_counting_ids_at_first_error() {
    let documents = documents_with_ids(3);
    let mut op = Insert::new(ns(), &documents, BulkWriteOptions::default());
    let description = StreamDescription::with_wire_version(17);
    op.build(&description).unwrap();

    let reply = doc! {
        "ok": 1,
        "n": 1,
        "writeErrors": vec![doc! { "index": 1, "code": 11000, "errmsg": "duplicate key" }],
    };
    let error = op.handle_response(response(reply), &description).unwrap_err();

    let ErrorKind::BulkWrite(ref failure) = *error.kind else {
        panic!("expected bulk write error, got {error:?}");
    };
    assert_eq!(failure.partial_result.inserted_count, 1);
    assert_eq!(failure.partial_result.inserted_ids.len(), 1);
    assert_eq!(
        failure.partial_result.inserted_ids.get(&0),
        Some(&Bson::Int32(0))
    );
    assert!(error.is_duplicate_key());
}

#[test]
fn unordered_insert_skips_only_failed_ids() {
    let documents = documents_with_ids(3);
    let options = BulkWriteOptions {
        ordered: Some(false),
        ..Default::default()
    };
    let mut op = Insert::new(ns(), &documents, options);
    let description = StreamDescription::with_wire_version(17);
    op.build(&description).unwrap();

    let reply = doc! {
        "ok": 1,
        "n": 2,
        "writeErrors": vec![doc! { "index": 1, "code": 11000, "errmsg": "duplicate key" }],
    };
    let error = op.handle_response(response(reply), &description).unwrap_err();

    let ErrorKind::BulkWrite(ref failure) = *error.kind else {
        panic!("expected bulk write error, got {error:?}");
    };
    let mut ids: Vec<_> = failure.partial_result.inserted_ids.keys().copied().collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 2]);
}

#[test]
fn update_reports_upserts() {
    let statements = vec![
        UpdateStatement {
            filter: doc! { "x": 1 },
            update: doc! { "$set": doc! { "y": 1 } }.into(),
            multi: false,
            upsert: Some(true),
            array_filters: None,
            collation: None,
            hint: None,
        },
        UpdateStatement {
            filter: doc! { "x": 2 },
            update: doc! { "$set": doc! { "y": 2 } }.into(),
            multi: false,
            upsert: Some(true),
            array_filters: None,
            collation: None,
            hint: None,
        },
    ];
    let mut op = Update::new(ns(), &statements, BulkWriteOptions::default());
    let description = StreamDescription::with_wire_version(17);
    let command = op.build(&description).unwrap();

    let sent = &command.document_sequences[0].documents;
    assert_eq!(sent[0].get_document("q").unwrap(), &doc! { "x": 1 });
    assert_eq!(sent[0].get_bool("upsert").unwrap(), true);
    assert!(!sent[0].contains_key("multi"));
    assert_eq!(op.retryability(), Retryability::Write);

    let reply = doc! {
        "ok": 1,
        "n": 2,
        "nModified": 1,
        "upserted": vec![doc! { "index": 1, "_id": "new" }],
    };
    let result = op.handle_response(response(reply), &description).unwrap();
    assert_eq!(result.matched_count, 1);
    assert_eq!(result.modified_count, 1);
    assert_eq!(result.upserted_count, 1);
    assert_eq!(result.upserted_ids.get(&1), Some(&Bson::from("new")));
}

#[test]
fn multi_statements_are_not_retryable() {
    let update = vec![UpdateStatement {
        filter: doc! {},
        update: doc! { "$inc": doc! { "x": 1 } }.into(),
        multi: true,
        upsert: None,
        array_filters: None,
        collation: None,
        hint: None,
    }];
    let op = Update::new(ns(), &update, BulkWriteOptions::default());
    assert_eq!(op.retryability(), Retryability::None);

    let delete = vec![DeleteStatement {
        filter: doc! {},
        single: false,
        collation: None,
        hint: None,
    }];
    let op = Delete::new(ns(), &delete, BulkWriteOptions::default());
    assert_eq!(op.retryability(), Retryability::None);
}

#[test]
fn delete_sends_limit() {
    let statements = vec![DeleteStatement {
        filter: doc! { "x": 1 },
        single: true,
        collation: None,
        hint: None,
    }];
    let mut op = Delete::new(ns(), &statements, BulkWriteOptions::default());
    let description = StreamDescription::with_wire_version(17);
    let command = op.build(&description).unwrap();

    assert_eq!(
        command.document_sequences[0].documents,
        vec![doc! { "q": doc! { "x": 1 }, "limit": 1 }]
    );

    let result = op
        .handle_response(response(doc! { "ok": 1, "n": 1 }), &description)
        .unwrap();
    assert_eq!(result.deleted_count, 1);
}

#[test]
fn write_concern_error_is_reported() {
    let documents = documents_with_ids(1);
    let mut op = Insert::new(ns(), &documents, BulkWriteOptions::default());
    let description = StreamDescription::with_wire_version(17);
    op.build(&description).unwrap();

    let reply = doc! {
        "ok": 1,
        "n": 1,
        "writeConcernError": doc! {
            "code": 64,
            "codeName": "WriteConcernFailed",
            "errmsg": "waiting for replication timed out",
            "errorLabels": vec!["RetryableWriteError"],
        },
    };
    let error = op.handle_response(response(reply), &description).unwrap_err();
    assert!(error.contains_label("RetryableWriteError"));
    let ErrorKind::BulkWrite(ref failure) = *error.kind else {
        panic!("expected bulk write error, got {error:?}");
    };
    assert_eq!(failure.write_concern_error.as_ref().unwrap().code, 64);
    assert_eq!(failure.partial_result.inserted_count, 1);
}

#[test]
fn find_with_negative_limit_is_single_batch() {
    let options = FindOptions::builder()
        .limit(-3)
        .batch_size(2)
        .max_time(Duration::from_millis(500))
        .build();
    let mut op = Find::new(ns(), doc! { "x": 1 }, Some(options));
    let command = op.build(&StreamDescription::with_wire_version(17)).unwrap();

    assert_eq!(command.body.get_i64("limit").unwrap(), 3);
    assert_eq!(command.body.get_bool("singleBatch").unwrap(), true);
    assert_eq!(command.body.get_i32("batchSize").unwrap(), 2);
    assert_eq!(command.body.get_i64("maxTimeMS").unwrap(), 500);
    assert_eq!(op.max_time(), Some(Duration::from_millis(500)));
}

#[test]
fn find_reads_first_batch() {
    let op = Find::new(ns(), doc! {}, None);
    let reply = doc! {
        "ok": 1,
        "cursor": doc! {
            "id": 42_i64,
            "ns": "test_db.test_coll",
            "firstBatch": vec![doc! { "_id": 1 }, doc! { "_id": 2 }],
        },
    };
    let spec = op
        .handle_response(response(reply), &StreamDescription::with_wire_version(17))
        .unwrap();

    assert_eq!(spec.info.id, 42);
    assert_eq!(spec.info.ns, ns());
    assert_eq!(spec.initial_buffer.len(), 2);
}

#[test]
fn get_more_targets_cursor_server() {
    let op = Find::new(ns(), doc! {}, None);
    let address = ServerAddress::parse("other:27018").unwrap();
    let reply = doc! {
        "ok": 1,
        "cursor": doc! { "id": 7_i64, "ns": "test_db.test_coll", "firstBatch": Vec::<Bson>::new() },
    };
    let spec = op
        .handle_response(
            RawCommandResponse::with_document_and_address(address.clone(), reply),
            &StreamDescription::with_wire_version(17),
        )
        .unwrap();

    let mut get_more = GetMore::new(spec.info);
    let command = get_more
        .build(&StreamDescription::with_wire_version(17))
        .unwrap();
    assert_eq!(command.body.get_i64("getMore").unwrap(), 7);
    assert_eq!(command.body.get_str("collection").unwrap(), "test_coll");

    let criteria = get_more.selection_criteria().unwrap();
    assert!(!criteria.is_read_pref_primary());

    let reply = doc! {
        "ok": 1,
        "cursor": doc! { "id": 0_i64, "ns": "test_db.test_coll", "nextBatch": vec![doc! {}] },
    };
    let result = get_more
        .handle_response(response(reply), &StreamDescription::with_wire_version(17))
        .unwrap();
    assert!(result.exhausted);
    assert_eq!(result.batch.len(), 1);
}

#[test]
fn count_documents_pipeline() {
    let options = CountOptions::builder().skip(5).limit(10).build();
    let mut op = CountDocuments::new(ns(), doc! { "x": 1 }, Some(options)).unwrap();
    let description = StreamDescription::with_wire_version(17);
    let command = op.build(&description).unwrap();

    let pipeline = command.body.get_array("pipeline").unwrap();
    assert_eq!(
        pipeline,
        &vec![
            Bson::Document(doc! { "$match": doc! { "x": 1 } }),
            Bson::Document(doc! { "$skip": 5_i64 }),
            Bson::Document(doc! { "$limit": 10_i64 }),
            Bson::Document(doc! {
                "$group": doc! { "_id": 1, "n": doc! { "$sum": 1 } }
            }),
        ]
    );

    let empty = doc! {
        "ok": 1,
        "cursor": doc! { "id": 0_i64, "ns": "test_db.test_coll", "firstBatch": Vec::<Bson>::new() },
    };
    assert_eq!(op.handle_response(response(empty), &description).unwrap(), 0);

    let counted = doc! {
        "ok": 1,
        "cursor": doc! {
            "id": 0_i64,
            "ns": "test_db.test_coll",
            "firstBatch": vec![doc! { "_id": 1, "n": 4 }],
        },
    };
    assert_eq!(op.handle_response(response(counted), &description).unwrap(), 4);
}

#[test]
fn find_and_modify_returns_new_document() {
    let options = FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .upsert(true)
        .build();
    let mut op = FindAndModify::new(
        ns(),
        doc! { "x": 1 },
        Modification::Update(doc! { "$set": doc! { "y": 1 } }.into()),
        Some(options),
    );
    let description = StreamDescription::with_wire_version(17);
    let command = op.build(&description).unwrap();

    assert_eq!(command.body.get_bool("new").unwrap(), true);
    assert_eq!(command.body.get_bool("upsert").unwrap(), true);
    assert!(!command.body.contains_key("remove"));

    let reply = doc! { "ok": 1, "value": doc! { "x": 1, "y": 1 } };
    assert_eq!(
        op.handle_response(response(reply), &description).unwrap(),
        Some(doc! { "x": 1, "y": 1 })
    );

    let reply = doc! { "ok": 1, "value": Bson::Null };
    assert_eq!(op.handle_response(response(reply), &description).unwrap(), None);

    let reply = doc! {
        "ok": 1,
        "value": Bson::Null,
        "writeConcernError": doc! { "code": 100, "errmsg": "unsatisfiable" },
    };
    let error = op.handle_response(response(reply), &description).unwrap_err();
    assert!(matches!(
        *error.kind,
        ErrorKind::Write(WriteFailure::WriteConcernError(_))
    ));
}

#[test]
fn commit_retry_upgrades_write_concern() {
    let mut op = CommitTransaction::new(None, None);
    let description = StreamDescription::with_wire_version(17);
    let command = op.build(&description).unwrap();
    assert_eq!(command.target_db, "admin");
    assert!(!command.to_document().contains_key("writeConcern"));

    op.update_for_retry();
    let command = op.build(&description).unwrap();
    assert!(command.to_document().contains_key("writeConcern"));
    let write_concern = op.write_concern().unwrap();
    assert_eq!(write_concern.w, Some(Acknowledgment::Majority));
    assert_eq!(write_concern.w_timeout, Some(Duration::from_secs(10)));
}

#[test]
fn run_command_uses_first_key_as_name() {
    let mut op = RunCommand::new("admin".to_string(), doc! { "ping": 1 }, None).unwrap();
    let command = op.build(&StreamDescription::with_wire_version(17)).unwrap();
    assert_eq!(command.name, "ping");
    assert!(op.supports_sessions());

    let kill = RunCommand::new(
        "db".to_string(),
        doc! { "killCursors": "coll", "cursors": vec![1_i64] },
        None,
    )
    .unwrap();
    assert!(kill.supports_sessions());

    let end = RunCommand::new(
        "admin".to_string(),
        doc! { "endSessions": Vec::<Document>::new() },
        None,
    )
    .unwrap();
    assert!(!end.supports_sessions());

    let with_lsid = RunCommand::new(
        "db".to_string(),
        doc! { "killCursors": "coll", "cursors": vec![1_i64], "lsid": doc! { "id": 1 } },
        None,
    )
    .unwrap();
    assert!(!with_lsid.supports_sessions());

    assert!(RunCommand::new("db".to_string(), doc! {}, None).is_err());
}
