use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use pretty_assertions::assert_eq;

use super::{client_with_events, standalone_hello, Event, MockReply, MockServer};
use crate::{
    bson::{doc, Bson, Document},
    error::{ErrorKind, UNKNOWN_TRANSACTION_COMMIT_RESULT},
    event::command::CommandEvent,
    options::{Acknowledgment, InsertOneOptions, TransactionOptions, WriteConcern},
};

fn recovery_token() -> Document {
    doc! { "recoveryShardId": "shard0" }
}

/// Acknowledges every write and hands out a recovery token the way a mongos does inside a
/// transaction.
fn acknowledge_with_token(command: &Document) -> MockReply {
    match command.first_key() {
        Some("insert") | Some("update") | Some("delete") => {
            doc! { "n": 1, "ok": 1, "recoveryToken": recovery_token() }.into()
        }
        _ => doc! { "ok": 1 }.into(),
    }
}

#[tokio::test]
async fn only_the_first_statement_starts_the_transaction() {
    let server = MockServer::start().await;
    server.set_handler(acknowledge_with_token);
    let (client, events) = client_with_events(&server);
    let coll = client.database("db").collection("coll");

    let mut session = client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();
    coll.insert_one_with_session(doc! { "x": 1 }, None, &mut session)
        .await
        .unwrap();
    coll.delete_one_with_session(doc! { "x": 1 }, None, &mut session)
        .await
        .unwrap();
    session.commit_transaction().await.unwrap();

    let insert = &events.started("insert")[0].command;
    let delete = &events.started("delete")[0].command;
    let commit = &events.started("commitTransaction")[0];

    assert_eq!(insert.get_bool("startTransaction"), Ok(true));
    assert!(!delete.contains_key("startTransaction"));
    assert!(!commit.command.contains_key("startTransaction"));
    for command in [insert, delete, &commit.command] {
        assert_eq!(command.get_bool("autocommit"), Ok(false));
        assert_eq!(command.get_i64("txnNumber"), Ok(1));
        assert_eq!(command.get_document("lsid").unwrap(), session.id());
        assert!(!command.contains_key("writeConcern"));
    }
    assert_eq!(commit.db, "admin");
    assert_eq!(
        commit.command.get_document("recoveryToken").unwrap(),
        &recovery_token()
    );
}

#[tokio::test]
async fn each_transaction_gets_a_new_txn_number() {
    let server = MockServer::start().await;
    server.set_handler(acknowledge_with_token);
    let (client, events) = client_with_events(&server);
    let coll = client.database("db").collection("coll");

    let mut session = client.start_session(None).await.unwrap();
    for _ in 0..2 {
        session.start_transaction(None).await.unwrap();
        coll.insert_one_with_session(doc! {}, None, &mut session)
            .await
            .unwrap();
        session.commit_transaction().await.unwrap();
    }

    let numbers: Vec<_> = events
        .started("commitTransaction")
        .iter()
        .map(|event| event.command.get_i64("txnNumber").unwrap())
        .collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[tokio::test]
async fn commit_is_retried_once_with_majority_write_concern() {
    let server = MockServer::start().await;
    let commits = Arc::new(AtomicUsize::new(0));
    let handler_commits = commits.clone();
    server.set_handler(move |command| match command.first_key() {
        Some("commitTransaction") if handler_commits.fetch_add(1, Ordering::SeqCst) == 0 => {
            MockReply::Close
        }
        _ => acknowledge_with_token(command),
    });
    let (client, events) = client_with_events(&server);

    let mut session = client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();
    client
        .database("db")
        .collection("coll")
        .insert_one_with_session(doc! {}, None, &mut session)
        .await
        .unwrap();
    session.commit_transaction().await.unwrap();

    let started = events.started("commitTransaction");
    assert_eq!(started.len(), 2);
    assert!(!started[0].command.contains_key("writeConcern"));
    assert_eq!(
        started[1].command.get_document("writeConcern").unwrap(),
        &doc! { "w": "majority", "wtimeout": 10_000_i64 }
    );
    for event in &started {
        assert_eq!(event.command.get_i64("txnNumber"), Ok(1));
        assert_eq!(
            event.command.get_document("recoveryToken").unwrap(),
            &recovery_token()
        );
    }
}

#[tokio::test]
async fn failed_commit_reports_unknown_result() {
    let server = MockServer::start().await;
    server.set_handler(|command| match command.first_key() {
        Some("commitTransaction") => MockReply::Close,
        _ => acknowledge_with_token(command),
    });
    let (client, events) = client_with_events(&server);

    let mut session = client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();
    client
        .database("db")
        .collection("coll")
        .insert_one_with_session(doc! {}, None, &mut session)
        .await
        .unwrap();
    let error = session.commit_transaction().await.unwrap_err();

    assert!(error.is_network_error());
    assert!(error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT));
    assert_eq!(events.started("commitTransaction").len(), 2);
}

#[tokio::test]
async fn repeated_commit_uses_majority_write_concern() {
    let server = MockServer::start().await;
    server.set_handler(acknowledge_with_token);
    let (client, events) = client_with_events(&server);

    let options = TransactionOptions::builder()
        .write_concern(WriteConcern::builder().w(Acknowledgment::Nodes(1)).build())
        .build();
    let mut session = client.start_session(None).await.unwrap();
    session.start_transaction(options).await.unwrap();
    client
        .database("db")
        .collection("coll")
        .insert_one_with_session(doc! {}, None, &mut session)
        .await
        .unwrap();
    session.commit_transaction().await.unwrap();
    session.commit_transaction().await.unwrap();

    let concerns: Vec<_> = events
        .started("commitTransaction")
        .iter()
        .map(|event| event.command.get_document("writeConcern").unwrap().clone())
        .collect();
    assert_eq!(
        concerns,
        vec![
            doc! { "w": 1 },
            doc! { "w": "majority", "wtimeout": 10_000_i64 },
        ]
    );
}

#[tokio::test]
async fn empty_transactions_never_reach_the_server() {
    let server = MockServer::start().await;
    let client = crate::Client::with_options(server.client_options()).unwrap();

    let mut session = client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();
    session.commit_transaction().await.unwrap();
    session.start_transaction(None).await.unwrap();
    session.abort_transaction().await.unwrap();

    assert!(server.received_names().is_empty());
}

#[tokio::test]
async fn abort_errors_are_swallowed() {
    let server = MockServer::start().await;
    server.set_handler(|command| match command.first_key() {
        Some("abortTransaction") => {
            doc! { "ok": 0, "code": 251, "codeName": "NoSuchTransaction", "errmsg": "gone" }
                .into()
        }
        _ => acknowledge_with_token(command),
    });
    let (client, events) = client_with_events(&server);

    let mut session = client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();
    client
        .database("db")
        .collection("coll")
        .insert_one_with_session(doc! {}, None, &mut session)
        .await
        .unwrap();
    session.abort_transaction().await.unwrap();

    assert_eq!(events.failed("abortTransaction").len(), 1);
    let error = session.abort_transaction().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));
}

#[tokio::test]
async fn transaction_state_errors() {
    let server = MockServer::start().await;
    server.set_handler(acknowledge_with_token);
    let client = crate::Client::with_options(server.client_options()).unwrap();
    let mut session = client.start_session(None).await.unwrap();

    let error = session.commit_transaction().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));

    session.start_transaction(None).await.unwrap();
    let error = session.start_transaction(None).await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));

    session.abort_transaction().await.unwrap();
    let error = session.commit_transaction().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));
}

#[tokio::test]
async fn operation_write_concern_is_rejected_in_a_transaction() {
    let server = MockServer::start().await;
    server.set_handler(acknowledge_with_token);
    let (client, events) = client_with_events(&server);

    let mut session = client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();
    let options = InsertOneOptions::builder()
        .write_concern(WriteConcern::majority())
        .build();
    let error = client
        .database("db")
        .collection("coll")
        .insert_one_with_session(doc! {}, options, &mut session)
        .await
        .unwrap_err();

    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
    assert!(events.started("insert").is_empty());
}

#[tokio::test]
async fn ending_a_session_aborts_its_transaction() {
    let server = MockServer::start().await;
    server.set_handler(acknowledge_with_token);
    let (client, events) = client_with_events(&server);

    let mut session = client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();
    client
        .database("db")
        .collection("coll")
        .insert_one_with_session(doc! {}, None, &mut session)
        .await
        .unwrap();
    let id = session.id().clone();
    session.end_session().await;

    let abort = &events.started("abortTransaction")[0].command;
    assert_eq!(abort.get_document("lsid").unwrap(), &id);
    assert_eq!(abort.get_bool("autocommit"), Ok(false));
    assert_eq!(abort.get_document("recoveryToken").unwrap(), &recovery_token());
}

#[tokio::test]
async fn dropping_a_session_aborts_its_transaction() {
    let server = MockServer::start().await;
    server.set_handler(acknowledge_with_token);
    let (client, events) = client_with_events(&server);

    let mut session = client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();
    client
        .database("db")
        .collection("coll")
        .insert_one_with_session(doc! {}, None, &mut session)
        .await
        .unwrap();
    drop(session);

    events
        .wait_for(Duration::from_secs(5), |event| {
            matches!(
                event,
                Event::Command(CommandEvent::Started(started))
                    if started.command_name == "abortTransaction"
            )
        })
        .await;
}

#[tokio::test]
async fn transactions_require_wire_version_seven() {
    let mut hello = standalone_hello();
    hello.insert("maxWireVersion", 6);
    let server = MockServer::with_hello(hello).await;
    let client = crate::Client::with_options(server.client_options()).unwrap();

    let mut session = client.start_session(None).await.unwrap();
    let error = session.start_transaction(None).await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));
}

#[tokio::test]
async fn statements_are_not_retried_inside_a_transaction() {
    let server = MockServer::start().await;
    server.set_handler(|command| match command.first_key() {
        Some("insert") => MockReply::Close,
        _ => doc! { "ok": 1 }.into(),
    });
    let (client, events) = client_with_events(&server);

    let mut session = client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();
    let error = client
        .database("db")
        .collection("coll")
        .insert_one_with_session(doc! {}, None, &mut session)
        .await
        .unwrap_err();

    assert!(error.contains_label(crate::error::TRANSIENT_TRANSACTION_ERROR));
    assert_eq!(events.started("insert").len(), 1);
    assert_eq!(
        events.started("insert")[0].command.get("txnNumber"),
        Some(&Bson::Int64(1))
    );
}

#[tokio::test]
async fn sharded_transactions_stay_on_one_mongos() {
    let routers = [MockServer::start().await, MockServer::start().await];
    for router in &routers {
        router.set_handler(acknowledge_with_token);
    }
    let mut options = routers[0].client_options();
    options.hosts = routers.iter().map(|router| router.address().clone()).collect();
    options.direct_connection = None;
    let client = crate::Client::with_options(options).unwrap();
    let coll = client.database("db").collection("coll");

    let counts = |name: &str| routers.each_ref().map(|router| router.received(name).len());
    let mut session = client.start_session(None).await.unwrap();
    let mut used = [false; 2];
    for _ in 0..40 {
        let (inserts, commits) = (counts("insert"), counts("commitTransaction"));
        session.start_transaction(None).await.unwrap();
        for x in 0..3 {
            coll.insert_one_with_session(doc! { "x": x }, None, &mut session)
                .await
                .unwrap();
        }
        session.commit_transaction().await.unwrap();

        let (new_inserts, new_commits) = (counts("insert"), counts("commitTransaction"));
        let pinned = if new_inserts[0] > inserts[0] { 0 } else { 1 };
        assert_eq!(new_inserts[pinned] - inserts[pinned], 3);
        assert_eq!(new_commits[pinned] - commits[pinned], 1);
        assert_eq!(new_inserts[1 - pinned], inserts[1 - pinned]);
        assert_eq!(new_commits[1 - pinned], commits[1 - pinned]);
        used[pinned] = true;
        if used == [true, true] {
            break;
        }
    }
    assert_eq!(used, [true, true]);
}

/// A session parked in a task when its runtime shuts down is dropped from inside the shutdown.
/// The abort it schedules then can never run, and dropping that abort must only return the
/// server session to the pool.
#[test]
fn runtime_shutdown_with_a_transaction_in_progress() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let server = MockServer::start().await;
        server.set_handler(acknowledge_with_token);
        let client = crate::Client::with_options(server.client_options()).unwrap();

        let mut session = client.start_session(None).await.unwrap();
        session.start_transaction(None).await.unwrap();
        client
            .database("db")
            .collection("coll")
            .insert_one_with_session(doc! {}, None, &mut session)
            .await
            .unwrap();
        assert!(session.in_transaction());

        tokio::spawn(async move {
            let _session = session;
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;
    });
    drop(runtime);
}
