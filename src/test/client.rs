use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use pretty_assertions::assert_eq;

use super::{client_with_events, standalone_hello, MockReply, MockServer};
use crate::{
    bson::{doc, Bson},
    error::{ErrorKind, RETRYABLE_WRITE_ERROR},
    Client,
};

#[tokio::test]
async fn ended_sessions_are_reused_most_recent_first() {
    let server = MockServer::start().await;
    let client = Client::with_options(server.client_options()).unwrap();

    let s1 = client.start_session(None).await.unwrap();
    let s2 = client.start_session(None).await.unwrap();
    let (id1, id2) = (s1.id().clone(), s2.id().clone());
    assert_ne!(id1, id2);

    s1.end_session().await;
    s2.end_session().await;

    let first = client.start_session(None).await.unwrap();
    let second = client.start_session(None).await.unwrap();
    assert_eq!(first.id(), &id2);
    assert_eq!(second.id(), &id1);
}

#[tokio::test]
async fn implicit_session_is_attached_and_released() {
    let server = MockServer::start().await;
    let (client, events) = client_with_events(&server);
    let coll = client.database("db").collection("coll");

    coll.insert_one(doc! { "x": 1 }, None).await.unwrap();
    coll.insert_one(doc! { "x": 2 }, None).await.unwrap();

    let started = events.started("insert");
    assert_eq!(started.len(), 2);
    let lsid = started[0].command.get_document("lsid").unwrap();
    // The first operation's server session went back to the pool and was picked up again.
    assert_eq!(started[1].command.get_document("lsid").unwrap(), lsid);
    assert_eq!(client.pooled_session_ids(), vec![lsid.clone()]);
}

#[tokio::test]
async fn explicit_session_id_is_sent() {
    let server = MockServer::start().await;
    let (client, events) = client_with_events(&server);
    let coll = client.database("db").collection("coll");

    let mut session = client.start_session(None).await.unwrap();
    coll.delete_one_with_session(doc! { "x": 1 }, None, &mut session)
        .await
        .unwrap();

    let started = events.started("delete");
    assert_eq!(
        started[0].command.get_document("lsid").unwrap(),
        session.id()
    );
}

#[tokio::test]
async fn session_from_another_client_is_rejected() {
    let server = MockServer::start().await;
    let client = Client::with_options(server.client_options()).unwrap();
    let other = Client::with_options(server.client_options()).unwrap();

    let mut session = other.start_session(None).await.unwrap();
    let error = client
        .database("db")
        .collection("coll")
        .insert_one_with_session(doc! {}, None, &mut session)
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
}

#[tokio::test]
async fn shutdown_ends_pooled_sessions() {
    let server = MockServer::start().await;
    let client = Client::with_options(server.client_options()).unwrap();

    let s1 = client.start_session(None).await.unwrap();
    let s2 = client.start_session(None).await.unwrap();
    let mut ids = vec![s1.id().clone(), s2.id().clone()];
    drop(s1);
    drop(s2);

    client.shutdown().await;

    let end_sessions = server.received("endSessions");
    assert_eq!(end_sessions.len(), 1);
    let mut sent: Vec<_> = end_sessions[0]
        .get_array("endSessions")
        .unwrap()
        .iter()
        .filter_map(Bson::as_document)
        .cloned()
        .collect();
    let key = |doc: &crate::bson::Document| format!("{doc:?}");
    sent.sort_by_key(key);
    ids.sort_by_key(key);
    assert_eq!(sent, ids);
    assert_eq!(end_sessions[0].get_str("$db").unwrap(), "admin");
}

#[tokio::test]
async fn retryable_write_is_retried_once_with_the_same_txn_number() {
    let server = MockServer::start().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let handler_attempts = attempts.clone();
    server.set_handler(move |command| match command.first_key() {
        Some("insert") if handler_attempts.fetch_add(1, Ordering::SeqCst) == 0 => {
            MockReply::Close
        }
        Some("insert") => doc! { "n": 1, "ok": 1 }.into(),
        _ => doc! { "ok": 1 }.into(),
    });
    let (client, events) = client_with_events(&server);

    client
        .database("db")
        .collection("coll")
        .insert_one(doc! { "x": 1 }, None)
        .await
        .unwrap();

    let started = events.started("insert");
    assert_eq!(started.len(), 2);
    let txn_number = started[0].command.get_i64("txnNumber").unwrap();
    assert_eq!(started[1].command.get_i64("txnNumber").unwrap(), txn_number);
    assert_eq!(
        started[0].command.get_document("lsid").unwrap(),
        started[1].command.get_document("lsid").unwrap()
    );
    assert_eq!(events.failed("insert").len(), 1);
}

#[tokio::test]
async fn retryable_write_gives_up_after_second_failure() {
    let server = MockServer::start().await;
    server.set_handler(|command| match command.first_key() {
        Some("insert") => MockReply::Close,
        _ => doc! { "ok": 1 }.into(),
    });
    let (client, events) = client_with_events(&server);

    let error = client
        .database("db")
        .collection("coll")
        .insert_one(doc! { "x": 1 }, None)
        .await
        .unwrap_err();

    assert!(error.is_network_error());
    assert!(error.contains_label(RETRYABLE_WRITE_ERROR));
    assert_eq!(events.started("insert").len(), 2);
}

#[tokio::test]
async fn standalone_writes_are_not_retried() {
    let server = MockServer::with_hello(standalone_hello()).await;
    server.set_handler(|command| match command.first_key() {
        Some("insert") => MockReply::Close,
        _ => doc! { "ok": 1 }.into(),
    });
    let (client, events) = client_with_events(&server);

    let error = client
        .database("db")
        .collection("coll")
        .insert_one(doc! { "x": 1 }, None)
        .await
        .unwrap_err();

    assert!(error.is_network_error());
    let started = events.started("insert");
    assert_eq!(started.len(), 1);
    assert!(!started[0].command.contains_key("txnNumber"));
}

#[tokio::test]
async fn multi_document_writes_are_not_retried() {
    let server = MockServer::start().await;
    server.set_handler(|command| match command.first_key() {
        Some("delete") => MockReply::Close,
        _ => doc! { "ok": 1 }.into(),
    });
    let (client, events) = client_with_events(&server);

    client
        .database("db")
        .collection("coll")
        .delete_many(doc! {}, None)
        .await
        .unwrap_err();

    assert_eq!(events.started("delete").len(), 1);
}

#[tokio::test]
async fn cluster_time_is_gossiped() {
    let server = MockServer::start().await;
    let cluster_time = doc! {
        "clusterTime": crate::bson::Timestamp { time: 10, increment: 2 },
        "signature": doc! { "keyId": 0_i64 },
    };
    let reply_time = cluster_time.clone();
    server.set_handler(move |_| {
        doc! { "ok": 1, "n": 1, "$clusterTime": reply_time.clone() }.into()
    });
    let (client, events) = client_with_events(&server);
    let coll = client.database("db").collection("coll");

    coll.insert_one(doc! {}, None).await.unwrap();
    coll.insert_one(doc! {}, None).await.unwrap();

    let started = events.started("insert");
    assert!(!started[0].command.contains_key("$clusterTime"));
    assert_eq!(
        started[1].command.get_document("$clusterTime").unwrap(),
        &cluster_time
    );
}
