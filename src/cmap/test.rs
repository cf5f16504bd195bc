use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use super::{establish::ConnectionEstablisher, options::ConnectionPoolOptions, ConnectionPool};
use crate::{
    bson::oid::ObjectId,
    error::{Error, ErrorKind},
    event::cmap::{
        CmapEvent,
        ConnectionCheckoutFailedReason,
        ConnectionClosedReason,
    },
    sdam::{TopologyUpdateReceiver, TopologyUpdater},
    test::{Event, EventCollector, MockServer},
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A ready pool to `server`. The returned receiver has to stay alive for the pool to report
/// establishment failures.
fn pool(
    server: &MockServer,
    events: &EventCollector,
    configure: impl FnOnce(&mut ConnectionPoolOptions),
) -> (ConnectionPool, TopologyUpdateReceiver) {
    let mut options = ConnectionPoolOptions {
        cmap_event_handler: Some(Arc::new(events.clone())),
        ready: Some(true),
        ..Default::default()
    };
    configure(&mut options);

    let establisher = ConnectionEstablisher::new(&server.client_options()).unwrap();
    let (updater, receiver) = TopologyUpdater::channel();
    let pool = ConnectionPool::new(
        server.address().clone(),
        establisher,
        updater,
        ObjectId::new(),
        Some(options),
    );
    (pool, receiver)
}

fn event_name(event: &CmapEvent) -> &'static str {
    match event {
        CmapEvent::PoolCreated(_) => "PoolCreated",
        CmapEvent::PoolReady(_) => "PoolReady",
        CmapEvent::PoolCleared(_) => "PoolCleared",
        CmapEvent::PoolClosed(_) => "PoolClosed",
        CmapEvent::ConnectionCreated(_) => "ConnectionCreated",
        CmapEvent::ConnectionReady(_) => "ConnectionReady",
        CmapEvent::ConnectionClosed(_) => "ConnectionClosed",
        CmapEvent::ConnectionCheckoutStarted(_) => "ConnectionCheckoutStarted",
        CmapEvent::ConnectionCheckoutFailed(_) => "ConnectionCheckoutFailed",
        CmapEvent::ConnectionCheckedOut(_) => "ConnectionCheckedOut",
        CmapEvent::ConnectionCheckedIn(_) => "ConnectionCheckedIn",
    }
}

fn checked_in(event: &Event) -> bool {
    matches!(event, Event::Cmap(CmapEvent::ConnectionCheckedIn(_)))
}

#[tokio::test]
async fn check_out_and_check_in() {
    let server = MockServer::start().await;
    let events = EventCollector::new();
    let (pool, _receiver) = pool(&server, &events, |_| {});

    let conn = pool.check_out().await.unwrap();
    let id = conn.id;
    drop(conn);
    events.wait_for(EVENT_TIMEOUT, checked_in).await;

    let names: Vec<_> = events.cmap_events().iter().map(event_name).collect();
    assert_eq!(
        names,
        vec![
            "PoolCreated",
            "ConnectionCheckoutStarted",
            "ConnectionCreated",
            "ConnectionReady",
            "ConnectionCheckedOut",
            "ConnectionCheckedIn",
        ]
    );

    // The idle connection is handed out again instead of a new one being established.
    let conn = pool.check_out().await.unwrap();
    assert_eq!(conn.id, id);
    let created = events
        .cmap_events()
        .into_iter()
        .filter(|event| matches!(event, CmapEvent::ConnectionCreated(_)))
        .count();
    assert_eq!(created, 1);
}

#[tokio::test]
async fn wait_queue_times_out_when_the_pool_is_full() {
    let server = MockServer::start().await;
    let events = EventCollector::new();
    let (pool, _receiver) = pool(&server, &events, |options| {
        options.max_pool_size = Some(1);
        options.wait_queue_timeout = Some(Duration::from_millis(100));
    });

    let held = pool.check_out().await.unwrap();
    let error = pool.check_out().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::WaitQueueTimeout { .. }));

    let reasons: Vec<_> = events.filter_map(|event| match event {
        Event::Cmap(CmapEvent::ConnectionCheckoutFailed(failed)) => Some(failed.reason),
        _ => None,
    });
    assert_eq!(reasons, vec![ConnectionCheckoutFailedReason::Timeout]);

    // Returning the held connection unblocks later checkouts.
    drop(held);
    events.wait_for(EVENT_TIMEOUT, checked_in).await;
    pool.check_out().await.unwrap();
}

#[tokio::test]
async fn waiters_are_served_when_a_connection_is_returned() {
    let server = MockServer::start().await;
    let events = EventCollector::new();
    let (pool, _receiver) = pool(&server, &events, |options| {
        options.max_pool_size = Some(1);
    });

    let held = pool.check_out().await.unwrap();
    let id = held.id;
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.check_out().await.map(|conn| conn.id) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(held);

    assert_eq!(waiter.await.unwrap().unwrap(), id);
}

#[tokio::test]
async fn clearing_pauses_the_pool_and_closes_stale_connections() {
    let server = MockServer::start().await;
    let events = EventCollector::new();
    let (pool, _receiver) = pool(&server, &events, |_| {});

    let conn = pool.check_out().await.unwrap();
    assert_eq!(pool.generation(), 0);

    pool.clear(Error::internal("server went away")).await;
    assert_eq!(pool.generation(), 1);
    assert!(events
        .cmap_events()
        .iter()
        .any(|event| matches!(event, CmapEvent::PoolCleared(_))));

    let error = pool.check_out().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::ConnectionPoolCleared { .. }));

    drop(conn);
    events
        .wait_for(EVENT_TIMEOUT, |event| {
            matches!(
                event,
                Event::Cmap(CmapEvent::ConnectionClosed(closed))
                    if closed.reason == ConnectionClosedReason::Stale
            )
        })
        .await;

    pool.mark_as_ready().await;
    let conn = pool.check_out().await.unwrap();
    assert_eq!(conn.generation, 1);
}

#[tokio::test]
async fn maintenance_fills_the_pool_to_its_minimum() {
    let server = MockServer::start().await;
    let events = EventCollector::new();
    let (_pool, _receiver) = pool(&server, &events, |options| {
        options.min_pool_size = Some(2);
        options.maintenance_frequency = Some(Duration::from_millis(10));
    });

    let filled = async {
        while events_ready_count(&events) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(EVENT_TIMEOUT, filled).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(events_ready_count(&events), 2);
}

fn events_ready_count(events: &EventCollector) -> usize {
    events
        .cmap_events()
        .iter()
        .filter(|event| matches!(event, CmapEvent::ConnectionReady(_)))
        .count()
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let server = MockServer::start().await;
    let events = EventCollector::new();
    let (pool, _receiver) = pool(&server, &events, |options| {
        options.max_idle_time = Some(Duration::from_millis(20));
        options.maintenance_frequency = Some(Duration::from_millis(10));
    });

    drop(pool.check_out().await.unwrap());
    events
        .wait_for(EVENT_TIMEOUT, |event| {
            matches!(
                event,
                Event::Cmap(CmapEvent::ConnectionClosed(closed))
                    if closed.reason == ConnectionClosedReason::Idle
            )
        })
        .await;
}
