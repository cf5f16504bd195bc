use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::Notify;

use crate::{
    event::{
        cmap::*,
        command::{
            CommandEvent,
            CommandEventHandler,
            CommandFailedEvent,
            CommandStartedEvent,
            CommandSucceededEvent,
        },
        sdam::*,
    },
    options::ClientOptions,
    runtime,
    Client,
};

#[derive(Clone, Debug)]
pub(crate) enum Event {
    Command(CommandEvent),
    Cmap(CmapEvent),
    Sdam(SdamEvent),
}

/// Records every event a `Client` emits, in order, so tests can assert on what was sent.
#[derive(Clone, Debug, Default)]
pub(crate) struct EventCollector {
    inner: Arc<EventCollectorInner>,
}

#[derive(Debug, Default)]
struct EventCollectorInner {
    events: Mutex<Vec<Event>>,
    event_received: Notify,
}

impl EventCollector {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Registers this collector for all three kinds of events on `options`.
    pub(crate) fn register(&self, options: &mut ClientOptions) {
        options.command_event_handler = Some(Arc::new(self.clone()));
        options.cmap_event_handler = Some(Arc::new(self.clone()));
        options.sdam_event_handler = Some(Arc::new(self.clone()));
    }

    fn push(&self, event: Event) {
        self.inner.events.lock().unwrap().push(event);
        self.inner.event_received.notify_waiters();
    }

    pub(crate) fn filter_map<R>(&self, f: impl Fn(&Event) -> Option<R>) -> Vec<R> {
        self.inner.events.lock().unwrap().iter().filter_map(f).collect()
    }

    pub(crate) fn clear(&self) {
        self.inner.events.lock().unwrap().clear();
    }

    /// The started events of commands named `name`, excluding handshakes and heartbeats.
    pub(crate) fn started(&self, name: &str) -> Vec<CommandStartedEvent> {
        self.filter_map(|event| match event {
            Event::Command(CommandEvent::Started(started)) if started.command_name == name => {
                Some(started.clone())
            }
            _ => None,
        })
    }

    pub(crate) fn succeeded(&self, name: &str) -> Vec<CommandSucceededEvent> {
        self.filter_map(|event| match event {
            Event::Command(CommandEvent::Succeeded(succeeded))
                if succeeded.command_name == name =>
            {
                Some(succeeded.clone())
            }
            _ => None,
        })
    }

    pub(crate) fn failed(&self, name: &str) -> Vec<CommandFailedEvent> {
        self.filter_map(|event| match event {
            Event::Command(CommandEvent::Failed(failed)) if failed.command_name == name => {
                Some(failed.clone())
            }
            _ => None,
        })
    }

    pub(crate) fn cmap_events(&self) -> Vec<CmapEvent> {
        self.filter_map(|event| match event {
            Event::Cmap(event) => Some(event.clone()),
            _ => None,
        })
    }

    pub(crate) fn sdam_events(&self) -> Vec<SdamEvent> {
        self.filter_map(|event| match event {
            Event::Sdam(event) => Some(event.clone()),
            _ => None,
        })
    }

    /// Waits until an event matching `predicate` has been recorded, failing the test after
    /// `timeout`.
    pub(crate) async fn wait_for(&self, timeout: Duration, predicate: impl Fn(&Event) -> bool) {
        let wait = async {
            loop {
                let notified = self.inner.event_received.notified();
                if self.inner.events.lock().unwrap().iter().any(&predicate) {
                    return;
                }
                notified.await;
            }
        };
        if runtime::timeout(timeout, wait).await.is_err() {
            panic!("timed out waiting for event; saw {:#?}", self.inner.events.lock().unwrap());
        }
    }
}

impl CommandEventHandler for EventCollector {
    fn handle_command_started_event(&self, event: CommandStartedEvent) {
        self.push(Event::Command(CommandEvent::Started(event)));
    }

    fn handle_command_succeeded_event(&self, event: CommandSucceededEvent) {
        self.push(Event::Command(CommandEvent::Succeeded(event)));
    }

    fn handle_command_failed_event(&self, event: CommandFailedEvent) {
        self.push(Event::Command(CommandEvent::Failed(event)));
    }
}

impl CmapEventHandler for EventCollector {
    fn handle_pool_created_event(&self, event: PoolCreatedEvent) {
        self.push(Event::Cmap(CmapEvent::PoolCreated(event)));
    }

    fn handle_pool_ready_event(&self, event: PoolReadyEvent) {
        self.push(Event::Cmap(CmapEvent::PoolReady(event)));
    }

    fn handle_pool_cleared_event(&self, event: PoolClearedEvent) {
        self.push(Event::Cmap(CmapEvent::PoolCleared(event)));
    }

    fn handle_pool_closed_event(&self, event: PoolClosedEvent) {
        self.push(Event::Cmap(CmapEvent::PoolClosed(event)));
    }

    fn handle_connection_created_event(&self, event: ConnectionCreatedEvent) {
        self.push(Event::Cmap(CmapEvent::ConnectionCreated(event)));
    }

    fn handle_connection_ready_event(&self, event: ConnectionReadyEvent) {
        self.push(Event::Cmap(CmapEvent::ConnectionReady(event)));
    }

    fn handle_connection_closed_event(&self, event: ConnectionClosedEvent) {
        self.push(Event::Cmap(CmapEvent::ConnectionClosed(event)));
    }

    fn handle_connection_checkout_started_event(&self, event: ConnectionCheckoutStartedEvent) {
        self.push(Event::Cmap(CmapEvent::ConnectionCheckoutStarted(event)));
    }

    fn handle_connection_checkout_failed_event(&self, event: ConnectionCheckoutFailedEvent) {
        self.push(Event::Cmap(CmapEvent::ConnectionCheckoutFailed(event)));
    }

    fn handle_connection_checked_out_event(&self, event: ConnectionCheckedOutEvent) {
        self.push(Event::Cmap(CmapEvent::ConnectionCheckedOut(event)));
    }

    fn handle_connection_checked_in_event(&self, event: ConnectionCheckedInEvent) {
        self.push(Event::Cmap(CmapEvent::ConnectionCheckedIn(event)));
    }
}

impl SdamEventHandler for EventCollector {
    fn handle_server_description_changed_event(&self, event: ServerDescriptionChangedEvent) {
        self.push(Event::Sdam(SdamEvent::ServerDescriptionChanged(Box::new(
            event,
        ))));
    }

    fn handle_server_opening_event(&self, event: ServerOpeningEvent) {
        self.push(Event::Sdam(SdamEvent::ServerOpening(event)));
    }

    fn handle_server_closed_event(&self, event: ServerClosedEvent) {
        self.push(Event::Sdam(SdamEvent::ServerClosed(event)));
    }

    fn handle_topology_description_changed_event(&self, event: TopologyDescriptionChangedEvent) {
        self.push(Event::Sdam(SdamEvent::TopologyDescriptionChanged(Box::new(
            event,
        ))));
    }

    fn handle_topology_opening_event(&self, event: TopologyOpeningEvent) {
        self.push(Event::Sdam(SdamEvent::TopologyOpening(event)));
    }

    fn handle_topology_closed_event(&self, event: TopologyClosedEvent) {
        self.push(Event::Sdam(SdamEvent::TopologyClosed(event)));
    }

    fn handle_server_heartbeat_started_event(&self, event: ServerHeartbeatStartedEvent) {
        self.push(Event::Sdam(SdamEvent::ServerHeartbeatStarted(event)));
    }

    fn handle_server_heartbeat_succeeded_event(&self, event: ServerHeartbeatSucceededEvent) {
        self.push(Event::Sdam(SdamEvent::ServerHeartbeatSucceeded(event)));
    }

    fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {
        self.push(Event::Sdam(SdamEvent::ServerHeartbeatFailed(event)));
    }
}

/// A client connected to `server` whose events are recorded by the returned collector.
pub(crate) fn client_with_events(server: &super::MockServer) -> (Client, EventCollector) {
    let events = EventCollector::new();
    let mut options = server.client_options();
    events.register(&mut options);
    (Client::with_options(options).unwrap(), events)
}
