use std::{
    collections::VecDeque,
    future::Future,
    time::{Duration, Instant},
};

use derive_where::derive_where;
use tokio::sync::watch;

use super::{
    conn::{pooled::PooledConnection, PendingConnection},
    connection_requester::{
        self,
        CheckoutReceiver,
        CheckoutReply,
        CheckoutRequest,
        ConnectionRequester,
    },
    establish::ConnectionEstablisher,
    manager::{self, ManagementReceiver, PoolManagementRequest, PoolManager},
    options::ConnectionPoolOptions,
    CmapEventEmitter,
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    error::{Error, Result},
    event::cmap::{
        ConnectionCheckedInEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionCreatedEvent,
        ConnectionReadyEvent,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolReadyEvent,
    },
    options::ServerAddress,
    runtime::{self, WorkerHandleListener},
    sdam::TopologyUpdater,
};

const DEFAULT_MAX_CONNECTING: u32 = 2;
const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// What the worker hands back to a new [`ConnectionPool`](super::ConnectionPool).
pub(super) struct WorkerChannels {
    pub(super) manager: PoolManager,
    pub(super) requester: ConnectionRequester,
    pub(super) generation: watch::Receiver<u32>,
}

/// Size and age limits, resolved from the pool options.
#[derive(Debug)]
struct PoolLimits {
    /// `None` means unbounded.
    max_size: Option<u32>,
    min_size: Option<u32>,
    max_connecting: u32,
    max_idle_time: Option<Duration>,
}

impl PoolLimits {
    fn new(options: Option<&ConnectionPoolOptions>) -> Self {
        let max_size = match options.and_then(|o| o.max_pool_size) {
            Some(0) => None,
            Some(size) => Some(size),
            None => Some(DEFAULT_MAX_POOL_SIZE),
        };
        Self {
            max_size,
            min_size: options.and_then(|o| o.min_pool_size),
            max_connecting: options
                .and_then(|o| o.max_connecting)
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_CONNECTING),
            max_idle_time: options
                .and_then(|o| o.max_idle_time)
                .filter(|t| !t.is_zero()),
        }
    }
}

enum WorkerEvent {
    Management(PoolManagementRequest),
    Checkout(CheckoutRequest),
    Maintenance,
}

#[derive(Debug)]
enum PoolState {
    /// Never marked ready yet.
    New,

    /// Cleared, with the error that caused it.
    Paused(Error),

    Ready,
}

/// The task that owns a pool's connections. All bookkeeping happens here, so none of it needs a
/// lock; handles talk to it over channels.
#[derive_where(Debug)]
pub(super) struct ConnectionPoolWorker {
    address: ServerAddress,
    state: PoolState,
    limits: PoolLimits,

    /// Every connection the pool is responsible for, whether idle, lent out or still opening.
    total: u32,

    /// Connections still opening.
    establishing: u32,

    next_connection_id: u32,
    generation: watch::Sender<u32>,

    /// Idle connections. The most recently returned sits at the back.
    idle: VecDeque<PooledConnection>,

    wait_queue: VecDeque<CheckoutRequest>,
    establisher: ConnectionEstablisher,
    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,
    topology_updater: TopologyUpdater,
    manager: PoolManager,
    checkouts: CheckoutReceiver,
    management: ManagementReceiver,
    handles: WorkerHandleListener,
    maintenance_frequency: Duration,
}

impl ConnectionPoolWorker {
    /// Spawns the worker. It runs until every requester has been dropped.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        topology_updater: TopologyUpdater,
        event_emitter: CmapEventEmitter,
        options: Option<&ConnectionPoolOptions>,
    ) -> WorkerChannels {
        let (handle, handles) = WorkerHandleListener::channel();
        let (requester, checkouts) = connection_requester::channel(handle);
        let (manager, management) = manager::channel();
        let (generation, generation_receiver) = watch::channel(0);

        #[cfg(test)]
        let (state, maintenance_frequency) = (
            match options.and_then(|o| o.ready) {
                Some(true) => PoolState::Ready,
                _ => PoolState::New,
            },
            options
                .and_then(|o| o.maintenance_frequency)
                .unwrap_or(MAINTENANCE_FREQUENCY),
        );
        #[cfg(not(test))]
        let (state, maintenance_frequency) = (PoolState::New, MAINTENANCE_FREQUENCY);

        let worker = Self {
            address,
            state,
            limits: PoolLimits::new(options),
            total: 0,
            establishing: 0,
            next_connection_id: 1,
            generation,
            idle: VecDeque::new(),
            wait_queue: VecDeque::new(),
            establisher,
            event_emitter,
            topology_updater,
            manager: manager.clone(),
            checkouts,
            management,
            handles,
            maintenance_frequency,
        };
        runtime::execute(worker.run());

        WorkerChannels {
            manager,
            requester,
            generation: generation_receiver,
        }
    }

    async fn run(mut self) {
        let mut maintenance = runtime::interval(self.maintenance_frequency);

        loop {
            let event = tokio::select! {
                // Returned connections are taken back before new callers are queued.
                biased;

                Some(request) = self.management.recv() => WorkerEvent::Management(request),
                Some(request) = self.checkouts.recv() => WorkerEvent::Checkout(request),
                _ = self.handles.wait_for_all_handle_drops() => break,
                _ = maintenance.tick() => WorkerEvent::Maintenance,
                else => break,
            };
            match event {
                WorkerEvent::Management(request) => self.handle_management(request),
                WorkerEvent::Checkout(request) => self.enqueue(request),
                WorkerEvent::Maintenance => self.perform_maintenance(),
            }

            while self.can_serve_next() {
                let Some(request) = self.wait_queue.pop_front() else {
                    break;
                };
                self.serve(request);
            }
        }

        for connection in self.idle.drain(..) {
            connection.close(ConnectionClosedReason::PoolClosed);
        }
        self.event_emitter.emit_event(|| {
            PoolClosedEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    fn handle_management(&mut self, request: PoolManagementRequest) {
        match request {
            PoolManagementRequest::CheckIn(connection) => self.check_in(*connection),
            PoolManagementRequest::Clear(message) => {
                let (cause, acknowledger) = message.into_parts();
                self.clear(cause);
                acknowledger.acknowledge(());
            }
            PoolManagementRequest::MarkAsReady(message) => {
                self.mark_as_ready();
                message.into_parts().1.acknowledge(());
            }
            PoolManagementRequest::EstablishmentFailed => {
                self.total -= 1;
                self.establishing -= 1;
            }
            PoolManagementRequest::EstablishmentSucceeded(connection) => {
                self.establishing -= 1;
                if let Some(connection) = connection {
                    self.return_to_idle(*connection);
                }
            }
        }
    }

    fn enqueue(&mut self, request: CheckoutRequest) {
        let refusal = match &self.state {
            PoolState::Ready => {
                self.wait_queue.push_back(request);
                return;
            }
            PoolState::Paused(cause) => cause.clone(),
            PoolState::New => Error::internal("the connection pool has not been marked ready"),
        };
        // The caller may have timed out already.
        let _ = request.fulfill(CheckoutReply::PoolCleared(refusal));
    }

    fn current_generation(&self) -> u32 {
        *self.generation.borrow()
    }

    fn has_room(&self) -> bool {
        self.limits.max_size.is_none_or(|max| self.total < max)
    }

    fn can_serve_next(&self) -> bool {
        matches!(self.state, PoolState::Ready)
            && (!self.idle.is_empty()
                || (self.has_room() && self.establishing < self.limits.max_connecting))
    }

    fn serve(&mut self, request: CheckoutRequest) {
        while let Some(mut connection) = self.idle.pop_back() {
            if let Some(reason) = self.expiry_reason(&connection) {
                self.close(connection, reason);
                continue;
            }

            connection.lend(self.manager.clone());
            if let Err(CheckoutReply::Pooled(mut unclaimed)) =
                request.fulfill(CheckoutReply::Pooled(Box::new(connection)))
            {
                unclaimed.park();
                self.idle.push_back(*unclaimed);
            }
            return;
        }

        if !self.has_room() {
            self.wait_queue.push_front(request);
            return;
        }

        let establishing = self.begin_establishment();
        let manager = self.manager.clone();
        let task = runtime::spawn(async move {
            let mut connection = establishing.await?;
            connection.lend(manager.clone());
            manager.establishment_succeeded(None);
            Ok(connection)
        });
        // An abandoned connection is checked in once it finishes opening.
        let _ = request.fulfill(CheckoutReply::Establishing(task));
    }

    /// Why an idle connection can no longer be handed out, if it can't.
    fn expiry_reason(&self, connection: &PooledConnection) -> Option<ConnectionClosedReason> {
        if connection.is_stale(self.current_generation()) {
            Some(ConnectionClosedReason::Stale)
        } else if connection.has_errored() {
            Some(ConnectionClosedReason::Error)
        } else if connection.is_idle(self.limits.max_idle_time) {
            Some(ConnectionClosedReason::Idle)
        } else {
            None
        }
    }

    /// Reserves a slot for a new connection and returns the future that opens it.
    fn begin_establishment(
        &mut self,
    ) -> impl Future<Output = Result<PooledConnection>> + Send + 'static {
        self.total += 1;
        self.establishing += 1;

        let pending = PendingConnection {
            id: self.next_connection_id,
            address: self.address.clone(),
            generation: self.current_generation(),
            event_emitter: self.event_emitter.clone(),
            time_created: Instant::now(),
        };
        self.next_connection_id += 1;
        self.event_emitter.emit_event(|| {
            ConnectionCreatedEvent {
                address: pending.address.clone(),
                connection_id: pending.id,
            }
            .into()
        });

        establish(
            self.establisher.clone(),
            pending,
            self.topology_updater.clone(),
            self.manager.clone(),
            self.event_emitter.clone(),
        )
    }

    fn check_in(&mut self, connection: PooledConnection) {
        self.event_emitter.emit_event(|| {
            ConnectionCheckedInEvent {
                address: self.address.clone(),
                connection_id: connection.id,
            }
            .into()
        });

        if connection.has_errored() {
            self.close(connection, ConnectionClosedReason::Error);
        } else if connection.is_stale(self.current_generation()) {
            self.close(connection, ConnectionClosedReason::Stale);
        } else if connection.is_executing() {
            self.close(connection, ConnectionClosedReason::Dropped);
        } else {
            self.return_to_idle(connection);
        }
    }

    fn return_to_idle(&mut self, mut connection: PooledConnection) {
        if connection.is_stale(self.current_generation()) {
            self.close(connection, ConnectionClosedReason::Stale);
        } else {
            connection.park();
            self.idle.push_back(connection);
        }
    }

    fn clear(&mut self, cause: Error) {
        self.generation.send_modify(|generation| *generation += 1);
        let was_ready = matches!(self.state, PoolState::Ready);
        self.state = PoolState::Paused(cause.clone());
        if !was_ready {
            return;
        }

        self.event_emitter.emit_event(|| {
            PoolClearedEvent {
                address: self.address.clone(),
            }
            .into()
        });
        for request in self.wait_queue.drain(..) {
            let _ = request.fulfill(CheckoutReply::PoolCleared(cause.clone()));
        }
    }

    fn mark_as_ready(&mut self) {
        if matches!(self.state, PoolState::Ready) {
            return;
        }
        self.state = PoolState::Ready;
        self.event_emitter.emit_event(|| {
            PoolReadyEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    fn close(&mut self, connection: PooledConnection, reason: ConnectionClosedReason) {
        connection.close(reason);
        self.total -= 1;
    }

    fn perform_maintenance(&mut self) {
        // The oldest connections sit at the front, so the sweep stops at the first healthy one.
        while let Some(connection) = self.idle.pop_front() {
            match self.expiry_reason(&connection) {
                Some(reason) => self.close(connection, reason),
                None => {
                    self.idle.push_front(connection);
                    break;
                }
            }
        }

        if !matches!(self.state, PoolState::Ready) {
            return;
        }
        let Some(min_size) = self.limits.min_size else {
            return;
        };
        while self.total < min_size && self.establishing < self.limits.max_connecting {
            let establishing = self.begin_establishment();
            let manager = self.manager.clone();
            runtime::execute(async move {
                if let Ok(connection) = establishing.await {
                    manager.establishment_succeeded(Some(connection));
                }
            });
        }
    }
}

/// Opens a connection and reports failures to both the pool and the topology.
async fn establish(
    establisher: ConnectionEstablisher,
    pending: PendingConnection,
    topology_updater: TopologyUpdater,
    manager: PoolManager,
    event_emitter: CmapEventEmitter,
) -> Result<PooledConnection> {
    let connection_id = pending.id;
    let address = pending.address.clone();

    match establisher.establish_connection(pending).await {
        Ok(connection) => {
            event_emitter.emit_event(|| {
                ConnectionReadyEvent {
                    address: connection.address.clone(),
                    connection_id,
                    duration: connection.time_created.elapsed(),
                }
                .into()
            });
            Ok(connection)
        }
        Err(failure) => {
            event_emitter.emit_event(|| {
                ConnectionClosedEvent {
                    address: address.clone(),
                    connection_id,
                    reason: ConnectionClosedReason::Error,
                }
                .into()
            });
            topology_updater
                .handle_application_error(address, failure.cause.clone(), failure.handshake_phase)
                .await;
            manager.establishment_failed();
            Err(failure.cause)
        }
    }
}
