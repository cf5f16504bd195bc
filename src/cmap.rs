#[cfg(test)]
mod test;

pub(crate) mod conn;
mod connection_requester;
pub(crate) mod establish;
pub(crate) mod manager;
pub(crate) mod options;
mod worker;

use std::time::{Duration, Instant};

use derive_where::derive_where;
use tokio::sync::watch;

pub use self::conn::ConnectionInfo;
use self::{
    conn::pooled::PooledConnection,
    connection_requester::{CheckoutReply, ConnectionRequester},
    establish::ConnectionEstablisher,
    manager::PoolManager,
    options::ConnectionPoolOptions,
    worker::{ConnectionPoolWorker, WorkerChannels},
};
pub(crate) use self::conn::{Command, Connection, RawCommandResponse, StreamDescription};
pub(crate) use crate::event::cmap::CmapEventEmitter;
use crate::{
    bson::oid::ObjectId,
    error::{Error, ErrorKind, Result},
    event::cmap::{
        ConnectionCheckedOutEvent,
        ConnectionCheckoutFailedEvent,
        ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent,
        PoolCreatedEvent,
    },
    options::ServerAddress,
    runtime,
    sdam::TopologyUpdater,
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// Handle to the pool of one server. The connections live in a background worker, which shuts
/// down when the last handle is dropped.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    requester: ConnectionRequester,
    generation: watch::Receiver<u32>,
    wait_queue_timeout: Option<Duration>,

    #[derive_where(skip)]
    events: CmapEventEmitter,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        updater: TopologyUpdater,
        topology_id: ObjectId,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let options = options.unwrap_or_default();
        let events = CmapEventEmitter::new(options.cmap_event_handler.clone(), topology_id);
        let WorkerChannels {
            manager,
            requester,
            generation,
        } = ConnectionPoolWorker::start(
            address.clone(),
            establisher,
            updater,
            events.clone(),
            Some(&options),
        );

        events.emit_event(|| {
            PoolCreatedEvent {
                address: address.clone(),
                options: Some(options.to_event_options()),
            }
            .into()
        });

        Self {
            address,
            manager,
            requester,
            generation,
            wait_queue_timeout: options.wait_queue_timeout,
            events,
        }
    }

    /// Waits in the pool's queue for an idle connection or a new one, for at most the wait queue
    /// timeout.
    pub(crate) async fn check_out(&self) -> Result<PooledConnection> {
        let started = Instant::now();
        self.events.emit_event(|| {
            ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        match self.wait_for_connection().await {
            Ok(conn) => {
                self.events.emit_event(|| {
                    ConnectionCheckedOutEvent {
                        address: self.address.clone(),
                        connection_id: conn.id,
                        duration: started.elapsed(),
                    }
                    .into()
                });
                Ok(conn)
            }
            Err((reason, error)) => {
                self.events.emit_event(|| {
                    ConnectionCheckoutFailedEvent {
                        address: self.address.clone(),
                        reason,
                        duration: started.elapsed(),
                    }
                    .into()
                });
                Err(error)
            }
        }
    }

    async fn wait_for_connection(
        &self,
    ) -> std::result::Result<PooledConnection, (ConnectionCheckoutFailedReason, Error)> {
        use ConnectionCheckoutFailedReason::{ConnectionError, PoolClosed, Timeout};

        let request = self.requester.request();
        let reply = match self.wait_queue_timeout {
            Some(timeout) => runtime::timeout(timeout, request).await.map_err(|_| {
                let error = ErrorKind::WaitQueueTimeout {
                    address: self.address.clone(),
                };
                (Timeout, error.into())
            })?,
            None => request.await,
        };

        match reply.map_err(|error| (PoolClosed, error))? {
            CheckoutReply::Pooled(conn) => Ok(*conn),
            CheckoutReply::Establishing(task) => task
                .await
                .and_then(std::convert::identity)
                .map_err(|error| (ConnectionError, error)),
            CheckoutReply::PoolCleared(cause) => Err((
                PoolClosed,
                Error::pool_cleared_error(&self.address, &cause),
            )),
        }
    }

    /// Starts a new generation and pauses the pool. The worker closes older connections as it
    /// comes across them.
    pub(crate) async fn clear(&self, cause: Error) {
        self.manager.clear(cause).wait().await;
    }

    /// Lets connections be created and checked out again.
    pub(crate) async fn mark_as_ready(&self) {
        self.manager.mark_as_ready().wait().await;
    }

    pub(crate) fn generation(&self) -> u32 {
        *self.generation.borrow()
    }
}
