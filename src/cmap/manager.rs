use tokio::sync::mpsc;

use super::conn::pooled::PooledConnection;
use crate::{
    error::Error,
    runtime::{AcknowledgedMessage, Acknowledgment},
};

pub(super) type ManagementReceiver = mpsc::UnboundedReceiver<PoolManagementRequest>;

pub(super) fn channel() -> (PoolManager, ManagementReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (PoolManager { sender }, receiver)
}

/// Sends bookkeeping requests to the pool worker. Unlike a requester, a manager does not keep
/// the pool open, so checked-out connections can hold one.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    fn send(&self, request: PoolManagementRequest) {
        // A closed pool has nothing left to manage.
        let _ = self.sender.send(request);
    }

    /// Bumps the generation and pauses the pool.
    pub(super) fn clear(&self, cause: Error) -> Acknowledgment<()> {
        let (message, ack) = AcknowledgedMessage::package(cause);
        self.send(PoolManagementRequest::Clear(message));
        ack
    }

    pub(super) fn mark_as_ready(&self) -> Acknowledgment<()> {
        let (message, ack) = AcknowledgedMessage::package(());
        self.send(PoolManagementRequest::MarkAsReady(message));
        ack
    }

    /// Returns `connection` to the pool, or hands it back if the pool is gone.
    pub(crate) fn check_in(
        &self,
        connection: PooledConnection,
    ) -> std::result::Result<(), PooledConnection> {
        let request = PoolManagementRequest::CheckIn(Box::new(connection));
        match self.sender.send(request) {
            Err(mpsc::error::SendError(PoolManagementRequest::CheckIn(connection))) => {
                Err(*connection)
            }
            _ => Ok(()),
        }
    }

    pub(super) fn establishment_failed(&self) {
        self.send(PoolManagementRequest::EstablishmentFailed);
    }

    /// Reports a finished establishment. `connection` is set when it was opened to fill the
    /// pool rather than for a waiting caller.
    pub(super) fn establishment_succeeded(&self, connection: Option<PooledConnection>) {
        self.send(PoolManagementRequest::EstablishmentSucceeded(
            connection.map(Box::new),
        ));
    }
}

#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    Clear(AcknowledgedMessage<Error>),
    MarkAsReady(AcknowledgedMessage<()>),
    CheckIn(Box<PooledConnection>),
    EstablishmentFailed,
    EstablishmentSucceeded(Option<Box<PooledConnection>>),
}
