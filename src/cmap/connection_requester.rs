use tokio::sync::{mpsc, oneshot};

use super::conn::pooled::PooledConnection;
use crate::{
    error::{Error, Result},
    runtime::{AsyncJoinHandle, WorkerHandle},
};

pub(super) type CheckoutReceiver = mpsc::UnboundedReceiver<CheckoutRequest>;

pub(super) fn channel(handle: WorkerHandle) -> (ConnectionRequester, CheckoutReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let requester = ConnectionRequester {
        sender,
        _worker: handle,
    };
    (requester, receiver)
}

/// Asks the pool worker for connections. Every requester keeps the worker alive; the pool closes
/// once the last one is dropped.
#[derive(Clone, Debug)]
pub(super) struct ConnectionRequester {
    sender: mpsc::UnboundedSender<CheckoutRequest>,
    _worker: WorkerHandle,
}

impl ConnectionRequester {
    /// Joins the wait queue and resolves once the worker has answered.
    pub(super) async fn request(&self) -> Result<CheckoutReply> {
        let (reply_to, reply) = oneshot::channel();
        self.sender
            .send(CheckoutRequest { reply_to })
            .map_err(|_| Error::internal("connection pool worker is no longer running"))?;
        reply
            .await
            .map_err(|_| Error::internal("connection pool worker dropped a checkout request"))
    }
}

/// A caller waiting in the pool's queue.
#[derive(Debug)]
pub(super) struct CheckoutRequest {
    reply_to: oneshot::Sender<CheckoutReply>,
}

impl CheckoutRequest {
    /// Answers the caller. If it has stopped waiting, the reply is handed back.
    pub(super) fn fulfill(self, reply: CheckoutReply) -> std::result::Result<(), CheckoutReply> {
        self.reply_to.send(reply)
    }
}

#[derive(Debug)]
pub(super) enum CheckoutReply {
    /// An idle connection taken from the pool.
    Pooled(Box<PooledConnection>),

    /// A connection being opened for this caller.
    Establishing(AsyncJoinHandle<Result<PooledConnection>>),

    /// The pool was cleared or is not ready yet.
    PoolCleared(Error),
}
