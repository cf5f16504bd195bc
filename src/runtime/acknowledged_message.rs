use tokio::sync::oneshot;

/// A message for a background worker. Whoever sent it can wait until the worker has handled it.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    message: M,
    acknowledger: Acknowledger<R>,
}

impl<M, R> AcknowledgedMessage<M, R> {
    pub(crate) fn package(message: M) -> (Self, Acknowledgment<R>) {
        let (sender, receiver) = oneshot::channel();
        let packaged = Self {
            message,
            acknowledger: Acknowledger(sender),
        };
        (packaged, Acknowledgment(receiver))
    }

    pub(crate) fn into_parts(self) -> (M, Acknowledger<R>) {
        (self.message, self.acknowledger)
    }
}

/// The worker's half: reports that a message was handled.
#[derive(Debug)]
pub(crate) struct Acknowledger<R>(oneshot::Sender<R>);

impl<R> Acknowledger<R> {
    pub(crate) fn acknowledge(self, result: R) {
        // The sender may have given up waiting.
        let _ = self.0.send(result);
    }
}

/// The sender's half.
#[derive(Debug)]
pub(crate) struct Acknowledgment<R>(oneshot::Receiver<R>);

impl<R> Acknowledgment<R> {
    /// Resolves to `None` if the worker dropped the message without handling it.
    pub(crate) async fn wait(self) -> Option<R> {
        self.0.await.ok()
    }
}
