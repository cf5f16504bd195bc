use tokio::sync::mpsc;

/// Keeps a background worker (a connection pool or topology worker) running. The worker shuts
/// itself down once every clone of its handle has been dropped.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    _alive: mpsc::Sender<()>,
}

/// The worker's end of a [`WorkerHandle`].
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    receiver: mpsc::Receiver<()>,
}

impl WorkerHandleListener {
    /// Creates a connected handle/listener pair.
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (sender, receiver) = mpsc::channel(1);
        (
            WorkerHandle { _alive: sender },
            WorkerHandleListener { receiver },
        )
    }

    /// Resolves once no handles remain. Nothing is ever sent on the channel, so this only
    /// completes on disconnection; poll it from a `select!`.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        self.receiver.recv().await;
    }
}
