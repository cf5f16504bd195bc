//! Thin wrappers over tokio for spawning, sleeping and timeouts.

mod acknowledged_message;
mod join_handle;
pub(crate) mod stream;
#[cfg(feature = "rustls-tls")]
mod tls;
mod worker_handle;

use std::{future::Future, io, time::Duration};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, Acknowledgment},
    join_handle::AsyncJoinHandle,
    stream::AsyncStream,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::error::Result;

#[cfg(feature = "rustls-tls")]
pub(crate) use tls::TlsConfig;

/// Stands in for the TLS configuration when TLS is compiled out. Every attempt to build one
/// fails, so TLS options are rejected when the client is created.
#[cfg(not(feature = "rustls-tls"))]
#[derive(Clone, Debug)]
pub(crate) struct TlsConfig {
    _private: (),
}

#[cfg(not(feature = "rustls-tls"))]
impl TlsConfig {
    pub(crate) fn new(_options: crate::options::TlsOptions) -> Result<TlsConfig> {
        Err(crate::error::ErrorKind::InvalidTlsConfig {
            message: "TLS was requested but the rustls-tls feature is disabled".to_string(),
        }
        .into())
    }
}

/// Runs `future` as a task on the current runtime. Panics outside of one.
pub(crate) fn spawn<F>(future: F) -> AsyncJoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    AsyncJoinHandle::spawn(future)
}

/// Like [`spawn`], for tasks nobody waits on.
pub(crate) fn execute<F>(future: F)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let _detached = spawn(future);
}

/// Spawns the future `make` builds when a runtime is current, and returns whether it did. `Drop`
/// impls use this since they can run after the runtime is gone.
pub(crate) fn try_execute<F>(make: impl FnOnce() -> F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return false;
    };
    let _detached = runtime.spawn(make());
    true
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

/// Fails with a `TimedOut` I/O error when `future` takes longer than `limit`.
pub(crate) async fn timeout<F: Future>(limit: Duration, future: F) -> Result<F::Output> {
    match tokio::time::timeout(limit, future).await {
        Ok(output) => Ok(output),
        Err(_elapsed) => Err(io::Error::from(io::ErrorKind::TimedOut).into()),
    }
}

pub(crate) fn interval(period: Duration) -> tokio::time::Interval {
    tokio::time::interval(period)
}
