use std::{sync::Arc, time::Duration};

use derive_where::derive_where;

use crate::{
    client::options::ClientOptions,
    event::cmap::{self, CmapEventHandler},
};

/// The client options a pool needs, plus test hooks.
#[derive(Clone, Default)]
#[derive_where(Debug)]
pub(crate) struct ConnectionPoolOptions {
    #[derive_where(skip)]
    pub(crate) cmap_event_handler: Option<Arc<dyn CmapEventHandler>>,

    /// Zero or `None` keeps idle connections forever.
    pub(crate) max_idle_time: Option<Duration>,

    /// Counts checked out connections too. Zero means unbounded.
    pub(crate) max_pool_size: Option<u32>,

    /// Topped up by the worker's maintenance pass.
    pub(crate) min_pool_size: Option<u32>,

    pub(crate) max_connecting: Option<u32>,

    pub(crate) wait_queue_timeout: Option<Duration>,

    /// Start out ready instead of waiting for a monitor check.
    #[cfg(test)]
    pub(crate) ready: Option<bool>,

    #[cfg(test)]
    pub(crate) maintenance_frequency: Option<Duration>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            cmap_event_handler: options.cmap_event_handler.clone(),
            max_idle_time: options.max_idle_time,
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_connecting: options.max_connecting,
            wait_queue_timeout: options.wait_queue_timeout,
            ..Default::default()
        }
    }

    pub(crate) fn to_event_options(&self) -> cmap::ConnectionPoolOptions {
        cmap::ConnectionPoolOptions {
            max_idle_time: self.max_idle_time,
            max_pool_size: self.max_pool_size,
            min_pool_size: self.min_pool_size,
        }
    }
}
