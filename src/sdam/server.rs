use std::sync::Arc;

use crate::{
    bson::oid::ObjectId,
    cmap::{establish::ConnectionEstablisher, options::ConnectionPoolOptions, ConnectionPool},
    options::{ClientOptions, ServerAddress},
    sdam::TopologyUpdater,
};

/// A known member of the topology. Owns the pool operations check connections out of.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,
    pub(crate) pool: ConnectionPool,
}

impl Server {
    pub(crate) fn new(
        address: ServerAddress,
        options: &ClientOptions,
        establisher: ConnectionEstablisher,
        updater: TopologyUpdater,
        topology_id: ObjectId,
    ) -> Arc<Self> {
        let pool_options = ConnectionPoolOptions::from_client_options(options);
        Arc::new(Self {
            pool: ConnectionPool::new(
                address.clone(),
                establisher,
                updater,
                topology_id,
                Some(pool_options),
            ),
            address,
        })
    }
}
