mod description;
mod monitor;
pub mod public;
mod server;
mod topology;

pub use self::public::{ServerInfo, ServerType, TopologyType};

pub use self::description::{server::ServerDescription, topology::TopologyDescription};
pub(crate) use self::{
    description::topology::{verify_max_staleness, SessionSupportStatus, TransactionSupportStatus},
    monitor::{DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    topology::{HandshakePhase, Topology, TopologyUpdater},
};
#[cfg(test)]
pub(crate) use self::topology::TopologyUpdateReceiver;
