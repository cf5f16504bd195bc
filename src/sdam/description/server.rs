use std::time::Duration;

use crate::{
    bson::{oid::ObjectId, DateTime},
    client::session::ClusterTime,
    error::{Error, Result},
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
};

const DRIVER_MIN_DB_VERSION: &str = "2.6";
const DRIVER_MIN_WIRE_VERSION: i32 = 2;
const DRIVER_MAX_WIRE_VERSION: i32 = 25;

/// Enum representing the possible types of servers that the driver can connect to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    RsPrimary,

    /// A secondary node in a replica set.
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    RsGhost,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn can_auth(self) -> bool {
        !matches!(self, ServerType::RsArbiter)
    }

    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// A description of the most up-to-date information known about a server.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The last time this server was updated.
    pub(crate) last_update_time: Option<DateTime>,

    /// The exponentially weighted average of this server's heartbeat round trip times.
    pub(crate) average_round_trip_time: Option<Duration>,

    // A server that has not been checked yet has neither a reply nor an error, so the reply is
    // optional inside the `Ok` case. Keeping the error in the `Err` case lets every accessor
    // below propagate it with `?`.
    pub(crate) reply: std::result::Result<Option<HelloReply>, Error>,
}

// Equality is used to decide whether a heartbeat changed anything, so it only compares the
// fields that drive topology transitions and selection.
impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| &r.command_response);
                let other_response = other_reply.as_ref().map(|r| &r.command_response);

                self_response == other_response
            }
            (Err(self_err), Err(other_err)) => {
                self_err.code() == other_err.code()
                    && self_err.to_string() == other_err.to_string()
            }
            _ => false,
        }
    }
}

impl ServerDescription {
    /// A description of a server the driver has not heard from yet.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: normalize_address(address),
            server_type: Default::default(),
            last_update_time: None,
            average_round_trip_time: None,
            reply: Ok(None),
        }
    }

    /// A description built from a successful heartbeat. Host lists in the reply are lowercased
    /// so they compare equal to the seed list.
    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_rtt: Duration,
    ) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());
        description.server_type = reply.command_response.server_type();

        // An unknown server's latency must not widen the selection window.
        if description.server_type.is_available() {
            description.average_round_trip_time = Some(average_rtt);
        }

        let response = &mut reply.command_response;
        for hosts in [
            response.hosts.as_mut(),
            response.passives.as_mut(),
            response.arbiters.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            for host in hosts.iter_mut() {
                *host = host.to_lowercase();
            }
        }
        if let Some(ref mut me) = response.me {
            *me = me.to_lowercase();
        }

        description.reply = Ok(Some(reply));
        description
    }

    /// A description of a server whose last check failed. Its type is always Unknown.
    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());
        description.reply = Err(error);
        description
    }

    /// Whether this server is "available" for selection.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    /// The address of this server.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The type of this server.
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// The weighted average heartbeat round trip time, if one has been measured.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.average_round_trip_time
    }

    /// The error the last check failed with, if it failed.
    pub fn error(&self) -> Option<&Error> {
        self.reply.as_ref().err()
    }

    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if let Ok(Some(ref reply)) = self.reply {
            let hello_min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);

            if hello_min_wire_version > DRIVER_MAX_WIRE_VERSION {
                return Some(format!(
                    "Server at {} requires wire version {}, but this driver only supports up to \
                     {}",
                    self.address, hello_min_wire_version, DRIVER_MAX_WIRE_VERSION,
                ));
            }

            let hello_max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);

            if hello_max_wire_version < DRIVER_MIN_WIRE_VERSION {
                return Some(format!(
                    "Server at {} reports wire version {}, but this driver requires at least {} \
                     (MongoDB {}).",
                    self.address,
                    hello_max_wire_version,
                    DRIVER_MIN_WIRE_VERSION,
                    DRIVER_MIN_DB_VERSION
                ));
            }
        }

        None
    }

    fn reply(&self) -> Result<Option<&HelloReply>> {
        self.reply.as_ref().map(Option::as_ref).map_err(Clone::clone)
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.set_name.clone()))
    }

    /// Every member the server reports: hosts, passives and arbiters.
    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>> {
        let Some(reply) = self.reply()? else {
            return Ok(Vec::new());
        };
        let response = &reply.command_response;

        [
            response.hosts.as_ref(),
            response.passives.as_ref(),
            response.arbiters.as_ref(),
        ]
        .into_iter()
        .flatten()
        .flatten()
        .map(ServerAddress::parse)
        .collect()
    }

    /// Whether the server reported a `me` field that does not match the address it was
    /// contacted at.
    pub(crate) fn invalid_me(&self) -> Result<bool> {
        if let Some(reply) = self.reply()? {
            if let Some(ref me) = reply.command_response.me {
                return Ok(self.address != ServerAddress::parse(me)?);
            }
        }

        Ok(false)
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.set_version))
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.election_id))
    }

    pub(crate) fn max_wire_version(&self) -> Result<Option<i32>> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.max_wire_version))
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<DateTime>> {
        Ok(self.reply()?.and_then(|reply| {
            reply
                .command_response
                .last_write
                .as_ref()
                .map(|write| write.last_write_date)
        }))
    }

    pub(crate) fn logical_session_timeout(&self) -> Result<Option<Duration>> {
        Ok(self.reply()?.and_then(|reply| {
            reply
                .command_response
                .logical_session_timeout_minutes
                .map(|minutes| Duration::from_secs(minutes.max(0) as u64 * 60))
        }))
    }

    pub(crate) fn cluster_time(&self) -> Result<Option<ClusterTime>> {
        Ok(self.reply()?.and_then(|reply| reply.cluster_time.clone()))
    }

    /// Whether the server's tags contain every key-value pair in `tag_set`. An empty tag set
    /// matches any server.
    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        if tag_set.is_empty() {
            return true;
        }

        let server_tags = match self.reply {
            Ok(Some(ref reply)) => match reply.command_response.tags {
                Some(ref tags) => tags,
                None => return false,
            },
            _ => return false,
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}

fn normalize_address(address: &ServerAddress) -> ServerAddress {
    ServerAddress::Tcp {
        host: address.host().to_lowercase(),
        port: Some(address.port()),
    }
}
