pub(crate) mod server_selection;
#[cfg(test)]
mod test;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use self::server_selection::IDLE_WRITE_PERIOD;
use crate::{
    bson::oid::ObjectId,
    client::session::ClusterTime,
    cmap::Command,
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::server::{ServerDescription, ServerType},
        public::ServerInfo,
        DEFAULT_HEARTBEAT_FREQUENCY,
    },
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria},
};

/// The overall shape of the deployment, as far as the client can tell.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, derive_more::Display)]
#[non_exhaustive]
pub enum TopologyType {
    /// One server, connected to directly.
    Single,

    /// A replica set whose primary is not currently known.
    ReplicaSetNoPrimary,

    /// A replica set with a known primary.
    ReplicaSetWithPrimary,

    /// One or more mongos routers.
    Sharded,

    /// Nothing has been learned about the deployment yet.
    #[default]
    Unknown,
}

/// What the client currently knows about the deployment: one [`ServerDescription`] per member,
/// plus the facts derived from all of them together.
#[derive(Debug, Clone, Default)]
pub struct TopologyDescription {
    /// The client was given exactly one seed.
    pub(crate) single_seed: bool,

    pub(crate) topology_type: TopologyType,

    /// The replica set name, from the options or the first member to report one.
    pub(crate) set_name: Option<String>,

    /// The highest `setVersion` any primary has reported.
    pub(crate) max_set_version: Option<i32>,

    /// The highest `electionId` any primary has reported.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Set while some member's wire version range does not overlap ours.
    pub(crate) compatibility_error: Option<String>,

    pub(crate) logical_session_timeout: Option<Duration>,

    pub(crate) transaction_support_status: TransactionSupportStatus,

    /// The greatest `$clusterTime` seen from any member.
    pub(crate) cluster_time: Option<ClusterTime>,

    /// Width of the latency window used by server selection.
    pub(crate) local_threshold: Option<Duration>,

    pub(crate) heartbeat_freq: Option<Duration>,

    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        // Waiting server selections are woken when this changes, so only what selection reads
        // is compared.
        self.topology_type == other.topology_type
            && self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
    }
}

impl TopologyDescription {
    /// The starting description: every seed is Unknown, and the type follows from
    /// `directConnection` and `replicaSet`.
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let topology_type = match (options.direct_connection, &options.repl_set_name) {
            (Some(true), _) => TopologyType::Single,
            (_, Some(_)) => TopologyType::ReplicaSetNoPrimary,
            _ => TopologyType::Unknown,
        };
        let servers: HashMap<_, _> = options
            .hosts
            .iter()
            .map(|address| (address.clone(), ServerDescription::new(address)))
            .collect();

        Self {
            single_seed: servers.len() == 1,
            topology_type,
            set_name: options.repl_set_name.clone(),
            local_threshold: options.local_threshold,
            heartbeat_freq: options.heartbeat_freq,
            servers,
            ..Default::default()
        }
    }

    /// The deployment's type.
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    /// The replica set name, once known.
    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// Every server currently part of the deployment.
    pub fn servers(&self) -> impl Iterator<Item = ServerInfo<'_>> {
        self.servers.values().map(ServerInfo::new)
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    /// Attaches `$readPreference` to a command bound for `address` when that server needs to
    /// see it.
    pub(crate) fn update_command_with_read_pref(
        &self,
        address: &ServerAddress,
        command: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        let server_type = self
            .get_server_description(address)
            .map_or(ServerType::Unknown, |server| server.server_type);

        let read_preference = match (self.topology_type, server_type) {
            (TopologyType::Sharded | TopologyType::Single, ServerType::Mongos) => {
                read_preference_for_mongos(criteria)
            }
            (TopologyType::Single, ServerType::Standalone) => None,
            // A direct connection to a secondary must be allowed to read from it.
            (TopologyType::Single, _) => match criteria.and_then(SelectionCriteria::as_read_pref) {
                None | Some(ReadPreference::Primary) => Some(primary_preferred()),
                Some(other) => Some(other.clone()),
            },
            _ => match criteria {
                None | Some(SelectionCriteria::ReadPreference(ReadPreference::Primary)) => None,
                Some(SelectionCriteria::ReadPreference(other)) => Some(other.clone()),
                Some(SelectionCriteria::Predicate(_)) => Some(primary_preferred()),
            },
        };

        if let Some(read_preference) = read_preference {
            command.set_read_preference(read_preference);
        }
    }

    fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    pub(crate) fn session_support_status(&self) -> SessionSupportStatus {
        let any_data_bearing = self
            .servers
            .values()
            .any(|server| server.server_type.is_data_bearing());
        match (any_data_bearing, self.logical_session_timeout) {
            (false, _) => SessionSupportStatus::Undetermined,
            (true, None) => SessionSupportStatus::Unsupported,
            (true, Some(logical_session_timeout)) => SessionSupportStatus::Supported {
                logical_session_timeout,
            },
        }
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.transaction_support_status
    }

    /// Replaces the recorded cluster time if `cluster_time` is newer.
    pub(crate) fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if self.cluster_time.as_ref() < Some(cluster_time) {
            self.cluster_time = Some(cluster_time.clone());
        }
    }

    /// What changed going from `self` to `other`, or `None` if nothing selection cares about
    /// did.
    pub(crate) fn diff<'a>(&'a self, other: &'a Self) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let removed_addresses = self
            .servers
            .keys()
            .filter(|address| !other.servers.contains_key(*address))
            .collect();
        let added_addresses = other
            .servers
            .keys()
            .filter(|address| !self.servers.contains_key(*address))
            .collect();
        let changed_servers = self
            .servers
            .iter()
            .filter_map(|(address, old)| {
                let new = other.servers.get(address)?;
                (old != new).then_some((address, (old, new)))
            })
            .collect();

        Some(TopologyDescriptionDiff {
            removed_addresses,
            added_addresses,
            changed_servers,
        })
    }

    /// Folds a fresh description of one server into the topology. Reports from servers that
    /// have since been removed are dropped.
    pub(crate) fn update(&mut self, mut server: ServerDescription) -> Result<()> {
        if !self.servers.contains_key(&server.address) {
            return Ok(());
        }

        if self.topology_type == TopologyType::Single && server.is_available() {
            if let Some(expected) = &self.set_name {
                let actual = server.set_name()?;
                if actual.as_ref() != Some(expected) {
                    let error = Error::invalid_argument(format!(
                        "Connection string replicaSet name {expected:?} does not match actual \
                         name {actual:?}"
                    ));
                    server = ServerDescription::new_from_error(server.address, error);
                }
            }
        }

        self.servers.insert(server.address.clone(), server.clone());

        if server.server_type.is_data_bearing() {
            self.logical_session_timeout = self
                .servers
                .values()
                .filter(|member| member.server_type.is_data_bearing())
                .map(|member| member.logical_session_timeout().ok().flatten())
                .min()
                .flatten();
        }
        if let Some(cluster_time) = server.cluster_time().ok().flatten() {
            self.advance_cluster_time(&cluster_time);
        }

        let max_wire_version = server.max_wire_version().ok().flatten();
        self.apply_transition(server)?;
        self.update_transaction_support_status(max_wire_version);

        self.compatibility_error = self
            .servers
            .values()
            .find_map(ServerDescription::compatibility_error_message);
        Ok(())
    }

    /// Transactions need sessions, wire version 7 on a replica set, and 8 through mongos. Judged
    /// against the topology type the latest server description produced.
    fn update_transaction_support_status(&mut self, max_wire_version: Option<i32>) {
        if self.logical_session_timeout.is_none() {
            self.transaction_support_status = TransactionSupportStatus::Unsupported;
            return;
        }
        let Some(max_wire_version) = max_wire_version else {
            return;
        };
        let required = if self.topology_type == TopologyType::Sharded {
            8
        } else {
            7
        };
        self.transaction_support_status = if max_wire_version >= required {
            TransactionSupportStatus::Supported
        } else {
            TransactionSupportStatus::Unsupported
        };
    }

    fn apply_transition(&mut self, server: ServerDescription) -> Result<()> {
        use ServerType as S;

        match self.topology_type {
            TopologyType::Single => {}

            TopologyType::Unknown => match server.server_type {
                S::Unknown | S::RsGhost => {}
                S::Standalone if self.single_seed => self.topology_type = TopologyType::Single,
                S::Standalone => self.remove(&server),
                S::Mongos => self.topology_type = TopologyType::Sharded,
                S::RsPrimary => self.adopt_primary(server)?,
                S::RsSecondary | S::RsArbiter | S::RsOther => {
                    self.topology_type = TopologyType::ReplicaSetNoPrimary;
                    self.adopt_member_without_primary(server)?;
                }
            },

            TopologyType::Sharded => {
                if !matches!(server.server_type, S::Unknown | S::Mongos) {
                    self.remove(&server);
                }
            }

            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
                match server.server_type {
                    S::RsPrimary => self.adopt_primary(server)?,
                    S::RsSecondary | S::RsArbiter | S::RsOther
                        if self.topology_type == TopologyType::ReplicaSetNoPrimary =>
                    {
                        self.adopt_member_without_primary(server)?;
                    }
                    S::RsSecondary | S::RsArbiter | S::RsOther => {
                        if self.set_name != server.set_name()? || server.invalid_me()? {
                            self.remove(&server);
                        }
                        self.record_primary_state();
                    }
                    S::Standalone | S::Mongos => {
                        self.remove(&server);
                        self.record_primary_state();
                    }
                    S::Unknown | S::RsGhost => self.record_primary_state(),
                }
            }
        }
        Ok(())
    }

    fn remove(&mut self, server: &ServerDescription) {
        self.servers.remove(&server.address);
    }

    /// A secondary, arbiter or hidden member reported while no primary is known. Its host list
    /// is trusted as a source of new members.
    fn adopt_member_without_primary(&mut self, member: ServerDescription) -> Result<()> {
        let set_name = member.set_name()?;
        if self.set_name.is_none() {
            self.set_name = set_name;
        } else if self.set_name != set_name {
            self.remove(&member);
            return Ok(());
        }

        self.add_new_servers(member.known_hosts()?);
        if member.invalid_me()? {
            self.remove(&member);
        }
        Ok(())
    }

    /// A member claims to be primary. Its host list becomes the membership, unless its
    /// `(setVersion, electionId)` is older than one already seen.
    fn adopt_primary(&mut self, primary: ServerDescription) -> Result<()> {
        self.topology_type = TopologyType::ReplicaSetWithPrimary;

        let set_name = primary.set_name()?;
        if self.set_name.is_none() {
            self.set_name = set_name;
        } else if self.set_name != set_name {
            self.remove(&primary);
            self.record_primary_state();
            return Ok(());
        }

        let set_version = primary.set_version()?;
        if let (Some(version), Some(election_id)) = (set_version, primary.election_id()?) {
            let is_stale = match (self.max_set_version, self.max_election_id) {
                (Some(max_version), Some(max_election_id)) => {
                    (max_version, max_election_id) > (version, election_id)
                }
                _ => false,
            };
            if is_stale {
                // Forget what the old primary said and wait for its next heartbeat.
                self.servers.insert(
                    primary.address.clone(),
                    ServerDescription::new(&primary.address),
                );
                self.record_primary_state();
                return Ok(());
            }
            self.max_election_id = Some(election_id);
        }
        if let Some(version) = set_version {
            let max = self.max_set_version.map_or(version, |max| max.max(version));
            self.max_set_version = Some(max);
        }

        // There is at most one primary.
        for (address, server) in self.servers.iter_mut() {
            if *address != primary.address && server.server_type == ServerType::RsPrimary {
                *server = ServerDescription::new(address);
            }
        }

        let members = primary.known_hosts()?;
        self.add_new_servers(members.iter().cloned());
        self.servers.retain(|address, _| members.contains(address));

        self.record_primary_state();
        Ok(())
    }

    fn record_primary_state(&mut self) {
        let has_primary = self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary);
        self.topology_type = if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    fn add_new_servers(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            if !self.servers.contains_key(&address) {
                let description = ServerDescription::new(&address);
                self.servers.insert(address, description);
            }
        }
    }
}

fn primary_preferred() -> ReadPreference {
    ReadPreference::PrimaryPreferred { options: None }
}

/// mongos only needs a read preference it would not infer on its own. A bare
/// `secondaryPreferred` is what the secondaryOk bit already says.
fn read_preference_for_mongos(criteria: Option<&SelectionCriteria>) -> Option<ReadPreference> {
    let Some(SelectionCriteria::ReadPreference(read_preference)) = criteria else {
        return None;
    };
    match read_preference {
        ReadPreference::Primary => None,
        ReadPreference::SecondaryPreferred { options }
            if options
                .as_ref()
                .is_none_or(ReadPreferenceOptions::is_default) =>
        {
            None
        }
        other => Some(other.clone()),
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ Type: {}", self.topology_type)?;
        if let Some(set_name) = &self.set_name {
            write!(f, ", Set Name: {set_name}")?;
        }
        if let Some(version) = self.max_set_version {
            write!(f, ", Max Set Version: {version}")?;
        }
        if let Some(election_id) = self.max_election_id {
            write!(f, ", Max Election ID: {election_id}")?;
        }
        if let Some(error) = &self.compatibility_error {
            write!(f, ", Compatibility Error: {error}")?;
        }
        if !self.servers.is_empty() {
            let servers: Vec<String> = self.servers().map(|server| server.to_string()).collect();
            write!(f, ", Servers: [ {} ]", servers.join(", "))?;
        }
        write!(f, " }}")
    }
}

/// Whether the deployment supports sessions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) enum SessionSupportStatus {
    /// No data-bearing server has reported in yet.
    #[default]
    Undetermined,

    Unsupported,

    /// Carries the smallest timeout among the data-bearing servers.
    Supported { logical_session_timeout: Duration },
}

/// Whether the deployment supports transactions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) enum TransactionSupportStatus {
    /// No data-bearing server has reported in yet.
    #[default]
    Undetermined,

    Unsupported,

    Supported,
}

/// The server-level changes between two descriptions, as returned by
/// [`TopologyDescription::diff`].
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
    pub(crate) changed_servers:
        HashMap<&'a ServerAddress, (&'a ServerDescription, &'a ServerDescription)>,
}

/// Rejects a max staleness below 90 seconds or below one heartbeat plus the idle write period.
pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<()> {
    let floor = heartbeat_frequency
        .saturating_add(IDLE_WRITE_PERIOD)
        .max(Duration::from_secs(90));
    if max_staleness < floor {
        return Err(Error::invalid_argument(format!(
            "invalid max_staleness value: must be at least {} seconds",
            floor.as_secs()
        )));
    }
    Ok(())
}
