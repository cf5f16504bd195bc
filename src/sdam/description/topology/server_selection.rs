#[cfg(test)]
mod test;

use std::{collections::HashMap, ops::Deref, sync::Arc, time::Duration};

use rand::seq::IndexedRandom;

use super::TopologyDescription;
use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::{
        description::{
            server::{ServerDescription, ServerType},
            topology::TopologyType,
        },
        public::ServerInfo,
        server::Server,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

const PRIMARY: &[ServerType] = &[ServerType::RsPrimary];
const SECONDARY: &[ServerType] = &[ServerType::RsSecondary];
const PRIMARY_OR_SECONDARY: &[ServerType] = &[ServerType::RsPrimary, ServerType::RsSecondary];

/// The server chosen for an operation.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    pub(crate) fn address(&self) -> &ServerAddress {
        &self.server.address
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        &self.server
    }
}

/// Runs one selection pass over a topology snapshot. `Ok(None)` means nothing matched yet and
/// the caller should wait for the next topology change.
pub(crate) fn attempt_to_select_server(
    criteria: &SelectionCriteria,
    description: &TopologyDescription,
    servers: &HashMap<ServerAddress, Arc<Server>>,
) -> Result<Option<SelectedServer>> {
    let window: Vec<&Arc<Server>> = description
        .suitable_servers_in_latency_window(criteria)?
        .into_iter()
        .filter_map(|candidate| servers.get(&candidate.address))
        .collect();
    Ok(choose_uniformly(&window).map(|server| SelectedServer {
        server: Arc::clone(server),
    }))
}

/// Picks one member of the latency window, each with equal probability.
pub(crate) fn choose_uniformly<'a, T>(window: &[&'a T]) -> Option<&'a T> {
    window.choose(&mut rand::rng()).copied()
}

/// Keeps only the servers whose average RTT is within `threshold` of the fastest one. Servers
/// that have not been measured yet never qualify.
fn retain_latency_window(candidates: &mut Vec<&ServerDescription>, threshold: Duration) {
    let Some(fastest) = candidates
        .iter()
        .filter_map(|candidate| candidate.average_round_trip_time)
        .min()
    else {
        candidates.clear();
        return;
    };
    let ceiling = fastest.saturating_add(threshold);
    candidates.retain(|candidate| {
        candidate
            .average_round_trip_time
            .is_some_and(|rtt| rtt <= ceiling)
    });
}

/// Narrows `candidates` to the first tag set in `tag_sets` that any of them matches. When none
/// of the tag sets match, nothing is eligible. An empty list places no restriction.
fn retain_first_matching_tag_set(candidates: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }
    match tag_sets
        .iter()
        .find(|tag_set| candidates.iter().any(|c| c.matches_tag_set(tag_set)))
    {
        Some(tag_set) => candidates.retain(|candidate| candidate.matches_tag_set(tag_set)),
        None => candidates.clear(),
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Estimates how far each secondary lags behind, in milliseconds, from the `lastWrite` data
/// reported in heartbeats.
enum StalenessReference {
    /// Compare against the primary's write date, adjusted by when each server was last checked.
    Primary { update: i64, write: i64 },

    /// Compare against the most recent write date seen on any secondary.
    FreshestSecondary { write: i64 },
}

impl StalenessReference {
    fn of(description: &TopologyDescription) -> Option<Self> {
        if let Some(primary) = description.servers_with_type(PRIMARY).next() {
            return Some(Self::Primary {
                update: primary.last_update_time?.timestamp_millis(),
                write: last_write_millis(primary)?,
            });
        }
        description
            .servers_with_type(SECONDARY)
            .filter_map(last_write_millis)
            .max()
            .map(|write| Self::FreshestSecondary { write })
    }

    fn staleness(&self, server: &ServerDescription, heartbeat_frequency: i64) -> Option<i64> {
        let write = last_write_millis(server)?;
        let lag = match *self {
            Self::Primary {
                update: primary_update,
                write: primary_write,
            } => {
                let update = server.last_update_time?.timestamp_millis();
                (update - write) - (primary_update - primary_write)
            }
            Self::FreshestSecondary { write: freshest } => freshest - write,
        };
        Some(lag + heartbeat_frequency)
    }
}

fn last_write_millis(server: &ServerDescription) -> Option<i64> {
    server
        .last_write_date()
        .ok()
        .flatten()
        .map(|date| date.timestamp_millis())
}

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {criteria:?}. Topology: {self}"
            )
        } else {
            format!("Server selection timeout: No available servers. Topology: {self}")
        }
    }

    /// The servers an operation with `criteria` may run on right now, narrowed to the latency
    /// window.
    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::ServerSelection {
                message: message.to_string(),
            }
            .into());
        }

        let mut candidates = match criteria {
            SelectionCriteria::ReadPreference(read_preference) => {
                self.eligible_for_read_preference(read_preference)?
            }
            SelectionCriteria::Predicate(predicate) => {
                // A lone server reached directly is usable whatever its type.
                let any_type = self.topology_type == TopologyType::Single;
                self.servers
                    .values()
                    .filter(|server| any_type || server.server_type.is_data_bearing())
                    .filter(|server| predicate(&ServerInfo::new(server)))
                    .collect()
            }
        };

        retain_latency_window(
            &mut candidates,
            self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD),
        );
        Ok(candidates)
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(ServerDescription::is_available)
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    #[cfg(test)]
    pub(crate) fn primary(&self) -> Option<&ServerDescription> {
        self.servers_with_type(PRIMARY).next()
    }

    fn eligible_for_read_preference(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let eligible = match (self.topology_type, read_preference) {
            (TopologyType::Unknown, _) => Vec::new(),
            (TopologyType::Single, _) => self.servers.values().collect(),
            (TopologyType::Sharded, _) => self.servers_with_type(&[ServerType::Mongos]).collect(),
            (_, ReadPreference::Primary) => self.servers_with_type(PRIMARY).collect(),
            (_, ReadPreference::Secondary { .. }) => {
                self.members_for_read_preference(SECONDARY, read_preference)?
            }
            (_, ReadPreference::Nearest { .. }) => {
                self.members_for_read_preference(PRIMARY_OR_SECONDARY, read_preference)?
            }
            (_, ReadPreference::PrimaryPreferred { .. }) => {
                let primary: Vec<_> = self.servers_with_type(PRIMARY).collect();
                if primary.is_empty() {
                    self.members_for_read_preference(SECONDARY, read_preference)?
                } else {
                    primary
                }
            }
            (_, ReadPreference::SecondaryPreferred { .. }) => {
                let secondaries = self.members_for_read_preference(SECONDARY, read_preference)?;
                if secondaries.is_empty() {
                    self.servers_with_type(PRIMARY).collect()
                } else {
                    secondaries
                }
            }
        };
        Ok(eligible)
    }

    /// Replica set members of the given types that satisfy the preference's max staleness and
    /// tag sets.
    fn members_for_read_preference(
        &self,
        types: &'static [ServerType],
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let mut members: Vec<_> = self.servers_with_type(types).collect();

        // A zero max staleness is the same as none.
        if let Some(max_staleness) = read_preference
            .max_staleness()
            .filter(|max_staleness| !max_staleness.is_zero())
        {
            super::verify_max_staleness(max_staleness, self.heartbeat_frequency())?;
            if let Some(reference) = StalenessReference::of(self) {
                let heartbeat_frequency = millis(self.heartbeat_frequency());
                let limit = millis(max_staleness);
                members.retain(|member| {
                    reference
                        .staleness(member, heartbeat_frequency)
                        .is_some_and(|staleness| staleness <= limit)
                });
            }
        }

        if let Some(tag_sets) = read_preference.tag_sets() {
            retain_first_matching_tag_set(&mut members, tag_sets);
        }
        Ok(members)
    }
}
