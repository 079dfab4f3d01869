use std::time::Duration;

use rand::seq::IteratorRandom;

use super::{TopologyDescription, TopologyType};
use crate::{
    sdam::description::server::{ServerDescription, ServerType},
    sdam::public::ServerInfo,
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

impl TopologyDescription {
    /// Selects a server from this topology for the given criteria, or `None` when no suitable
    /// server exists right now. The choice among equally suitable servers within the latency
    /// window is uniformly random.
    pub(crate) fn select_server<'a>(
        &'a self,
        criteria: &SelectionCriteria,
    ) -> Option<&'a ServerDescription> {
        // A Single topology always selects its sole server, whatever state it is in: a direct
        // connection has nowhere else to go, so the latency window is skipped as well.
        if let TopologyType::Single = self.topology_type {
            return self.servers.values().next();
        }

        let mut suitable_servers = self.suitable_servers(criteria);

        // If the read preference is primary, we skip the overhead of calculating the latency
        // window because we know there's at most one server selected.
        if !criteria.is_read_pref_primary() {
            self.retain_servers_within_latency_window(&mut suitable_servers);
        }

        suitable_servers.into_iter().choose(&mut rand::thread_rng())
    }

    /// The servers suitable for the criteria before the latency window is applied. Public within
    /// the crate so the selection invariants can be checked in tests.
    pub(crate) fn suitable_servers<'a>(
        &'a self,
        criteria: &SelectionCriteria,
    ) -> Vec<&'a ServerDescription> {
        match criteria {
            SelectionCriteria::ReadPreference(read_pref) => match self.topology_type {
                TopologyType::Unknown => Vec::new(),
                TopologyType::Single => self.servers.values().collect(),
                TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
                TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                    self.suitable_servers_in_replica_set(read_pref)
                }
            },
            SelectionCriteria::Predicate(filter) => self
                .servers
                .values()
                .filter(|server| server.is_available() && filter(&ServerInfo::new_borrowed(server)))
                .collect(),
        }
    }

    fn retain_servers_within_latency_window(
        &self,
        suitable_servers: &mut Vec<&ServerDescription>,
    ) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.average_round_trip_time)
            .min();

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window = shortest_average_rtt.map(|rtt| rtt + local_threshold);

        suitable_servers.retain(move |server_desc| {
            match (server_desc.average_round_trip_time, max_rtt_within_window) {
                (Some(server_rtt), Some(max_rtt)) => server_rtt <= max_rtt,
                _ => false,
            }
        });
    }

    fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    fn suitable_servers_in_replica_set<'a>(
        &'a self,
        read_preference: &ReadPreference,
    ) -> Vec<&'a ServerDescription> {
        match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]).collect(),
            ReadPreference::Secondary { options } => self.suitable_servers_for_read_preference(
                &[ServerType::RsSecondary],
                options.tag_sets.as_ref(),
                options.max_staleness,
            ),
            ReadPreference::PrimaryPreferred { options } => {
                match self.servers_with_type(&[ServerType::RsPrimary]).next() {
                    Some(primary) => vec![primary],
                    None => self.suitable_servers_for_read_preference(
                        &[ServerType::RsSecondary],
                        options.tag_sets.as_ref(),
                        options.max_staleness,
                    ),
                }
            }
            ReadPreference::SecondaryPreferred { options } => {
                let suitable_servers = self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    options.tag_sets.as_ref(),
                    options.max_staleness,
                );

                if suitable_servers.is_empty() {
                    self.servers_with_type(&[ServerType::RsPrimary]).collect()
                } else {
                    suitable_servers
                }
            }
            ReadPreference::Nearest { options } => self.suitable_servers_for_read_preference(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                options.tag_sets.as_ref(),
                options.max_staleness,
            ),
        }
    }

    fn suitable_servers_for_read_preference<'a>(
        &'a self,
        types: &'a [ServerType],
        tag_sets: Option<&Vec<TagSet>>,
        max_staleness: Option<Duration>,
    ) -> Vec<&'a ServerDescription> {
        let mut servers: Vec<_> = self.servers_with_type(types).collect();

        if let Some(max_staleness) = max_staleness {
            self.filter_servers_by_max_staleness(&mut servers, max_staleness);
        }

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        servers
    }

    /// Removes secondaries whose estimated replication lag exceeds `max_staleness`, per the max
    /// staleness spec. Staleness is estimated from `lastWriteDate` deltas plus the heartbeat
    /// interval; primaries are never stale.
    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let primary = self
            .servers
            .values()
            .find(|server| server.server_type == ServerType::RsPrimary);

        match primary {
            Some(primary) => {
                servers.retain(|server| {
                    self.staleness_with_primary(primary, server)
                        .map(|staleness| staleness <= max_staleness)
                        .unwrap_or(false)
                })
            }
            None => {
                let max_last_write_date = self
                    .servers
                    .values()
                    .filter(|server| server.server_type == ServerType::RsSecondary)
                    .filter_map(|server| server.last_write_date().ok().flatten())
                    .max();

                let max_last_write_date = match max_last_write_date {
                    Some(date) => date,
                    None => return,
                };

                servers.retain(|server| {
                    let last_write_date = match server.last_write_date().ok().flatten() {
                        Some(date) => date,
                        None => return false,
                    };
                    let lag_millis =
                        max_last_write_date.timestamp_millis() - last_write_date.timestamp_millis();
                    let staleness = Duration::from_millis(lag_millis.max(0) as u64)
                        + self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);
                    staleness <= max_staleness
                })
            }
        }
    }

    fn staleness_with_primary(
        &self,
        primary: &ServerDescription,
        server: &ServerDescription,
    ) -> Option<Duration> {
        if server.server_type == ServerType::RsPrimary {
            return Some(Duration::ZERO);
        }

        let server_last_write = server.last_write_date().ok().flatten()?;
        let primary_last_write = primary.last_write_date().ok().flatten()?;
        let server_updated = server.last_update_time?;
        let primary_updated = primary.last_update_time?;

        // (S.lastUpdateTime - S.lastWriteDate) - (P.lastUpdateTime - P.lastWriteDate)
        // + heartbeatFrequency
        let server_lag = server_updated.timestamp_millis() - server_last_write.timestamp_millis();
        let primary_lag =
            primary_updated.timestamp_millis() - primary_last_write.timestamp_millis();
        let staleness_millis = (server_lag - primary_lag).max(0) as u64;

        Some(
            Duration::from_millis(staleness_millis)
                + self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY),
        )
    }
}

/// The first tag set with any matching server wins; a tag-set list that matches nothing empties
/// the candidate set.
fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);

            return;
        }
    }

    servers.clear();
}
