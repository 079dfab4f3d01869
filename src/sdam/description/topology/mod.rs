pub(crate) mod server_selection;
#[cfg(test)]
mod test;

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use bson::oid::ObjectId;

use crate::{
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
    sdam::description::server::{ServerDescription, ServerType},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// The possible types for a topology.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

/// A description of the most up-to-date information known about a topology. Mutated only by the
/// topology worker; everyone else observes cloned snapshots.
#[derive(Debug, Clone)]
pub(crate) struct TopologyDescription {
    /// Whether or not the topology was initialized with a single seed.
    pub(crate) single_seed: bool,

    /// The current type of the topology.
    pub(crate) topology_type: TopologyType,

    /// The replica set name of the topology.
    pub(crate) set_name: Option<String>,

    /// The highest replica set version the driver has seen by a member of the topology.
    pub(crate) max_set_version: Option<i32>,

    /// The highest replica set election id the driver has seen by a member of the topology.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Describes the compatibility issue between the driver and server with regards to the
    /// respective supported wire versions, if any.
    pub(crate) compatibility_error: Option<String>,

    /// The amount of latency beyond that of the fastest eligible server that is tolerated during
    /// server selection.
    pub(crate) local_threshold: Option<Duration>,

    /// The interval between server monitoring checks, used by the max staleness filter.
    pub(crate) heartbeat_freq: Option<Duration>,

    /// The time a logical session will remain active on the deployment: the minimum over the
    /// data-bearing members, or `None` while any data-bearing member has not reported one.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The server descriptions of each member of the topology.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        self.topology_type == other.topology_type
            && self.set_name == other.set_name
            && self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
    }
}

impl TopologyDescription {
    pub(crate) fn new(options: &ClientOptions) -> Result<Self> {
        let topology_type = if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else if options.direct_connection == Some(true) {
            TopologyType::Single
        } else {
            TopologyType::Unknown
        };

        if options.direct_connection == Some(true) && options.hosts.len() > 1 {
            return Err(Error::invalid_argument(
                "cannot specify multiple seeds with directConnection=true",
            ));
        }

        let servers: HashMap<_, _> = options
            .hosts
            .iter()
            .map(|address| (address.clone(), ServerDescription::new(address.clone())))
            .collect();

        Ok(Self {
            single_seed: servers.len() == 1,
            topology_type,
            set_name: options.repl_set_name.clone(),
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            local_threshold: options.local_threshold,
            heartbeat_freq: options.heartbeat_freq,
            logical_session_timeout: None,
            servers,
        })
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    /// When the topology type is `Single`, reads against non-mongos servers need an explicit
    /// primaryPreferred read preference so that direct connections to secondaries work.
    pub(crate) fn read_pref_for_single(
        &self,
        server_type: ServerType,
        criteria: Option<&SelectionCriteria>,
    ) -> Option<ReadPreference> {
        match (self.topology_type, server_type) {
            (TopologyType::Single, ServerType::Standalone) => None,
            (TopologyType::Single, ServerType::Mongos) => None,
            (TopologyType::Single, _) => Some(
                criteria
                    .and_then(SelectionCriteria::as_read_pref)
                    .cloned()
                    .unwrap_or(ReadPreference::PrimaryPreferred {
                        options: Default::default(),
                    }),
            ),
            _ => None,
        }
    }

    /// Update the topology based on the new information about the topology contained by the
    /// ServerDescription.
    pub(crate) fn update(&mut self, server_description: ServerDescription) -> Result<()> {
        // Ignore updates from servers not currently in the cluster.
        if !self.servers.contains_key(&server_description.address) {
            return Ok(());
        }

        // Replace the old info about the server with the new info.
        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        // Update the topology description based on the current topology type.
        match self.topology_type {
            TopologyType::Single => {}
            TopologyType::Unknown => self.update_unknown_topology(server_description)?,
            TopologyType::Sharded => self.update_sharded_topology(server_description),
            TopologyType::ReplicaSetNoPrimary => {
                self.update_replica_set_no_primary_topology(server_description)?
            }
            TopologyType::ReplicaSetWithPrimary => {
                self.update_replica_set_with_primary_topology(server_description)?;
            }
        }

        // Record any compatibility error and recompute the deployment-wide session timeout.
        self.check_compatibility();
        self.update_logical_session_timeout();

        Ok(())
    }

    /// Check the cluster for a compatibility error, and record the error message if one is found.
    fn check_compatibility(&mut self) {
        self.compatibility_error = None;

        for server in self.servers.values() {
            if let Some(error_message) = server.compatibility_error_message() {
                self.compatibility_error = Some(error_message);
                return;
            }
        }
    }

    /// The deployment-wide logical session timeout is the minimum over the data-bearing members;
    /// it is unknown while any data-bearing member has not reported one.
    fn update_logical_session_timeout(&mut self) {
        let mut timeout: Option<Duration> = None;
        for server in self.servers.values() {
            if !server.server_type.is_data_bearing() {
                continue;
            }
            match server.logical_session_timeout().ok().flatten() {
                Some(server_timeout) => {
                    timeout = Some(match timeout {
                        Some(min) => min.min(server_timeout),
                        None => server_timeout,
                    });
                }
                None => {
                    self.logical_session_timeout = None;
                    return;
                }
            }
        }
        self.logical_session_timeout = timeout;
    }

    /// Update the Unknown topology description based on the server description.
    fn update_unknown_topology(&mut self, server_description: ServerDescription) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::PossiblePrimary | ServerType::RsGhost => {}
            ServerType::Standalone => {
                self.update_unknown_with_standalone_server(server_description)
            }
            ServerType::Mongos => self.topology_type = TopologyType::Sharded,
            ServerType::RsPrimary => {
                self.update_rs_from_primary_server(server_description)?;
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary_server(server_description)?;
            }
        }

        Ok(())
    }

    /// Update the Sharded topology description based on the server description.
    fn update_sharded_topology(&mut self, server_description: ServerDescription) {
        match server_description.server_type {
            ServerType::Unknown | ServerType::PossiblePrimary | ServerType::Mongos => {}
            _ => {
                self.servers.remove(&server_description.address);
            }
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the server description.
    fn update_replica_set_no_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::PossiblePrimary | ServerType::RsGhost => {}
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
            }
            ServerType::RsPrimary => {
                self.update_rs_from_primary_server(server_description)?
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_without_primary_server(server_description)?;
            }
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the server description.
    fn update_replica_set_with_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::PossiblePrimary | ServerType::RsGhost => {
                self.record_primary_state();
            }
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
                self.record_primary_state();
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_with_primary_from_member(server_description)?;
            }
        }

        Ok(())
    }

    /// Update the Unknown topology description based on the Standalone server description.
    fn update_unknown_with_standalone_server(&mut self, server_description: ServerDescription) {
        if self.single_seed {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(&server_description.address);
        }
    }

    /// Update the replica set topology description based on a non-primary server description.
    fn update_rs_without_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);

            return Ok(());
        }

        self.add_new_servers(server_description.known_hosts()?);
        self.mark_possible_primary(&server_description);

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on a non-primary server
    /// description.
    fn update_rs_with_primary_from_member(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        Ok(())
    }

    /// Update the replica set topology description based on an RSPrimary server description.
    fn update_rs_from_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        // An incoming primary whose (setVersion, electionId) pair is dominated by one already
        // seen is stale: the member has not yet learned it lost an election. It is relabeled
        // unknown rather than believed.
        if let (Some(server_set_version), Some(server_election_id)) = (
            server_description.set_version()?,
            server_description.election_id()?,
        ) {
            if let (Some(max_set_version), Some(ref max_election_id)) =
                (self.max_set_version, self.max_election_id.as_ref())
            {
                if max_set_version > server_set_version
                    || (max_set_version == server_set_version
                        && **max_election_id > server_election_id)
                {
                    self.servers.insert(
                        server_description.address.clone(),
                        ServerDescription::new(server_description.address),
                    );
                    self.record_primary_state();
                    return Ok(());
                }
            }

            self.max_election_id = Some(server_election_id);
        }

        if let Some(server_set_version) = server_description.set_version()? {
            if self
                .max_set_version
                .map(|max_set_version| server_set_version > max_set_version)
                .unwrap_or(true)
            {
                self.max_set_version = Some(server_set_version);
            }
        }

        let addresses: Vec<_> = self.servers.keys().cloned().collect();

        // If any other servers are RSPrimary, replace them with an unknown server description,
        // which will cause them to be updated by a new hello.
        for address in addresses.iter() {
            if address == &server_description.address {
                continue;
            }

            if let Some(ServerType::RsPrimary) =
                self.servers.get(address).map(|server| server.server_type)
            {
                self.servers
                    .insert(address.clone(), ServerDescription::new(address.clone()));
            }
        }

        let known_hosts = server_description.known_hosts()?;
        self.add_new_servers(known_hosts.clone());
        let known_hosts: HashSet<_> = known_hosts.into_iter().collect();

        // The primary's view of the membership is authoritative: anything it doesn't list is
        // removed.
        for address in addresses {
            if !known_hosts.contains(&address) {
                self.servers.remove(&address);
            }
        }

        self.record_primary_state();

        Ok(())
    }

    /// Inspect the topology for a primary server, and update the topology type to
    /// ReplicaSetNoPrimary if none is found.
    ///
    /// This should only be called on a replica set topology.
    fn record_primary_state(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// When a member reports the set's primary and the driver only knows that address as
    /// Unknown, flag it so selection error messages can distinguish "never seen" from "reported
    /// primary, check pending".
    fn mark_possible_primary(&mut self, server_description: &ServerDescription) {
        if let Some(primary) = server_description.primary() {
            if let Ok(address) = ServerAddress::parse(&primary) {
                if let Some(server) = self.servers.get_mut(&address) {
                    if server.server_type == ServerType::Unknown {
                        server.server_type = ServerType::PossiblePrimary;
                    }
                }
            }
        }
    }

    /// Create a new ServerDescription for each address not already present and add it to the
    /// topology.
    fn add_new_servers(&mut self, servers: impl IntoIterator<Item = ServerAddress>) {
        for server in servers {
            if !self.servers.contains_key(&server) {
                self.servers
                    .insert(server.clone(), ServerDescription::new(server));
            }
        }
    }

    /// Computes the diff between this topology description and the `new` one, returning `None`
    /// if they are equal.
    pub(crate) fn diff<'a>(&'a self, new: &'a TopologyDescription) -> Option<TopologyDescriptionDiff<'a>> {
        if self == new {
            return None;
        }

        let addresses: HashSet<&ServerAddress> = self.server_addresses().collect();
        let new_addresses: HashSet<&ServerAddress> = new.server_addresses().collect();

        let changed_servers = self
            .servers
            .iter()
            .filter_map(|(address, description)| match new.servers.get(address) {
                Some(new_description) if new_description != description => {
                    Some((address, (description, new_description)))
                }
                _ => None,
            });

        Some(TopologyDescriptionDiff {
            removed_addresses: addresses.difference(&new_addresses).cloned().collect(),
            added_addresses: new_addresses.difference(&addresses).cloned().collect(),
            changed_servers: changed_servers.collect(),
        })
    }
}

/// A diff between two topology descriptions, driving server monitor lifecycle and change events.
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
    pub(crate) changed_servers: HashMap<&'a ServerAddress, (&'a ServerDescription, &'a ServerDescription)>,
}
