//! Contains the events and functionality for monitoring server discovery and monitoring.

use std::time::Duration;

use bson::{oid::ObjectId, Document};

use crate::{
    error::Error,
    options::ServerAddress,
    sdam::public::{ServerInfo, TopologyType},
    selection_criteria::SelectionCriteria,
};

/// A description of the most up-to-date information known about a server, as attached to SDAM
/// events.
pub type ServerDescription = ServerInfo<'static>;

/// A public view of the topology at a point in time, as attached to SDAM events.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescription {
    /// The type of the topology.
    pub topology_type: TopologyType,

    /// The name of the replica set, when the topology is a replica set.
    pub set_name: Option<String>,

    /// The reason the topology is unusable, when the driver and deployment have no overlapping
    /// wire version range.
    pub compatibility_error: Option<String>,

    /// The servers in the topology.
    pub servers: Vec<ServerDescription>,
}

impl From<&crate::sdam::TopologyDescription> for TopologyDescription {
    fn from(description: &crate::sdam::TopologyDescription) -> Self {
        Self {
            topology_type: description.topology_type(),
            set_name: description.set_name.clone(),
            compatibility_error: description.compatibility_error.clone(),
            servers: description
                .servers
                .values()
                .map(|server| ServerInfo::new_owned(server.clone()))
                .collect(),
        }
    }
}

/// Published when a server description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The server's previous description.
    pub previous_description: ServerDescription,

    /// The server's new description.
    pub new_description: ServerDescription,
}

/// Published when a server is added to the topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server is removed from the topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when the topology description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The topology's previous description.
    pub previous_description: TopologyDescription,

    /// The topology's new description.
    pub new_description: TopologyDescription,
}

/// Published when the topology is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when the topology is closed, which happens when the client is shut down.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server monitor's `hello` command is started.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the check used an awaitable `hello` held open by the server.
    pub awaited: bool,
}

/// Published when a server monitor's `hello` command succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The execution time of the check.
    pub duration: Duration,

    /// The reply to the `hello` command.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the check used an awaitable `hello` held open by the server.
    pub awaited: bool,
}

/// Published when a server monitor's `hello` command fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The execution time of the check.
    pub duration: Duration,

    /// The failure that occurred.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the check used an awaitable `hello` held open by the server.
    pub awaited: bool,
}

/// Published once per failed server-selection attempt: the topology had no server satisfying the
/// criteria, and the driver is about to wait for a topology change.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerSelectionEmptyEvent {
    /// The name of the operation selection ran for.
    pub operation_name: String,

    /// The criteria that could not be satisfied.
    pub criteria: SelectionCriteria,

    /// The topology as it looked when selection came up empty.
    pub topology_description: TopologyDescription,
}

/// Applications can implement this trait to specify custom logic to run on each SDAM event sent
/// by the driver. Handlers are invoked inline from the topology worker and the server monitors
/// and must not block.
pub trait SdamEventHandler: Send + Sync {
    /// Called whenever a server's description changes.
    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {}

    /// Called whenever a server is added to the topology.
    fn handle_server_opening_event(&self, _event: ServerOpeningEvent) {}

    /// Called whenever a server is removed from the topology.
    fn handle_server_closed_event(&self, _event: ServerClosedEvent) {}

    /// Called whenever the topology description changes.
    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {}

    /// Called when the topology is initialized.
    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {}

    /// Called when the topology is closed.
    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {}

    /// Called when a server monitor starts a heartbeat.
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    /// Called when a server monitor's heartbeat succeeds.
    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    /// Called when a server monitor's heartbeat fails.
    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}

    /// Called when a server-selection attempt found no suitable server.
    fn handle_server_selection_empty_event(&self, _event: ServerSelectionEmptyEvent) {}
}
