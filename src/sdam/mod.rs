mod description;
mod monitor;
pub mod public;
mod topology;

pub(crate) use self::{
    description::{
        server::{ServerDescription, TopologyVersion},
        topology::TopologyDescription,
    },
    monitor::MIN_HEARTBEAT_FREQUENCY,
    topology::{
        HandshakePhase,
        SelectedServer,
        Server,
        Topology,
        TopologyUpdater,
        TopologyWatcher,
        DEFAULT_SERVER_SELECTION_TIMEOUT,
    },
};
pub use self::public::{ServerInfo, ServerType, TopologyType};
