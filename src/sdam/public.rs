//! Public views of the driver's topology model, exposed through events and selection predicates.

use std::{borrow::Cow, fmt, time::Duration};

use crate::{options::ServerAddress, selection_criteria::TagSet};

use super::description::server::ServerDescription;
pub use super::description::{server::ServerType, topology::TopologyType};

/// A description of the most up-to-date information known about a server.
#[derive(Clone)]
pub struct ServerInfo<'a> {
    pub(crate) description: Cow<'a, ServerDescription>,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a ServerDescription) -> Self {
        Self {
            description: Cow::Borrowed(description),
        }
    }

    pub(crate) fn new_owned(description: ServerDescription) -> ServerInfo<'static> {
        ServerInfo {
            description: Cow::Owned(description),
        }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the weighted average of the time it has taken for a server check to round-trip
    /// to the server.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the tags associated with the server, if it is a replica set member.
    pub fn tags(&self) -> Option<&TagSet> {
        self.description.tags()
    }

    /// Gets the name of the replica set the server belongs to, if any.
    pub fn set_name(&self) -> Option<String> {
        self.description.set_name().ok().flatten()
    }

    /// Gets the error that occurred during the last check of the server, if any.
    pub fn error(&self) -> Option<&crate::error::Error> {
        self.description.error()
    }

    /// Clones the underlying description so the info can outlive the topology snapshot it came
    /// from.
    pub fn into_owned(self) -> ServerInfo<'static> {
        ServerInfo {
            description: Cow::Owned(self.description.into_owned()),
        }
    }
}

impl fmt::Debug for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInfo")
            .field("address", self.address())
            .field("server_type", &self.server_type())
            .field("average_round_trip_time", &self.average_round_trip_time())
            .finish()
    }
}

impl fmt::Display for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ address: {}, type: {:?}",
            self.address(),
            self.server_type()
        )?;

        if let Some(error) = self.error() {
            write!(f, ", error: {}", error)?;
        }

        write!(f, " }}")
    }
}
