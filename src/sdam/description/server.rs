use std::time::Duration;

use bson::{bson, oid::ObjectId, Bson, DateTime};
use serde::Deserialize;

use crate::{
    error::{Error, Result},
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
};

pub(crate) const DRIVER_MIN_DB_VERSION: &str = "3.6";
pub(crate) const DRIVER_MIN_WIRE_VERSION: i32 = 6;
pub(crate) const DRIVER_MAX_WIRE_VERSION: i32 = 21;

/// The possible types for a server.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Default)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A server that another replica set member reported to be the primary but that the driver
    /// has not yet checked itself.
    PossiblePrimary,

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
        !matches!(self, ServerType::Unknown | ServerType::PossiblePrimary)
    }
}

/// Struct modeling the `topologyVersion` field included in the server's hello responses, used to
/// discard stale monitoring updates and to drive streamed monitoring.
#[derive(Debug, Copy, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TopologyVersion {
    pub(crate) process_id: ObjectId,
    pub(crate) counter: i64,
}

impl From<TopologyVersion> for Bson {
    fn from(tv: TopologyVersion) -> Self {
        bson!({
            "processId": tv.process_id,
            "counter": tv.counter
        })
    }
}

/// A description of the most up-to-date information known about a server.
#[derive(Debug, Clone)]
pub(crate) struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The last time this server was updated.
    pub(crate) last_update_time: Option<DateTime>,

    /// The average duration of this server's hello calls, an exponentially weighted moving
    /// average seeded with the first sample.
    pub(crate) average_round_trip_time: Option<Duration>,

    // A ServerDescription carries an error message when the server's heartbeat failed, and may
    // carry neither a reply nor an error for a server newly added to the topology that has not
    // been checked yet. Storing a Result of an Option makes the three states explicit while
    // letting helpers propagate the stored error with `?`.
    pub(crate) reply: Result<Option<HelloReply>>,
}

// Server description equality has a specific notion of which fields of a hello reply are
// compared, so that e.g. RTT-only changes don't count as topology changes.
fn hello_reply_eq(a: &HelloReply, b: &HelloReply) -> bool {
    let (a, b) = (&a.command_response, &b.command_response);
    a.server_type() == b.server_type()
        && a.min_wire_version == b.min_wire_version
        && a.max_wire_version == b.max_wire_version
        && a.me == b.me
        && a.hosts == b.hosts
        && a.passives == b.passives
        && a.arbiters == b.arbiters
        && a.tags == b.tags
        && a.set_name == b.set_name
        && a.set_version == b.set_version
        && a.election_id == b.election_id
        && a.primary == b.primary
        && a.logical_session_timeout_minutes == b.logical_session_timeout_minutes
        && a.topology_version == b.topology_version
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(Some(a)), Ok(Some(b))) => hello_reply_eq(a, b),
            (Ok(None), Ok(None)) => true,
            (Err(a), Err(b)) => match (a.code(), b.code()) {
                (Some(a_code), Some(b_code)) => a_code == b_code,
                _ => a.to_string() == b.to_string(),
            },
            _ => false,
        }
    }
}

impl ServerDescription {
    pub(crate) fn new(address: ServerAddress) -> Self {
        Self {
            address: address.canonicalized(),
            server_type: Default::default(),
            last_update_time: None,
            average_round_trip_time: None,
            reply: Ok(None),
        }
    }

    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_rtt: Duration,
    ) -> Self {
        let mut description = Self::new(address);
        description.average_round_trip_time = Some(average_rtt);
        description.last_update_time = Some(DateTime::now());
        description.server_type = reply.command_response.server_type();

        // Normalize all hostnames to lowercase.
        for list in [
            &mut reply.command_response.hosts,
            &mut reply.command_response.passives,
            &mut reply.command_response.arbiters,
        ]
        .into_iter()
        .flatten()
        {
            for host in list.iter_mut() {
                *host = host.to_lowercase();
            }
        }

        if let Some(ref mut me) = reply.command_response.me {
            *me = me.to_lowercase();
        }

        description.reply = Ok(Some(reply));

        description
    }

    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        let mut description = Self::new(address);
        description.last_update_time = Some(DateTime::now());
        description.reply = Err(error);
        description
    }

    /// Whether this server is "available" as per the definition in the server selection spec.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if let Ok(Some(ref reply)) = self.reply {
            let hello_min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);

            if hello_min_wire_version > DRIVER_MAX_WIRE_VERSION {
                return Some(format!(
                    "Server at {} requires wire version {}, but this version of the driver only \
                     supports up to {}",
                    self.address, hello_min_wire_version, DRIVER_MAX_WIRE_VERSION,
                ));
            }

            let hello_max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);

            if hello_max_wire_version < DRIVER_MIN_WIRE_VERSION {
                return Some(format!(
                    "Server at {} reports wire version {}, but this version of the driver \
                     requires at least {} (MongoDB {}).",
                    self.address,
                    hello_max_wire_version,
                    DRIVER_MIN_WIRE_VERSION,
                    DRIVER_MIN_DB_VERSION,
                ));
            }
        }

        None
    }

    pub(crate) fn error(&self) -> Option<&Error> {
        self.reply.as_ref().err()
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>> {
        let set_name = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_name.clone());
        Ok(set_name)
    }

    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>> {
        let known_hosts = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .map(|reply| {
                let hosts = reply.command_response.hosts.as_deref().unwrap_or_default();
                let passives = reply
                    .command_response
                    .passives
                    .as_deref()
                    .unwrap_or_default();
                let arbiters = reply
                    .command_response
                    .arbiters
                    .as_deref()
                    .unwrap_or_default();

                hosts
                    .iter()
                    .chain(passives.iter())
                    .chain(arbiters.iter())
                    .map(ServerAddress::parse)
                    .collect::<Result<Vec<ServerAddress>>>()
            })
            .transpose()?;

        Ok(known_hosts.unwrap_or_default())
    }

    /// Whether the server's self-reported address disagrees with the address the driver used to
    /// reach it.
    pub(crate) fn invalid_me(&self) -> Result<bool> {
        if let Some(reply) = self.reply.as_ref().map_err(Clone::clone)? {
            if let Some(ref me) = reply.command_response.me {
                return Ok(&self.address.to_string() != me);
            }
        }

        Ok(false)
    }

    pub(crate) fn primary(&self) -> Option<String> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.primary.clone(),
            _ => None,
        }
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>> {
        let set_version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_version);
        Ok(set_version)
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>> {
        let election_id = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.election_id);
        Ok(election_id)
    }

    pub(crate) fn min_wire_version(&self) -> Result<Option<i32>> {
        let version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.min_wire_version);
        Ok(version)
    }

    pub(crate) fn max_wire_version(&self) -> Result<Option<i32>> {
        let version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.max_wire_version);
        Ok(version)
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<DateTime>> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply
                .command_response
                .last_write
                .as_ref()
                .map(|write| write.last_write_date)),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn logical_session_timeout(&self) -> Result<Option<Duration>> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply
                .command_response
                .logical_session_timeout_minutes
                .map(|timeout| Duration::from_secs(timeout as u64 * 60))),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.reply {
            Ok(None) => None,
            Ok(Some(ref reply)) => reply.command_response.topology_version,
            Err(ref e) => e.topology_version(),
        }
    }

    pub(crate) fn tags(&self) -> Option<&TagSet> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.tags.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.tags() {
            Some(tags) => tags,
            None => return false,
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use bson::Document;

    use super::*;
    use crate::hello::{HelloCommandResponse, HelloReply};

    /// Builds a `ServerDescription` from a raw hello response document, the way a monitor would
    /// from a live server's reply.
    pub(crate) fn description_from_hello(
        address: &str,
        hello: Document,
    ) -> ServerDescription {
        let address = ServerAddress::parse(address).unwrap();
        let command_response: HelloCommandResponse = bson::from_document(hello.clone()).unwrap();
        ServerDescription::new_from_hello_reply(
            address.clone(),
            HelloReply {
                server_address: address,
                command_response,
                raw_command_response: hello,
            },
            Duration::from_millis(10),
        )
    }
}
