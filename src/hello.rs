use std::time::Duration;

use bson::{doc, oid::ObjectId, DateTime, Document};
use serde::Deserialize;

use crate::{
    cmap::Command,
    options::ServerAddress,
    sdam::{ServerType, TopologyVersion},
    selection_criteria::TagSet,
};

/// The legacy version of the `hello` command which was deprecated in 5.0.
/// To limit usages of the legacy name in the codebase, this constant should be used
/// wherever possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";
pub(crate) const LEGACY_HELLO_COMMAND_NAME_LOWERCASE: &str = "ismaster";

#[derive(Debug, Clone, Copy)]
pub(crate) struct AwaitableHelloOptions {
    pub(crate) topology_version: TopologyVersion,
    pub(crate) max_await_time: Duration,
}

/// Construct a hello or legacy hello command, depending on the circumstances.
///
/// If the server indicated `helloOk: true`, then `hello` will be used. Otherwise, legacy hello
/// will be used, and if it's unknown whether the server supports hello, the command will also
/// contain `helloOk: true`.
pub(crate) fn hello_command(
    hello_ok: Option<bool>,
    awaitable_options: Option<AwaitableHelloOptions>,
) -> Command {
    let (mut body, command_name) = if matches!(hello_ok, Some(true)) {
        (doc! { "hello": 1 }, "hello")
    } else {
        let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        (body, LEGACY_HELLO_COMMAND_NAME)
    };

    if let Some(options) = awaitable_options {
        body.insert("topologyVersion", options.topology_version);
        body.insert(
            "maxAwaitTimeMS",
            options.max_await_time.as_millis().min(i64::MAX as u128) as i64,
        );
    }

    Command::new(command_name, "admin", body)
}

#[derive(Debug, Clone)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: Document,
}

/// The response to a `hello` command.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub(crate) is_writable_primary: Option<bool>,

    /// Legacy name for the `is_writable_primary` field.
    #[serde(rename = "ismaster")]
    pub(crate) is_master: Option<bool>,

    /// Whether or not the server supports using the `hello` command for monitoring instead
    /// of the legacy hello command.
    pub(crate) hello_ok: Option<bool>,

    /// The list of all hosts.
    pub(crate) hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub(crate) passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub(crate) arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a mongos.
    pub(crate) msg: Option<String>,

    /// The address of the server that returned this `HelloCommandResponse`.
    pub(crate) me: Option<String>,

    /// The current replica set config version.
    pub(crate) set_version: Option<i32>,

    /// The name of the current replica set.
    pub(crate) set_name: Option<String>,

    /// Whether the server is hidden.
    pub(crate) hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub(crate) secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub(crate) arbiter_only: Option<bool>,

    /// Whether the server is a member of an uninitialized replica set.
    #[serde(rename = "isreplicaset")]
    pub(crate) is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub(crate) logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub(crate) last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub(crate) min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub(crate) max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub(crate) tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub(crate) election_id: Option<ObjectId>,

    /// The address of the current primary member of the replica set.
    pub(crate) primary: Option<String>,

    /// A list of SASL mechanisms available for the user's credential(s).
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// The reply to speculative authentication done in the authentication handshake.
    pub(crate) speculative_authenticate: Option<Document>,

    /// The maximum permitted size of a BSON object in bytes.
    pub(crate) max_bson_object_size: Option<i64>,

    /// The maximum number of write operations permitted in a write batch.
    pub(crate) max_write_batch_size: Option<i64>,

    /// The maximum permitted size of a wire protocol message.
    pub(crate) max_message_size_bytes: Option<i64>,

    /// Used by the server to coordinate streamed monitoring responses.
    pub(crate) topology_version: Option<TopologyVersion>,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub(crate) last_write_date: DateTime,
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    fn parse(doc: Document) -> HelloCommandResponse {
        bson::from_document(doc).unwrap()
    }

    #[test]
    fn standalone_reply() {
        let response = parse(doc! { "ok": 1, "ismaster": true, "maxWireVersion": 17 });
        assert_eq!(response.server_type(), ServerType::Standalone);
    }

    #[test]
    fn mongos_reply() {
        let response = parse(doc! { "ok": 1, "ismaster": true, "msg": "isdbgrid" });
        assert_eq!(response.server_type(), ServerType::Mongos);
    }

    #[test]
    fn replica_set_replies() {
        let primary = parse(doc! { "ok": 1, "ismaster": true, "setName": "replset1" });
        assert_eq!(primary.server_type(), ServerType::RsPrimary);

        let secondary = parse(doc! { "ok": 1, "secondary": true, "setName": "replset1" });
        assert_eq!(secondary.server_type(), ServerType::RsSecondary);

        let arbiter = parse(doc! { "ok": 1, "arbiterOnly": true, "setName": "replset1" });
        assert_eq!(arbiter.server_type(), ServerType::RsArbiter);

        let hidden = parse(doc! {
            "ok": 1,
            "secondary": true,
            "hidden": true,
            "setName": "replset1"
        });
        assert_eq!(hidden.server_type(), ServerType::RsOther);

        let ghost = parse(doc! { "ok": 1, "isreplicaset": true });
        assert_eq!(ghost.server_type(), ServerType::RsGhost);
    }
}
