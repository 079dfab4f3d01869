use std::time::Duration;

use crate::{hello::HelloReply, options::ServerAddress, sdam::{ServerType, TopologyVersion}};

/// Information about the server a connection is connected to, derived from its handshake.
#[derive(Debug, Clone)]
pub(crate) struct StreamDescription {
    /// The address of the server.
    pub(crate) server_address: ServerAddress,

    /// The type the server had when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub(crate) min_wire_version: Option<i32>,

    /// The list of SASL mechanisms availble for the user's credential(s), used to negotiate the
    /// authentication mechanism when none was configured.
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// How long sessions started on this server will stay alive without further activity.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The maximum size of writes (excluding command overhead) that should be sent to the server.
    pub(crate) max_bson_object_size: i64,

    /// The maximum number of inserts, updates, or deletes that can be included in a single batch.
    pub(crate) max_write_batch_size: i64,

    /// Whether the server associated with this connection supports the `hello` command.
    pub(crate) hello_ok: bool,

    /// The topology version returned by the server, present when it supports streamed monitoring
    /// responses.
    pub(crate) topology_version: Option<TopologyVersion>,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `HelloReply`.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: response.server_type(),
            max_wire_version: response.max_wire_version,
            min_wire_version: response.min_wire_version,
            sasl_supported_mechs: response.sasl_supported_mechs.clone(),
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|timeout| Duration::from_secs(timeout as u64 * 60)),
            max_bson_object_size: response.max_bson_object_size.unwrap_or(16 * 1024 * 1024),
            max_write_batch_size: response.max_write_batch_size.unwrap_or(100_000),
            hello_ok: response.hello_ok.unwrap_or(false),
            topology_version: response.topology_version,
        }
    }

    /// Whether this server supports sessions, and by extension retryable writes.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }

    /// Whether this server supports retryable writes: sessions must be supported and the server
    /// must not be a standalone.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.supports_sessions() && self.initial_server_type != ServerType::Standalone
    }
}
