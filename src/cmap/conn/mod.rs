pub(crate) mod command;
mod stream_description;
pub(crate) mod wire;

use std::time::{Duration, Instant};

use bson::doc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use self::wire::{Header, Message};
use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime::{self, AsyncStream, TlsConfig},
};
pub(crate) use self::{
    command::{Command, CommandResponse},
    stream_description::StreamDescription,
};

/// Options used when opening a new connection, derived from the client options.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionOptions {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) socket_timeout: Option<Duration>,
    pub(crate) tls_config: Option<TlsConfig>,
}

/// A single authenticated channel to one server. Commands run strictly serially on a connection;
/// concurrency against an address comes only from the pool holding multiple connections.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,

    /// The cached StreamDescription from the connection's handshake.
    pub(crate) stream_description: Option<StreamDescription>,

    /// Marks the time when the connection was last checked into the pool, used to detect if it
    /// has sat idle.
    ready_and_available_time: Option<Instant>,

    stream: AsyncStream,
    socket_timeout: Option<Duration>,
    next_request_id: i32,
    dead: bool,
}

impl Connection {
    /// Opens the underlying TCP (and optionally TLS) stream. The connection is not usable by the
    /// pool until the establishment layer has run the handshake and authentication.
    pub(crate) async fn connect(
        id: u32,
        address: ServerAddress,
        generation: u32,
        options: &ConnectionOptions,
    ) -> Result<Self> {
        let stream =
            AsyncStream::connect(&address, options.connect_timeout, options.tls_config.as_ref())
                .await?;
        Ok(Self {
            id,
            address,
            generation,
            stream_description: None,
            ready_and_available_time: None,
            stream,
            socket_timeout: options.socket_timeout,
            next_request_id: 1,
            dead: false,
        })
    }

    /// Opens a connection used for server monitoring, which is never shared with the
    /// application's connection pool.
    pub(crate) async fn connect_monitoring(
        address: ServerAddress,
        options: &ConnectionOptions,
    ) -> Result<Self> {
        Self::connect(0, address, 0, options).await
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Allocates a request id from this connection's counter. Ids stay positive; the negative
    /// range is reserved for handshake and authentication exchanges.
    pub(crate) fn allocate_request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    /// Whether a fatal error has occurred on this connection.
    pub(crate) fn is_dead(&self) -> bool {
        self.dead
    }

    /// Helper to mark the time that the connection was checked into the pool for the purpose of
    /// detecting when it becomes idle.
    pub(crate) fn mark_checked_in(&mut self) {
        self.ready_and_available_time = Some(Instant::now());
    }

    /// Helper to mark that the connection has been checked out of the pool.
    pub(crate) fn mark_checked_out(&mut self) {
        self.ready_and_available_time.take();
    }

    /// Checks if the connection has been idle longer than `max_idle_time`.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        self.ready_and_available_time
            .and_then(|ready_and_available_time| {
                max_idle_time.map(|max_idle_time| {
                    Instant::now().duration_since(ready_and_available_time) >= max_idle_time
                })
            })
            .unwrap_or(false)
    }

    /// Checks if the connection belongs to a previous generation of its pool.
    pub(crate) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    /// Executes a `Command` and returns the server's reply.
    ///
    /// An `Ok(..)` result means the server received the command and replied to it; it does not
    /// imply anything about the success of the command itself. A request id may be supplied for
    /// exchanges whose ids are fixed (handshake and authentication); otherwise one is allocated
    /// from the connection's counter.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
    ) -> Result<CommandResponse> {
        self.send_command_with_timeout(command, request_id, self.socket_timeout)
            .await
    }

    /// `send_command` with an explicit read timeout, used for awaitable monitoring commands that
    /// legitimately block longer than the socket timeout.
    pub(crate) async fn send_command_with_timeout(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
        read_timeout: Option<Duration>,
    ) -> Result<CommandResponse> {
        if self.dead {
            return Err(Error::disconnected(format!(
                "connection {} to {} closed due to a previous error",
                self.id, self.address
            )));
        }

        let request_id = request_id.into().unwrap_or_else(|| self.allocate_request_id());

        // The handshake may be speaking to a pre-OP_MSG server, so it goes out as a legacy query
        // frame. Everything after the handshake uses OP_MSG.
        let frame = if self.stream_description.is_none() {
            Message::encode_op_query(command, request_id)?
        } else {
            Message::from_command(command, request_id).encode()?
        };

        let result = self.round_trip(frame, request_id, read_timeout).await;
        if result.is_err() {
            self.dead = true;
        }
        let message = result?;

        let body = message.single_document_response()?;
        Ok(CommandResponse::new(self.address.clone(), body))
    }

    async fn round_trip(
        &mut self,
        frame: Vec<u8>,
        request_id: i32,
        read_timeout: Option<Duration>,
    ) -> Result<Message> {
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;

        let read = self.read_message();
        let message = match read_timeout {
            Some(timeout) => runtime::timeout(timeout, read).await??,
            None => read.await?,
        };

        if message.response_to != request_id {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "expected a response to request {} but got one to {}",
                    request_id, message.response_to
                ),
            }
            .into());
        }

        Ok(message)
    }

    async fn read_message(&mut self) -> Result<Message> {
        let mut header_bytes = [0u8; Header::LENGTH];
        self.stream.read_exact(&mut header_bytes).await?;
        let header = Header::from_slice(&header_bytes)?;

        let body_length = (header.length as usize)
            .checked_sub(Header::LENGTH)
            .ok_or_else(|| {
                Error::from(ErrorKind::InvalidResponse {
                    message: format!("invalid message length {}", header.length),
                })
            })?;

        let mut body = vec![0u8; body_length];
        self.stream.read_exact(&mut body).await?;

        Message::decode(header, &body)
    }

    /// Runs a lightweight keepalive command on the connection.
    pub(crate) async fn ping(&mut self) -> Result<()> {
        let response = self
            .send_command(Command::new("ping", "admin", doc! { "ping": 1 }), None)
            .await?;
        response.ok().map(|_| ())
    }

    /// Gets the connection's StreamDescription.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            Error::internal("stream description accessed before handshake completed")
        })
    }
}
