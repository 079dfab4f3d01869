pub(crate) mod handshake;

use self::handshake::Handshaker;
use crate::{
    client::auth::Credential,
    cmap::conn::{Connection, ConnectionOptions},
    error::Result,
    hello::HelloReply,
    options::{ClientOptions, ServerAddress},
    runtime::TlsConfig,
};

/// Contains the logic to establish a connection, including handshaking and authenticating.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionEstablisher {
    handshaker: Handshaker,
    connection_options: ConnectionOptions,
    credential: Option<Credential>,
}

impl ConnectionEstablisher {
    /// Creates a new `ConnectionEstablisher` from the client options.
    pub(crate) fn new(options: &ClientOptions) -> Result<Self> {
        let tls_config = match options.tls_options() {
            Some(ref tls_options) => Some(TlsConfig::new(tls_options)?),
            None => None,
        };

        Ok(Self {
            handshaker: Handshaker::new(options),
            connection_options: ConnectionOptions {
                connect_timeout: options.connect_timeout,
                socket_timeout: options.socket_timeout,
                tls_config,
            },
            credential: options.credential.clone(),
        })
    }

    /// Establishes an application connection: opens the stream, runs the handshake (carrying the
    /// first authentication message speculatively when possible), and completes authentication.
    pub(crate) async fn establish_connection(
        &self,
        id: u32,
        address: ServerAddress,
        generation: u32,
    ) -> Result<Connection> {
        let mut connection =
            Connection::connect(id, address, generation, &self.connection_options).await?;

        let first_round = self
            .handshaker
            .handshake(&mut connection, self.credential.as_ref())
            .await?;

        if let Some(ref credential) = self.credential {
            credential
                .authenticate_stream(&mut connection, first_round)
                .await?;
        }

        Ok(connection)
    }

    /// Establishes a monitoring connection, which handshakes without authenticating.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
    ) -> Result<(Connection, HelloReply)> {
        let mut connection =
            Connection::connect_monitoring(address, &self.connection_options).await?;
        let reply = self.handshaker.handshake_monitoring(&mut connection).await?;

        Ok((connection, reply))
    }
}
