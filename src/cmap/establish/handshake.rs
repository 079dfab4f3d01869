use bson::{doc, Bson, Document};
use once_cell::sync::Lazy;

use crate::{
    client::auth::{ClientFirst, Credential, FirstRound},
    cmap::conn::{wire::HANDSHAKE_REQUEST_ID, Command, Connection, StreamDescription},
    error::{Error, ErrorKind, Result},
    hello::{HelloReply, LEGACY_HELLO_COMMAND_NAME},
    options::ClientOptions,
};

#[derive(Clone, Debug)]
struct ClientMetadata {
    application: Option<AppMetadata>,
    driver: DriverMetadata,
    os: OsMetadata,
    platform: Option<String>,
}

#[derive(Clone, Debug)]
struct AppMetadata {
    name: String,
}

#[derive(Clone, Debug)]
struct DriverMetadata {
    name: String,
    version: String,
}

#[derive(Clone, Debug)]
struct OsMetadata {
    os_type: String,
    name: Option<String>,
    architecture: String,
    version: Option<String>,
}

impl From<ClientMetadata> for Bson {
    fn from(metadata: ClientMetadata) -> Self {
        let mut metadata_doc = Document::new();

        if let Some(application) = metadata.application {
            metadata_doc.insert("application", doc! { "name": application.name });
        }

        metadata_doc.insert(
            "driver",
            doc! {
                "name": metadata.driver.name,
                "version": metadata.driver.version,
            },
        );

        metadata_doc.insert("os", metadata.os);

        if let Some(platform) = metadata.platform {
            metadata_doc.insert("platform", platform);
        }

        Bson::Document(metadata_doc)
    }
}

impl From<OsMetadata> for Bson {
    fn from(metadata: OsMetadata) -> Self {
        let mut doc = doc! { "type": metadata.os_type };

        if let Some(name) = metadata.name {
            doc.insert("name", name);
        }

        doc.insert("architecture", metadata.architecture);

        if let Some(version) = metadata.version {
            doc.insert("version", version);
        }

        Bson::Document(doc)
    }
}

/// Contains the basic handshake information that can be statically determined. This document
/// (potentially with additional fields added) can be cloned and put in the `client` field of
/// the handshake command.
static BASE_CLIENT_METADATA: Lazy<ClientMetadata> = Lazy::new(|| {
    let mut metadata = ClientMetadata {
        application: None,
        driver: DriverMetadata {
            name: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
        },
        os: OsMetadata {
            os_type: std::env::consts::OS.into(),
            architecture: std::env::consts::ARCH.into(),
            name: None,
            version: None,
        },
        platform: None,
    };

    let info = os_info::get();

    if info.os_type() != os_info::Type::Unknown {
        metadata.os.name = Some(info.os_type().to_string());

        let version = info.version();
        if *version != os_info::Version::Unknown {
            metadata.os.version = Some(version.to_string());
        }
    }

    let rustc = rustc_version_runtime::version();
    metadata.platform = Some(format!("rustc {}", rustc));

    metadata
});

/// Contains the logic needed to handshake a connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    /// The handshake command to send. This is always identical given the same client options, so
    /// it is created up front and cloned per connection.
    command: Command,
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let mut metadata = BASE_CLIENT_METADATA.clone();

        if let Some(ref app_name) = options.app_name {
            metadata.application = Some(AppMetadata {
                name: app_name.to_string(),
            });
        }

        let mut db = "admin";

        // The first exchange on a connection may be with a pre-`hello` server, so the handshake
        // always uses the legacy command name and negotiates `hello` support via `helloOk`.
        let mut body = doc! {
            LEGACY_HELLO_COMMAND_NAME: 1,
            "helloOk": true,
            "client": metadata,
        };

        if let Some(ref credential) = options.credential {
            credential.append_needed_mechanism_negotiation(&mut body);
            db = credential.resolved_source();
        }

        Self {
            command: Command::new(LEGACY_HELLO_COMMAND_NAME, db, body),
        }
    }

    /// Handshakes a connection, optionally beginning authentication speculatively. Returns the
    /// first round of the authentication exchange when the server replied to the speculative
    /// attempt.
    pub(crate) async fn handshake(
        &self,
        conn: &mut Connection,
        credential: Option<&Credential>,
    ) -> Result<Option<FirstRound>> {
        let mut command = self.command.clone();

        let client_first = match credential {
            Some(credential) => {
                let client_first = credential.build_speculative_client_first()?;
                if let Some(ref client_first) = client_first {
                    command
                        .body
                        .insert("speculativeAuthenticate", client_first.to_document());
                }
                client_first
            }
            None => None,
        };

        let mut reply = run_handshake(conn, command).await?;
        conn.stream_description = Some(StreamDescription::from_hello_reply(&reply));

        let first_round = client_first.and_then(|client_first| {
            reply
                .command_response
                .speculative_authenticate
                .take()
                .map(|server_first| client_first.into_first_round(server_first))
        });

        Ok(first_round)
    }

    /// Handshakes a monitoring connection, returning the hello reply for the monitor to turn
    /// into a server description.
    pub(crate) async fn handshake_monitoring(&self, conn: &mut Connection) -> Result<HelloReply> {
        let reply = run_handshake(conn, self.command.clone()).await?;
        conn.stream_description = Some(StreamDescription::from_hello_reply(&reply));
        Ok(reply)
    }
}

async fn run_handshake(conn: &mut Connection, command: Command) -> Result<HelloReply> {
    let response = conn.send_command(command, HANDSHAKE_REQUEST_ID).await?;
    let body = match response.ok() {
        Ok(body) => body,
        Err(error) if error.is_command_error() => {
            return Err(Error::from(ErrorKind::Handshake {
                message: format!("the server rejected the handshake: {}", error),
            })
            .with_address(conn.address().clone()))
        }
        Err(error) => return Err(error),
    };

    let command_response = bson::from_document(body.clone()).map_err(|e| {
        Error::from(ErrorKind::Handshake {
            message: format!("invalid server handshake response: {}", e),
        })
        .with_address(conn.address().clone())
    })?;

    Ok(HelloReply {
        server_address: conn.address().clone(),
        command_response,
        raw_command_response: body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::auth::AuthMechanism;
    use crate::options::ClientOptions;

    #[test]
    fn metadata_includes_driver_and_os() {
        let mut options = ClientOptions::default();
        options.app_name = Some("testApp".to_string());
        let handshaker = Handshaker::new(&options);

        let client = handshaker.command.body.get_document("client").unwrap();
        assert_eq!(
            client.get_document("application").unwrap().get_str("name"),
            Ok("testApp")
        );
        let driver = client.get_document("driver").unwrap();
        assert_eq!(driver.get_str("name"), Ok("mongocore"));
        assert!(client.get_document("os").unwrap().get_str("type").is_ok());
    }

    #[test]
    fn negotiation_key_present_only_without_mechanism() {
        let mut options = ClientOptions::default();
        options.credential = Some(
            Credential::builder()
                .username("sarah".to_string())
                .password("pw".to_string())
                .build(),
        );
        let handshaker = Handshaker::new(&options);
        assert_eq!(
            handshaker.command.body.get_str("saslSupportedMechs"),
            Ok("admin.sarah")
        );

        options.credential.as_mut().unwrap().mechanism = Some(AuthMechanism::ScramSha256);
        let handshaker = Handshaker::new(&options);
        assert!(!handshaker
            .command
            .body
            .contains_key("saslSupportedMechs"));
    }
}
