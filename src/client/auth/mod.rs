//! Contains the types needed to specify the auth configuration for a [`Client`](crate::Client).

mod cr;
mod plain;
mod sasl;
mod scram;
mod x509;

use std::{borrow::Cow, fmt, str::FromStr};

use bson::Document;
use rand::Rng;
use serde::Deserialize;
use typed_builder::TypedBuilder;

use self::scram::ScramVersion;
use crate::{
    cmap::{Command, Connection, StreamDescription},
    error::{Error, ErrorKind, Result},
};

const SCRAM_SHA_1_STR: &str = "SCRAM-SHA-1";
const SCRAM_SHA_256_STR: &str = "SCRAM-SHA-256";
const MONGODB_CR_STR: &str = "MONGODB-CR";
const MONGODB_X509_STR: &str = "MONGODB-X509";
const PLAIN_STR: &str = "PLAIN";

/// The authentication mechanisms supported by this driver.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// The SCRAM-SHA-1 mechanism as defined in [RFC 5802](http://tools.ietf.org/html/rfc5802).
    ScramSha1,

    /// The SCRAM-SHA-256 mechanism which extends [RFC 5802](http://tools.ietf.org/html/rfc5802)
    /// and is formally defined in [RFC 7677](https://tools.ietf.org/html/rfc7677).
    ScramSha256,

    /// The legacy MongoDB challenge-response mechanism, deprecated server-side since 3.6 but
    /// still spoken by old deployments.
    MongoDbCr,

    /// The MONGODB-X509 mechanism based on the usage of X.509 certificates to validate a client
    /// where the distinguished subject name of the client certificate acts as the username.
    MongoDbX509,

    /// The SASL PLAIN mechanism, as defined in [RFC 4616](https://tools.ietf.org/html/rfc4616),
    /// used in MongoDB to perform LDAP authentication. Since the credentials are stored outside
    /// of MongoDB, the "$external" database must be used for authentication.
    Plain,
}

impl AuthMechanism {
    fn from_scram_version(scram: &ScramVersion) -> Self {
        match scram {
            ScramVersion::Sha1 => Self::ScramSha1,
            ScramVersion::Sha256 => Self::ScramSha256,
        }
    }

    /// Negotiate a mechanism from the `saslSupportedMechs` the server advertised during the
    /// handshake, preferring SCRAM-SHA-256 and falling back to SCRAM-SHA-1.
    pub(crate) fn from_stream_description(description: &StreamDescription) -> AuthMechanism {
        let scram_sha_256_found = description
            .sasl_supported_mechs
            .as_ref()
            .map(|ms| ms.iter().any(|m| m == SCRAM_SHA_256_STR))
            .unwrap_or(false);

        if scram_sha_256_found {
            AuthMechanism::ScramSha256
        } else {
            AuthMechanism::ScramSha1
        }
    }

    /// Determines if the provided credentials have the required information to perform
    /// authentication.
    pub fn validate_credential(&self, credential: &Credential) -> Result<()> {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 | AuthMechanism::MongoDbCr => {
                if credential.username.is_none() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!("No username provided for {} authentication", self),
                    }
                    .into());
                };
                Ok(())
            }
            AuthMechanism::MongoDbX509 => {
                if credential.password.is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "A password cannot be specified with MONGODB-X509".to_string(),
                    }
                    .into());
                }

                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(ErrorKind::InvalidArgument {
                        message: "only $external may be specified as an auth source for \
                                  MONGODB-X509"
                            .to_string(),
                    }
                    .into());
                }

                Ok(())
            }
            AuthMechanism::Plain => {
                if credential.username.as_deref().unwrap_or("").is_empty() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "Username for PLAIN authentication must be non-empty".to_string(),
                    }
                    .into());
                }

                if credential.password.is_none() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "No password provided for PLAIN authentication".to_string(),
                    }
                    .into());
                }

                Ok(())
            }
        }
    }

    /// Returns this `AuthMechanism` as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => SCRAM_SHA_1_STR,
            AuthMechanism::ScramSha256 => SCRAM_SHA_256_STR,
            AuthMechanism::MongoDbCr => MONGODB_CR_STR,
            AuthMechanism::MongoDbX509 => MONGODB_X509_STR,
            AuthMechanism::Plain => PLAIN_STR,
        }
    }

    /// Get the default authSource for a given mechanism depending on the database provided in the
    /// connection string.
    pub(crate) fn default_source<'a>(&self, uri_db: Option<&'a str>) -> &'a str {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 | AuthMechanism::MongoDbCr => {
                uri_db.unwrap_or("admin")
            }
            AuthMechanism::MongoDbX509 | AuthMechanism::Plain => "$external",
        }
    }

    /// Constructs the first message of the authentication handshake for mechanisms that can begin
    /// speculatively inside the `hello` exchange.
    pub(crate) fn build_speculative_client_first(
        &self,
        credential: &Credential,
    ) -> Result<Option<ClientFirst>> {
        match self {
            Self::ScramSha1 => Ok(Some(ClientFirst::Scram(
                ScramVersion::Sha1,
                ScramVersion::Sha1.build_client_first(credential, true)?,
            ))),
            Self::ScramSha256 => Ok(Some(ClientFirst::Scram(
                ScramVersion::Sha256,
                ScramVersion::Sha256.build_client_first(credential, true)?,
            ))),
            Self::MongoDbX509 => Ok(Some(ClientFirst::X509(x509::build_client_first(
                credential,
            )))),
            Self::MongoDbCr | Self::Plain => Ok(None),
        }
    }

    /// Completes authentication on a freshly handshaked connection.
    pub(crate) async fn authenticate_stream(
        &self,
        stream: &mut Connection,
        credential: &Credential,
    ) -> Result<()> {
        self.validate_credential(credential)?;

        match self {
            AuthMechanism::ScramSha1 => {
                ScramVersion::Sha1
                    .authenticate_stream(stream, credential, None)
                    .await
            }
            AuthMechanism::ScramSha256 => {
                ScramVersion::Sha256
                    .authenticate_stream(stream, credential, None)
                    .await
            }
            AuthMechanism::MongoDbCr => cr::authenticate_stream(stream, credential).await,
            AuthMechanism::MongoDbX509 => {
                x509::authenticate_stream(stream, credential, None).await
            }
            AuthMechanism::Plain => plain::authenticate_stream(stream, credential).await,
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            SCRAM_SHA_1_STR => Ok(AuthMechanism::ScramSha1),
            SCRAM_SHA_256_STR => Ok(AuthMechanism::ScramSha256),
            MONGODB_CR_STR => Ok(AuthMechanism::MongoDbCr),
            MONGODB_X509_STR => Ok(AuthMechanism::MongoDbX509),
            PLAIN_STR => Ok(AuthMechanism::Plain),
            _ => Err(ErrorKind::InvalidArgument {
                message: format!("invalid mechanism string: {}", str),
            }
            .into()),
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A struct containing authentication information.
///
/// Some fields (mechanism and source) may be omitted and will either be negotiated or assigned a
/// default value, depending on the values of other fields in the credential.
#[derive(Clone, Default, Deserialize, TypedBuilder, PartialEq)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with. This applies to all mechanisms but may be omitted when
    /// authenticating via MONGODB-X509.
    pub username: Option<String>,

    /// The database used to authenticate. This applies to all mechanisms and defaults to "admin"
    /// in SCRAM authentication mechanisms and "$external" for MONGODB-X509 and PLAIN.
    pub source: Option<String>,

    /// The password to authenticate with. This does not apply to all mechanisms.
    pub password: Option<String>,

    /// Which authentication mechanism to use. If not provided, one will be negotiated with the
    /// server.
    pub mechanism: Option<AuthMechanism>,

    /// Additional properties for the given mechanism.
    pub mechanism_properties: Option<Document>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The password must never appear in logs or debug output.
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("source", &self.source)
            .field("password", &self.password.as_ref().map(|_| "..."))
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

impl Credential {
    /// The database this credential authenticates against, accounting for mechanism defaults.
    pub(crate) fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or_else(|| {
            self.mechanism
                .as_ref()
                .map(|m| m.default_source(None))
                .unwrap_or("admin")
        })
    }

    /// If the mechanism is missing, append the appropriate mechanism negotiation key-value-pair
    /// to the provided handshake command document.
    pub(crate) fn append_needed_mechanism_negotiation(&self, command: &mut Document) {
        if let (Some(username), None) = (self.username.as_ref(), self.mechanism.as_ref()) {
            command.insert(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }

    /// Builds the first message of the authentication exchange to ride inside the handshake, if
    /// the configured (or presumed) mechanism supports that.
    pub(crate) fn build_speculative_client_first(&self) -> Result<Option<ClientFirst>> {
        // When no mechanism is configured the negotiation answer arrives with the same hello
        // reply that carries the speculative response, so SCRAM-SHA-256 is presumed.
        match self.mechanism {
            Some(ref mechanism) => mechanism.build_speculative_client_first(self),
            None => AuthMechanism::ScramSha256.build_speculative_client_first(self),
        }
    }

    /// Attempts to authenticate a stream according to this credential, returning an error result
    /// on failure. A mechanism may be negotiated if one is not provided as part of the credential.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        first_round: Option<FirstRound>,
    ) -> Result<()> {
        let stream_description = conn.stream_description()?;

        // Arbiters don't have user data and cannot be authenticated against.
        if !stream_description.initial_server_type.can_auth() {
            return Ok(());
        }

        // If speculative authentication returned a response, short-circuit the authentication
        // logic and use the first round from the handshake.
        if let Some(first_round) = first_round {
            return match first_round {
                FirstRound::Scram(version, first_round) => {
                    version
                        .authenticate_stream(conn, self, Some(first_round))
                        .await
                }
                FirstRound::X509(server_first) => {
                    x509::authenticate_stream(conn, self, Some(server_first)).await
                }
            };
        }

        let mechanism = match self.mechanism {
            None => Cow::Owned(AuthMechanism::from_stream_description(stream_description)),
            Some(ref m) => Cow::Borrowed(m),
        };

        mechanism.authenticate_stream(conn, self).await
    }
}

/// Contains the first client message sent as part of the authentication handshake.
#[derive(Debug)]
pub(crate) enum ClientFirst {
    Scram(ScramVersion, scram::ClientFirst),
    X509(Command),
}

impl ClientFirst {
    pub(crate) fn to_document(&self) -> Document {
        match self {
            Self::Scram(version, client_first) => client_first.to_command(version).body,
            Self::X509(command) => command.body.clone(),
        }
    }

    pub(crate) fn into_first_round(self, server_first: Document) -> FirstRound {
        match self {
            Self::Scram(version, client_first) => FirstRound::Scram(
                version,
                scram::FirstRound {
                    client_first,
                    server_first,
                },
            ),
            Self::X509(..) => FirstRound::X509(server_first),
        }
    }
}

/// Contains the complete first round of the authentication handshake, including the client
/// message and the server response.
#[derive(Debug)]
pub(crate) enum FirstRound {
    Scram(ScramVersion, scram::FirstRound),
    X509(Document),
}

/// The number of random bytes in a client nonce before base64 encoding.
const NONCE_LENGTH: usize = 24;

pub(crate) fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill(&mut bytes[..]);
    base64::encode(bytes)
}
