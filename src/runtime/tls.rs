use std::{
    convert::TryFrom,
    fs::File,
    io::BufReader,
    sync::Arc,
    time::SystemTime,
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier, ServerName},
    Certificate,
    ClientConfig,
    Error as TlsError,
    OwnedTrustAnchor,
    PrivateKey,
    RootCertStore,
};
use rustls_pemfile::{certs, read_one, Item};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use webpki_roots::TLS_SERVER_ROOTS;

use crate::{
    error::{Error, ErrorKind, Result},
    options::TlsOptions,
};

/// Configuration required to use TLS. Creating this is expensive, so its best to cache this value
/// and reuse it for multiple connections.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish()
    }
}

impl TlsConfig {
    /// Create a new `TlsConfig` from the provided options from the user.
    /// This operation is expensive, so the resultant `TlsConfig` should be cached.
    pub(crate) fn new(options: &TlsOptions) -> Result<TlsConfig> {
        let tls_config = make_rustls_config(options)?;
        let connector: TlsConnector = Arc::new(tls_config).into();
        Ok(TlsConfig { connector })
    }

    pub(crate) async fn connect(
        &self,
        host: &str,
        tcp_stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let name = ServerName::try_from(host).map_err(|e| {
            Error::from(ErrorKind::InvalidArgument {
                message: format!("invalid hostname {:?} for TLS: {}", host, e),
            })
        })?;

        let stream = self.connector.connect(name, tcp_stream).await?;
        Ok(stream)
    }
}

/// Converts `TlsOptions` into a `rustls::ClientConfig`.
fn make_rustls_config(cfg: &TlsOptions) -> Result<ClientConfig> {
    let mut store = RootCertStore::empty();
    if let Some(ref path) = cfg.ca_file_path {
        let ders = certs(&mut BufReader::new(File::open(path)?)).map_err(|_| {
            ErrorKind::InvalidArgument {
                message: format!(
                    "Unable to parse PEM-encoded root certificate from {}",
                    path.display()
                ),
            }
        })?;
        store.add_parsable_certificates(&ders);
    } else {
        let trust_anchors = TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        });
        store.add_server_trust_anchors(trust_anchors);
    }

    let config_builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(store);

    let mut config = if let Some(ref path) = cfg.cert_key_file_path {
        let mut file = BufReader::new(File::open(path)?);
        let certs: Vec<Certificate> = match certs(&mut file) {
            Ok(certs) => certs.into_iter().map(Certificate).collect(),
            Err(error) => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "Unable to parse PEM-encoded client certificate from {}: {}",
                        path.display(),
                        error,
                    ),
                }
                .into())
            }
        };

        let mut file = BufReader::new(File::open(path)?);
        let key = loop {
            match read_one(&mut file) {
                Ok(Some(Item::PKCS8Key(bytes))) | Ok(Some(Item::RSAKey(bytes))) => {
                    break PrivateKey(bytes)
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!("No PEM-encoded keys in {}", path.display()),
                    }
                    .into())
                }
                Err(error) => {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "Unable to parse PEM-encoded item from {}: {}",
                            path.display(),
                            error,
                        ),
                    }
                    .into())
                }
            }
        };

        config_builder
            .with_single_cert(certs, key)
            .map_err(|error| ErrorKind::InvalidArgument {
                message: error.to_string(),
            })?
    } else {
        config_builder.with_no_client_auth()
    };

    if let Some(true) = cfg.allow_invalid_certificates {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier {}));
    }

    Ok(config)
}

struct NoCertVerifier {}

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _: &Certificate,
        _: &[Certificate],
        _: &ServerName,
        _: &mut dyn Iterator<Item = &[u8]>,
        _: &[u8],
        _: SystemTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}
