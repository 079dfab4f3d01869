use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    ops::{BitXor, Range},
    str,
    sync::RwLock,
};

use bson::{Bson, Document};
use hmac::{Hmac, Mac};
use md5::Md5;
use once_cell::sync::Lazy;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{
    client::auth::{
        self,
        sasl::{SaslContinue, SaslResponse, SaslStart},
        AuthMechanism,
        Credential,
    },
    cmap::{
        conn::wire::{AUTH_CONTINUE_REQUEST_ID, AUTH_FINAL_REQUEST_ID, AUTH_FIRST_REQUEST_ID},
        Connection,
    },
    error::{Error, Result},
};

// The single letter attribute keys in SCRAM messages.
const ITERATION_COUNT_KEY: char = 'i';
const ERROR_KEY: char = 'e';
const PROOF_KEY: char = 'p';
const VERIFIER_KEY: char = 'v';
const NONCE_KEY: char = 'r';
const SALT_KEY: char = 's';
const CHANNEL_BINDING_KEY: char = 'c';
const USERNAME_KEY: char = 'n';

/// Constant specifying that we won't be using channel binding.
const NO_CHANNEL_BINDING: char = 'n';

/// The minimum number of iterations of the hash function that we will accept from the server.
const MIN_ITERATION_COUNT: u32 = 4096;

/// Cache of pre-computed salted passwords. PBKDF2 dominates the cost of establishing a
/// connection, so each derived key is computed at most once per process.
static CREDENTIAL_CACHE: Lazy<RwLock<HashMap<CacheEntry, Vec<u8>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Keyed by everything that feeds the PBKDF2 derivation. The password component is the
/// mechanism-specific digest, so keys derived for one user can never be served to another.
#[derive(Hash, Eq, PartialEq)]
struct CacheEntry {
    password: String,
    salt: Vec<u8>,
    i: u32,
    mechanism: ScramVersion,
}

/// The versions of SCRAM supported by the driver (classified according to the hash function
/// used).
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub(crate) enum ScramVersion {
    Sha1,
    Sha256,
}

impl ScramVersion {
    /// Constructs the client first message, optionally for use in speculative authentication
    /// during the handshake.
    pub(crate) fn build_client_first(
        &self,
        credential: &Credential,
        include_db: bool,
    ) -> Result<ClientFirst> {
        let username = credential
            .username
            .as_ref()
            .ok_or_else(|| Error::authentication_error("SCRAM", "no username supplied"))?;

        let nonce = auth::generate_nonce();

        Ok(ClientFirst::new(
            credential.resolved_source(),
            username,
            nonce,
            include_db,
        ))
    }

    /// Sends the client first message to the server, returning the response along with the
    /// message that produced it.
    async fn send_client_first(
        &self,
        conn: &mut Connection,
        credential: &Credential,
    ) -> Result<(ClientFirst, Document)> {
        let client_first = self.build_client_first(credential, false)?;

        let command = client_first.to_command(self);
        let response = conn.send_command(command, AUTH_FIRST_REQUEST_ID).await?;

        Ok((client_first, response.into_body()))
    }

    /// Perform SCRAM authentication for a given stream. The first round may have already
    /// happened speculatively as part of the handshake.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        credential: &Credential,
        first_round: Option<FirstRound>,
    ) -> Result<()> {
        let username = credential
            .username
            .as_ref()
            .ok_or_else(|| Error::authentication_error("SCRAM", "no username supplied"))?;

        let password = credential
            .password
            .as_ref()
            .ok_or_else(|| Error::authentication_error("SCRAM", "no password supplied"))?;

        if credential.mechanism_properties.is_some() {
            return Err(Error::authentication_error(
                "SCRAM",
                "mechanism properties MUST NOT be specified",
            ));
        };

        let source = credential.resolved_source().to_string();

        let (client_first, server_first_doc) = match first_round {
            Some(FirstRound {
                client_first,
                server_first,
            }) => (client_first, server_first),
            None => self.send_client_first(conn, credential).await?,
        };

        let server_first_response =
            SaslResponse::parse(self.mechanism_str(), server_first_doc)?;
        let server_first = ServerFirst::parse(
            server_first_response.conversation_id,
            server_first_response.done,
            &server_first_response.payload,
        )?;
        server_first.validate(client_first.nonce())?;

        let cache_entry_key = CacheEntry {
            password: self.password_digest(username, password)?.into_owned(),
            salt: server_first.salt().to_vec(),
            i: server_first.i(),
            mechanism: self.clone(),
        };
        let (should_update_cache, salted_password) = match CREDENTIAL_CACHE
            .read()
            .map_err(|_| Error::unknown_authentication_error(self.mechanism_str()))?
            .get(&cache_entry_key)
        {
            Some(pwd) => (false, pwd.clone()),
            None => (
                true,
                self.h_i(
                    cache_entry_key.password.as_str(),
                    server_first.salt(),
                    server_first.i(),
                ),
            ),
        };

        let client_final = ClientFinal::new(
            salted_password.as_slice(),
            &client_first,
            &server_first,
            self,
        )?;

        let command = SaslContinue::new(
            source.clone(),
            client_final.conversation_id.clone(),
            client_final.message().as_bytes().to_vec(),
        )
        .into_command();

        let response = conn.send_command(command, AUTH_CONTINUE_REQUEST_ID).await?;
        let server_final_response = SaslResponse::parse(self.mechanism_str(), response.into_body())?;
        let server_final = ServerFinal::parse(
            server_final_response.conversation_id,
            server_final_response.done,
            &server_final_response.payload,
        )?;
        server_final.validate(salted_password.as_slice(), &client_final, self)?;

        // Normal SCRAM implementations would cease here. The following round trip is MongoDB
        // implementation specific (a client no-op answered by a server no-op with `done: true`)
        // and is skipped when the server honored `skipEmptyExchange`.
        if !server_final.done {
            let command = SaslContinue::new(
                source,
                server_final.conversation_id().clone(),
                Vec::new(),
            )
            .into_command();
            let response = conn.send_command(command, AUTH_FINAL_REQUEST_ID).await?;
            let server_noop_response =
                SaslResponse::parse(self.mechanism_str(), response.into_body())?;

            if server_noop_response.conversation_id != *server_final.conversation_id() {
                return Err(Error::authentication_error(
                    "SCRAM",
                    "mismatched conversationId's",
                ));
            }

            if !server_noop_response.done {
                return Err(Error::authentication_error(
                    "SCRAM",
                    "authentication did not complete successfully",
                ));
            }
        }

        if should_update_cache {
            if let Ok(ref mut cache) = CREDENTIAL_CACHE.write() {
                if cache.get(&cache_entry_key).is_none() {
                    cache.insert(cache_entry_key, salted_password);
                }
            }
        }

        Ok(())
    }

    fn mechanism_str(&self) -> &'static str {
        AuthMechanism::from_scram_version(self).as_str()
    }

    /// HMAC function used as part of SCRAM authentication.
    fn hmac(&self, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        let bytes = match self {
            ScramVersion::Sha1 => mac::<Hmac<Sha1>>(key, input)?,
            ScramVersion::Sha256 => mac::<Hmac<Sha256>>(key, input)?,
        };

        Ok(bytes)
    }

    /// Compute the HMAC of the given key and input and verify it matches the given signature.
    fn hmac_verify(&self, key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            ScramVersion::Sha1 => mac_verify::<Hmac<Sha1>>(key, input, signature),
            ScramVersion::Sha256 => mac_verify::<Hmac<Sha256>>(key, input, signature),
        }
    }

    /// The "h" function defined in the SCRAM RFC.
    fn h(&self, str: &[u8]) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => hash::<Sha1>(str),
            ScramVersion::Sha256 => hash::<Sha256>(str),
        }
    }

    /// The "h_i" function as defined in the SCRAM RFC.
    fn h_i(&self, str: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => h_i::<Hmac<Sha1>>(str, salt, iterations, 160 / 8),
            ScramVersion::Sha256 => h_i::<Hmac<Sha256>>(str, salt, iterations, 256 / 8),
        }
    }

    /// The normalized password string fed to PBKDF2: the MongoDB-specific MD5 digest for SHA-1
    /// and the SASLprep'd password for SHA-256.
    fn password_digest<'a>(&self, username: &str, password: &'a str) -> Result<Cow<'a, str>> {
        match self {
            ScramVersion::Sha1 => {
                let mut md5 = Md5::new();
                md5.update(format!("{}:mongo:{}", username, password));
                Ok(Cow::Owned(hex::encode(md5.finalize())))
            }
            ScramVersion::Sha256 => match stringprep::saslprep(password) {
                Ok(p) => Ok(p),
                Err(_) => Err(Error::authentication_error(
                    "SCRAM-SHA-256",
                    "saslprep failure",
                )),
            },
        }
    }
}

impl fmt::Display for ScramVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mechanism_str())
    }
}

fn xor(lhs: &[u8], rhs: &[u8]) -> Vec<u8> {
    debug_assert_eq!(lhs.len(), rhs.len());

    lhs.iter()
        .zip(rhs.iter())
        .map(|(l, r)| l.bitxor(r))
        .collect()
}

fn mac<M: Mac + hmac::digest::KeyInit>(key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::unknown_authentication_error("SCRAM"))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn mac_verify<M: Mac + hmac::digest::KeyInit>(
    key: &[u8],
    input: &[u8],
    signature: &[u8],
) -> Result<()> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::unknown_authentication_error("SCRAM"))?;
    mac.update(input);
    match mac.verify_slice(signature) {
        Ok(_) => Ok(()),
        Err(_) => Err(Error::authentication_error(
            "SCRAM",
            "Authentication failed.",
        )),
    }
}

fn hash<D: Digest>(val: &[u8]) -> Vec<u8> {
    let mut hash = D::new();
    hash.update(val);
    hash.finalize().to_vec()
}

fn h_i<M>(str: &str, salt: &[u8], iterations: u32, output_size: usize) -> Vec<u8>
where
    M: hmac::digest::KeyInit
        + hmac::digest::Update
        + hmac::digest::FixedOutput
        + Clone
        + Sync,
{
    let mut buf = vec![0u8; output_size];
    pbkdf2::pbkdf2::<M>(str.as_bytes(), salt, iterations, buf.as_mut_slice());
    buf
}

/// Parses a string slice of the form "<expected_key>=<body>" into "<body>", if possible.
fn parse_kvp(str: &str, expected_key: char) -> Result<String> {
    if str.chars().next() != Some(expected_key) || str.chars().nth(1) != Some('=') {
        Err(Error::invalid_authentication_response("SCRAM"))
    } else {
        Ok(str.chars().skip(2).collect())
    }
}

/// Model of the first message sent by the client.
#[derive(Debug)]
pub(crate) struct ClientFirst {
    source: String,

    message: String,

    gs2_header: Range<usize>,

    bare: Range<usize>,

    nonce: String,

    include_db: bool,
}

impl ClientFirst {
    fn new(source: &str, username: &str, nonce: String, include_db: bool) -> Self {
        let gs2_header = format!("{},,", NO_CHANNEL_BINDING);
        let bare = format!(
            "{}={},{}={}",
            USERNAME_KEY,
            username.replace('=', "=3D").replace(',', "=2C"),
            NONCE_KEY,
            nonce
        );
        let full = format!("{}{}", &gs2_header, &bare);
        let end = full.len();
        ClientFirst {
            source: source.to_string(),
            message: full,
            gs2_header: Range {
                start: 0,
                end: gs2_header.len(),
            },
            bare: Range {
                start: gs2_header.len(),
                end,
            },
            nonce,
            include_db,
        }
    }

    fn bare_message(&self) -> &str {
        &self.message[self.bare.clone()]
    }

    fn gs2_header(&self) -> &str {
        &self.message[self.gs2_header.clone()]
    }

    fn message(&self) -> &str {
        &self.message[..]
    }

    fn nonce(&self) -> &str {
        self.nonce.as_str()
    }

    pub(crate) fn to_command(&self, scram: &ScramVersion) -> crate::cmap::Command {
        let mut command = SaslStart::new(
            self.source.clone(),
            AuthMechanism::from_scram_version(scram),
            self.message().as_bytes().to_vec(),
        )
        .into_command();

        if self.include_db {
            command.body.insert("db", self.source.clone());
        }

        command
    }
}

/// Model of the first message received from the server.
///
/// This MUST be validated before sending the `ClientFinal` message back to the server.
struct ServerFirst {
    conversation_id: Bson,
    done: bool,
    message: String,
    nonce: String,
    salt: Vec<u8>,
    i: u32,
}

impl ServerFirst {
    fn parse(conversation_id: Bson, done: bool, payload: &[u8]) -> Result<Self> {
        let message = str::from_utf8(payload)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let parts: Vec<&str> = message.split(',').collect();

        if parts.len() < 3 {
            return Err(Error::invalid_authentication_response("SCRAM"));
        };

        let full_nonce = parse_kvp(parts[0], NONCE_KEY)?;

        let salt = base64::decode(parse_kvp(parts[1], SALT_KEY)?.as_str())
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let i: u32 = parse_kvp(parts[2], ITERATION_COUNT_KEY)?
            .parse()
            .map_err(|_| Error::authentication_error("SCRAM", "iteration count invalid"))?;

        Ok(ServerFirst {
            conversation_id,
            done,
            message: message.to_string(),
            nonce: full_nonce,
            salt,
            i,
        })
    }

    fn conversation_id(&self) -> &Bson {
        &self.conversation_id
    }

    fn message(&self) -> &str {
        self.message.as_str()
    }

    fn nonce(&self) -> &str {
        self.nonce.as_str()
    }

    fn salt(&self) -> &[u8] {
        self.salt.as_slice()
    }

    fn i(&self) -> u32 {
        self.i
    }

    fn validate(&self, nonce: &str) -> Result<()> {
        if self.done {
            Err(Error::authentication_error(
                "SCRAM",
                "handshake terminated early",
            ))
        } else if !self.nonce.starts_with(nonce) {
            Err(Error::authentication_error("SCRAM", "mismatched nonce"))
        } else if self.i < MIN_ITERATION_COUNT {
            Err(Error::authentication_error(
                "SCRAM",
                "iteration count too low",
            ))
        } else {
            Ok(())
        }
    }
}

/// Model of the final message sent by the client.
///
/// Contains the "AuthMessage" mentioned in the RFC used in computing the client and server
/// signatures.
struct ClientFinal {
    message: String,
    auth_message: String,
    conversation_id: Bson,
}

impl ClientFinal {
    fn new(
        salted_password: &[u8],
        client_first: &ClientFirst,
        server_first: &ServerFirst,
        scram: &ScramVersion,
    ) -> Result<Self> {
        let client_key = scram.hmac(salted_password, b"Client Key")?;
        let stored_key = scram.h(client_key.as_slice());

        let without_proof = format!(
            "{}={},{}={}",
            CHANNEL_BINDING_KEY,
            base64::encode(client_first.gs2_header()),
            NONCE_KEY,
            server_first.nonce()
        );
        let auth_message = format!(
            "{},{},{}",
            client_first.bare_message(),
            server_first.message(),
            without_proof.as_str()
        );
        let client_signature = scram.hmac(stored_key.as_slice(), auth_message.as_bytes())?;
        let client_proof =
            base64::encode(xor(client_key.as_slice(), client_signature.as_slice()).as_slice());

        let message = format!("{},{}={}", without_proof, PROOF_KEY, client_proof);

        Ok(ClientFinal {
            message,
            auth_message,
            conversation_id: server_first.conversation_id().clone(),
        })
    }

    fn message(&self) -> &str {
        self.message.as_str()
    }

    fn auth_message(&self) -> &str {
        self.auth_message.as_str()
    }
}

enum ServerFinalBody {
    Error(String),
    Verifier(String),
}

/// Model of the final message received from the server.
struct ServerFinal {
    conversation_id: Bson,
    done: bool,
    body: ServerFinalBody,
}

impl ServerFinal {
    fn parse(conversation_id: Bson, done: bool, payload: &[u8]) -> Result<Self> {
        let message = str::from_utf8(payload)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let first = message
            .chars()
            .next()
            .ok_or_else(|| Error::invalid_authentication_response("SCRAM"))?;
        let body = if first == ERROR_KEY {
            let error = parse_kvp(message, ERROR_KEY)?;
            ServerFinalBody::Error(error)
        } else if first == VERIFIER_KEY {
            let verifier = parse_kvp(message, VERIFIER_KEY)?;
            ServerFinalBody::Verifier(verifier)
        } else {
            return Err(Error::invalid_authentication_response("SCRAM"));
        };

        Ok(ServerFinal {
            conversation_id,
            done,
            body,
        })
    }

    fn validate(
        &self,
        salted_password: &[u8],
        client_final: &ClientFinal,
        scram: &ScramVersion,
    ) -> Result<()> {
        if self.conversation_id != client_final.conversation_id {
            return Err(Error::authentication_error(
                "SCRAM",
                "mismatched conversationId's",
            ));
        };

        match self.body {
            ServerFinalBody::Verifier(ref body) => {
                let server_key = scram.hmac(salted_password, b"Server Key")?;
                let body_decoded = base64::decode(body.as_bytes())
                    .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

                scram.hmac_verify(
                    server_key.as_slice(),
                    client_final.auth_message().as_bytes(),
                    body_decoded.as_slice(),
                )
            }
            ServerFinalBody::Error(ref err) => {
                Err(Error::authentication_error("SCRAM", err.as_str()))
            }
        }
    }

    fn conversation_id(&self) -> &Bson {
        &self.conversation_id
    }
}

/// The first round of a SCRAM exchange that happened speculatively during the handshake.
#[derive(Debug)]
pub(crate) struct FirstRound {
    pub(crate) client_first: ClientFirst,
    pub(crate) server_first: Document,
}

#[cfg(test)]
mod tests {
    use bson::Bson;

    use super::*;

    fn run_exchange(
        scram: ScramVersion,
        username: &str,
        password: &str,
        client_nonce: &str,
        server_payload: &str,
    ) -> (Vec<u8>, ClientFinal, ServerFirst) {
        let client_first = ClientFirst::new("admin", username, client_nonce.to_string(), false);

        let server_first =
            ServerFirst::parse(Bson::Int32(1), false, server_payload.as_bytes()).unwrap();
        server_first.validate(client_nonce).unwrap();

        let digest = scram.password_digest(username, password).unwrap();
        let salted_password = scram.h_i(digest.as_ref(), server_first.salt(), server_first.i());

        let client_final =
            ClientFinal::new(salted_password.as_slice(), &client_first, &server_first, &scram)
                .unwrap();

        (salted_password, client_final, server_first)
    }

    // The RFC 7677 test vector: user "user", password "pencil".
    #[test]
    fn sha_256_rfc_vector() {
        let (salted_password, client_final, _) = run_exchange(
            ScramVersion::Sha256,
            "user",
            "pencil",
            "rOprNGfwEbeRWgbNEkqO",
            "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,\
             i=4096",
        );

        assert_eq!(
            base64::encode(&salted_password),
            "xKSVEDI6tPlSysH6mUQZOeeOp01r6B3fcJbodRPcYV0="
        );
        assert_eq!(
            client_final.message(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        let server_final = ServerFinal::parse(
            Bson::Int32(1),
            true,
            b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=",
        )
        .unwrap();
        server_final
            .validate(&salted_password, &client_final, &ScramVersion::Sha256)
            .unwrap();
    }

    #[test]
    fn sha_256_alternate_server_nonce() {
        let (salted_password, client_final, _) = run_exchange(
            ScramVersion::Sha256,
            "user",
            "pencil",
            "rOprNGfwEbeRWgbNEkqO",
            "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlopI,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
        );

        assert_eq!(
            client_final.message(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlopI,\
             p=Izy+aGRljDOr9bbOOZHoqsEIIvOTZjFjf/41+QYAIbM="
        );

        let server_final = ServerFinal::parse(
            Bson::Int32(1),
            true,
            b"v=jHLXCBK84lX5N1JnJqHAOtD7joRr079CsCWvrjZE9wY=",
        )
        .unwrap();
        server_final
            .validate(&salted_password, &client_final, &ScramVersion::Sha256)
            .unwrap();
    }

    // SCRAM-SHA-1 uses the MD5 digest of "<user>:mongo:<password>" as the password string.
    #[test]
    fn sha_1_mongodb_digest() {
        let scram = ScramVersion::Sha1;
        assert_eq!(
            scram.password_digest("user", "pencil").unwrap().as_ref(),
            "1c33006ec1ffd90f9cadcbcc0e118200"
        );

        let (salted_password, client_final, _) = run_exchange(
            scram,
            "user",
            "pencil",
            "fyko+d2lbbFgONRv9qkxdawL",
            "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096",
        );

        assert_eq!(base64::encode(&salted_password), "KNmdCqhfbYTIUHbRTcl5XvG1RAU=");
        assert!(client_final
            .message()
            .ends_with("p=JDntyRhQfJWIGDV27H0LEifJQLE="));

        let server_final = ServerFinal::parse(
            Bson::Int32(1),
            false,
            b"v=kDkyBj41ObwwX3x4AfqHbtVnO/4=",
        )
        .unwrap();
        server_final
            .validate(&salted_password, &client_final, &ScramVersion::Sha1)
            .unwrap();
    }

    #[test]
    fn server_first_validation() {
        let low_iterations = ServerFirst::parse(
            Bson::Int32(1),
            false,
            b"r=abcdef,s=QSXCR+Q6sek8bf92,i=42",
        )
        .unwrap();
        assert!(low_iterations.validate("abcd").is_err());

        let mismatched_nonce = ServerFirst::parse(
            Bson::Int32(1),
            false,
            b"r=wrong,s=QSXCR+Q6sek8bf92,i=4096",
        )
        .unwrap();
        assert!(mismatched_nonce.validate("abcd").is_err());

        let early_termination = ServerFirst::parse(
            Bson::Int32(1),
            true,
            b"r=abcdef,s=QSXCR+Q6sek8bf92,i=4096",
        )
        .unwrap();
        assert!(early_termination.validate("abcd").is_err());
    }

    #[test]
    fn server_error_payload_fails_validation() {
        let (salted_password, client_final, _) = run_exchange(
            ScramVersion::Sha256,
            "user",
            "pencil",
            "rOprNGfwEbeRWgbNEkqO",
            "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlopI,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
        );

        let server_final =
            ServerFinal::parse(Bson::Int32(1), true, b"e=other-error").unwrap();
        assert!(server_final
            .validate(&salted_password, &client_final, &ScramVersion::Sha256)
            .is_err());
    }
}
