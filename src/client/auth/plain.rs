use crate::{
    client::auth::{
        sasl::{SaslResponse, SaslStart},
        AuthMechanism,
        Credential,
    },
    cmap::{conn::wire::AUTH_FIRST_REQUEST_ID, Connection},
    error::{Error, Result},
};

/// Performs SASL PLAIN authentication, used by MongoDB for LDAP proxy authentication. The
/// credentials live outside the database, so the exchange always targets `$external`.
pub(crate) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
) -> Result<()> {
    let username = credential
        .username
        .as_ref()
        .ok_or_else(|| Error::authentication_error("PLAIN", "no username supplied"))?;
    let password = credential
        .password
        .as_ref()
        .ok_or_else(|| Error::authentication_error("PLAIN", "no password supplied"))?;

    let command = SaslStart::new(
        credential.resolved_source().to_string(),
        AuthMechanism::Plain,
        payload(username, password),
    )
    .into_command();

    let response = conn.send_command(command, AUTH_FIRST_REQUEST_ID).await?;
    let sasl_response = SaslResponse::parse("PLAIN", response.into_body())?;

    if !sasl_response.done {
        return Err(Error::invalid_authentication_response("PLAIN"));
    }

    Ok(())
}

fn payload(username: &str, password: &str) -> Vec<u8> {
    let mut bytes = vec![0];
    bytes.extend(username.as_bytes());
    bytes.push(0);
    bytes.extend(password.as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::payload;

    #[test]
    fn payload_layout() {
        assert_eq!(payload("user", "pw"), b"\0user\0pw".to_vec());
    }
}
