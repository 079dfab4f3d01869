use bson::{doc, Document};

use crate::{
    client::auth::Credential,
    cmap::{conn::wire::AUTH_FIRST_REQUEST_ID, Command, Connection},
    error::{Error, Result},
};

/// Constructs the first client message in the X.509 handshake for speculative authentication.
pub(crate) fn build_client_first(credential: &Credential) -> Command {
    let mut auth_command_doc = doc! {
        "authenticate": 1,
        "mechanism": "MONGODB-X509",
    };

    if let Some(ref username) = credential.username {
        auth_command_doc.insert("user", username);
    }

    Command::new("authenticate", "$external", auth_command_doc)
}

/// Performs X.509 authentication for a given stream. The certificate itself was presented during
/// the TLS handshake; this command just binds the connection to the certificate's subject.
pub(crate) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
    server_first: impl Into<Option<Document>>,
) -> Result<()> {
    // If speculative authentication succeeded, no further work is needed.
    if server_first.into().is_some() {
        return Ok(());
    }

    let command = build_client_first(credential);
    let response = conn.send_command(command, AUTH_FIRST_REQUEST_ID).await?;
    response
        .ok()
        .map_err(|_| Error::authentication_error("MONGODB-X509", "authentication failed"))?;

    Ok(())
}
