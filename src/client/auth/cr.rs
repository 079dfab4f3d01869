use bson::doc;
use md5::{Digest, Md5};

use crate::{
    client::auth::Credential,
    cmap::{
        conn::wire::{AUTH_CONTINUE_REQUEST_ID, AUTH_FIRST_REQUEST_ID},
        Command,
        Connection,
    },
    error::{Error, Result},
};

/// Performs the legacy MONGODB-CR challenge-response exchange: fetch a nonce from the server,
/// then prove knowledge of the password digest by hashing it together with the nonce.
pub(crate) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
) -> Result<()> {
    let username = credential
        .username
        .as_ref()
        .ok_or_else(|| Error::authentication_error("MONGODB-CR", "no username supplied"))?;

    let password = credential
        .password
        .as_ref()
        .ok_or_else(|| Error::authentication_error("MONGODB-CR", "no password supplied"))?;

    let source = credential.resolved_source().to_string();

    let response = conn
        .send_command(
            Command::new("getnonce", source.clone(), doc! { "getnonce": 1 }),
            AUTH_FIRST_REQUEST_ID,
        )
        .await?;
    let nonce_doc = response
        .ok()
        .map_err(|_| Error::invalid_authentication_response("MONGODB-CR"))?;
    let nonce = nonce_doc
        .get_str("nonce")
        .map_err(|_| Error::invalid_authentication_response("MONGODB-CR"))?
        .to_string();

    let command = Command::new(
        "authenticate",
        source,
        doc! {
            "authenticate": 1,
            "user": username.clone(),
            "nonce": nonce.clone(),
            "key": compute_key(username, password, &nonce),
        },
    );

    let response = conn.send_command(command, AUTH_CONTINUE_REQUEST_ID).await?;
    if !response.is_success() {
        let doc = response.into_body();
        let message = doc.get_str("errmsg").unwrap_or("authentication failed");
        let code = doc
            .get("code")
            .and_then(crate::bson_util::get_int)
            .map(|code| code as i32);
        return Err(Error::new(
            crate::error::ErrorKind::Authentication {
                message: format!("MONGODB-CR failure: {}", message),
                code,
            },
            None::<Option<String>>,
        ));
    }

    Ok(())
}

fn md5_hex(input: impl AsRef<[u8]>) -> String {
    let mut md5 = Md5::new();
    md5.update(input);
    hex::encode(md5.finalize())
}

/// `key = md5hex(nonce + username + md5hex(username + ":mongo:" + password))`
fn compute_key(username: &str, password: &str, nonce: &str) -> String {
    let password_digest = md5_hex(format!("{}:mongo:{}", username, password));
    md5_hex(format!("{}{}{}", nonce, username, password_digest))
}

#[cfg(test)]
mod tests {
    use super::compute_key;

    #[test]
    fn key_derivation() {
        assert_eq!(
            compute_key("mongo", "pass", "2375531c32080ae8"),
            "ffd01b3f050558ae8c9b93722f3a9b68"
        );
    }
}
