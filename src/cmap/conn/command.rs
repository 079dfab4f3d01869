use std::collections::HashSet;

use bson::{Bson, Document};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;

use crate::{
    bson_util::get_int,
    error::{Error, ErrorKind, Result},
    hello::LEGACY_HELLO_COMMAND_NAME_LOWERCASE,
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

pub(crate) static REDACTED_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "authenticate",
        "saslstart",
        "saslcontinue",
        "getnonce",
        "createuser",
        "updateuser",
        "copydbgetnonce",
        "copydbsaslstart",
        "copydb",
    ]
    .into_iter()
    .collect()
});

/// Driver-side model of a database command: everything needed to serialize it to a wire message.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) document_sequences: Vec<DocumentSequence>,
}

/// A bulk payload attached to a command, sent as an OP_MSG type 1 section.
#[derive(Debug, Clone)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<Document>,
}

impl Command {
    /// Constructs a new command.
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            document_sequences: Vec::new(),
        }
    }

    pub(crate) fn add_document_sequence(
        &mut self,
        identifier: impl Into<String>,
        documents: Vec<Document>,
    ) {
        self.document_sequences.push(DocumentSequence {
            identifier: identifier.into(),
            documents,
        });
    }

    pub(crate) fn set_session_id(&mut self, session_id: &Document) {
        self.body.insert("lsid", session_id.clone());
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.body
            .insert("$readPreference", read_preference.into_document());
    }

    /// Whether the contents of this command should be hidden from command monitoring and error
    /// messages.
    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        REDACTED_COMMANDS.contains(name.as_str())
            || ((name == "hello" || name == LEGACY_HELLO_COMMAND_NAME_LOWERCASE)
                && self.body.contains_key("speculativeAuthenticate"))
    }
}

/// A successfully-read server reply to a command, not yet checked for a command-level error.
#[derive(Debug, Clone)]
pub(crate) struct CommandResponse {
    pub(crate) source: ServerAddress,
    body: Document,
}

impl CommandResponse {
    pub(crate) fn new(source: ServerAddress, body: Document) -> Self {
        Self { source, body }
    }

    /// Whether the server indicated command success. This does not imply anything about writes
    /// within the command having succeeded.
    pub(crate) fn is_success(&self) -> bool {
        match self.body.get("ok") {
            Some(b) => get_int(b) == Some(1),
            None => false,
        }
    }

    /// Convert a non-`ok` reply into the corresponding `Error`, tagging it with the address of
    /// the server that produced it.
    pub(crate) fn command_error(&self) -> Error {
        let error_labels = self
            .body
            .get_array("errorLabels")
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|label| match label {
                        Bson::String(s) => Some(s.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
            })
            .ok();

        let kind = match bson::from_document(self.body.clone()) {
            Ok(command_error) => ErrorKind::Command(command_error),
            Err(_) => ErrorKind::InvalidResponse {
                message: "server returned malformed error response".to_string(),
            },
        };

        Error::new(kind, error_labels).with_address(self.source.clone())
    }

    /// Returns the body if the command succeeded and the command error otherwise.
    pub(crate) fn ok(self) -> Result<Document> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(self.command_error())
        }
    }

    /// Deserialize the body of this response.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_document(self.body.clone()).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                message: e.to_string(),
            })
        })
    }

    pub(crate) fn raw_body(&self) -> &Document {
        &self.body
    }

    pub(crate) fn into_body(self) -> Document {
        self.body
    }

    /// The address of the server that sent this response.
    pub(crate) fn source_address(&self) -> &ServerAddress {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    fn address() -> ServerAddress {
        ServerAddress::parse("localhost:27017").unwrap()
    }

    #[test]
    fn ok_field_coercion() {
        for ok in [Bson::Int32(1), Bson::Int64(1), Bson::Double(1.0)] {
            let response = CommandResponse::new(address(), doc! { "ok": ok.clone() });
            assert!(response.is_success(), "ok: {:?}", ok);
        }

        let failed = CommandResponse::new(address(), doc! { "ok": 0.0, "code": 59 });
        assert!(!failed.is_success());
    }

    #[test]
    fn command_error_includes_code_and_address() {
        let response = CommandResponse::new(
            address(),
            doc! {
                "ok": 0,
                "code": 189,
                "codeName": "PrimarySteppedDown",
                "errmsg": "stepping down",
                "errorLabels": ["RetryableWriteError"],
            },
        );
        let error = response.ok().unwrap_err();
        assert_eq!(error.code(), Some(189));
        assert!(error.contains_label("RetryableWriteError"));
        assert_eq!(error.server_address(), Some(&address()));
    }

    #[test]
    fn sensitive_commands_are_redacted() {
        assert!(Command::new("saslStart", "admin", doc! { "saslStart": 1 }).should_redact());
        assert!(!Command::new("find", "db", doc! { "find": "coll" }).should_redact());

        let mut hello = Command::new("hello", "admin", doc! { "hello": 1 });
        assert!(!hello.should_redact());
        hello.body.insert("speculativeAuthenticate", doc! {});
        assert!(hello.should_redact());
    }
}
