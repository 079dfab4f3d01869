//! Contains the `Error` and `Result` types that `mongocore` uses.

use std::{
    collections::HashSet,
    fmt,
    sync::Arc,
};

use serde::Deserialize;
use thiserror::Error;

use crate::{options::ServerAddress, sdam::TopologyVersion};

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOTWRITABLEPRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];

/// The command error codes that allow an operation to be retried on another
/// server: not-primary and recovering states, shutdown, unreachable hosts,
/// server-side timeouts, and stale sharding metadata.
const RETRYABLE_CODES: [i32; 14] = [
    6, 7, 63, 89, 91, 133, 150, 189, 262, 9001, 10107, 11600, 13435, 13436,
];

const DUPLICATE_KEY_CODES: [i32; 3] = [11000, 11001, 12582];
const CURSOR_KILLED_CODES: [i32; 2] = [43, 237];

/// The code a server returns when a change stream should be resumed by the client.
const RETRY_CHANGE_STREAM_CODE: i32 = 234;

/// Retryable write error label. This label will be added to an error when the error is
/// write-retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// The result type for all methods that can return an error in the `mongocore` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongocore` crate. The inner [`ErrorKind`] is boxed to keep the
/// type small, and the error as a whole is cheaply cloneable so it can be stored in server
/// descriptions and replayed to event subscribers.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    pub(crate) server_address: Option<ServerAddress>,
    pub(crate) wire_version: Option<i32>,
    pub(crate) retry_attempted: bool,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref address) = self.server_address {
            write!(f, " (server {})", address)?;
        }
        if self.retry_attempted {
            write!(f, " (retry was attempted)")?;
        }
        if !self.labels.is_empty() {
            write!(f, " (labels: {:?})", self.labels)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.kind.as_ref() {
            ErrorKind::Io(ref err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        Self {
            kind: Box::new(kind),
            labels,
            server_address: None,
            wire_version: None,
            retry_attempted: false,
        }
    }

    /// Creates an authentication error for the given mechanism with the provided reason.
    pub(crate) fn authentication_error(mechanism_name: &str, reason: &str) -> Self {
        ErrorKind::Authentication {
            message: format!("{} failure: {}", mechanism_name, reason),
            code: None,
        }
        .into()
    }

    /// Creates an authentication error for the given mechanism with a generic "internal error"
    /// message.
    pub(crate) fn unknown_authentication_error(mechanism_name: &str) -> Error {
        Error::authentication_error(mechanism_name, "internal error")
    }

    /// Creates an authentication error for the given mechanism when the server response is
    /// invalid.
    pub(crate) fn invalid_authentication_response(mechanism_name: &str) -> Error {
        Error::authentication_error(mechanism_name, "invalid server response")
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn disconnected(message: impl Into<String>) -> Error {
        ErrorKind::Disconnected {
            message: message.into(),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    pub(crate) fn network_timeout() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    pub(crate) fn pool_cleared_error(address: &ServerAddress, cause: &Error) -> Self {
        ErrorKind::ConnectionPoolCleared {
            message: format!(
                "Connection pool for {} cleared because another operation failed with: {}",
                address, cause
            ),
        }
        .into()
    }

    pub(crate) fn with_address(mut self, address: ServerAddress) -> Self {
        self.server_address = Some(address);
        self
    }

    /// The address of the server that produced this error, if any.
    pub fn server_address(&self) -> Option<&ServerAddress> {
        self.server_address.as_ref()
    }

    /// Whether the driver attempted (and exhausted) a retry before surfacing this error.
    pub fn retry_attempted(&self) -> bool {
        self.retry_attempted
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// Adds the given label to this error.
    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }

    /// Gets the server-assigned code from this error, if any. Per the SDAM spec, write concern
    /// error codes are considered and write error codes are not.
    pub(crate) fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)) => Some(wc_error.code),
            ErrorKind::Authentication { code, .. } => *code,
            _ => None,
        }
    }

    pub(crate) fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    pub(crate) fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..)
                | ErrorKind::Disconnected { .. }
                | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        self.is_network_error() && !self.is_network_timeout()
    }

    /// Whether an error originated from the server.
    pub(crate) fn is_server_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Authentication { .. } | ErrorKind::Command(_) | ErrorKind::Write(_)
        )
    }

    pub(crate) fn is_pool_cleared(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ConnectionPoolCleared { .. })
    }

    /// If this error corresponds to a "not writable primary" error as per the SDAM spec.
    pub(crate) fn is_notwritableprimary(&self) -> bool {
        self.code()
            .map(|code| NOTWRITABLEPRIMARY_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is recovering" error as per the SDAM spec.
    pub(crate) fn is_recovering(&self) -> bool {
        self.code()
            .map(|code| RECOVERING_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is shutting down" error as per the SDAM spec.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.code()
            .map(|code| SHUTTING_DOWN_CODES.contains(&code))
            .unwrap_or(false)
    }

    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary()
    }

    /// Whether this error is transient: a network failure or one of the server codes that
    /// indicates the operation may succeed against a newly selected server. Errors that match
    /// neither list are treated as final.
    pub(crate) fn is_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        match self.code() {
            Some(code) => RETRYABLE_CODES.contains(&code),
            None => false,
        }
    }

    /// Whether a read operation should be retried if this error occurs.
    pub(crate) fn is_read_retryable(&self) -> bool {
        self.is_retryable()
    }

    pub(crate) fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether a "RetryableWriteError" label should be added to this error. If max_wire_version
    /// indicates a 4.4+ server, a label should only be added if the error is a network error,
    /// since those servers add the label themselves. Otherwise, a label should be added if the
    /// error is a network error or the error code matches one of the retryable codes.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if max_wire_version > 8 {
            return self.is_network_error();
        }
        self.is_retryable()
    }

    #[allow(unused)]
    pub(crate) fn is_duplicate_key(&self) -> bool {
        let code = match self.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(we)) => Some(we.code),
            ErrorKind::Command(command_error) => Some(command_error.code),
            _ => None,
        };
        code.map(|c| DUPLICATE_KEY_CODES.contains(&c))
            .unwrap_or(false)
    }

    pub(crate) fn is_cursor_killed(&self) -> bool {
        self.code()
            .map(|code| CURSOR_KILLED_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error is resumable as per the change streams spec: a network error, cursor
    /// death, or one of the transient server codes plus the dedicated resume code. Every other
    /// kind of error is final and surfaces to the caller.
    pub(crate) fn is_resumable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        if self.is_auth_error() {
            return false;
        }
        if self.is_cursor_killed() {
            return true;
        }
        match self.code() {
            Some(RETRY_CHANGE_STREAM_CODE) => true,
            Some(code) => RETRYABLE_CODES.contains(&code),
            None => false,
        }
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.kind.as_ref() {
            ErrorKind::Command(c) => c.topology_version,
            _ => None,
        }
    }

    /// For sensitive commands, everything besides the error labels, code, and code name must be
    /// redacted from errors before they are surfaced to event subscribers.
    pub(crate) fn redact(&mut self) {
        match *self.kind {
            ErrorKind::Command(ref mut command_error) => {
                command_error.message = "REDACTED".to_string();
            }
            ErrorKind::Write(ref mut write_failure) => match write_failure {
                WriteFailure::WriteConcernError(wce) => {
                    wce.message = "REDACTED".to_string();
                }
                WriteFailure::WriteError(we) => {
                    we.message = "REDACTED".to_string();
                }
            },
            _ => {}
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::InvalidArgument {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// An error occurred while the [`Client`](crate::Client) attempted to authenticate a
    /// connection.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication {
        message: String,
        code: Option<i32>,
    },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An operation was attempted on a connection that previously experienced a fatal error.
    #[error("Connection is no longer usable: {message}")]
    #[non_exhaustive]
    Disconnected { message: String },

    /// The handshake on a new connection failed before authentication began.
    #[error("Handshake failed: {message}")]
    #[non_exhaustive]
    Handshake { message: String },

    /// The connection pool for a server was cleared during operation execution due to
    /// a concurrent error, causing the operation to fail.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// The client was not able to select a server for the operation before the deadline.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// The wire version ranges of the driver and a server do not overlap.
    #[error("The server does not support a database operation: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// An error occurred when trying to execute a write operation.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    Write(WriteFailure),

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// The deployment does not support sessions.
    #[error("Attempted to start a session on a deployment that does not support sessions")]
    SessionsNotSupported,

    /// No resume token was present in a change stream document.
    #[error("Cannot provide resume functionality when the resume token is missing")]
    MissingResumeToken,

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// A method was called on a client that was shut down.
    #[error("Client has been shut down")]
    Shutdown,
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    #[serde(default)]
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// The topology version reported by the server in the error response, if any.
    #[serde(rename = "topologyVersion")]
    pub(crate) topology_version: Option<TopologyVersion>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error code {} ({}): {}", self.code, self.code_name, self.message)
    }
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

/// An error that occurred during a write operation that wasn't due to being unable to satisfy a
/// write concern.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct WriteError {
    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// The index of the write in the original batch that this error corresponds to, when the
    /// write was issued as part of a batch.
    #[serde(rename = "index")]
    pub index: Option<usize>,
}

/// An error that occurred when trying to execute a write operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteFailure {
    /// The write concern was not satisfied.
    WriteConcernError(WriteConcernError),

    /// The write itself failed.
    WriteError(WriteError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ServerAddress;

    fn command_error(code: i32) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: String::new(),
            topology_version: None,
        })
        .into()
    }

    #[test]
    fn network_errors_are_retryable_and_resumable() {
        let err: Error = ErrorKind::from(std::io::ErrorKind::ConnectionRefused).into();
        assert!(err.is_network_error());
        assert!(err.is_retryable());
        assert!(err.is_resumable());
        assert!(!err.is_network_timeout());

        let timeout = Error::network_timeout();
        assert!(timeout.is_network_timeout());
        assert!(timeout.is_retryable());
    }

    #[test]
    fn state_change_codes_are_retryable() {
        // PrimarySteppedDown, ShutdownInProgress, NotWritablePrimary.
        for code in [189, 91, 10107] {
            let err = command_error(code);
            assert!(err.is_retryable(), "code {} should be retryable", code);
            assert!(err.is_state_change_error());
        }
        assert!(command_error(11600).is_shutting_down());
    }

    #[test]
    fn unknown_codes_fail_closed() {
        // An unclassified server error is neither retryable nor resumable.
        let err = command_error(8000);
        assert!(!err.is_retryable());
        assert!(!err.is_resumable());

        let write_err: Error = ErrorKind::Write(WriteFailure::WriteError(WriteError {
            code: 11000,
            code_name: None,
            message: "duplicate".to_string(),
            index: Some(2),
        }))
        .into();
        assert!(write_err.is_duplicate_key());
        assert!(!write_err.is_retryable());
    }

    #[test]
    fn resume_code_is_not_retryable() {
        let err = command_error(234);
        assert!(err.is_resumable());
        assert!(!err.is_retryable());

        // CursorNotFound resumes the change stream.
        assert!(command_error(43).is_resumable());
    }

    #[test]
    fn fatal_kinds_are_not_resumable() {
        let fatal: Vec<Error> = vec![
            ErrorKind::InvalidArgument {
                message: "bad pipeline".to_string(),
            }
            .into(),
            ErrorKind::IncompatibleServer {
                message: "wire version".to_string(),
            }
            .into(),
            ErrorKind::ServerSelection {
                message: "timed out".to_string(),
            }
            .into(),
            ErrorKind::Authentication {
                message: "auth failed".to_string(),
                code: Some(18),
            }
            .into(),
            ErrorKind::MissingResumeToken.into(),
            ErrorKind::Shutdown.into(),
        ];

        for err in fatal {
            assert!(!err.is_resumable(), "{} should not be resumable", err);
        }
    }

    #[test]
    fn write_concern_codes_count_for_sdam() {
        let err: Error = ErrorKind::Write(WriteFailure::WriteConcernError(WriteConcernError {
            code: 91,
            code_name: "ShutdownInProgress".to_string(),
            message: String::new(),
        }))
        .into();
        assert_eq!(err.code(), Some(91));
        assert!(err.is_shutting_down());
    }

    #[test]
    fn display_includes_address_and_retry() {
        let err = command_error(6)
            .with_address(ServerAddress::parse("db.example.com:27018").unwrap());
        let mut err = err;
        err.retry_attempted = true;
        let msg = err.to_string();
        assert!(msg.contains("db.example.com:27018"), "{}", msg);
        assert!(msg.contains("retry was attempted"), "{}", msg);
    }
}
