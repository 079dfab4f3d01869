//! Contains the events and functionality for monitoring transparent retries.

use crate::{error::Error, options::ServerAddress};

/// Published when a read command failed with a transient error and is about to be replayed
/// against a newly selected server.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RetryReadEvent {
    /// The name of the command being retried.
    pub command_name: String,

    /// The error that triggered the retry.
    pub cause: Error,

    /// The address of the server the first attempt ran against.
    pub first_address: ServerAddress,
}

/// Published when a write command failed with a transient error and is about to be replayed with
/// the same transaction number so the server can deduplicate it.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RetryWriteEvent {
    /// The name of the command being retried.
    pub command_name: String,

    /// The error that triggered the retry.
    pub cause: Error,

    /// The address of the server the first attempt ran against.
    pub first_address: ServerAddress,

    /// The transaction number the replay reuses.
    pub txn_number: Option<i64>,
}

/// Applications can implement this trait to observe the driver's transparent retries. Handlers
/// are invoked inline from operation execution and must not block.
pub trait RetryEventHandler: Send + Sync {
    /// Called when a read is about to be retried.
    fn handle_retry_read_event(&self, _event: RetryReadEvent) {}

    /// Called when a write is about to be retried.
    fn handle_retry_write_event(&self, _event: RetryWriteEvent) {}
}
