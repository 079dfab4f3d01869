mod aggregate;
mod end_sessions;
mod find;
mod get_more;
mod insert;
mod kill_cursors;
mod run_command;

use bson::Document;
use serde::Deserialize;

use crate::{
    cmap::{Command, CommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::{Error, ErrorKind, Result, WriteConcernError, WriteError, WriteFailure},
    namespace::Namespace,
    selection_criteria::SelectionCriteria,
};

pub use self::insert::InsertResult;
pub(crate) use self::{
    aggregate::{Aggregate, AggregateTarget},
    end_sessions::{EndSessions, MAX_END_SESSIONS_BATCH_SIZE},
    find::Find,
    get_more::GetMore,
    insert::Insert,
    kill_cursors::KillCursors,
    run_command::RunCommand,
};

/// The retryability level of an operation, before client options and server support are
/// consulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Retryability {
    /// The operation is a write that can be replayed with the same transaction number.
    Write,

    /// The operation is a read without side effects.
    Read,

    /// The operation must not be retried.
    None,
}

/// A trait modeling the behavior of a server-side operation: how to build its command for a
/// given server, how to interpret the server's reply, and how it interacts with server
/// selection, sessions, and the retry machinery.
pub(crate) trait Operation {
    /// The output type of this operation.
    type O;

    /// The name of the server side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server's successful reply to the command.
    fn handle_response(&self, response: CommandResponse) -> Result<Self::O>;

    /// Criteria to use when selecting a server for this operation.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// Whether this operation can be safely retried, assuming the client options and the
    /// selected server also allow it.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Whether a session should be attached to the command when one is available.
    fn supports_sessions(&self) -> bool {
        true
    }

    /// The name of the command, for events and logs.
    fn name(&self) -> &str {
        Self::NAME
    }
}

/// The body every command reply shares: `ok` plus optional error fields. Operations deserialize
/// their specific payloads separately.
pub(crate) fn handle_response_error(response: &CommandResponse) -> Result<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(response.command_error())
    }
}

/// The `cursor` subdocument of a `find`/`aggregate`/`getMore` reply.
#[derive(Debug, Deserialize)]
pub(crate) struct CursorBody {
    pub(crate) cursor: CursorInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,

    pub(crate) ns: String,

    #[serde(default)]
    pub(crate) first_batch: Vec<Document>,

    #[serde(default)]
    pub(crate) next_batch: Vec<Document>,

    pub(crate) post_batch_resume_token: Option<Document>,
}

impl CursorBody {
    pub(crate) fn into_specification(
        self,
        address: crate::options::ServerAddress,
    ) -> Result<CursorSpecification> {
        let ns: Namespace = self.cursor.ns.parse()?;
        let batch = if self.cursor.first_batch.is_empty() {
            self.cursor.next_batch
        } else {
            self.cursor.first_batch
        };
        Ok(CursorSpecification::new(
            ns,
            address,
            self.cursor.id,
            batch,
            self.cursor.post_batch_resume_token,
        ))
    }
}

/// Extracts write errors out of an otherwise-`ok` write command reply. The server reports
/// per-document failures in `writeErrors` (with the batch index of the offending document) and
/// write concern failures in `writeConcernError`.
pub(crate) fn extract_write_failure(response: &CommandResponse) -> Result<()> {
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct WriteResponseBody {
        #[serde(default)]
        write_errors: Vec<WriteError>,
        write_concern_error: Option<WriteConcernError>,
        #[serde(default)]
        error_labels: Vec<String>,
    }

    let body: WriteResponseBody = response.body()?;

    if let Some(write_error) = body.write_errors.into_iter().next() {
        return Err(Error::new(
            ErrorKind::Write(WriteFailure::WriteError(write_error)),
            Some(body.error_labels),
        )
        .with_address(response.source_address().clone()));
    }

    if let Some(write_concern_error) = body.write_concern_error {
        return Err(Error::new(
            ErrorKind::Write(WriteFailure::WriteConcernError(write_concern_error)),
            Some(body.error_labels),
        )
        .with_address(response.source_address().clone()));
    }

    Ok(())
}

/// Appends a serialized write concern to a command body when one is configured and
/// non-default.
pub(crate) fn append_write_concern(
    body: &mut Document,
    write_concern: Option<&crate::options::WriteConcern>,
) -> Result<()> {
    if let Some(write_concern) = write_concern {
        let doc = write_concern.to_document()?;
        if !doc.is_empty() {
            body.insert("writeConcern", doc);
        }
    }
    Ok(())
}

