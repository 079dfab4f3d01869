use bson::doc;

use super::{handle_response_error, CursorBody, Operation};
use crate::{
    cmap::{Command, CommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::Result,
    namespace::Namespace,
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
};

/// Fetches the next batch from a server-side cursor. Always runs against the server that issued
/// the cursor, and is never retried: a replayed getMore could silently skip documents.
pub(crate) struct GetMore {
    ns: Namespace,
    cursor_id: i64,
    batch_size: Option<u32>,
    max_await_time_ms: Option<u64>,
    selection_criteria: SelectionCriteria,
}

impl GetMore {
    pub(crate) fn new(
        ns: Namespace,
        cursor_id: i64,
        address: ServerAddress,
        batch_size: Option<u32>,
        max_await_time_ms: Option<u64>,
    ) -> Self {
        Self {
            ns,
            cursor_id,
            batch_size,
            max_await_time_ms,
            selection_criteria: SelectionCriteria::from_address(address),
        }
    }
}

impl Operation for GetMore {
    type O = CursorSpecification;

    const NAME: &'static str = "getMore";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.cursor_id,
            "collection": self.ns.coll.clone(),
        };

        if let Some(batch_size) = self.batch_size {
            body.insert("batchSize", i64::from(batch_size));
        }

        if let Some(max_await_time_ms) = self.max_await_time_ms {
            body.insert("maxTimeMS", max_await_time_ms.min(i64::MAX as u64) as i64);
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(&self, response: CommandResponse) -> Result<Self::O> {
        handle_response_error(&response)?;
        let body: CursorBody = response.body()?;
        body.into_specification(response.source_address().clone())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }
}
