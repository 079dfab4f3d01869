use bson::doc;

use super::{handle_response_error, Operation};
use crate::{
    cmap::{Command, CommandResponse, StreamDescription},
    error::Result,
    namespace::Namespace,
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
};

/// Closes a server-side cursor before it is exhausted. Pinned to the cursor's server.
pub(crate) struct KillCursors {
    ns: Namespace,
    cursor_id: i64,
    selection_criteria: SelectionCriteria,
}

impl KillCursors {
    pub(crate) fn new(ns: Namespace, cursor_id: i64, address: ServerAddress) -> Self {
        Self {
            ns,
            cursor_id,
            selection_criteria: SelectionCriteria::from_address(address),
        }
    }
}

impl Operation for KillCursors {
    type O = ();

    const NAME: &'static str = "killCursors";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "cursors": [self.cursor_id],
        };

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(&self, response: CommandResponse) -> Result<Self::O> {
        handle_response_error(&response)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }

    fn supports_sessions(&self) -> bool {
        false
    }
}
