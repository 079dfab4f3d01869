use bson::{doc, Document};

use super::{handle_response_error, Operation};
use crate::{
    cmap::{Command, CommandResponse, StreamDescription},
    error::Result,
};

/// Releases server-side session state for the given session ids, issued best-effort at client
/// shutdown. The server accepts at most 10,000 ids per command; callers batch accordingly.
pub(crate) struct EndSessions {
    session_ids: Vec<Document>,
}

/// The maximum number of session ids the server accepts in one `endSessions` command.
pub(crate) const MAX_END_SESSIONS_BATCH_SIZE: usize = 10_000;

impl EndSessions {
    pub(crate) fn new(session_ids: Vec<Document>) -> Self {
        debug_assert!(session_ids.len() <= MAX_END_SESSIONS_BATCH_SIZE);
        Self { session_ids }
    }
}

impl Operation for EndSessions {
    type O = ();

    const NAME: &'static str = "endSessions";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let body = doc! {
            Self::NAME: self.session_ids.clone(),
        };

        Ok(Command::new(Self::NAME, "admin", body))
    }

    fn handle_response(&self, response: CommandResponse) -> Result<Self::O> {
        handle_response_error(&response)
    }

    fn supports_sessions(&self) -> bool {
        false
    }
}
