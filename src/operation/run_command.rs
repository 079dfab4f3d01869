use bson::Document;

use super::{handle_response_error, Operation};
use crate::{
    cmap::{Command, CommandResponse, StreamDescription},
    error::{ErrorKind, Result},
    selection_criteria::SelectionCriteria,
};

/// A generic command supplied by the user, forwarded to the server as-is.
pub(crate) struct RunCommand {
    db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
}

impl RunCommand {
    pub(crate) fn new(
        db: impl Into<String>,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Result<Self> {
        if command.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "an empty document cannot be passed to a run_command operation".into(),
            }
            .into());
        }

        Ok(Self {
            db: db.into(),
            command,
            selection_criteria,
        })
    }

    fn command_name(&self) -> &str {
        self.command
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or(Self::NAME)
    }
}

impl Operation for RunCommand {
    type O = Document;

    const NAME: &'static str = "runCommand";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(
            self.command_name().to_string(),
            self.db.clone(),
            self.command.clone(),
        ))
    }

    fn handle_response(&self, response: CommandResponse) -> Result<Self::O> {
        handle_response_error(&response)?;
        Ok(response.into_body())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn name(&self) -> &str {
        self.command_name()
    }
}
