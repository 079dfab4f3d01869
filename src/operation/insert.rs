use bson::{doc, Document};

use super::{extract_write_failure, handle_response_error, Operation, Retryability};
use crate::{
    cmap::{Command, CommandResponse, StreamDescription},
    error::Result,
    namespace::Namespace,
    options::WriteConcern,
};

/// The result of an insert operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct InsertResult {
    /// The number of documents the server reports as inserted.
    pub inserted_count: i64,
}

/// Inserts documents into a collection. The documents ride in an OP_MSG document sequence
/// rather than the command body, matching how bulk payloads are framed on the wire.
pub(crate) struct Insert {
    ns: Namespace,
    documents: Vec<Document>,
    write_concern: Option<WriteConcern>,
}

impl Insert {
    pub(crate) fn new(
        ns: Namespace,
        documents: Vec<Document>,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self {
            ns,
            documents,
            write_concern,
        }
    }
}

impl Operation for Insert {
    type O = InsertResult;

    const NAME: &'static str = "insert";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        let max_batch_size = description.max_write_batch_size.max(1) as usize;
        if self.documents.len() > max_batch_size {
            return Err(crate::error::ErrorKind::InvalidArgument {
                message: format!(
                    "cannot insert {} documents in one batch; the server accepts at most {}",
                    self.documents.len(),
                    max_batch_size
                ),
            }
            .into());
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "ordered": true,
        };
        super::append_write_concern(&mut body, self.write_concern.as_ref())?;

        let mut command = Command::new(Self::NAME, self.ns.db.clone(), body);
        command.add_document_sequence("documents", self.documents.clone());
        Ok(command)
    }

    fn handle_response(&self, response: CommandResponse) -> Result<Self::O> {
        handle_response_error(&response)?;
        extract_write_failure(&response)?;

        let inserted_count = response
            .raw_body()
            .get("n")
            .and_then(crate::bson_util::get_int)
            .unwrap_or_default();

        Ok(InsertResult { inserted_count })
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}
