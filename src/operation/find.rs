use bson::{doc, Document};

use super::{handle_response_error, CursorBody, Operation, Retryability};
use crate::{
    cmap::{Command, CommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::Result,
    namespace::Namespace,
    options::FindOptions,
    selection_criteria::SelectionCriteria,
};

/// Queries a collection, producing the specification of the server-side cursor that iterates
/// the results.
pub(crate) struct Find {
    ns: Namespace,
    filter: Document,
    options: Option<FindOptions>,
}

impl Find {
    pub(crate) fn new(ns: Namespace, filter: Document, options: Option<FindOptions>) -> Self {
        Self {
            ns,
            filter,
            options,
        }
    }
}

impl Operation for Find {
    type O = CursorSpecification;

    const NAME: &'static str = "find";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "filter": self.filter.clone(),
        };

        if let Some(ref options) = self.options {
            if let Some(limit) = options.limit {
                body.insert("limit", limit);
            }
            if let Some(batch_size) = options.batch_size {
                body.insert("batchSize", i64::from(batch_size));
            }
            if let Some(ref sort) = options.sort {
                body.insert("sort", sort.clone());
            }
            if let Some(ref projection) = options.projection {
                body.insert("projection", projection.clone());
            }
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(&self, response: CommandResponse) -> Result<Self::O> {
        handle_response_error(&response)?;
        let body: CursorBody = response.body()?;
        body.into_specification(response.source_address().clone())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|options| options.selection_criteria.as_ref())
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
