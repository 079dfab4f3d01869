use bson::{doc, Bson, Document};

use super::{handle_response_error, CursorBody, Operation, Retryability};
use crate::{
    cmap::{Command, CommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::Result,
    namespace::Namespace,
    selection_criteria::SelectionCriteria,
};

/// What an aggregation runs against: a collection, or a whole database/deployment (used by
/// change streams on databases and clusters, where the command's collection field is the
/// integer 1).
#[derive(Clone, Debug)]
pub(crate) enum AggregateTarget {
    Collection(Namespace),
    Database(String),
}

impl AggregateTarget {
    pub(crate) fn db(&self) -> &str {
        match self {
            AggregateTarget::Collection(ns) => ns.db.as_str(),
            AggregateTarget::Database(db) => db.as_str(),
        }
    }

    fn aggregate_field(&self) -> Bson {
        match self {
            AggregateTarget::Collection(ns) => Bson::String(ns.coll.clone()),
            AggregateTarget::Database(_) => Bson::Int32(1),
        }
    }
}

/// Runs an aggregation pipeline, producing a cursor over its results. Change streams are
/// aggregations whose first stage is `$changeStream`.
pub(crate) struct Aggregate {
    target: AggregateTarget,
    pipeline: Vec<Document>,
    selection_criteria: Option<SelectionCriteria>,
    max_await_time_ms: Option<u64>,
}

impl Aggregate {
    pub(crate) fn new(
        target: AggregateTarget,
        pipeline: impl IntoIterator<Item = Document>,
        selection_criteria: Option<SelectionCriteria>,
        max_await_time_ms: Option<u64>,
    ) -> Self {
        Self {
            target,
            pipeline: pipeline.into_iter().collect(),
            selection_criteria,
            max_await_time_ms,
        }
    }
}

impl Operation for Aggregate {
    type O = CursorSpecification;

    const NAME: &'static str = "aggregate";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let body = doc! {
            Self::NAME: self.target.aggregate_field(),
            "pipeline": self.pipeline.clone(),
            "cursor": {},
        };

        Ok(Command::new(Self::NAME, self.target.db(), body))
    }

    fn handle_response(&self, response: CommandResponse) -> Result<Self::O> {
        handle_response_error(&response)?;
        let body: CursorBody = response.body()?;
        let mut spec = body.into_specification(response.source_address().clone())?;
        spec.max_await_time_ms = self.max_await_time_ms;
        Ok(spec)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
