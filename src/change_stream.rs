use bson::{doc, Document};
use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::{
    client::Client,
    cursor::Cursor,
    error::{ErrorKind, Result},
    operation::{Aggregate, AggregateTarget},
    selection_criteria::SelectionCriteria,
};

/// An opaque token used to resume a change stream from a known point, taken from the `_id` of a
/// change event or from the post-batch resume token the server attaches to each reply.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ResumeToken(pub(crate) Document);

impl ResumeToken {
    /// View the raw token document.
    pub fn as_document(&self) -> &Document {
        &self.0
    }
}

/// Options for opening a change stream.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct ChangeStreamOptions {
    /// Directs the server to start reporting changes that occurred immediately after the given
    /// token.
    pub resume_after: Option<ResumeToken>,

    /// Like `resume_after`, but also usable with tokens from invalidate events.
    pub start_after: Option<ResumeToken>,

    /// The maximum amount of time for the server to wait for new changes before responding with
    /// an empty batch.
    pub max_await_time_ms: Option<u64>,

    /// The criteria used to select a server to run the stream against.
    pub selection_criteria: Option<SelectionCriteria>,
}

pub(crate) struct WatchArgs {
    pub(crate) target: AggregateTarget,
    pub(crate) pipeline: Vec<Document>,
    pub(crate) options: ChangeStreamOptions,
}

/// A stream of change events on a collection, database, or deployment.
///
/// The stream transparently resumes across transient failures: every batch (including empty
/// ones) updates the resume token, and on a resumable error the underlying aggregation is
/// rebuilt with `resumeAfter`/`startAfter` so no events are lost.
#[derive(Debug)]
pub struct ChangeStream {
    client: Client,
    cursor: Cursor,
    target: AggregateTarget,
    pipeline: Vec<Document>,
    options: ChangeStreamOptions,
    resume_token: Option<ResumeToken>,
    document_returned: bool,
}

impl ChangeStream {
    pub(crate) async fn open(client: Client, args: WatchArgs) -> Result<ChangeStream> {
        let resume_token = args
            .options
            .start_after
            .clone()
            .or_else(|| args.options.resume_after.clone());

        let mut stream = ChangeStream {
            client: client.clone(),
            // Replaced immediately below; an exhausted placeholder keeps the fields simple.
            cursor: Cursor::new(
                client,
                crate::cursor::CursorSpecification::new(
                    crate::namespace::Namespace::new("admin", "$cmd"),
                    crate::options::ServerAddress::default(),
                    0,
                    Vec::new(),
                    None,
                ),
            ),
            target: args.target,
            pipeline: args.pipeline,
            options: args.options,
            resume_token,
            document_returned: false,
        };

        stream.open_cursor().await?;
        Ok(stream)
    }

    /// The cursor's current resume token, updated on every batch the server returns.
    pub fn resume_token(&self) -> Option<&ResumeToken> {
        self.resume_token.as_ref()
    }

    /// Returns the next change event, waiting through empty batches until one arrives. Resumable
    /// failures restart the stream from the latest resume token before retrying.
    pub async fn next(&mut self) -> Result<Option<Document>> {
        loop {
            match self.next_if_any().await {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) if self.cursor.is_exhausted() => return Ok(None),
                Ok(None) => continue,
                Err(error) => return Err(error),
            }
        }
    }

    /// Returns the next change event if one is available in the current or next batch, or `None`
    /// after an empty batch (whose post-batch resume token is still recorded). Resumable
    /// failures restart the stream before retrying once.
    pub async fn next_if_any(&mut self) -> Result<Option<Document>> {
        match self.next_from_cursor().await {
            Ok(event) => Ok(event),
            Err(error) if error.is_resumable() => {
                self.resume().await?;
                self.next_from_cursor().await
            }
            Err(error) => Err(error),
        }
    }

    async fn next_from_cursor(&mut self) -> Result<Option<Document>> {
        loop {
            if let Some(event) = self.cursor.try_next_buffered() {
                let token = if self.cursor.buffered_count() == 0 {
                    self.cursor
                        .post_batch_resume_token()
                        .cloned()
                        .or_else(|| event.get_document("_id").ok().cloned())
                } else {
                    event.get_document("_id").ok().cloned()
                };

                match token {
                    Some(token) => self.resume_token = Some(ResumeToken(token)),
                    None => return Err(ErrorKind::MissingResumeToken.into()),
                }

                self.document_returned = true;
                return Ok(Some(event));
            }

            if self.cursor.is_exhausted() {
                return Ok(None);
            }

            self.cursor.fetch_batch().await?;

            // Post-batch resume tokens advance the stream's position even when nothing changed,
            // so a later resume doesn't replay the whole oplog window.
            if let Some(token) = self.cursor.post_batch_resume_token().cloned() {
                self.resume_token = Some(ResumeToken(token));
            }

            if self.cursor.buffered_count() == 0 {
                return Ok(None);
            }
        }
    }

    /// Re-opens the stream's cursor from the latest known position.
    async fn resume(&mut self) -> Result<()> {
        self.open_cursor().await
    }

    async fn open_cursor(&mut self) -> Result<()> {
        let mut stage = Document::new();

        match self.resume_token {
            Some(ref token) => {
                // A stream opened with startAfter keeps using it until the first event has been
                // seen; after that the stream's own tokens take over via resumeAfter.
                if !self.document_returned && self.options.start_after.is_some() {
                    stage.insert("startAfter", token.0.clone());
                } else {
                    stage.insert("resumeAfter", token.0.clone());
                }
            }
            None => {}
        }

        if matches!(self.target, AggregateTarget::Database(ref db) if db == "admin") {
            stage.insert("allChangesForCluster", true);
        }

        let mut pipeline = vec![doc! { "$changeStream": stage }];
        pipeline.extend(self.pipeline.iter().cloned());

        let mut op = Aggregate::new(
            self.target.clone(),
            pipeline,
            self.options.selection_criteria.clone(),
            self.options.max_await_time_ms,
        );

        let spec = self.client.execute_operation(&mut op, None).await?;
        self.cursor = Cursor::new(self.client.clone(), spec);

        // An empty initial batch's post-batch resume token supersedes the position the stream
        // was opened or resumed from. When the batch has events, their `_id`s take over as the
        // documents are iterated instead.
        if self.cursor.buffered_count() == 0 {
            if let Some(token) = self.cursor.post_batch_resume_token().cloned() {
                self.resume_token = Some(ResumeToken(token));
            }
        }

        Ok(())
    }
}
