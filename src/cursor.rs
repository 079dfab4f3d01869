use std::collections::VecDeque;

use bson::Document;

use crate::{
    client::Client,
    error::Result,
    namespace::Namespace,
    operation::{GetMore, KillCursors},
    options::ServerAddress,
};

/// Everything needed to resume iterating a server-side cursor: which server issued it, its id,
/// and the buffered batch. A cursor is exhausted once the server reports id 0.
#[derive(Clone, Debug)]
pub(crate) struct CursorSpecification {
    pub(crate) ns: Namespace,
    pub(crate) address: ServerAddress,
    pub(crate) id: i64,
    pub(crate) initial_buffer: VecDeque<Document>,
    pub(crate) post_batch_resume_token: Option<Document>,
    pub(crate) max_await_time_ms: Option<u64>,
}

impl CursorSpecification {
    pub(crate) fn new(
        ns: Namespace,
        address: ServerAddress,
        id: i64,
        batch: Vec<Document>,
        post_batch_resume_token: Option<Document>,
    ) -> Self {
        Self {
            ns,
            address,
            id,
            initial_buffer: batch.into(),
            post_batch_resume_token,
            max_await_time_ms: None,
        }
    }
}

/// A cursor over the results of a query or aggregation. Batches are fetched lazily with
/// `getMore` commands pinned to the server that created the cursor.
#[derive(Debug)]
pub struct Cursor {
    client: Client,
    ns: Namespace,
    address: ServerAddress,
    id: i64,
    buffer: VecDeque<Document>,
    post_batch_resume_token: Option<Document>,
    max_await_time_ms: Option<u64>,
    batch_size: Option<u32>,
}

impl Cursor {
    pub(crate) fn new(client: Client, spec: CursorSpecification) -> Self {
        Self {
            client,
            ns: spec.ns,
            address: spec.address,
            id: spec.id,
            buffer: spec.initial_buffer,
            post_batch_resume_token: spec.post_batch_resume_token,
            max_await_time_ms: spec.max_await_time_ms,
            batch_size: None,
        }
    }

    /// Whether the server has no more results to hand out. The buffer may still hold documents.
    pub fn is_exhausted(&self) -> bool {
        self.id == 0
    }

    /// The resume token that applies once the current batch is fully iterated, when the cursor
    /// belongs to a change stream.
    pub(crate) fn post_batch_resume_token(&self) -> Option<&Document> {
        self.post_batch_resume_token.as_ref()
    }

    pub(crate) fn buffered_count(&self) -> usize {
        self.buffer.len()
    }

    /// Pops the next document off the in-memory buffer without touching the network.
    pub(crate) fn try_next_buffered(&mut self) -> Option<Document> {
        self.buffer.pop_front()
    }

    /// Advances the cursor, returning the next document or `None` once the cursor is exhausted
    /// and the buffer is drained.
    pub async fn next(&mut self) -> Result<Option<Document>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Ok(Some(doc));
            }

            if self.is_exhausted() {
                return Ok(None);
            }

            self.fetch_batch().await?;

            if self.buffer.is_empty() && self.is_exhausted() {
                return Ok(None);
            }
        }
    }

    /// Collects the remaining documents in the cursor.
    pub async fn collect(mut self) -> Result<Vec<Document>> {
        let mut all = Vec::new();
        while let Some(doc) = self.next().await? {
            all.push(doc);
        }
        Ok(all)
    }

    /// Runs one `getMore`, refilling the buffer and updating the cursor state. Exposed within
    /// the crate so change streams can observe batch boundaries.
    pub(crate) async fn fetch_batch(&mut self) -> Result<()> {
        let mut op = GetMore::new(
            self.ns.clone(),
            self.id,
            self.address.clone(),
            self.batch_size,
            self.max_await_time_ms,
        );

        let spec = self.client.execute_operation(&mut op, None).await?;

        self.id = spec.id;
        self.buffer = spec.initial_buffer;
        if spec.post_batch_resume_token.is_some() {
            self.post_batch_resume_token = spec.post_batch_resume_token;
        }

        Ok(())
    }

    /// Closes the cursor server-side if it is not yet exhausted. Best-effort: a cursor that is
    /// never closed times out on the server after its idle period.
    pub async fn close(mut self) {
        self.kill();
    }

    fn kill(&mut self) {
        if self.id != 0 && tokio::runtime::Handle::try_current().is_ok() {
            let client = self.client.clone();
            let mut op = KillCursors::new(self.ns.clone(), self.id, self.address.clone());
            self.id = 0;
            crate::runtime::spawn(async move {
                let _: Result<_> = client.execute_operation(&mut op, None).await;
            });
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.kill();
    }
}
