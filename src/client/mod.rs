pub(crate) mod auth;
mod executor;
pub(crate) mod options;
pub(crate) mod session;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bson::Document;

use crate::{
    change_stream::{ChangeStream, ChangeStreamOptions, WatchArgs},
    cursor::Cursor,
    error::{ErrorKind, Result},
    namespace::Namespace,
    operation::{
        Aggregate,
        AggregateTarget,
        EndSessions,
        Find,
        Insert,
        InsertResult,
        RunCommand,
        MAX_END_SESSIONS_BATCH_SIZE,
    },
    options::{ClientOptions, FindOptions},
    runtime,
    sdam::Topology,
    selection_criteria::SelectionCriteria,
};

use self::session::{ClientSession, ServerSession, ServerSessionPool};

/// The amount of time shutdown will spend, at most, ending pooled sessions on the deployment.
const END_SESSIONS_DEADLINE: Duration = Duration::from_secs(5);

/// The entry point to the driver: a handle to a deployment of servers.
///
/// A `Client` owns the machinery that tracks the deployment (one monitor task per server and a
/// topology worker applying their updates), a connection pool per server, and a pool of logical
/// sessions. It is cheap to clone and safe to share across tasks; all clones observe the same
/// topology.
///
/// Dropping the last handle shuts the machinery down; call [`Client::shutdown`] instead to also
/// release server-side session state.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    topology: Topology,
    options: ClientOptions,
    session_pool: ServerSessionPool,
    shutdown: AtomicBool,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `uri`. The cluster is
    /// discovered and monitored in the background; this call does not wait for any server to be
    /// reachable.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri.as_ref())?;
        Client::with_options(options)
    }

    /// Creates a new `Client` with the given options.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let topology = Topology::new(options.clone())?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                topology,
                options,
                session_pool: ServerSessionPool::new(),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Starts a new [`ClientSession`].
    pub async fn start_session(&self) -> ClientSession {
        self.start_session_inner(false).await
    }

    pub(crate) async fn start_implicit_session(&self) -> ClientSession {
        self.start_session_inner(true).await
    }

    async fn start_session_inner(&self, is_implicit: bool) -> ClientSession {
        let timeout = self.inner.topology.logical_session_timeout();
        let server_session = self.inner.session_pool.check_out(timeout).await;
        ClientSession::new(server_session, self.clone(), is_implicit)
    }

    /// Returns a dropped session to the pool. Runs in the background since `Drop` cannot await.
    pub(crate) fn check_in_server_session(&self, session: ServerSession) {
        let client = self.clone();
        if tokio::runtime::Handle::try_current().is_ok() {
            runtime::spawn(async move {
                let timeout = client.inner.topology.logical_session_timeout();
                client.inner.session_pool.check_in(session, timeout).await;
            });
        }
    }

    /// Runs a database command against the given database. No inspection is done on the
    /// command or response other than surfacing a command-level failure as an error.
    pub async fn run_command(
        &self,
        db: impl AsRef<str>,
        command: Document,
    ) -> Result<Document> {
        let mut op = RunCommand::new(db.as_ref(), command, None)?;
        self.execute_operation(&mut op, None).await
    }

    /// Inserts the given documents into the namespace (of the form `"db.coll"`). Single-batch
    /// inserts are transparently retried on transient failures when the deployment supports
    /// retryable writes.
    pub async fn insert(
        &self,
        ns: impl AsRef<str>,
        documents: Vec<Document>,
    ) -> Result<InsertResult> {
        if documents.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "no documents provided to insert".to_string(),
            }
            .into());
        }

        let ns: Namespace = ns.as_ref().parse()?;
        let mut op = Insert::new(ns, documents, self.inner.options.write_concern.clone());
        self.execute_operation(&mut op, None).await
    }

    /// Queries the namespace, returning a [`Cursor`] over the matching documents.
    pub async fn find(&self, ns: impl AsRef<str>, filter: Document) -> Result<Cursor> {
        self.find_with_options(ns, filter, None).await
    }

    /// `find` with explicit options.
    pub async fn find_with_options(
        &self,
        ns: impl AsRef<str>,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Cursor> {
        let ns: Namespace = ns.as_ref().parse()?;
        let mut op = Find::new(ns, filter, options.into());
        let spec = self.execute_operation(&mut op, None).await?;
        Ok(Cursor::new(self.clone(), spec))
    }

    /// Runs an aggregation pipeline against the namespace, returning a [`Cursor`] over its
    /// results.
    pub async fn aggregate(
        &self,
        ns: impl AsRef<str>,
        pipeline: impl IntoIterator<Item = Document>,
    ) -> Result<Cursor> {
        let ns: Namespace = ns.as_ref().parse()?;
        let mut op = Aggregate::new(AggregateTarget::Collection(ns), pipeline, None, None);
        let spec = self.execute_operation(&mut op, None).await?;
        Ok(Cursor::new(self.clone(), spec))
    }

    /// Opens a [`ChangeStream`] on the namespace, reporting changes as they occur. The stream
    /// resumes transparently across transient failures.
    pub async fn watch(
        &self,
        ns: impl AsRef<str>,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<ChangeStreamOptions>>,
    ) -> Result<ChangeStream> {
        let ns: Namespace = ns.as_ref().parse()?;
        let args = WatchArgs {
            target: AggregateTarget::Collection(ns),
            pipeline: pipeline.into_iter().collect(),
            options: options.into().unwrap_or_default(),
        };
        ChangeStream::open(self.clone(), args).await
    }

    /// Opens a [`ChangeStream`] on the whole deployment.
    pub async fn watch_cluster(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<ChangeStreamOptions>>,
    ) -> Result<ChangeStream> {
        let args = WatchArgs {
            target: AggregateTarget::Database("admin".to_string()),
            pipeline: pipeline.into_iter().collect(),
            options: options.into().unwrap_or_default(),
        };
        ChangeStream::open(self.clone(), args).await
    }

    /// Shuts the client down: session state on the deployment is released (best-effort, with a
    /// deadline), then the monitors and the topology worker stop and the connection pools are
    /// dropped. Operations issued after shutdown fail with `ErrorKind::Shutdown`.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let _: Result<_> = runtime::timeout(END_SESSIONS_DEADLINE, self.end_sessions()).await;
        self.inner.topology.shutdown().await;
    }

    /// Releases every pooled server session on the deployment, batching up to the server's
    /// per-command limit.
    async fn end_sessions(&self) {
        let ids = self.inner.session_pool.drain().await;

        for batch in ids.chunks(MAX_END_SESSIONS_BATCH_SIZE) {
            let mut op = EndSessions::new(batch.to_vec());
            let _: Result<_> = self.execute_operation_inner(&mut op, None).await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn session_pool_contains(&self, id: &Document) -> bool {
        self.inner.session_pool.contains(id).await
    }

    pub(crate) fn default_selection_criteria(&self) -> SelectionCriteria {
        self.inner
            .options
            .selection_criteria
            .clone()
            .unwrap_or(SelectionCriteria::ReadPreference(
                crate::selection_criteria::ReadPreference::Primary,
            ))
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::SeqCst) && tokio::runtime::Handle::try_current().is_ok() {
            let updater = self.topology.updater();
            runtime::spawn(async move {
                updater.shutdown().await;
            });
        }
    }
}
