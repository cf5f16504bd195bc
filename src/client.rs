pub mod auth;
mod executor;
pub mod options;
pub mod session;

use std::sync::Arc;

use derive_where::derive_where;

use crate::{
    bson::{doc, Document},
    concern::{ReadConcern, WriteConcern},
    db::Database,
    error::{ErrorKind, Result},
    event::command::{CommandEvent, CommandEventHandler},
    operation::RunCommand,
    options::{ClientOptions, DatabaseOptions, ReadPreference, SelectionCriteria, SessionOptions},
    sdam::{SessionSupportStatus, Topology},
    trace::{command::CommandTracingEventEmitter, trace_enabled, COMMAND_TRACING_EVENT_TARGET},
    ClientSession,
};

use session::{ServerSession, ServerSessionPool};

/// The server accepts at most this many ids in a single `endSessions` command.
const MAX_END_SESSIONS_BATCH_SIZE: usize = 10_000;

/// This is the main entry point for the API. A `Client` is used to connect to a MongoDB cluster.
/// By default, it will monitor the topology of the cluster, keeping track of any changes, such
/// as servers being added or removed.
///
/// `Client` uses [`std::sync::Arc`] internally, so it can safely be shared across threads or
/// async tasks. For example:
///
/// ```rust,no_run
/// # use mongodb_core::{bson::doc, Client, error::Result};
/// # async fn start_workers() -> Result<()> {
/// let client = Client::with_uri_str("mongodb://example.com").await?;
///
/// for i in 0..5 {
///     let client_ref = client.clone();
///
///     tokio::task::spawn(async move {
///         let collection = client_ref.database("items").collection(&format!("coll{}", i));
///         let _ = collection.insert_one(doc! { "i": i }, None).await;
///     });
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive_where(Debug)]
struct ClientInner {
    topology: Topology,
    options: ClientOptions,
    #[derive_where(skip)]
    session_pool: ServerSessionPool,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `uri`. `uri` must be a valid
    /// MongoDB connection string.
    ///
    /// See the documentation on [`ClientOptions::parse`] for more details.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri.as_ref())?;
        Client::with_options(options)
    }

    /// Creates a new `Client` connected to the cluster specified by `options`.
    ///
    /// This must be called from within a tokio runtime, since it starts the monitoring tasks.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let inner = Arc::new(ClientInner {
            topology: Topology::new(options.clone())?,
            session_pool: ServerSessionPool::new(),
            options,
        });
        Ok(Self { inner })
    }

    pub(crate) fn emit_command_event(&self, make: impl FnOnce() -> CommandEvent) {
        let tracer =
            trace_enabled!(COMMAND_TRACING_EVENT_TARGET).then(|| self.command_tracing_emitter());
        let handler = self.inner.options.command_event_handler.as_deref();
        crate::event::deliver(
            handler,
            tracer.as_ref().map(|tracer| tracer as &dyn CommandEventHandler),
            make,
            |event, to| event.dispatch(to),
        );
    }

    fn command_tracing_emitter(&self) -> CommandTracingEventEmitter {
        CommandTracingEventEmitter::new(
            self.inner.options.tracing_max_document_length_bytes,
            self.inner.topology.id(),
        )
    }

    /// Gets the default selection criteria the `Client` uses for operations.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.options.selection_criteria.as_ref()
    }

    /// Gets the default read concern the `Client` uses for operations.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.options.read_concern.as_ref()
    }

    /// Gets the default write concern the `Client` uses for operations.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.options.write_concern.as_ref()
    }

    /// Gets a handle to a database specified by `name` in the cluster the `Client` is connected to.
    /// The `Database` options (e.g. read preference and write concern) will default to those of the
    /// `Client`.
    ///
    /// This method does not send or receive anything across the wire to the database, so it can be
    /// used repeatedly without incurring any costs from I/O.
    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name, None)
    }

    /// Gets a handle to a database specified by `name` in the cluster the `Client` is connected to.
    /// Operations done with this `Database` will use the options specified by `options` by default
    /// and will otherwise default to those of the `Client`.
    pub fn database_with_options(&self, name: &str, options: DatabaseOptions) -> Database {
        Database::new(self.clone(), name, Some(options))
    }

    /// Gets a handle to the default database specified in the `ClientOptions` or MongoDB connection
    /// string used to construct this `Client`.
    ///
    /// If no default database was specified, `None` will be returned.
    pub fn default_database(&self) -> Option<Database> {
        self.inner
            .options
            .default_database
            .as_ref()
            .map(|db_name| self.database(db_name))
    }

    /// Starts a new `ClientSession`.
    ///
    /// Server sessions are reused most-recently-released first, so a workload that runs one
    /// session at a time keeps using the same server session.
    pub async fn start_session(
        &self,
        options: impl Into<Option<SessionOptions>>,
    ) -> Result<ClientSession> {
        match self.session_support_status().await? {
            SessionSupportStatus::Supported {
                logical_session_timeout,
            } => Ok(ClientSession::new(
                self.inner.session_pool.check_out(logical_session_timeout),
                self.clone(),
                options.into(),
                false,
            )),
            _ => Err(ErrorKind::SessionsNotSupported.into()),
        }
    }

    /// Starts a session owned by a single operation. The caller has already checked that the
    /// server it is talking to supports sessions.
    pub(crate) fn start_implicit_session(&self) -> ClientSession {
        let timeout = match self.inner.topology.session_support_status() {
            SessionSupportStatus::Supported {
                logical_session_timeout,
            } => Some(logical_session_timeout),
            _ => None,
        };
        let server_session = match timeout {
            Some(timeout) => self.inner.session_pool.check_out(timeout),
            None => ServerSession::new(),
        };
        ClientSession::new(server_session, self.clone(), None, true)
    }

    /// Returns a server session to the pool. It is discarded if it is dirty, close to expiring,
    /// or the deployment no longer supports sessions.
    pub(crate) fn check_in_server_session(&self, session: ServerSession) {
        if let SessionSupportStatus::Supported {
            logical_session_timeout,
        } = self.inner.topology.session_support_status()
        {
            self.inner
                .session_pool
                .check_in(session, logical_session_timeout);
        }
    }

    /// Shuts down this `Client`: the server sessions in the pool are ended on the server with
    /// `endSessions` and the monitoring tasks and connection pools are stopped. Operations started
    /// after this returns fail with [`ErrorKind::Shutdown`].
    ///
    /// Sessions still held by the application are not ended.
    pub async fn shutdown(self) {
        let ids = self.inner.session_pool.drain_ids();
        for batch in ids.chunks(MAX_END_SESSIONS_BATCH_SIZE) {
            if let Err(error) = self.end_sessions(batch).await {
                tracing::debug!(%error, "endSessions failed during shutdown");
            }
        }
        self.inner.topology.shutdown().await;
    }

    async fn end_sessions(&self, ids: &[Document]) -> Result<()> {
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred {
            options: Default::default(),
        });
        let op = RunCommand::new(
            "admin".to_string(),
            doc! { "endSessions": ids.to_vec() },
            Some(criteria),
        )?;
        self.execute_operation(op, None).await.map(|_| ())
    }

    #[cfg(test)]
    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    #[cfg(test)]
    pub(crate) fn pooled_session_ids(&self) -> Vec<Document> {
        self.inner.session_pool.ids()
    }
}
