pub mod options;

use std::sync::Arc;

use crate::{
    bson::Document,
    concern::{ReadConcern, WriteConcern},
    error::{Error, Result},
    operation::RunCommand,
    options::{CollectionOptions, DatabaseOptions},
    selection_criteria::SelectionCriteria,
    Client,
    ClientSession,
    Collection,
};

/// A handle to one database on the deployment, obtained from [`Client::database`] or
/// [`Client::database_with_options`].
///
/// Handles are cheap to clone and share the same underlying client. Creating one does no I/O.
///
/// ```rust,no_run
/// # use mongodb_core::{bson::doc, error::Result, Client};
/// # async fn run() -> Result<()> {
/// let client = Client::with_uri_str("mongodb://example.com").await?;
/// let db = client.database("inventory");
/// db.run_command(doc! { "ping": 1 }, None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

#[derive(Debug)]
struct DatabaseInner {
    client: Client,
    name: String,
    selection_criteria: Option<SelectionCriteria>,
    read_concern: Option<ReadConcern>,
    write_concern: Option<WriteConcern>,
}

impl Database {
    pub(crate) fn new(client: Client, name: &str, options: Option<DatabaseOptions>) -> Self {
        let DatabaseOptions {
            selection_criteria,
            read_concern,
            write_concern,
        } = options.unwrap_or_default();

        let inner = DatabaseInner {
            selection_criteria: selection_criteria.or_else(|| client.selection_criteria().cloned()),
            read_concern: read_concern.or_else(|| client.read_concern().cloned()),
            write_concern: write_concern.or_else(|| client.write_concern().cloned()),
            name: name.to_string(),
            client,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The client this handle was created from.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// The database's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The default selection criteria for reads through this handle.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.selection_criteria.as_ref()
    }

    /// The default read concern.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.read_concern.as_ref()
    }

    /// The default write concern.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.write_concern.as_ref()
    }

    /// A handle to the collection `name`, inheriting this database's defaults.
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.clone(), name, None)
    }

    /// A handle to the collection `name`. Options left unset fall back to this database's.
    pub fn collection_with_options(&self, name: &str, options: CollectionOptions) -> Collection {
        Collection::new(self.clone(), name, Some(options))
    }

    /// Sends `command` to this database as-is. The database's read and write concerns are not
    /// applied.
    pub async fn run_command(
        &self,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Result<Document> {
        let operation = RunCommand::new(self.name().into(), command, selection_criteria.into())?;
        self.client().execute_operation(operation, None).await
    }

    /// Like [`run_command`](Self::run_command), but on `session`.
    ///
    /// Inside a transaction the command is routed with the transaction's read preference, which
    /// has to be primary, and it may not carry its own `readConcern`.
    pub async fn run_command_with_session(
        &self,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let mut selection_criteria = selection_criteria.into();
        if session.in_transaction() {
            if command.contains_key("readConcern") {
                return Err(Error::invalid_argument(
                    "cannot set read concern after starting a transaction",
                ));
            }
            selection_criteria = selection_criteria.or_else(|| {
                session
                    .transaction
                    .options
                    .as_ref()
                    .and_then(|options| options.selection_criteria.clone())
            });
            if selection_criteria
                .as_ref()
                .is_some_and(|criteria| !criteria.is_read_pref_primary())
            {
                return Err(Error::invalid_argument(
                    "read preference in a transaction must be primary",
                ));
            }
        }

        let operation = RunCommand::new(self.name().into(), command, selection_criteria)?;
        self.client().execute_operation(operation, session).await
    }
}
