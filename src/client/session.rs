mod cluster_time;
mod pool;

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::{
    bson::{doc, Binary, Document, Timestamp},
    error::{Error, Result},
    operation::{AbortTransaction, CommitTransaction, Operation, Retryability},
    options::{ServerAddress, SessionOptions, TransactionOptions, WriteConcern},
    runtime,
    sdam::TransactionSupportStatus,
    selection_criteria::SelectionCriteria,
    Client,
};
pub use cluster_time::ClusterTime;
pub(super) use pool::ServerSessionPool;

/// Server sessions idle for less than this long before their timeout are not reused.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// A logical session: a sequence of operations the server can order causally and group into
/// transactions. Created with [`Client::start_session`].
///
/// A session must not be used concurrently. Dropping it returns its server session to the
/// client's pool; a transaction still in progress is aborted in the background first.
///
/// ## Transactions
/// Call [`ClientSession::start_transaction`], then pass the session to every operation that
/// belongs to the transaction.
///
/// ```rust,no_run
/// # use mongodb_core::{
/// #     bson::doc,
/// #     error::{Result, TRANSIENT_TRANSACTION_ERROR},
/// #     Client,
/// #     ClientSession,
/// #     Collection,
/// # };
/// # async fn run() -> Result<()> {
/// # let client = Client::with_uri_str("mongodb://example.com").await?;
/// # let accounts = client.database("bank").collection("accounts");
/// let mut session = client.start_session(None).await?;
/// loop {
///     session.start_transaction(None).await?;
///     match transfer(&accounts, &mut session).await {
///         Err(error) if error.contains_label(TRANSIENT_TRANSACTION_ERROR) => continue,
///         outcome => break outcome,
///     }
/// }
/// # }
///
/// async fn transfer(accounts: &Collection, session: &mut ClientSession) -> Result<()> {
///     let debit = doc! { "$inc": doc! { "balance": -10 } };
///     let credit = doc! { "$inc": doc! { "balance": 10 } };
///     accounts
///         .update_one_with_session(doc! { "_id": "alice" }, debit, None, session)
///         .await?;
///     accounts
///         .update_one_with_session(doc! { "_id": "bob" }, credit, None, session)
///         .await?;
///     session.commit_transaction().await
/// }
/// ```
#[derive(Debug)]
pub struct ClientSession {
    client: Client,
    server_session: ServerSession,
    options: Option<SessionOptions>,
    is_implicit: bool,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    pub(crate) transaction: Transaction,
}

/// Transaction bookkeeping for a session.
#[derive(Clone, Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    /// Set while a sharded transaction is bound to one mongos.
    pub(crate) pinned: Option<SelectionCriteria>,
    /// Handed out by mongos so a commit or abort can find the transaction on another router.
    pub(crate) recovery_token: Option<Document>,
}

impl Transaction {
    pub(crate) fn start(&mut self, options: Option<TransactionOptions>) {
        *self = Self {
            state: TransactionState::Starting,
            options,
            pinned: self.pinned.take(),
            recovery_token: None,
        };
    }

    pub(crate) fn commit(&mut self, data_committed: bool) {
        self.state = TransactionState::Committed { data_committed };
    }

    pub(crate) fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn pinned_mongos(&self) -> Option<&SelectionCriteria> {
        self.pinned.as_ref()
    }

    fn write_concern(&self) -> Option<WriteConcern> {
        self.options.as_ref()?.write_concern.clone()
    }

    fn commit_operation(&self) -> CommitTransaction {
        CommitTransaction::new(self.options.clone(), self.pinned.clone())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    Committed {
        /// False when the transaction ran no statements, so there is nothing on the server to
        /// commit again.
        data_committed: bool,
    },
    Aborted,
}

impl ClientSession {
    pub(crate) fn new(
        server_session: ServerSession,
        client: Client,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> Self {
        Self {
            client,
            server_session,
            options,
            is_implicit,
            cluster_time: None,
            operation_time: None,
            transaction: Transaction::default(),
        }
    }

    /// The client that started this session.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The `lsid` document sent with every command of this session.
    pub fn id(&self) -> &Document {
        &self.server_session.id
    }

    /// The options the session was started with.
    pub fn options(&self) -> Option<&SessionOptions> {
        self.options.as_ref()
    }

    /// The newest cluster time this session has observed.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The newest operation time this session has observed.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Moves the session's cluster time forward to `to`. Older times are ignored.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time.as_ref().is_none_or(|current| current < to) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Moves the session's operation time forward to `ts`. Older times are ignored.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        if self.operation_time.is_none_or(|current| current < ts) {
            self.operation_time = Some(ts);
        }
    }

    /// Sessions the driver starts on its own behalf.
    pub(crate) fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    pub(crate) fn in_transaction(&self) -> bool {
        matches!(
            self.transaction.state,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    pub(crate) fn causal_consistency(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|options| options.causal_consistency)
            .unwrap_or(true)
    }

    /// Keeps the server session out of the pool once this session ends. Used after network
    /// errors, when the server may still consider the session busy.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session.dirty = true;
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.server_session.dirty
    }

    pub(crate) fn update_last_use(&mut self) {
        self.server_session.last_use = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn txn_number(&self) -> i64 {
        self.server_session.txn_number
    }

    /// The `txnNumber` to attach to the next command. Every statement of a transaction reuses
    /// the transaction's number, and each retryable write outside one takes a new number.
    pub(crate) fn get_txn_number_for_operation(
        &mut self,
        retryability: Retryability,
    ) -> Option<i64> {
        let server_session = &mut self.server_session;
        if self.transaction.state != TransactionState::None {
            return Some(server_session.txn_number);
        }
        (retryability == Retryability::Write).then(|| {
            server_session.txn_number += 1;
            server_session.txn_number
        })
    }

    pub(crate) fn pin_mongos(&mut self, address: ServerAddress) {
        self.transaction.pinned = Some(SelectionCriteria::from_address(address));
    }

    pub(crate) fn unpin(&mut self) {
        self.transaction.pinned = None;
    }

    /// Starts a transaction. Options missing from `options` come from the session's default
    /// transaction options, then from the client.
    ///
    /// Every operation of the transaction must be given this session; operations run without it
    /// happen outside the transaction.
    pub async fn start_transaction(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::transaction("transaction already in progress"));
        }
        if self.client.transaction_support_status().await? != TransactionSupportStatus::Supported
        {
            return Err(Error::transaction(
                "transactions are not supported by this deployment",
            ));
        }

        let options = self.effective_transaction_options(options.into());
        let unacknowledged = options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
            .is_some_and(|wc| !wc.is_acknowledged());
        if unacknowledged {
            return Err(Error::transaction(
                "transactions do not support unacknowledged write concerns",
            ));
        }

        self.server_session.txn_number += 1;
        self.unpin();
        self.transaction.start(options);
        Ok(())
    }

    fn effective_transaction_options(
        &self,
        explicit: Option<TransactionOptions>,
    ) -> Option<TransactionOptions> {
        let defaults = self
            .options
            .as_ref()
            .and_then(|options| options.default_transaction_options.as_ref());
        let mut options = match (explicit, defaults) {
            (Some(mut explicit), Some(defaults)) => {
                merge_options!(
                    defaults,
                    explicit,
                    [
                        read_concern,
                        write_concern,
                        selection_criteria,
                        max_commit_time
                    ]
                );
                Some(explicit)
            }
            (explicit, defaults) => explicit.or_else(|| defaults.cloned()),
        };
        resolve_options!(
            self.client,
            options,
            [read_concern, write_concern, selection_criteria]
        );
        options
    }

    /// Commits the active transaction.
    ///
    /// A retryable failure is retried once with the write concern raised to majority. Calling
    /// this again after a commit sends the commit again in the same way, which settles an
    /// outcome left unknown by the first call.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        let commit = match self.transaction.state {
            TransactionState::None => return Err(Error::transaction("no transaction started")),
            TransactionState::Aborted => {
                return Err(Error::transaction(
                    "commitTransaction cannot follow abortTransaction",
                ))
            }
            TransactionState::Starting
            | TransactionState::Committed {
                data_committed: false,
            } => {
                self.transaction.commit(false);
                return Ok(());
            }
            TransactionState::InProgress => self.transaction.commit_operation(),
            TransactionState::Committed {
                data_committed: true,
            } => {
                let mut commit = self.transaction.commit_operation();
                commit.update_for_retry();
                commit
            }
        };
        self.transaction.commit(true);
        self.client
            .clone()
            .execute_operation(commit, self)
            .await
    }

    /// Aborts the active transaction. Failures reported while aborting are logged and
    /// otherwise ignored.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => return Err(Error::transaction("no transaction started")),
            TransactionState::Committed { .. } => {
                return Err(Error::transaction(
                    "abortTransaction cannot follow commitTransaction",
                ))
            }
            TransactionState::Aborted => {
                return Err(Error::transaction("transaction already aborted"))
            }
            TransactionState::Starting => {}
            TransactionState::InProgress => {
                let abort = self.begin_abort();
                self.send_abort(abort).await;
                return Ok(());
            }
        }
        self.transaction.abort();
        Ok(())
    }

    /// Ends the session, aborting a transaction that is still running.
    pub async fn end_session(mut self) {
        if self.transaction.state == TransactionState::InProgress {
            let _ = self.abort_transaction().await;
        }
    }

    /// Marks the transaction aborted and returns the command that tells the server so.
    fn begin_abort(&mut self) -> AbortTransaction {
        let abort = AbortTransaction::new(
            self.transaction.write_concern(),
            self.transaction.pinned.clone(),
        );
        self.transaction.abort();
        abort
    }

    async fn send_abort(&mut self, abort: AbortTransaction) {
        let client = self.client.clone();
        if let Err(error) = client.execute_operation(abort, &mut *self).await {
            tracing::debug!(%error, "abortTransaction failed");
        }
        self.unpin();
    }

    /// Moves everything out of `self` into a session that can outlive it.
    fn detach(&mut self) -> ClientSession {
        ClientSession {
            client: self.client.clone(),
            server_session: self.server_session.clone(),
            options: self.options.take(),
            is_implicit: self.is_implicit,
            cluster_time: self.cluster_time.take(),
            operation_time: self.operation_time,
            transaction: std::mem::take(&mut self.transaction),
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if self.transaction.state == TransactionState::InProgress {
            // The detached session is no longer in progress, so dropping it unsent only checks
            // the server session in.
            let spawned = runtime::try_execute(|| {
                let mut detached = self.detach();
                let abort = detached.begin_abort();
                async move { detached.send_abort(abort).await }
            });
            if spawned {
                return;
            }
        }
        self.client
            .check_in_server_session(self.server_session.clone());
    }
}

/// The server-side half of a session. Pooled by the client and reused by successive
/// `ClientSession`s.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// Generated client side as a random UUID.
    pub(crate) id: Document,
    last_use: Instant,
    dirty: bool,
    txn_number: i64,
}

impl ServerSession {
    pub(crate) fn new() -> Self {
        Self {
            id: doc! { "id": Binary::uuid(Uuid::new_v4()) },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Whether the server may time the session out within the next minute.
    fn is_about_to_expire(&self, logical_session_timeout: Duration) -> bool {
        self.last_use + logical_session_timeout < Instant::now() + EXPIRY_MARGIN
    }
}
