use std::{
    borrow::BorrowMut,
    sync::Arc,
    time::{Duration, Instant},
};

use super::{session::TransactionState, Client, ClientSession};
use crate::{
    bson::Document,
    cmap::{
        conn::{pooled::PooledConnection, wire::next_request_id},
        Command,
        RawCommandResponse,
        StreamDescription,
    },
    error::{
        Error,
        ErrorKind,
        Result,
        RETRYABLE_WRITE_ERROR,
        TRANSIENT_TRANSACTION_ERROR,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    event::command::{
        CommandEvent,
        CommandFailedEvent,
        CommandStartedEvent,
        CommandSucceededEvent,
    },
    operation::{
        AbortTransaction,
        CommitTransaction,
        CursorSpecification,
        Operation,
        Retryability,
    },
    options::SelectionCriteria,
    runtime,
    sdam::{
        HandshakePhase,
        ServerType,
        SessionSupportStatus,
        TopologyType,
        TransactionSupportStatus,
    },
    selection_criteria::ReadPreference,
    Cursor,
    SessionCursor,
};

/// Commands whose bodies and replies never reach command monitoring.
const SENSITIVE_COMMANDS: &[&str] = &[
    "authenticate",
    "saslstart",
    "saslcontinue",
    "getnonce",
    "createuser",
    "updateuser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

/// Added to the server-side time limits to get the client-side deadline for a reply.
const CLIENT_TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// Whether monitoring must see an empty body for `command` and its reply. A handshake only counts
/// when it carries speculative authentication.
fn is_sensitive(command: &Command) -> bool {
    let name = command.name.to_ascii_lowercase();
    SENSITIVE_COMMANDS.contains(&name.as_str())
        || (matches!(name.as_str(), "hello" | "ismaster")
            && command.body.contains_key("speculativeAuthenticate"))
}

/// A failed first attempt, kept while the operation is retried.
#[derive(Debug)]
struct FailedAttempt {
    error: Error,

    /// A retried write reuses the transaction number of the first attempt.
    txn_number: Option<i64>,
}

impl Client {
    /// Runs `op`, selecting a server with the operation's criteria. An implicit session is
    /// started when none is given and the server and operation allow one.
    pub(crate) async fn execute_operation<T: Operation>(
        &self,
        mut op: impl BorrowMut<T>,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<T::O> {
        self.execute_operation_by_ref(op.borrow_mut(), session.into())
            .await
    }

    /// Runs a cursor-returning operation. Without an explicit session the cursor owns an implicit
    /// one, so every `getMore` runs in the session that created the cursor.
    pub(crate) async fn execute_cursor_operation<T>(&self, op: T) -> Result<Cursor>
    where
        T: Operation<O = CursorSpecification>,
    {
        let mut implicit_session = match self.session_support_status().await? {
            SessionSupportStatus::Supported { .. } => Some(self.start_implicit_session()),
            _ => None,
        };
        let spec = self.execute_operation(op, implicit_session.as_mut()).await?;
        Ok(Cursor::new(self.clone(), spec, implicit_session))
    }

    pub(crate) async fn execute_session_cursor_operation<T>(
        &self,
        op: T,
        session: &mut ClientSession,
    ) -> Result<SessionCursor>
    where
        T: Operation<O = CursorSpecification>,
    {
        let spec = self.execute_operation(op, &mut *session).await?;
        Ok(SessionCursor::new(self.clone(), spec, session.id().clone()))
    }

    /// Like [`Client::execute_operation`], but the caller keeps `op` and can read what it
    /// recorded while running.
    pub(crate) async fn execute_operation_by_ref<T: Operation>(
        &self,
        op: &mut T,
        mut session: Option<&mut ClientSession>,
    ) -> Result<T::O> {
        if let Some(wc) = op.write_concern() {
            wc.validate()?;
        }
        if let Some(session) = session.as_deref_mut() {
            self.check_session_for(op, session)?;
        }
        Box::pin(self.execute_with_retry(op, session)).await
    }

    fn check_session_for<T: Operation>(&self, op: &T, session: &mut ClientSession) -> Result<()> {
        if !Arc::ptr_eq(&self.inner, &session.client().inner) {
            return Err(Error::invalid_argument(
                "a session can only be used with the client that started it",
            ));
        }

        let reads_off_primary = op
            .selection_criteria()
            .and_then(SelectionCriteria::as_read_pref)
            .is_some_and(|read_pref| read_pref != &ReadPreference::Primary);
        if session.in_transaction() && reads_off_primary {
            return Err(Error::transaction(
                "read preference in a transaction must be primary",
            ));
        }

        // A finished transaction lingers only for repeated commits or aborts.
        let lingers = match session.transaction.state {
            TransactionState::Committed { .. } => op.name() == CommitTransaction::NAME,
            TransactionState::Aborted => op.name() == AbortTransaction::NAME,
            _ => true,
        };
        if !lingers {
            session.transaction.reset();
        }
        Ok(())
    }

    /// Where `op` should run. A transaction pinned to a mongos overrides the operation.
    fn criteria_for<T: Operation>(
        &self,
        op: &T,
        session: Option<&ClientSession>,
    ) -> SelectionCriteria {
        session
            .and_then(|session| session.transaction.pinned_mongos())
            .or_else(|| op.selection_criteria())
            .cloned()
            .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary))
    }

    async fn execute_with_retry<T: Operation>(
        &self,
        op: &mut T,
        session: Option<&mut ClientSession>,
    ) -> Result<T::O> {
        let mut first_attempt: Option<FailedAttempt> = None;
        let mut implicit_session: Option<ClientSession> = None;
        let mut session: Option<&mut ClientSession> = session;

        loop {
            if first_attempt.is_some() {
                op.update_for_retry();
            }

            let criteria = self.criteria_for(op, session.as_deref());
            let server = match self.inner.topology.select_server(&criteria, op.name()).await {
                Ok(server) => server,
                Err(mut error) => {
                    if let Some(previous) = first_attempt {
                        return Err(previous.error);
                    }
                    error.add_labels_and_update_pin(None, &mut session, None);
                    return Err(error);
                }
            };
            let address = server.address.clone();

            let mut conn = match server.pool.check_out().await {
                Ok(conn) => conn,
                Err(mut error) => {
                    if let Some(previous) = first_attempt {
                        return Err(previous.error);
                    }
                    error.add_labels_and_update_pin(None, &mut session, None);
                    if error.is_read_retryable() && self.inner.options.retry_writes != Some(false) {
                        error.add_label(RETRYABLE_WRITE_ERROR);
                    }
                    let in_transaction = session.as_ref().is_some_and(|s| s.in_transaction());
                    let retryability = self.retryability_with_options(op.retryability());
                    if in_transaction || !retryability.can_retry_error(&error) {
                        return Err(error);
                    }
                    first_attempt = Some(FailedAttempt {
                        error,
                        txn_number: None,
                    });
                    continue;
                }
            };

            if session.is_some() && !conn.supports_sessions() {
                return Err(ErrorKind::SessionsNotSupported.into());
            }
            if session.is_none()
                && conn.supports_sessions()
                && op.supports_sessions()
                && op.is_acknowledged()
            {
                session = Some(implicit_session.insert(self.start_implicit_session()));
            }

            let retryability =
                self.get_retryability(op, session.as_deref(), conn.stream_description()?);
            if retryability == Retryability::None {
                if let Some(previous) = first_attempt.take() {
                    return Err(previous.error);
                }
            }

            let txn_number = first_attempt
                .as_ref()
                .and_then(|attempt| attempt.txn_number)
                .or_else(|| {
                    session
                        .as_deref_mut()
                        .and_then(|s| s.get_txn_number_for_operation(retryability))
                });

            let outcome = self
                .execute_on_connection(
                    op,
                    &mut conn,
                    &mut session,
                    txn_number,
                    retryability,
                    &criteria,
                )
                .await;
            let error = match outcome {
                Ok(output) => return Ok(output),
                Err(error) => explain_unsupported_retryable_writes(error),
            };

            let phase = HandshakePhase::after_completion(&conn);
            self.inner
                .topology
                .handle_application_error(address, error.clone(), phase)
                .await;
            // Checked back in now so the pool can judge the connection.
            drop(conn);
            drop(server);

            match first_attempt {
                Some(previous) => {
                    // A retry that fails without saying anything about the server reports the
                    // first failure instead.
                    let informative = error.is_server_error()
                        || error.is_read_retryable()
                        || error.is_write_retryable();
                    return Err(if informative { error } else { previous.error });
                }
                None if retryability.can_retry_error(&error) => {
                    tracing::debug!(
                        operation = op.name(),
                        error = %error,
                        "retrying operation after a retryable error"
                    );
                    first_attempt = Some(FailedAttempt { error, txn_number });
                }
                None => return Err(error),
            }
        }
    }

    async fn execute_on_connection<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut PooledConnection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
        retryability: Retryability,
        criteria: &SelectionCriteria,
    ) -> Result<T::O> {
        let cmd = self.build_command(op, connection, session, txn_number, criteria)?;

        let connection_info = connection.info();
        let request_id = next_request_id();
        let sensitive = is_sensitive(&cmd);
        let command_name = cmd.name.clone();
        let is_sharded = connection.stream_description()?.initial_server_type == ServerType::Mongos;

        self.emit_command_event(|| {
            CommandEvent::Started(CommandStartedEvent {
                command: if sensitive {
                    Document::new()
                } else {
                    cmd.to_monitoring_document()
                },
                db: cmd.target_db.clone(),
                command_name: command_name.clone(),
                request_id,
                connection: connection_info.clone(),
            })
        });

        let started = Instant::now();
        let sent = match self.command_timeout(op) {
            None => connection.send_command(cmd, request_id).await,
            Some(limit) => {
                let sent = runtime::timeout(limit, connection.send_command(cmd, request_id)).await;
                sent.unwrap_or_else(|timed_out| {
                    // A late reply would desynchronize the stream.
                    connection.error = Some(timed_out.clone());
                    Err(timed_out)
                })
            }
        };
        let outcome = match sent {
            Ok(response) => self
                .absorb_reply(session, is_sharded, &response)
                .await
                .map(|()| response),
            Err(error) => Err(error),
        };
        let duration = started.elapsed();

        let response = match outcome {
            Ok(response) => response,
            Err(mut error) => {
                self.emit_command_event(|| {
                    CommandEvent::Failed(CommandFailedEvent {
                        duration,
                        command_name: command_name.clone(),
                        failure: error.clone(),
                        request_id,
                        connection: connection_info.clone(),
                    })
                });
                if error.is_network_error() {
                    if let Some(session) = session.as_deref_mut() {
                        session.mark_dirty();
                    }
                }
                let description = connection.stream_description()?;
                error.add_labels_and_update_pin(Some(description), session, Some(retryability));
                return op.handle_error(error);
            }
        };

        self.emit_command_event(|| {
            CommandEvent::Succeeded(CommandSucceededEvent {
                duration,
                reply: if sensitive {
                    Document::new()
                } else {
                    response.body().clone()
                },
                command_name: command_name.clone(),
                request_id,
                connection: connection_info.clone(),
            })
        });

        let description = connection.stream_description()?;
        op.handle_response(response, description).map_err(|mut error| {
            error.add_labels_and_update_pin(Some(description), session, Some(retryability));
            error
        })
    }

    fn build_command<T: Operation>(
        &self,
        op: &mut T,
        connection: &PooledConnection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
        criteria: &SelectionCriteria,
    ) -> Result<Command> {
        let description = connection.stream_description()?;
        let is_sharded = description.initial_server_type == ServerType::Mongos;
        let supports_read_concern = op.supports_read_concern(description);

        let mut cmd = op.build(description)?;
        if session.as_ref().is_some_and(|s| s.in_transaction()) {
            // Only the first statement of a transaction carries a read concern.
            cmd.clear_read_concern();
        }
        self.inner
            .topology
            .update_command_with_read_pref(connection.address(), &mut cmd, Some(criteria));

        let uses_session = op.supports_sessions() && op.is_acknowledged();
        match session.as_deref_mut() {
            Some(session) if uses_session => {
                cmd.set_session(session);
                if let Some(txn_number) = txn_number {
                    cmd.set_txn_number(txn_number);
                }
                if supports_read_concern
                    && session.causal_consistency()
                    && matches!(
                        session.transaction.state,
                        TransactionState::None | TransactionState::Starting
                    )
                {
                    cmd.set_after_cluster_time(session);
                }
                apply_transaction_fields(&mut cmd, session, is_sharded, connection);
                session.update_last_use();
            }
            Some(session) if !session.is_implicit() => {
                let message = if op.supports_sessions() {
                    "sessions cannot be used with an unacknowledged write concern".to_owned()
                } else {
                    format!("{} does not support sessions", cmd.name)
                };
                return Err(Error::invalid_argument(message));
            }
            _ => {}
        }

        // Gossip whichever cluster time is newest.
        let session_time = session.as_deref().and_then(ClientSession::cluster_time);
        let client_time = self.inner.topology.cluster_time();
        if let Some(cluster_time) = session_time.max(client_time.as_ref()) {
            cmd.set_cluster_time(cluster_time);
        }

        Ok(cmd)
    }

    /// Records the cluster time, operation time and recovery token a reply carries, then turns
    /// an `ok: 0` reply into an error.
    async fn absorb_reply(
        &self,
        session: &mut Option<&mut ClientSession>,
        is_sharded: bool,
        response: &RawCommandResponse,
    ) -> Result<()> {
        if let Some(cluster_time) = response.cluster_time() {
            self.inner
                .topology
                .advance_cluster_time(cluster_time.clone())
                .await;
            if let Some(session) = session.as_deref_mut() {
                session.advance_cluster_time(&cluster_time);
            }
        }

        let Some(session) = session.as_deref_mut() else {
            return response.validate();
        };
        if let Ok(operation_time) = response.body().get_timestamp("operationTime") {
            session.advance_operation_time(operation_time);
        }
        response.validate()?;
        if is_sharded && session.in_transaction() {
            session.transaction.recovery_token =
                response.body().get_document("recoveryToken").ok().cloned();
        }
        Ok(())
    }

    /// The client-side deadline for a reply: `maxTimeMS` plus `wtimeout` plus a grace period,
    /// capped by `socketTimeoutMS`. `None` waits forever.
    fn command_timeout<T: Operation>(&self, op: &T) -> Option<Duration> {
        let max_time = op.max_time();
        let w_timeout = op.write_concern().and_then(|wc| wc.w_timeout);
        let server_limit = (max_time.is_some() || w_timeout.is_some()).then(|| {
            max_time.unwrap_or_default() + w_timeout.unwrap_or_default() + CLIENT_TIMEOUT_GRACE
        });
        let socket_timeout = self
            .inner
            .options
            .socket_timeout
            .filter(|timeout| !timeout.is_zero());
        match (server_limit, socket_timeout) {
            (Some(limit), Some(socket)) => Some(limit.min(socket)),
            (limit, socket) => limit.or(socket),
        }
    }

    /// Waits until the topology has seen a server that can answer questions about the
    /// deployment's capabilities.
    async fn discover_data_bearing_server(&self, reason: &str) -> Result<()> {
        let single = self.inner.topology.topology_type() == TopologyType::Single;
        let criteria = SelectionCriteria::Predicate(Arc::new(move |server| {
            let server_type = server.server_type();
            server_type.is_data_bearing() || (single && server_type.is_available())
        }));
        self.inner.topology.select_server(&criteria, reason).await?;
        Ok(())
    }

    /// Whether the deployment supports sessions, discovering a data-bearing server first when
    /// that is not known yet.
    pub(crate) async fn session_support_status(&self) -> Result<SessionSupportStatus> {
        let status = self.inner.topology.session_support_status();
        if status != SessionSupportStatus::Undetermined {
            return Ok(status);
        }
        self.discover_data_bearing_server("check session support")
            .await?;
        Ok(self.inner.topology.session_support_status())
    }

    /// Whether the deployment supports transactions, discovering a data-bearing server first
    /// when that is not known yet.
    pub(crate) async fn transaction_support_status(&self) -> Result<TransactionSupportStatus> {
        let status = self.inner.topology.transaction_support_status();
        if status != TransactionSupportStatus::Undetermined {
            return Ok(status);
        }
        self.discover_data_bearing_server("check transaction support")
            .await?;
        Ok(self.inner.topology.transaction_support_status())
    }

    fn retryability_with_options(&self, retryability: Retryability) -> Retryability {
        let options = &self.inner.options;
        let retry_reads = options.retry_reads != Some(false);
        let retry_writes = options.retry_writes != Some(false);
        retryability.with_options(retry_reads, retry_writes)
    }

    /// How `op` may be retried on a server described by `description`.
    fn get_retryability<T: Operation>(
        &self,
        op: &T,
        session: Option<&ClientSession>,
        description: &StreamDescription,
    ) -> Retryability {
        // Commits and aborts are retried whatever retryWrites says.
        if [CommitTransaction::NAME, AbortTransaction::NAME].contains(&op.name()) {
            return Retryability::Write;
        }
        if session.is_some_and(ClientSession::in_transaction) {
            return Retryability::None;
        }
        match self.retryability_with_options(op.retryability()) {
            Retryability::Write if !description.supports_retryable_writes() => Retryability::None,
            retryability => retryability,
        }
    }
}

/// Applies the transaction fields matching the session's transaction state, advancing a starting
/// transaction to in progress.
fn apply_transaction_fields(
    cmd: &mut Command,
    session: &mut ClientSession,
    is_sharded: bool,
    connection: &PooledConnection,
) {
    match session.transaction.state {
        TransactionState::None => {}
        TransactionState::Starting => {
            cmd.set_start_transaction();
            cmd.set_autocommit();
            let read_concern = session
                .transaction
                .options
                .as_ref()
                .and_then(|options| options.read_concern.clone());
            if let Some(read_concern) = read_concern {
                cmd.set_read_concern(read_concern.into());
            }
            if session.causal_consistency() {
                cmd.set_after_cluster_time(session);
            }
            if is_sharded {
                session.pin_mongos(connection.address().clone());
            }
            session.transaction.state = TransactionState::InProgress;
        }
        TransactionState::InProgress => cmd.set_autocommit(),
        TransactionState::Committed { .. } | TransactionState::Aborted => {
            cmd.set_autocommit();
            if is_sharded {
                if let Some(token) = &session.transaction.recovery_token {
                    cmd.set_recovery_token(token);
                }
            }
        }
    }
}

/// Replaces the server's confusing reply to `txnNumber` on storage engines without
/// document-level locking.
fn explain_unsupported_retryable_writes(mut error: Error) -> Error {
    if let ErrorKind::Command(command_error) = error.kind.as_mut() {
        if command_error.code == 20 && command_error.message.starts_with("Transaction numbers") {
            command_error.message = "this deployment does not support retryable writes; add \
                                     retryWrites=false to the connection string"
                .to_owned();
        }
    }
    error
}

impl Error {
    /// Adds the labels this error earns given the session's transaction state, and unpins the
    /// session once the transaction's outcome is in doubt.
    ///
    /// Network and server selection errors inside a transaction become transient. Errors of
    /// commits, aborts and retryable writes are labelled retryable when the server would have
    /// done so itself.
    fn add_labels_and_update_pin(
        &mut self,
        description: Option<&StreamDescription>,
        session: &mut Option<&mut ClientSession>,
        retryability: Option<Retryability>,
    ) {
        let state = session
            .as_deref()
            .map_or(TransactionState::None, |s| s.transaction.state.clone());

        if let TransactionState::Starting | TransactionState::InProgress = state {
            let selection_failed = matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. });
            if self.is_network_error() || selection_failed {
                self.add_label(TRANSIENT_TRANSACTION_ERROR);
            }
        } else {
            let wants_retry_label = match state {
                TransactionState::None => retryability == Some(Retryability::Write),
                _ => true,
            };
            let server_type = description.map(|d| d.initial_server_type);
            let needs_retry_label = description
                .and_then(|d| d.max_wire_version)
                .is_some_and(|wire| self.should_add_retryable_write_label(wire, server_type));
            if wants_retry_label && needs_retry_label {
                self.add_label(RETRYABLE_WRITE_ERROR);
            }
            if matches!(state, TransactionState::Committed { .. })
                && self.should_add_unknown_transaction_commit_result_label()
            {
                self.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
            }
        }

        let outcome_in_doubt = self.contains_label(TRANSIENT_TRANSACTION_ERROR)
            || self.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
        if outcome_in_doubt {
            if let Some(session) = session.as_deref_mut() {
                session.unpin();
            }
        }
    }
}
