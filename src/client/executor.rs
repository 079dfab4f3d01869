use std::time::Instant;

use super::{session::ClientSession, Client};
use crate::{
    cmap::PooledConnection,
    error::{Error, ErrorKind, Result, RETRYABLE_WRITE_ERROR},
    event::{
        command::{CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent},
        retry::{RetryReadEvent, RetryWriteEvent},
    },
    operation::{Operation, Retryability},
    options::ServerAddress,
    sdam::{HandshakePhase, DEFAULT_SERVER_SELECTION_TIMEOUT},
    selection_criteria::SelectionCriteria,
};

/// State tracked across the two attempts of a retried operation: the error that triggered the
/// retry and the transaction number the replay must reuse.
#[derive(Debug)]
struct ExecutionRetry {
    prior_txn_number: Option<i64>,
    first_error: Error,
}

trait RetryHelper {
    fn first_error(&mut self) -> Result<()>;
}

impl RetryHelper for Option<ExecutionRetry> {
    /// When a retry attempt fails before reaching the server, the error from the first attempt
    /// is the one worth surfacing.
    fn first_error(&mut self) -> Result<()> {
        match self.take() {
            Some(r) => {
                let mut error = r.first_error;
                error.retry_attempted = true;
                Err(error)
            }
            None => Ok(()),
        }
    }
}

impl Client {
    /// Selects a server per the operation's criteria and executes the operation on a pooled
    /// connection, retrying once on transient failures when the operation, the options, and the
    /// deployment allow it. An implicit session is attached when the caller did not provide one.
    pub(crate) async fn execute_operation<T: Operation>(
        &self,
        op: &mut T,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<T::O> {
        if self.is_shutdown() {
            return Err(ErrorKind::Shutdown.into());
        }
        self.execute_operation_inner(op, session.into()).await
    }

    pub(crate) async fn execute_operation_inner<T: Operation>(
        &self,
        op: &mut T,
        mut session: Option<&mut ClientSession>,
    ) -> Result<T::O> {
        let mut implicit_session: Option<ClientSession> = None;
        let mut retry: Option<ExecutionRetry> = None;

        loop {
            let selection_criteria = op
                .selection_criteria()
                .cloned()
                .unwrap_or_else(|| self.default_selection_criteria());

            let selection_timeout = self
                .options()
                .server_selection_timeout
                .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);

            let server = match self
                .topology()
                .select_server(&selection_criteria, op.name(), selection_timeout)
                .await
            {
                Ok(server) => server,
                Err(err) => {
                    retry.first_error()?;
                    return Err(err);
                }
            };
            let server_address = server.address.clone();

            let mut conn = match server.pool.check_out().await {
                Ok(conn) => conn,
                Err(err) => {
                    // A failed establishment is an application error against the server from
                    // the SDAM perspective.
                    self.topology()
                        .handle_application_error(
                            server_address.clone(),
                            err.clone(),
                            HandshakePhase::PreHello {
                                generation: server.pool.generation(),
                            },
                        )
                        .await;

                    retry.first_error()?;

                    // A cleared pool failed some other operation, not this one; trying again is
                    // always safe. Other checkout failures retry only when the operation can.
                    if err.is_pool_cleared()
                        || (err.is_retryable() && op.retryability() != Retryability::None)
                    {
                        self.emit_retry_event(op, &err, &server_address, None);
                        retry = Some(ExecutionRetry {
                            prior_txn_number: None,
                            first_error: err,
                        });
                        continue;
                    }
                    return Err(err);
                }
            };

            if session.is_none()
                && op.supports_sessions()
                && conn.stream_description()?.supports_sessions()
            {
                implicit_session = Some(self.start_implicit_session().await);
                session = implicit_session.as_mut();
            }

            let retryability = self.get_retryability(&conn, op, &session)?;
            if retryability == Retryability::None {
                retry.first_error()?;
            }

            let txn_number = retry
                .as_ref()
                .and_then(|r| r.prior_txn_number)
                .or_else(|| {
                    if retryability == Retryability::Write {
                        session.as_mut().map(|s| s.get_and_increment_txn_number())
                    } else {
                        None
                    }
                });

            match self
                .execute_operation_on_connection(op, &mut conn, &mut session, txn_number)
                .await
            {
                Ok(output) => return Ok(output),
                Err(mut err) => {
                    err.wire_version = conn.stream_description()?.max_wire_version;
                    err.server_address = Some(server_address.clone());

                    if retryability == Retryability::Write
                        && err.should_add_retryable_write_label(
                            err.wire_version.unwrap_or(0),
                        )
                    {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }

                    // A session whose last use may not have reached the server cannot be
                    // safely re-pooled.
                    if err.is_network_error() {
                        if let Some(ref mut session) = session {
                            session.mark_dirty();
                        }
                    }

                    self.topology()
                        .handle_application_error(
                            server_address.clone(),
                            err.clone(),
                            HandshakePhase::after_completion(&conn),
                        )
                        .await;
                    // Release the connection (and the selected server) before the retry
                    // selects again.
                    drop(conn);
                    drop(server);

                    if let Some(r) = retry {
                        // Only one retry per operation: surface whichever error is more
                        // informative.
                        err.retry_attempted = true;
                        if err.is_server_error()
                            || err.is_read_retryable()
                            || err.is_write_retryable()
                        {
                            return Err(err);
                        } else {
                            let mut first_error = r.first_error;
                            first_error.retry_attempted = true;
                            return Err(first_error);
                        }
                    } else if retryability == Retryability::Read && err.is_read_retryable()
                        || retryability == Retryability::Write && err.is_write_retryable()
                    {
                        self.emit_retry_event(op, &err, &server_address, txn_number);
                        retry = Some(ExecutionRetry {
                            prior_txn_number: txn_number,
                            first_error: err,
                        });
                        continue;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Executes the operation on an already checked-out connection, wiring up sessions, read
    /// preference, and command monitoring.
    async fn execute_operation_on_connection<T: Operation>(
        &self,
        op: &mut T,
        conn: &mut PooledConnection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<T::O> {
        let stream_description = conn.stream_description()?.clone();
        let mut cmd = op.build(&stream_description)?;

        // Reads against a directly-connected replica set member need an explicit read
        // preference; reads routed through mongos carry the caller's non-default preference.
        let topology_state = self.topology().latest_state();
        if let Some(read_pref) = topology_state.description.read_pref_for_single(
            stream_description.initial_server_type,
            op.selection_criteria(),
        ) {
            cmd.set_read_preference(read_pref);
        } else if stream_description.initial_server_type == crate::sdam::ServerType::Mongos {
            if let Some(SelectionCriteria::ReadPreference(ref read_pref)) = op.selection_criteria()
            {
                if !matches!(read_pref, crate::selection_criteria::ReadPreference::Primary) {
                    cmd.set_read_preference(read_pref.clone());
                }
            }
        }

        if let Some(ref mut session) = session {
            if op.supports_sessions() {
                cmd.set_session_id(session.id());
                if let Some(txn_number) = txn_number {
                    cmd.set_txn_number(txn_number);
                }
                session.update_last_use();
            }
        }

        let should_redact = cmd.should_redact();
        let command_name = cmd.name.clone();
        let target_db = cmd.target_db.clone();
        let address = conn.address().clone();

        // The request id is allocated here rather than inside the connection so command events
        // can reference it.
        let request_id = conn.allocate_request_id();

        self.emit_command_event(|handler| {
            let command_body = if should_redact {
                bson::doc! {}
            } else {
                cmd.body.clone()
            };
            handler.handle_command_started_event(CommandStartedEvent {
                command: command_body,
                db: target_db.clone(),
                command_name: command_name.clone(),
                request_id,
                connection: address.clone(),
            });
        });

        let start = Instant::now();
        let response_result = conn.send_command(cmd, request_id).await;
        let duration = start.elapsed();

        let emit_failed = |error: &Error| {
            self.emit_command_event(|handler| {
                handler.handle_command_failed_event(CommandFailedEvent {
                    duration,
                    command_name: command_name.clone(),
                    failure: error.clone(),
                    request_id,
                    connection: address.clone(),
                });
            });
        };

        match response_result {
            Ok(response) => {
                // Replies to sensitive commands are fully redacted.
                let reply = if should_redact {
                    bson::doc! {}
                } else {
                    response.raw_body().clone()
                };

                match op.handle_response(response) {
                    Ok(output) => {
                        self.emit_command_event(|handler| {
                            handler.handle_command_succeeded_event(CommandSucceededEvent {
                                duration,
                                reply,
                                command_name: command_name.clone(),
                                request_id,
                                connection: address.clone(),
                            });
                        });
                        Ok(output)
                    }
                    Err(mut error) => {
                        if should_redact {
                            error.redact();
                        }
                        emit_failed(&error);
                        Err(error)
                    }
                }
            }
            Err(mut error) => {
                if should_redact {
                    error.redact();
                }
                emit_failed(&error);
                Err(error)
            }
        }
    }

    /// The effective retryability of an operation on a given connection: the operation must
    /// support it, the client options must not disable it, and retryable writes additionally
    /// require a session-supporting non-standalone server.
    fn get_retryability<T: Operation>(
        &self,
        conn: &PooledConnection,
        op: &T,
        session: &Option<&mut ClientSession>,
    ) -> Result<Retryability> {
        match op.retryability() {
            Retryability::Read if self.options().retry_reads != Some(false) => {
                Ok(Retryability::Read)
            }
            Retryability::Write => {
                if self.options().retry_writes != Some(false)
                    && session.is_some()
                    && conn.stream_description()?.supports_retryable_writes()
                {
                    Ok(Retryability::Write)
                } else {
                    Ok(Retryability::None)
                }
            }
            _ => Ok(Retryability::None),
        }
    }

    fn emit_retry_event<T: Operation>(
        &self,
        op: &T,
        error: &Error,
        address: &ServerAddress,
        txn_number: Option<i64>,
    ) {
        let handler = match self.options().retry_event_handler {
            Some(ref handler) => handler.clone(),
            None => return,
        };

        match op.retryability() {
            Retryability::Read => handler.handle_retry_read_event(RetryReadEvent {
                command_name: op.name().to_string(),
                cause: error.clone(),
                first_address: address.clone(),
            }),
            Retryability::Write => handler.handle_retry_write_event(RetryWriteEvent {
                command_name: op.name().to_string(),
                cause: error.clone(),
                first_address: address.clone(),
                txn_number,
            }),
            Retryability::None => {}
        }
    }

    fn emit_command_event<F>(&self, emit: F)
    where
        F: FnOnce(&dyn crate::event::command::CommandEventHandler),
    {
        if let Some(ref handler) = self.options().command_event_handler {
            emit(handler.as_ref());
        }
    }
}
