use std::{borrow::Cow, sync::Arc};

use tracing::Level;

use super::status::SuspendedResourcesHolder;
use crate::{
    synchronization, CompletionStatus, Error, ErrorKind, Isolation, Propagation, Synchronization,
    SynchronizationMode, TransactionBackend, TransactionContext, TransactionDefinition,
    TransactionStatus, TIMEOUT_DEFAULT,
};

/// Settings for a [`TransactionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Config {
    default_timeout: i32,
    nested_transaction_allowed: bool,
    validate_existing_transaction: bool,
    global_rollback_on_participation_failure: bool,
    fail_early_on_global_rollback_only: bool,
    rollback_on_commit_failure: bool,
    synchronization: SynchronizationMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: TIMEOUT_DEFAULT,
            nested_transaction_allowed: false,
            validate_existing_transaction: false,
            global_rollback_on_participation_failure: true,
            fail_early_on_global_rollback_only: false,
            rollback_on_commit_failure: false,
            synchronization: SynchronizationMode::Always,
        }
    }
}

impl Config {
    /// Sets the timeout, in seconds, applied to new transactions whose
    /// definition uses [`TIMEOUT_DEFAULT`].
    pub const fn default_timeout(mut self, seconds: i32) -> Self {
        self.default_timeout = seconds;
        self
    }

    /// Allows [`Propagation::Nested`] to run inside an existing transaction.
    /// Disallowed by default.
    pub const fn nested_transaction_allowed(mut self, allowed: bool) -> Self {
        self.nested_transaction_allowed = allowed;
        self
    }

    /// Validates that participating definitions match the isolation level
    /// and read-only flag of the existing transaction.
    pub const fn validate_existing_transaction(mut self, validate: bool) -> Self {
        self.validate_existing_transaction = validate;
        self
    }

    /// Marks the existing transaction rollback-only when a participating
    /// scope fails. Enabled by default.
    pub const fn global_rollback_on_participation_failure(mut self, enabled: bool) -> Self {
        self.global_rollback_on_participation_failure = enabled;
        self
    }

    /// Raises [`ErrorKind::UnexpectedRollback`] as soon as a participating
    /// scope notices the transaction was marked rollback-only, instead of
    /// only at the outermost commit.
    pub const fn fail_early_on_global_rollback_only(mut self, enabled: bool) -> Self {
        self.fail_early_on_global_rollback_only = enabled;
        self
    }

    /// Rolls the transaction back when the backend commit fails.
    pub const fn rollback_on_commit_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_commit_failure = enabled;
        self
    }

    /// Sets when synchronization is activated.
    pub const fn synchronization(mut self, mode: SynchronizationMode) -> Self {
        self.synchronization = mode;
        self
    }

    /// Returns the configured default timeout.
    #[must_use]
    pub const fn configured_default_timeout(&self) -> i32 {
        self.default_timeout
    }

    /// Returns the configured synchronization mode.
    #[must_use]
    pub const fn synchronization_mode(&self) -> SynchronizationMode {
        self.synchronization
    }

    /// Returns a manager driving `backend` with these settings.
    pub fn build<B: TransactionBackend>(self, backend: B) -> Result<TransactionManager<B>, Error> {
        TransactionManager::with_config(backend, self)
    }
}

/// Drives a [`TransactionBackend`] through the propagation rules of each
/// [`TransactionDefinition`].
///
/// The manager only holds configuration. All per-scope state lives in the
/// [`TransactionContext`] and the [`TransactionStatus`] values it returns.
#[derive(Debug)]
pub struct TransactionManager<B: TransactionBackend> {
    backend: B,
    config: Config,
}

impl<B: TransactionBackend> TransactionManager<B> {
    /// Returns a manager using the default [`Config`].
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: Config::default(),
        }
    }

    /// Returns a manager using `config`.
    ///
    /// Fails with [`ErrorKind::InvalidTimeout`] if the default timeout is
    /// below [`TIMEOUT_DEFAULT`].
    pub fn with_config(backend: B, config: Config) -> Result<Self, Error> {
        if config.default_timeout < TIMEOUT_DEFAULT {
            return Err(Error::from(ErrorKind::InvalidTimeout(config.default_timeout)));
        }
        Ok(Self { backend, config })
    }

    /// Returns the backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the configuration.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a status for a transaction scope described by `definition`,
    /// starting, joining, suspending or rejecting a transaction as its
    /// propagation behavior requires.
    #[tracing::instrument(skip_all, fields(definition = %definition))]
    pub fn get_transaction(
        &self,
        context: &mut TransactionContext,
        definition: &TransactionDefinition,
    ) -> Result<TransactionStatus<B>, Error> {
        let transaction = self.backend.get_transaction(context)?;
        let debug = tracing::enabled!(Level::DEBUG);

        if self.backend.is_existing_transaction(&transaction)? {
            return self.handle_existing_transaction(context, definition, transaction, debug);
        }

        definition.validate_timeout()?;

        match definition.propagation {
            Propagation::Mandatory => Err(Error::illegal_state(
                "no existing transaction found for transaction marked with propagation 'mandatory'",
            )),
            propagation if propagation.creates_transaction() => {
                let suspended = self.suspend(context, None)?;
                tracing::debug!(name = ?definition.name(), "creating new transaction");
                self.start_transaction(context, definition, transaction, false, debug, suspended)
            }
            _ => {
                if definition.isolation != Isolation::Default {
                    tracing::warn!(
                        "custom isolation level specified but no actual transaction initiated: isolation level will effectively be ignored"
                    );
                }
                let new_synchronization = self.config.synchronization == SynchronizationMode::Always;
                self.prepare_transaction_status(
                    context,
                    definition,
                    None,
                    true,
                    new_synchronization,
                    debug,
                    None,
                )
            }
        }
    }

    /// Commits the scope described by `status`.
    ///
    /// A scope marked rollback-only is rolled back instead. If the
    /// underlying transaction was marked rollback-only by another
    /// participant, it is rolled back and [`ErrorKind::UnexpectedRollback`]
    /// is returned.
    #[tracing::instrument(skip_all, fields(new_transaction = status.is_new_transaction()))]
    pub fn commit(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
    ) -> Result<(), Error> {
        if status.is_completed() {
            return Err(Error::illegal_state(
                "transaction is already completed: do not call commit or rollback more than once per transaction",
            ));
        }

        if status.is_local_rollback_only() {
            tracing::debug!("transactional code has requested rollback");
            return self.process_rollback(context, status, false);
        }

        if !self.backend.should_commit_on_global_rollback_only() && status.is_global_rollback_only()
        {
            tracing::debug!(
                "global transaction is marked as rollback-only but transactional code requested commit"
            );
            return self.process_rollback(context, status, true);
        }

        self.process_commit(context, status)
    }

    /// Rolls back the scope described by `status`.
    #[tracing::instrument(skip_all, fields(new_transaction = status.is_new_transaction()))]
    pub fn rollback(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
    ) -> Result<(), Error> {
        if status.is_completed() {
            return Err(Error::illegal_state(
                "transaction is already completed: do not call commit or rollback more than once per transaction",
            ));
        }
        self.process_rollback(context, status, false)
    }

    fn handle_existing_transaction(
        &self,
        context: &mut TransactionContext,
        definition: &TransactionDefinition,
        mut transaction: B::Transaction,
        debug: bool,
    ) -> Result<TransactionStatus<B>, Error> {
        match definition.propagation {
            Propagation::Never => Err(Error::illegal_state(
                "existing transaction found for transaction marked with propagation 'never'",
            )),
            Propagation::NotSupported => {
                tracing::debug!("suspending current transaction");
                let suspended = self.suspend(context, Some(&mut transaction))?;
                let new_synchronization = self.config.synchronization == SynchronizationMode::Always;
                self.prepare_transaction_status(
                    context,
                    definition,
                    None,
                    false,
                    new_synchronization,
                    debug,
                    suspended,
                )
            }
            Propagation::RequiresNew => {
                tracing::debug!(
                    name = ?definition.name(),
                    "suspending current transaction, creating new transaction"
                );
                let suspended = self.suspend(context, Some(&mut transaction))?;
                self.start_transaction(context, definition, transaction, true, debug, suspended)
            }
            Propagation::Nested => {
                if !self.config.nested_transaction_allowed {
                    return Err(Error::nested_not_supported(
                        "transaction manager does not allow nested transactions: enable nested_transaction_allowed",
                    ));
                }
                tracing::debug!(name = ?definition.name(), "creating nested transaction");
                if self.backend.use_savepoint_for_nested_transaction() {
                    let mut status = self.prepare_transaction_status(
                        context,
                        definition,
                        Some(transaction),
                        false,
                        false,
                        debug,
                        None,
                    )?;
                    status.create_and_hold_savepoint()?;
                    Ok(status)
                } else {
                    self.start_transaction(context, definition, transaction, true, debug, None)
                }
            }
            Propagation::Required | Propagation::Supports | Propagation::Mandatory => {
                tracing::debug!("participating in existing transaction");
                if self.config.validate_existing_transaction {
                    Self::validate_participation(context, definition)?;
                }
                let new_synchronization = self.config.synchronization != SynchronizationMode::Never;
                self.prepare_transaction_status(
                    context,
                    definition,
                    Some(transaction),
                    false,
                    new_synchronization,
                    debug,
                    None,
                )
            }
        }
    }

    fn validate_participation(
        context: &TransactionContext,
        definition: &TransactionDefinition,
    ) -> Result<(), Error> {
        if definition.isolation != Isolation::Default {
            let current = context.current_transaction_isolation();
            if current != Some(definition.isolation) {
                return Err(Error::illegal_state(format!(
                    "participating transaction with definition [{definition}] specifies isolation level which is incompatible with existing transaction: {}",
                    current.map_or("(unknown)", Isolation::name)
                )));
            }
        }
        if !definition.read_only && context.is_current_transaction_read_only() {
            return Err(Error::illegal_state(format!(
                "participating transaction with definition [{definition}] is not marked as read-only but existing transaction is"
            )));
        }
        Ok(())
    }

    /// Begins a new backend transaction. If beginning fails, the suspended
    /// scope is resumed before the error is returned.
    fn start_transaction(
        &self,
        context: &mut TransactionContext,
        definition: &TransactionDefinition,
        mut transaction: B::Transaction,
        existing: bool,
        debug: bool,
        suspended: Option<SuspendedResourcesHolder<B::Suspended>>,
    ) -> Result<TransactionStatus<B>, Error> {
        let effective = self.effective_definition(definition);
        if let Err(begin_error) = self.backend.begin(context, &mut transaction, &effective) {
            let resumed = if existing {
                self.resume(context, Some(&mut transaction), suspended)
            } else {
                self.resume(context, None, suspended)
            };
            if let Err(resume_error) = resumed {
                tracing::error!(error = %begin_error, "begin error overridden by resume error");
                return Err(resume_error);
            }
            return Err(begin_error);
        }

        let new_synchronization = self.config.synchronization != SynchronizationMode::Never;
        let status = self.new_transaction_status(
            context,
            Some(transaction),
            true,
            new_synchronization,
            definition.read_only,
            debug,
            suspended,
        );
        Self::prepare_synchronization(context, &status, definition)?;
        Ok(status)
    }

    fn effective_definition<'a>(
        &self,
        definition: &'a TransactionDefinition,
    ) -> Cow<'a, TransactionDefinition> {
        if definition.timeout == TIMEOUT_DEFAULT && self.config.default_timeout != TIMEOUT_DEFAULT {
            Cow::Owned(
                definition
                    .clone()
                    .with_timeout(self.config.default_timeout),
            )
        } else {
            Cow::Borrowed(definition)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare_transaction_status(
        &self,
        context: &mut TransactionContext,
        definition: &TransactionDefinition,
        transaction: Option<B::Transaction>,
        new_transaction: bool,
        new_synchronization: bool,
        debug: bool,
        suspended: Option<SuspendedResourcesHolder<B::Suspended>>,
    ) -> Result<TransactionStatus<B>, Error> {
        let status = self.new_transaction_status(
            context,
            transaction,
            new_transaction,
            new_synchronization,
            definition.read_only,
            debug,
            suspended,
        );
        Self::prepare_synchronization(context, &status, definition)?;
        Ok(status)
    }

    #[allow(clippy::too_many_arguments, clippy::unused_self)]
    fn new_transaction_status(
        &self,
        context: &TransactionContext,
        transaction: Option<B::Transaction>,
        new_transaction: bool,
        new_synchronization: bool,
        read_only: bool,
        debug: bool,
        suspended: Option<SuspendedResourcesHolder<B::Suspended>>,
    ) -> TransactionStatus<B> {
        let new_synchronization = new_synchronization && !context.is_synchronization_active();
        TransactionStatus::new(
            transaction,
            new_transaction,
            new_synchronization,
            read_only,
            debug,
            suspended,
        )
    }

    fn prepare_synchronization(
        context: &mut TransactionContext,
        status: &TransactionStatus<B>,
        definition: &TransactionDefinition,
    ) -> Result<(), Error> {
        if status.is_new_synchronization() {
            context.set_actual_transaction_active(status.has_transaction());
            context.set_current_transaction_isolation(
                (definition.isolation != Isolation::Default).then_some(definition.isolation),
            );
            context.set_current_transaction_read_only(definition.read_only);
            context.set_current_transaction_name(definition.name().map(String::from));
            context.init_synchronization()?;
        }
        Ok(())
    }

    /// Suspends the current scope: its synchronizations, its backend
    /// resources and the exposed characteristics.
    fn suspend(
        &self,
        context: &mut TransactionContext,
        transaction: Option<&mut B::Transaction>,
    ) -> Result<Option<SuspendedResourcesHolder<B::Suspended>>, Error> {
        if context.is_synchronization_active() {
            let synchronizations = Self::suspend_synchronizations(context)?;
            let suspended_resources = match transaction {
                Some(transaction) => match self.backend.suspend(context, transaction) {
                    Ok(resources) => Some(resources),
                    Err(err) => {
                        if let Err(resume_error) =
                            Self::resume_synchronizations(context, synchronizations)
                        {
                            tracing::error!(
                                error = %resume_error,
                                "failed to resume synchronizations after suspend failure"
                            );
                        }
                        return Err(err);
                    }
                },
                None => None,
            };

            let name = context.current_transaction_name().map(String::from);
            context.set_current_transaction_name(None);
            let read_only = context.is_current_transaction_read_only();
            context.set_current_transaction_read_only(false);
            let isolation = context.current_transaction_isolation();
            context.set_current_transaction_isolation(None);
            let was_active = context.is_actual_transaction_active();
            context.set_actual_transaction_active(false);

            Ok(Some(SuspendedResourcesHolder {
                suspended_resources,
                synchronizations: Some(synchronizations),
                name,
                read_only,
                isolation,
                was_active,
            }))
        } else if let Some(transaction) = transaction {
            let suspended_resources = self.backend.suspend(context, transaction)?;
            Ok(Some(SuspendedResourcesHolder {
                suspended_resources: Some(suspended_resources),
                synchronizations: None,
                name: None,
                read_only: false,
                isolation: None,
                was_active: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Restores a scope returned by [`suspend()`](Self::suspend).
    fn resume(
        &self,
        context: &mut TransactionContext,
        transaction: Option<&mut B::Transaction>,
        suspended: Option<SuspendedResourcesHolder<B::Suspended>>,
    ) -> Result<(), Error> {
        let Some(suspended) = suspended else {
            return Ok(());
        };
        if let Some(resources) = suspended.suspended_resources {
            self.backend.resume(context, transaction, resources)?;
        }
        if let Some(synchronizations) = suspended.synchronizations {
            context.set_actual_transaction_active(suspended.was_active);
            context.set_current_transaction_isolation(suspended.isolation);
            context.set_current_transaction_read_only(suspended.read_only);
            context.set_current_transaction_name(suspended.name);
            Self::resume_synchronizations(context, synchronizations)?;
        }
        Ok(())
    }

    fn suspend_synchronizations(
        context: &mut TransactionContext,
    ) -> Result<Vec<Arc<dyn Synchronization>>, Error> {
        let synchronizations = context.synchronizations()?;
        for (index, synchronization) in synchronizations.iter().enumerate() {
            if let Err(err) = synchronization.suspend(context) {
                for suspended in &synchronizations[..index] {
                    if let Err(resume_error) = suspended.resume(context) {
                        tracing::error!(error = %resume_error, "failed to resume synchronization");
                    }
                }
                return Err(err);
            }
        }
        context.clear_synchronization()?;
        Ok(synchronizations)
    }

    fn resume_synchronizations(
        context: &mut TransactionContext,
        synchronizations: Vec<Arc<dyn Synchronization>>,
    ) -> Result<(), Error> {
        context.init_synchronization()?;
        let mut result = Ok(());
        for synchronization in synchronizations {
            if let Err(err) = synchronization.resume(context) {
                tracing::error!(error = %err, "failed to resume synchronization");
                if result.is_ok() {
                    result = Err(err);
                }
            }
            context.register_synchronization(synchronization)?;
        }
        result
    }

    fn process_commit(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
    ) -> Result<(), Error> {
        let result = self.commit_or_roll_back(context, status);
        self.finish(context, status, result)
    }

    fn commit_or_roll_back(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
    ) -> Result<(), Error> {
        let failure = match self.prepare_commit(context, status) {
            Err(err) => Some((err, false)),
            Ok(()) => {
                Self::trigger_before_completion(context, status);
                self.complete_commit(context, status)
                    .err()
                    .map(|err| (err, true))
            }
        };

        if let Some((err, before_completion_invoked)) = failure {
            return Err(if matches!(err.kind, ErrorKind::UnexpectedRollback(_)) {
                self.trigger_after_completion(context, status, CompletionStatus::RolledBack);
                err
            } else if err.is_transaction_failure() {
                if self.config.rollback_on_commit_failure {
                    self.rollback_on_commit_error(context, status, err)
                } else {
                    self.trigger_after_completion(context, status, CompletionStatus::Unknown);
                    err
                }
            } else {
                if !before_completion_invoked {
                    Self::trigger_before_completion(context, status);
                }
                self.rollback_on_commit_error(context, status, err)
            });
        }

        let after_commit = Self::trigger_after_commit(context, status);
        self.trigger_after_completion(context, status, CompletionStatus::Committed);
        after_commit
    }

    fn prepare_commit(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
    ) -> Result<(), Error> {
        self.backend.prepare_for_commit(context, status)?;
        Self::trigger_before_commit(context, status)
    }

    fn complete_commit(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
    ) -> Result<(), Error> {
        let unexpected_rollback = if status.has_savepoint() {
            tracing::debug!("releasing transaction savepoint");
            let unexpected_rollback = status.is_global_rollback_only();
            status.release_held_savepoint()?;
            unexpected_rollback
        } else if status.is_new_transaction() {
            tracing::debug!("initiating transaction commit");
            let unexpected_rollback = status.is_global_rollback_only();
            self.backend.commit(context, status)?;
            unexpected_rollback
        } else {
            self.config.fail_early_on_global_rollback_only && status.is_global_rollback_only()
        };

        if unexpected_rollback {
            Err(Error::unexpected_rollback(
                "transaction silently rolled back because it has been marked as rollback-only",
            ))
        } else {
            Ok(())
        }
    }

    /// Rolls back after a failed commit, returning the error to report.
    fn rollback_on_commit_error(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
        error: Error,
    ) -> Error {
        let rolled_back = if status.is_new_transaction() {
            tracing::debug!("initiating transaction rollback after commit exception");
            self.backend.rollback(context, status)
        } else if status.has_transaction() && self.config.global_rollback_on_participation_failure {
            tracing::debug!("marking existing transaction as rollback-only after commit exception");
            self.backend.set_rollback_only(context, status)
        } else {
            Ok(())
        };

        match rolled_back {
            Ok(()) => {
                self.trigger_after_completion(context, status, CompletionStatus::RolledBack);
                error
            }
            Err(rollback_error) => {
                tracing::error!(error = %error, "commit exception overridden by rollback exception");
                self.trigger_after_completion(context, status, CompletionStatus::Unknown);
                rollback_error
            }
        }
    }

    fn process_rollback(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
        unexpected: bool,
    ) -> Result<(), Error> {
        let result = self.roll_back(context, status, unexpected);
        self.finish(context, status, result)
    }

    fn roll_back(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
        unexpected: bool,
    ) -> Result<(), Error> {
        let mut unexpected_rollback = unexpected;
        Self::trigger_before_completion(context, status);

        let rolled_back = if status.has_savepoint() {
            tracing::debug!("rolling back transaction to savepoint");
            status.rollback_to_held_savepoint()
        } else if status.is_new_transaction() {
            tracing::debug!("initiating transaction rollback");
            self.backend.rollback(context, status)
        } else {
            let result = if status.has_transaction() {
                if status.is_local_rollback_only()
                    || self.config.global_rollback_on_participation_failure
                {
                    tracing::debug!("participating transaction failed: marking existing transaction as rollback-only");
                    self.backend.set_rollback_only(context, status)
                } else {
                    tracing::debug!("participating transaction failed: letting transaction originator decide on rollback");
                    Ok(())
                }
            } else {
                tracing::debug!("should roll back transaction but cannot: no transaction available");
                Ok(())
            };
            if !self.config.fail_early_on_global_rollback_only {
                unexpected_rollback = false;
            }
            result
        };

        if let Err(err) = rolled_back {
            self.trigger_after_completion(context, status, CompletionStatus::Unknown);
            return Err(err);
        }

        self.trigger_after_completion(context, status, CompletionStatus::RolledBack);

        if unexpected_rollback {
            Err(Error::unexpected_rollback(
                "transaction rolled back because it has been marked as rollback-only",
            ))
        } else {
            Ok(())
        }
    }

    fn trigger_before_commit(
        context: &mut TransactionContext,
        status: &TransactionStatus<B>,
    ) -> Result<(), Error> {
        if status.is_new_synchronization() {
            tracing::trace!("triggering before_commit synchronization");
            synchronization::trigger_before_commit(context, status.is_read_only())
        } else {
            Ok(())
        }
    }

    fn trigger_before_completion(context: &mut TransactionContext, status: &TransactionStatus<B>) {
        if status.is_new_synchronization() {
            tracing::trace!("triggering before_completion synchronization");
            synchronization::trigger_before_completion(context);
        }
    }

    fn trigger_after_commit(
        context: &mut TransactionContext,
        status: &TransactionStatus<B>,
    ) -> Result<(), Error> {
        if status.is_new_synchronization() {
            tracing::trace!("triggering after_commit synchronization");
            synchronization::trigger_after_commit(context)
        } else {
            Ok(())
        }
    }

    fn trigger_after_completion(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
        completion: CompletionStatus,
    ) {
        if !status.is_new_synchronization() {
            return;
        }
        let synchronizations = context.take_synchronizations();
        let new_transaction = status.is_new_transaction();
        match status.transaction_mut() {
            Some(transaction) if !new_transaction => {
                if synchronizations.is_empty() {
                    return;
                }
                if let Err(err) = self
                    .backend
                    .register_after_completion_with_existing_transaction(
                        context,
                        transaction,
                        synchronizations,
                    )
                {
                    tracing::error!(error = %err, "failed to register after-completion synchronizations with existing transaction");
                }
            }
            _ => {
                tracing::trace!(?completion, "triggering after_completion synchronization");
                synchronization::invoke_after_completion(context, &synchronizations, completion);
            }
        }
    }

    /// Runs cleanup after completion, returning the error to report. A
    /// cleanup failure replaces an earlier error.
    fn finish(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
        result: Result<(), Error>,
    ) -> Result<(), Error> {
        match (result, self.cleanup_after_completion(context, status)) {
            (result, Ok(())) => result,
            (Err(err), Err(cleanup_error)) => {
                tracing::error!(error = %err, "transaction error overridden by cleanup error");
                Err(cleanup_error)
            }
            (Ok(()), Err(cleanup_error)) => Err(cleanup_error),
        }
    }

    fn cleanup_after_completion(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
    ) -> Result<(), Error> {
        status.set_completed();
        if status.is_new_synchronization() {
            context.clear();
        }
        if status.is_new_transaction() {
            if let Some(transaction) = status.transaction_mut() {
                self.backend.cleanup_after_completion(context, transaction);
            }
        }
        if let Some(suspended) = status.take_suspended() {
            tracing::debug!("resuming suspended transaction after completion of inner transaction");
            self.resume(context, status.transaction_mut(), Some(suspended))?;
        }
        Ok(())
    }
}
