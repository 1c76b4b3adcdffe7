use std::{
    convert::Infallible,
    fmt::{Debug, Display},
    panic::{self, AssertUnwindSafe},
};

use crate::{
    Error, TransactionBackend, TransactionContext, TransactionDefinition, TransactionManager,
    TransactionStatus,
};

/// An error that could come from the unit of work or from the transaction
/// infrastructure.
#[derive(thiserror::Error, Debug)]
pub enum ExecuteError<CallerError: Display + Debug> {
    /// The unit of work failed. The transaction was completed according to
    /// the rollback rules in effect.
    #[error("callback error: {0}")]
    Callback(CallerError),
    /// Beginning or completing the transaction failed.
    #[error("transaction error: {0}")]
    Transaction(#[from] Error),
    /// The unit of work failed and completing the transaction afterwards
    /// failed as well.
    #[error("transaction completion failed after callback error ({application}): {error}")]
    Superseded {
        /// The error returned by the unit of work.
        application: CallerError,
        /// The error completing the transaction.
        #[source]
        error: Error,
    },
}

impl<CallerError: Display + Debug> ExecuteError<CallerError> {
    /// Returns the error returned by the unit of work, if it failed.
    pub const fn application_error(&self) -> Option<&CallerError> {
        match self {
            Self::Callback(application) | Self::Superseded { application, .. } => {
                Some(application)
            }
            Self::Transaction(_) => None,
        }
    }

    /// Returns the transaction infrastructure error, if one occurred.
    pub const fn transaction_error(&self) -> Option<&Error> {
        match self {
            Self::Transaction(error) | Self::Superseded { error, .. } => Some(error),
            Self::Callback(_) => None,
        }
    }
}

impl ExecuteError<Infallible> {
    /// Unwraps the error contained within an infallible execute error.
    #[must_use]
    pub fn infallible(self) -> Error {
        match self {
            Self::Callback(infallible) | Self::Superseded {
                application: infallible,
                ..
            } => match infallible {},
            Self::Transaction(error) => error,
        }
    }
}

/// Runs units of work inside transactions described by a single
/// [`TransactionDefinition`].
#[derive(Debug)]
#[must_use]
pub struct TransactionTemplate<'a, B: TransactionBackend> {
    manager: &'a TransactionManager<B>,
    definition: TransactionDefinition,
}

impl<'a, B: TransactionBackend> TransactionTemplate<'a, B> {
    /// Returns a template using the default definition.
    pub fn new(manager: &'a TransactionManager<B>) -> Self {
        Self::with_definition(manager, TransactionDefinition::default())
    }

    /// Returns a template using `definition`.
    pub const fn with_definition(
        manager: &'a TransactionManager<B>,
        definition: TransactionDefinition,
    ) -> Self {
        Self {
            manager,
            definition,
        }
    }

    /// Returns the definition used for every execution.
    pub const fn definition(&self) -> &TransactionDefinition {
        &self.definition
    }

    /// Runs `work` inside a transaction.
    ///
    /// The transaction is committed if `work` succeeds and rolled back if it
    /// fails or panics. A panic is resumed after the rollback.
    #[tracing::instrument(skip_all, fields(definition = %self.definition))]
    pub fn execute<T, CallerError, Work>(
        &self,
        context: &mut TransactionContext,
        work: Work,
    ) -> Result<T, ExecuteError<CallerError>>
    where
        Work: FnOnce(&mut TransactionContext, &mut TransactionStatus<B>) -> Result<T, CallerError>,
        CallerError: Display + Debug,
    {
        let mut status = self.manager.get_transaction(context, &self.definition)?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(context, &mut status)));
        match outcome {
            Ok(Ok(value)) => {
                self.manager.commit(context, &mut status)?;
                Ok(value)
            }
            Ok(Err(application)) => Err(self.rollback_on_error(context, &mut status, application)),
            Err(panic) => {
                tracing::debug!("initiating transaction rollback on panic");
                if let Err(error) = self.manager.rollback(context, &mut status) {
                    tracing::error!(%error, "rollback after panic failed");
                }
                panic::resume_unwind(panic)
            }
        }
    }

    /// Runs `work`, which produces no value, inside a transaction.
    pub fn execute_without_result<CallerError, Work>(
        &self,
        context: &mut TransactionContext,
        work: Work,
    ) -> Result<(), ExecuteError<CallerError>>
    where
        Work: FnOnce(&mut TransactionContext, &mut TransactionStatus<B>) -> Result<(), CallerError>,
        CallerError: Display + Debug,
    {
        self.execute(context, work)
    }

    fn rollback_on_error<CallerError: Display + Debug>(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<B>,
        application: CallerError,
    ) -> ExecuteError<CallerError> {
        tracing::debug!(error = %application, "initiating transaction rollback on application error");
        match self.manager.rollback(context, status) {
            Ok(()) => ExecuteError::Callback(application),
            Err(error) => {
                tracing::error!(error = %application, "application error overridden by rollback error");
                ExecuteError::Superseded { application, error }
            }
        }
    }
}

/// Runs units of work, each inside whatever transaction scope the
/// implementation provides.
pub trait TransactionOperations {
    /// The status handed to each unit of work.
    type Status;

    /// Runs `work`, returning its value or the error that stopped it.
    fn execute<T, CallerError, Work>(
        &self,
        context: &mut TransactionContext,
        work: Work,
    ) -> Result<T, ExecuteError<CallerError>>
    where
        Work: FnOnce(&mut TransactionContext, &mut Self::Status) -> Result<T, CallerError>,
        CallerError: Display + Debug;

    /// Runs `work`, which produces no value.
    fn execute_without_result<CallerError, Work>(
        &self,
        context: &mut TransactionContext,
        work: Work,
    ) -> Result<(), ExecuteError<CallerError>>
    where
        Work: FnOnce(&mut TransactionContext, &mut Self::Status) -> Result<(), CallerError>,
        CallerError: Display + Debug,
    {
        self.execute(context, work)
    }
}

impl<'a, B: TransactionBackend> TransactionOperations for TransactionTemplate<'a, B> {
    type Status = TransactionStatus<B>;

    fn execute<T, CallerError, Work>(
        &self,
        context: &mut TransactionContext,
        work: Work,
    ) -> Result<T, ExecuteError<CallerError>>
    where
        Work: FnOnce(&mut TransactionContext, &mut TransactionStatus<B>) -> Result<T, CallerError>,
        CallerError: Display + Debug,
    {
        TransactionTemplate::execute(self, context, work)
    }
}

/// The status handed to work run by [`WithoutTransaction`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UntransactedStatus {
    rollback_only: bool,
}

impl UntransactedStatus {
    /// Always false: no transaction is ever started.
    #[must_use]
    pub const fn is_new_transaction(&self) -> bool {
        false
    }

    /// Records a rollback request. There is nothing to roll back, so the
    /// flag is only informational.
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    /// Returns true if [`set_rollback_only()`](Self::set_rollback_only) was
    /// called.
    #[must_use]
    pub const fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }
}

/// [`TransactionOperations`] that run work directly, without any
/// transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct WithoutTransaction;

impl TransactionOperations for WithoutTransaction {
    type Status = UntransactedStatus;

    fn execute<T, CallerError, Work>(
        &self,
        context: &mut TransactionContext,
        work: Work,
    ) -> Result<T, ExecuteError<CallerError>>
    where
        Work: FnOnce(&mut TransactionContext, &mut UntransactedStatus) -> Result<T, CallerError>,
        CallerError: Display + Debug,
    {
        work(context, &mut UntransactedStatus::default()).map_err(ExecuteError::Callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_util::{CallLog, Injected, MemoryBackend},
        ErrorKind, Propagation,
    };

    #[test]
    fn commits_on_success() {
        let log = CallLog::default();
        let manager = TransactionManager::new(MemoryBackend::new(&log));
        let template = TransactionTemplate::new(&manager);
        let mut context = TransactionContext::new();

        let value = template
            .execute(&mut context, |_context, status| {
                assert!(status.is_new_transaction());
                Ok::<_, Injected>(42)
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(log.entries(), ["begin 1", "commit 1", "cleanup 1"]);
    }

    #[test]
    fn rolls_back_on_error() {
        let log = CallLog::default();
        let manager = TransactionManager::new(MemoryBackend::new(&log));
        let template = TransactionTemplate::new(&manager);
        let mut context = TransactionContext::new();

        let error = template
            .execute_without_result(&mut context, |_context, _status| Err(Injected("work")))
            .unwrap_err();
        assert!(matches!(error, ExecuteError::Callback(Injected("work"))));
        assert!(error.transaction_error().is_none());
        assert_eq!(log.entries(), ["begin 1", "rollback 1", "cleanup 1"]);
    }

    #[test]
    fn rollback_only_work_rolls_back_quietly() {
        let log = CallLog::default();
        let manager = TransactionManager::new(MemoryBackend::new(&log));
        let template = TransactionTemplate::new(&manager);
        let mut context = TransactionContext::new();

        template
            .execute(&mut context, |_context, status| {
                status.set_rollback_only();
                Ok::<_, Injected>(())
            })
            .unwrap();
        assert_eq!(log.entries(), ["begin 1", "rollback 1", "cleanup 1"]);
    }

    #[test]
    fn failed_rollback_keeps_the_application_error() {
        let log = CallLog::default();
        let manager = TransactionManager::new(MemoryBackend::new(&log));
        manager.backend().fail(|failures| failures.rollback = true);
        let template = TransactionTemplate::new(&manager);
        let mut context = TransactionContext::new();

        let error = template
            .execute_without_result(&mut context, |_context, _status| Err(Injected("work")))
            .unwrap_err();
        assert!(matches!(error.application_error(), Some(Injected("work"))));
        assert!(matches!(
            error.transaction_error().map(|error| &error.kind),
            Some(ErrorKind::Backend(_))
        ));
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn panics_roll_back_before_unwinding() {
        let log = CallLog::default();
        let manager = TransactionManager::new(MemoryBackend::new(&log));
        let template = TransactionTemplate::new(&manager);
        let mut context = TransactionContext::new();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            template.execute_without_result::<Injected, _>(&mut context, |_context, _status| {
                panic!("work exploded")
            })
        }));
        assert!(result.is_err());
        assert_eq!(log.entries(), ["begin 1", "rollback 1", "cleanup 1"]);
        assert!(!context.is_synchronization_active());
    }

    #[test]
    fn begin_failures_are_transaction_errors() {
        let log = CallLog::default();
        let manager = TransactionManager::new(MemoryBackend::new(&log));
        let template =
            TransactionTemplate::with_definition(&manager, TransactionDefinition::new(Propagation::Mandatory));
        let mut context = TransactionContext::new();

        let error = template
            .execute(&mut context, |_context, _status| Ok::<_, Infallible>(()))
            .unwrap_err()
            .infallible();
        assert!(matches!(error.kind, ErrorKind::IllegalState(_)));
        assert!(log.entries().is_empty());
    }

    fn reserve_stock<O: TransactionOperations>(
        operations: &O,
        context: &mut TransactionContext,
        fail: bool,
    ) -> Result<u32, ExecuteError<Injected>> {
        operations.execute(context, |_context, _status| {
            if fail {
                Err(Injected("reservation"))
            } else {
                Ok(3)
            }
        })
    }

    #[test]
    fn operations_are_interchangeable() {
        let log = CallLog::default();
        let manager = TransactionManager::new(MemoryBackend::new(&log));
        let template = TransactionTemplate::new(&manager);
        let mut context = TransactionContext::new();

        assert_eq!(reserve_stock(&template, &mut context, false).unwrap(), 3);
        assert!(matches!(
            reserve_stock(&template, &mut context, true),
            Err(ExecuteError::Callback(Injected("reservation")))
        ));
        assert_eq!(
            log.entries(),
            ["begin 1", "commit 1", "cleanup 1", "begin 2", "rollback 2", "cleanup 2"]
        );

        log.clear();
        assert_eq!(reserve_stock(&WithoutTransaction, &mut context, false).unwrap(), 3);
        assert!(matches!(
            reserve_stock(&WithoutTransaction, &mut context, true),
            Err(ExecuteError::Callback(Injected("reservation")))
        ));
        assert!(log.entries().is_empty());
        assert!(!context.is_synchronization_active());
    }

    #[test]
    fn untransacted_work_sees_a_plain_status() {
        let mut context = TransactionContext::new();
        let rollback_only = WithoutTransaction
            .execute(&mut context, |_context, status| {
                assert!(!status.is_new_transaction());
                status.set_rollback_only();
                Ok::<_, Infallible>(status.is_rollback_only())
            })
            .map_err(ExecuteError::infallible)
            .unwrap();
        assert!(rollback_only);
    }
}
