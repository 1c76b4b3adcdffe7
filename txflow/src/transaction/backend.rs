use std::sync::Arc;

use crate::{
    synchronization::invoke_after_completion, CompletionStatus, Error, ErrorKind,
    SavepointManager, Synchronization, TransactionContext, TransactionDefinition,
    TransactionStatus,
};

/// A backend-specific transaction object, created for every
/// [`TransactionManager::get_transaction()`](crate::TransactionManager::get_transaction)
/// call.
///
/// The object may represent a freshly requested transaction or a handle to
/// one that is already in progress. Optional capabilities are exposed through
/// the accessor methods.
pub trait TransactionObject: Send {
    /// Returns the savepoint capability of this transaction, if supported.
    fn savepoint_manager(&mut self) -> Option<&mut dyn SavepointManager> {
        None
    }

    /// Returns the rollback-only and flush capability of this transaction, if
    /// supported.
    fn smart(&self) -> Option<&dyn SmartTransactionObject> {
        None
    }
}

/// A transaction object that can report a global rollback-only marker, such
/// as one kept on a resource holder shared by every participant.
pub trait SmartTransactionObject {
    /// Returns true if the underlying transaction has been marked
    /// rollback-only by any participant.
    fn is_rollback_only(&self) -> bool;

    /// Flushes the underlying session to the backend.
    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// The primitive operations a [`TransactionManager`](crate::TransactionManager)
/// drives.
///
/// Only the four required operations must be implemented. The remaining
/// hooks have defaults for backends that cannot detect existing transactions
/// or suspend them.
pub trait TransactionBackend: Sized {
    /// The transaction object type.
    type Transaction: TransactionObject;
    /// The state returned by [`suspend()`](Self::suspend) and consumed by
    /// [`resume()`](Self::resume).
    type Suspended: Send;

    /// Returns a transaction object representing the current transaction
    /// state. The object may reference resources bound in `context`.
    fn get_transaction(&self, context: &mut TransactionContext) -> Result<Self::Transaction, Error>;

    /// Returns true if `transaction` refers to a transaction that is already
    /// in progress.
    fn is_existing_transaction(&self, _transaction: &Self::Transaction) -> Result<bool, Error> {
        Ok(false)
    }

    /// Returns true if nested transactions are implemented with savepoints.
    /// Otherwise a nested begin is issued against the existing transaction.
    fn use_savepoint_for_nested_transaction(&self) -> bool {
        true
    }

    /// Begins a new transaction using `definition`. The definition's timeout
    /// already has the manager's default substituted.
    fn begin(
        &self,
        context: &mut TransactionContext,
        transaction: &mut Self::Transaction,
        definition: &TransactionDefinition,
    ) -> Result<(), Error>;

    /// Suspends the resources of `transaction`, unbinding them from
    /// `context`.
    fn suspend(
        &self,
        _context: &mut TransactionContext,
        _transaction: &mut Self::Transaction,
    ) -> Result<Self::Suspended, Error> {
        Err(Error::from(ErrorKind::SuspensionNotSupported))
    }

    /// Resumes resources previously returned by [`suspend()`](Self::suspend).
    fn resume(
        &self,
        _context: &mut TransactionContext,
        _transaction: Option<&mut Self::Transaction>,
        _suspended: Self::Suspended,
    ) -> Result<(), Error> {
        Err(Error::from(ErrorKind::SuspensionNotSupported))
    }

    /// Returns true if a transaction that was globally marked rollback-only
    /// should still be committed, leaving the rollback decision to the
    /// backend.
    fn should_commit_on_global_rollback_only(&self) -> bool {
        false
    }

    /// Invoked before the commit synchronization callbacks run.
    fn prepare_for_commit(
        &self,
        _context: &mut TransactionContext,
        _status: &mut TransactionStatus<Self>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Commits the transaction held by `status`.
    fn commit(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<Self>,
    ) -> Result<(), Error>;

    /// Rolls back the transaction held by `status`.
    fn rollback(
        &self,
        context: &mut TransactionContext,
        status: &mut TransactionStatus<Self>,
    ) -> Result<(), Error>;

    /// Marks the existing transaction held by `status` rollback-only, on
    /// behalf of a participant that failed.
    fn set_rollback_only(
        &self,
        _context: &mut TransactionContext,
        _status: &mut TransactionStatus<Self>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Hands `synchronizations` to the outer transaction that `transaction`
    /// participates in, so they are notified once it completes.
    ///
    /// The default implementation cannot learn the outcome of the outer
    /// transaction and notifies the synchronizations immediately with
    /// [`CompletionStatus::Unknown`].
    fn register_after_completion_with_existing_transaction(
        &self,
        context: &mut TransactionContext,
        _transaction: &mut Self::Transaction,
        synchronizations: Vec<Arc<dyn Synchronization>>,
    ) -> Result<(), Error> {
        tracing::debug!(
            "cannot register after-completion callbacks with an existing transaction: invoking them immediately with an unknown outcome"
        );
        invoke_after_completion(context, &synchronizations, CompletionStatus::Unknown);
        Ok(())
    }

    /// Releases resources of `transaction` after it completed.
    fn cleanup_after_completion(
        &self,
        _context: &mut TransactionContext,
        _transaction: &mut Self::Transaction,
    ) {
    }
}
