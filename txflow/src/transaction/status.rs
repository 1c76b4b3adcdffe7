use std::{fmt::Debug, sync::Arc};

use crate::{
    Error, Isolation, Savepoint, SavepointManager, Synchronization, TransactionBackend,
    TransactionObject,
};

/// The state of one transaction scope returned by
/// [`TransactionManager::get_transaction()`](crate::TransactionManager::get_transaction).
///
/// A status is completed exactly once, by passing it to
/// [`TransactionManager::commit()`](crate::TransactionManager::commit) or
/// [`TransactionManager::rollback()`](crate::TransactionManager::rollback).
#[must_use]
pub struct TransactionStatus<B: TransactionBackend> {
    transaction: Option<B::Transaction>,
    new_transaction: bool,
    new_synchronization: bool,
    read_only: bool,
    debug: bool,
    rollback_only: bool,
    completed: bool,
    savepoint: Option<Savepoint>,
    suspended: Option<SuspendedResourcesHolder<B::Suspended>>,
}

impl<B: TransactionBackend> Debug for TransactionStatus<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStatus")
            .field("has_transaction", &self.transaction.is_some())
            .field("new_transaction", &self.new_transaction)
            .field("new_synchronization", &self.new_synchronization)
            .field("read_only", &self.read_only)
            .field("rollback_only", &self.rollback_only)
            .field("completed", &self.completed)
            .field("savepoint", &self.savepoint)
            .field("suspended", &self.suspended)
            .finish_non_exhaustive()
    }
}

impl<B: TransactionBackend> TransactionStatus<B> {
    pub(crate) const fn new(
        transaction: Option<B::Transaction>,
        new_transaction: bool,
        new_synchronization: bool,
        read_only: bool,
        debug: bool,
        suspended: Option<SuspendedResourcesHolder<B::Suspended>>,
    ) -> Self {
        Self {
            transaction,
            new_transaction,
            new_synchronization,
            read_only,
            debug,
            rollback_only: false,
            completed: false,
            savepoint: None,
            suspended,
        }
    }

    /// Returns the backend transaction object, if this scope has one.
    #[must_use]
    pub const fn transaction(&self) -> Option<&B::Transaction> {
        self.transaction.as_ref()
    }

    /// Returns the backend transaction object mutably, if this scope has one.
    pub fn transaction_mut(&mut self) -> Option<&mut B::Transaction> {
        self.transaction.as_mut()
    }

    /// Returns true if this scope has a backend transaction object.
    #[must_use]
    pub const fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Returns true if this scope started the backend transaction, as
    /// opposed to participating in an existing one.
    #[must_use]
    pub const fn is_new_transaction(&self) -> bool {
        self.transaction.is_some() && self.new_transaction
    }

    /// Returns true if this scope activated synchronization.
    #[must_use]
    pub const fn is_new_synchronization(&self) -> bool {
        self.new_synchronization
    }

    /// Returns true if the transaction was requested read-only.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns true if debug logging was enabled when this scope began.
    #[must_use]
    pub const fn is_debug(&self) -> bool {
        self.debug
    }

    /// Marks this scope rollback-only. A later commit rolls back instead.
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    /// Returns true if this scope or the underlying transaction was marked
    /// rollback-only.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.is_local_rollback_only() || self.is_global_rollback_only()
    }

    /// Returns true if [`set_rollback_only()`](Self::set_rollback_only) was
    /// called on this scope.
    #[must_use]
    pub const fn is_local_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Returns true if the underlying transaction reports that it was marked
    /// rollback-only, possibly by another participant.
    #[must_use]
    pub fn is_global_rollback_only(&self) -> bool {
        self.transaction
            .as_ref()
            .and_then(TransactionObject::smart)
            .map_or(false, |smart| smart.is_rollback_only())
    }

    /// Flushes the underlying session, if the transaction object supports it.
    pub fn flush(&self) -> Result<(), Error> {
        match self.transaction.as_ref().and_then(TransactionObject::smart) {
            Some(smart) => smart.flush(),
            None => Ok(()),
        }
    }

    /// Returns true once this scope has been committed or rolled back.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn set_completed(&mut self) {
        self.completed = true;
    }

    /// Returns true if this scope holds a savepoint, which makes it a nested
    /// transaction.
    #[must_use]
    pub const fn has_savepoint(&self) -> bool {
        self.savepoint.is_some()
    }

    /// Returns the held savepoint, if any.
    #[must_use]
    pub const fn savepoint(&self) -> Option<&Savepoint> {
        self.savepoint.as_ref()
    }

    pub(crate) fn take_suspended(&mut self) -> Option<SuspendedResourcesHolder<B::Suspended>> {
        self.suspended.take()
    }

    /// Returns true if this scope suspended an outer scope that will be
    /// resumed on completion.
    #[must_use]
    pub const fn has_suspended_resources(&self) -> bool {
        self.suspended.is_some()
    }

    /// Creates a savepoint and holds it for this scope.
    pub fn create_and_hold_savepoint(&mut self) -> Result<(), Error> {
        let savepoint = self.savepoint_manager()?.create_savepoint()?;
        tracing::trace!(%savepoint, "holding savepoint");
        self.savepoint = Some(savepoint);
        Ok(())
    }

    /// Rolls back to the held savepoint and releases it.
    ///
    /// The savepoint stays held if releasing it fails.
    pub fn rollback_to_held_savepoint(&mut self) -> Result<(), Error> {
        let savepoint = self.held_savepoint("cannot roll back to savepoint")?;
        let manager = self.savepoint_manager()?;
        manager.rollback_to_savepoint(&savepoint)?;
        manager.release_savepoint(&savepoint)?;
        self.savepoint = None;
        Ok(())
    }

    /// Releases the held savepoint.
    ///
    /// The savepoint stays held if releasing it fails.
    pub fn release_held_savepoint(&mut self) -> Result<(), Error> {
        let savepoint = self.held_savepoint("cannot release savepoint")?;
        self.savepoint_manager()?.release_savepoint(&savepoint)?;
        self.savepoint = None;
        Ok(())
    }

    /// Creates a savepoint without holding it.
    pub fn create_savepoint(&mut self) -> Result<Savepoint, Error> {
        self.savepoint_manager()?.create_savepoint()
    }

    /// Rolls back to `savepoint`.
    pub fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), Error> {
        self.savepoint_manager()?.rollback_to_savepoint(savepoint)
    }

    /// Releases `savepoint`.
    pub fn release_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), Error> {
        self.savepoint_manager()?.release_savepoint(savepoint)
    }

    fn held_savepoint(&self, action: &str) -> Result<Savepoint, Error> {
        self.savepoint
            .clone()
            .ok_or_else(|| Error::usage(format!("{action}: no savepoint associated with current transaction")))
    }

    fn savepoint_manager(&mut self) -> Result<&mut dyn SavepointManager, Error> {
        self.transaction
            .as_mut()
            .and_then(TransactionObject::savepoint_manager)
            .ok_or_else(|| {
                Error::nested_not_supported("transaction object does not support savepoints")
            })
    }
}

/// The state of a scope that was suspended so that another scope could run.
pub struct SuspendedResourcesHolder<S> {
    pub(crate) suspended_resources: Option<S>,
    pub(crate) synchronizations: Option<Vec<Arc<dyn Synchronization>>>,
    pub(crate) name: Option<String>,
    pub(crate) read_only: bool,
    pub(crate) isolation: Option<Isolation>,
    pub(crate) was_active: bool,
}

impl<S> SuspendedResourcesHolder<S> {
    /// Returns true if the suspended scope had an active backend
    /// transaction.
    #[must_use]
    pub const fn was_active(&self) -> bool {
        self.was_active
    }

    /// Returns the name of the suspended transaction.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl<S> Debug for SuspendedResourcesHolder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendedResourcesHolder")
            .field("has_resources", &self.suspended_resources.is_some())
            .field(
                "synchronizations",
                &self.synchronizations.as_ref().map(Vec::len),
            )
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("isolation", &self.isolation)
            .field("was_active", &self.was_active)
            .finish()
    }
}
