//! Callbacks invoked at the boundaries of a transaction scope, and the
//! synchronization that keeps bound resource holders in step with them.

use std::{
    fmt::Display,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{resource::Bindable, Error, ErrorKind, ResourceHolder, ResourceKey, TransactionContext};

/// How a transaction ended, as reported to
/// [`Synchronization::after_completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    /// The transaction was committed.
    Committed,
    /// The transaction was rolled back.
    RolledBack,
    /// The outcome is unknown because an error occurred while completing.
    Unknown,
}

/// When a [`TransactionManager`](crate::TransactionManager) activates
/// synchronization for a transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SynchronizationMode {
    /// Activate synchronization for every scope, including "empty"
    /// transactions that run without a backend transaction.
    #[default]
    Always,
    /// Activate synchronization only for scopes with a backend transaction.
    OnActualTransaction,
    /// Never activate synchronization.
    Never,
}

impl SynchronizationMode {
    /// Returns the canonical name, such as `SYNCHRONIZATION_ALWAYS`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Always => "SYNCHRONIZATION_ALWAYS",
            Self::OnActualTransaction => "SYNCHRONIZATION_ON_ACTUAL_TRANSACTION",
            Self::Never => "SYNCHRONIZATION_NEVER",
        }
    }
}

impl Display for SynchronizationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SynchronizationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Always, Self::OnActualTransaction, Self::Never]
            .into_iter()
            .find(|mode| mode.name() == s)
            .ok_or_else(|| {
                Error::from(ErrorKind::InvalidAttribute(format!(
                    "unknown synchronization mode {s}"
                )))
            })
    }
}

/// Callbacks invoked at well-defined points of a transaction scope.
///
/// Synchronizations are registered with a [`TransactionContext`] while
/// synchronization is active and are shared as `Arc`s, so implementors use
/// interior mutability for any state they track. Every callback receives the
/// context, which allows callbacks to bind and unbind resources or register
/// further synchronizations.
pub trait Synchronization: Send + Sync {
    /// The priority of this synchronization. Lower values run first;
    /// synchronizations without an order run after all ordered ones.
    fn order(&self) -> Option<i32> {
        None
    }

    /// Suspends this synchronization, unbinding any resources it manages.
    fn suspend(&self, _context: &mut TransactionContext) -> Result<(), Error> {
        Ok(())
    }

    /// Resumes this synchronization, rebinding any resources it manages.
    fn resume(&self, _context: &mut TransactionContext) -> Result<(), Error> {
        Ok(())
    }

    /// Flushes the underlying session to the backend, if applicable.
    fn flush(&self, _context: &mut TransactionContext) -> Result<(), Error> {
        Ok(())
    }

    /// Invoked before commit. An error aborts the commit and causes a
    /// rollback.
    fn before_commit(&self, _context: &mut TransactionContext, _read_only: bool) -> Result<(), Error> {
        Ok(())
    }

    /// Invoked before commit or rollback. Errors are logged and otherwise
    /// ignored.
    fn before_completion(&self, _context: &mut TransactionContext) -> Result<(), Error> {
        Ok(())
    }

    /// Invoked after a successful commit. An error is returned to the caller
    /// of `commit`, but the transaction stays committed.
    fn after_commit(&self, _context: &mut TransactionContext) -> Result<(), Error> {
        Ok(())
    }

    /// Invoked after commit or rollback. Errors are logged and otherwise
    /// ignored.
    fn after_completion(
        &self,
        _context: &mut TransactionContext,
        _status: CompletionStatus,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Invokes [`Synchronization::flush`] on every registered synchronization.
pub(crate) fn trigger_flush(context: &mut TransactionContext) -> Result<(), Error> {
    for synchronization in context.synchronizations()? {
        synchronization.flush(context)?;
    }
    Ok(())
}

pub(crate) fn trigger_before_commit(
    context: &mut TransactionContext,
    read_only: bool,
) -> Result<(), Error> {
    for synchronization in context.synchronizations()? {
        synchronization.before_commit(context, read_only)?;
    }
    Ok(())
}

pub(crate) fn trigger_before_completion(context: &mut TransactionContext) {
    let Ok(synchronizations) = context.synchronizations() else {
        return;
    };
    for synchronization in synchronizations {
        if let Err(err) = synchronization.before_completion(context) {
            tracing::error!(error = %err, "synchronization before_completion failed");
        }
    }
}

pub(crate) fn trigger_after_commit(context: &mut TransactionContext) -> Result<(), Error> {
    let synchronizations = context.synchronizations()?;
    invoke_after_commit(context, &synchronizations)
}

/// Invokes [`Synchronization::after_commit`] on each of `synchronizations`,
/// stopping at the first error.
pub fn invoke_after_commit(
    context: &mut TransactionContext,
    synchronizations: &[Arc<dyn Synchronization>],
) -> Result<(), Error> {
    for synchronization in synchronizations {
        synchronization.after_commit(context)?;
    }
    Ok(())
}

/// Invokes [`Synchronization::after_completion`] on each of
/// `synchronizations`. Errors are logged so that every synchronization is
/// notified.
pub fn invoke_after_completion(
    context: &mut TransactionContext,
    synchronizations: &[Arc<dyn Synchronization>],
    status: CompletionStatus,
) {
    for synchronization in synchronizations {
        if let Err(err) = synchronization.after_completion(context, status) {
            tracing::error!(error = %err, ?status, "synchronization after_completion failed");
        }
    }
}

/// Resource-specific behavior for a [`ResourceHolderSynchronization`].
pub trait ResourceRelease<H>: Send + Sync {
    /// Returns true if the holder should be unbound when the transaction
    /// completes.
    fn should_unbind_at_completion(&self) -> bool {
        true
    }

    /// Returns true if the resource should be released in
    /// `before_completion` rather than after completion.
    fn should_release_before_completion(&self) -> bool {
        true
    }

    /// Returns true if the resource should be released after completion when
    /// it was not released earlier.
    fn should_release_after_completion(&self, _holder: &H) -> bool {
        !self.should_release_before_completion()
    }

    /// Flushes the resource.
    fn flush_resource(&self, _holder: &H) -> Result<(), Error> {
        Ok(())
    }

    /// Post-processes the resource after a commit.
    fn process_resource_after_commit(&self, _holder: &H) -> Result<(), Error> {
        Ok(())
    }

    /// Releases the resource.
    fn release_resource(&self, _holder: &H, _key: &ResourceKey) -> Result<(), Error> {
        Ok(())
    }

    /// Cleans up a resource that stays bound after completion.
    fn cleanup_resource(&self, _holder: &H, _key: &ResourceKey, _committed: bool) {}
}

/// A [`Synchronization`] that keeps a bound resource holder consistent with
/// the transaction lifecycle: the holder is unbound while the transaction is
/// suspended, unbound at completion, and reset once the transaction ends.
pub struct ResourceHolderSynchronization<H, R> {
    holder: H,
    key: ResourceKey,
    release: R,
    holder_active: AtomicBool,
}

impl<H, R> ResourceHolderSynchronization<H, R>
where
    H: Bindable + Clone + AsRef<ResourceHolder>,
    R: ResourceRelease<H>,
{
    /// Returns a synchronization managing `holder`, which is bound to `key`.
    pub fn new(holder: H, key: ResourceKey, release: R) -> Self {
        Self {
            holder,
            key,
            release,
            holder_active: AtomicBool::new(true),
        }
    }

    /// Returns true while the holder is still managed by this
    /// synchronization.
    #[must_use]
    pub fn is_holder_active(&self) -> bool {
        self.holder_active.load(Ordering::SeqCst)
    }
}

impl<H, R> Synchronization for ResourceHolderSynchronization<H, R>
where
    H: Bindable + Clone + AsRef<ResourceHolder>,
    R: ResourceRelease<H>,
{
    fn suspend(&self, context: &mut TransactionContext) -> Result<(), Error> {
        if self.is_holder_active() {
            context.unbind_resource(&self.key)?;
        }
        Ok(())
    }

    fn resume(&self, context: &mut TransactionContext) -> Result<(), Error> {
        if self.is_holder_active() {
            context.bind_resource(&self.key, self.holder.clone())?;
        }
        Ok(())
    }

    fn flush(&self, _context: &mut TransactionContext) -> Result<(), Error> {
        self.release.flush_resource(&self.holder)
    }

    fn before_completion(&self, context: &mut TransactionContext) -> Result<(), Error> {
        if self.release.should_unbind_at_completion() {
            context.unbind_resource(&self.key)?;
            self.holder_active.store(false, Ordering::SeqCst);
            if self.release.should_release_before_completion() {
                self.release.release_resource(&self.holder, &self.key)?;
            }
        }
        Ok(())
    }

    fn after_commit(&self, _context: &mut TransactionContext) -> Result<(), Error> {
        if self.release.should_release_before_completion() {
            Ok(())
        } else {
            self.release.process_resource_after_commit(&self.holder)
        }
    }

    fn after_completion(
        &self,
        context: &mut TransactionContext,
        status: CompletionStatus,
    ) -> Result<(), Error> {
        let mut result = Ok(());
        if self.release.should_unbind_at_completion() {
            let release_necessary = if self.holder_active.swap(false, Ordering::SeqCst) {
                // before_completion never ran, so the holder is still bound.
                context.unbind_resource_if_possible(&self.key);
                self.holder.as_ref().unbound();
                true
            } else {
                self.release.should_release_after_completion(&self.holder)
            };
            if release_necessary {
                result = self.release.release_resource(&self.holder, &self.key);
            }
        } else {
            self.release
                .cleanup_resource(&self.holder, &self.key, status == CompletionStatus::Committed);
        }
        self.holder.as_ref().reset();
        result
    }
}

impl AsRef<ResourceHolder> for ResourceHolder {
    fn as_ref(&self) -> &ResourceHolder {
        self
    }
}
