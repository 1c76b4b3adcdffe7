use std::{
    borrow::Cow,
    panic::{self, AssertUnwindSafe},
};

use crate::{
    Error, ExecuteError, TransactionAttribute, TransactionBackend, TransactionContext,
    TransactionManager, TransactionStatus,
};

/// The transaction state of a single [`invoke_within_transaction`] call.
#[derive(Debug)]
pub struct TransactionInfo<'a, B: TransactionBackend> {
    attribute: Option<&'a TransactionAttribute>,
    joinpoint: String,
    status: Option<TransactionStatus<B>>,
}

impl<'a, B: TransactionBackend> TransactionInfo<'a, B> {
    fn create(
        manager: &TransactionManager<B>,
        context: &mut TransactionContext,
        attribute: Option<&'a TransactionAttribute>,
        joinpoint: &str,
    ) -> Result<Self, Error> {
        let status = match attribute {
            Some(attribute) => {
                let definition = if attribute.definition.name.is_some() {
                    Cow::Borrowed(&attribute.definition)
                } else {
                    Cow::Owned(attribute.definition.clone().named(joinpoint.to_string()))
                };
                Some(manager.get_transaction(context, &definition)?)
            }
            None => {
                tracing::trace!(joinpoint, "no transaction attribute, running untransacted");
                None
            }
        };
        Ok(Self {
            attribute,
            joinpoint: joinpoint.to_string(),
            status,
        })
    }

    /// Returns the attribute the call was made with.
    #[must_use]
    pub const fn attribute(&self) -> Option<&'a TransactionAttribute> {
        self.attribute
    }

    /// Returns the name of the invoked operation.
    #[must_use]
    pub fn joinpoint_identification(&self) -> &str {
        &self.joinpoint
    }

    /// Returns true if the call runs inside a transaction scope.
    #[must_use]
    pub const fn has_transaction(&self) -> bool {
        self.status.is_some()
    }

    /// Returns the status of the transaction scope, if there is one.
    #[must_use]
    pub const fn status(&self) -> Option<&TransactionStatus<B>> {
        self.status.as_ref()
    }

    /// Returns the status of the transaction scope, if there is one.
    pub fn status_mut(&mut self) -> Option<&mut TransactionStatus<B>> {
        self.status.as_mut()
    }

    fn commit_after_returning(
        &mut self,
        manager: &TransactionManager<B>,
        context: &mut TransactionContext,
    ) -> Result<(), Error> {
        match self.status.as_mut() {
            Some(status) => {
                tracing::trace!(joinpoint = %self.joinpoint, "completing transaction");
                manager.commit(context, status)
            }
            None => Ok(()),
        }
    }

    fn complete_after_error<CallerError>(
        &mut self,
        manager: &TransactionManager<B>,
        context: &mut TransactionContext,
        application: CallerError,
    ) -> ExecuteError<CallerError>
    where
        CallerError: std::error::Error + 'static,
    {
        let Some(status) = self.status.as_mut() else {
            return ExecuteError::Callback(application);
        };

        let rollback = self
            .attribute
            .map_or(true, |attribute| attribute.rollback_on(&application));
        let completion = if rollback {
            tracing::trace!(joinpoint = %self.joinpoint, error = %application, "rolling back after error");
            manager.rollback(context, status)
        } else {
            tracing::trace!(joinpoint = %self.joinpoint, error = %application, "committing despite error");
            manager.commit(context, status)
        };

        match completion {
            Ok(()) => ExecuteError::Callback(application),
            Err(error) => {
                tracing::error!(
                    joinpoint = %self.joinpoint,
                    error = %application,
                    "application error overridden by completion error"
                );
                ExecuteError::Superseded { application, error }
            }
        }
    }

    fn rollback_after_panic(&mut self, manager: &TransactionManager<B>, context: &mut TransactionContext) {
        if let Some(status) = self.status.as_mut() {
            if let Err(error) = manager.rollback(context, status) {
                tracing::error!(joinpoint = %self.joinpoint, %error, "rollback after panic failed");
            }
        }
    }
}

/// Runs `work` as the operation `joinpoint`, inside a transaction scope
/// described by `attribute`.
///
/// Without an attribute, `work` runs untransacted. Otherwise a scope is
/// opened, named after `joinpoint` unless the definition carries a name.
/// The scope commits when `work` succeeds. When `work` fails, the
/// attribute's rollback rules decide between rolling back and committing,
/// and the error is returned as [`ExecuteError::Callback`]. If completing
/// the scope fails as well, both errors are returned as
/// [`ExecuteError::Superseded`].
#[tracing::instrument(skip(manager, context, attribute, work))]
pub fn invoke_within_transaction<'a, B, T, CallerError, Work>(
    manager: &TransactionManager<B>,
    context: &mut TransactionContext,
    attribute: Option<&'a TransactionAttribute>,
    joinpoint: &str,
    work: Work,
) -> Result<T, ExecuteError<CallerError>>
where
    B: TransactionBackend,
    Work: FnOnce(&mut TransactionContext, &mut TransactionInfo<'a, B>) -> Result<T, CallerError>,
    CallerError: std::error::Error + 'static,
{
    let mut info = TransactionInfo::create(manager, context, attribute, joinpoint)?;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(context, &mut info)));
    match outcome {
        Ok(Ok(value)) => {
            info.commit_after_returning(manager, context)?;
            Ok(value)
        }
        Ok(Err(application)) => Err(info.complete_after_error(manager, context, application)),
        Err(panic) => {
            info.rollback_after_panic(manager, context);
            panic::resume_unwind(panic)
        }
    }
}
