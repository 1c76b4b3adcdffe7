#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]
#![forbid(unsafe_code)]
#![warn(
    clippy::cargo,
    missing_docs,
    // clippy::missing_docs_in_private_items,
    clippy::nursery,
    clippy::pedantic,
    future_incompatible,
    rust_2018_idioms,
)]
#![cfg_attr(doc, deny(rustdoc::all))]
#![allow(
    clippy::missing_errors_doc, // TODO clippy::missing_errors_doc
    clippy::option_if_let_else,
    clippy::module_name_repetitions,
)]

mod attribute;
mod context;
mod definition;
mod error;
mod interceptor;
mod resource;
mod savepoint;
pub mod synchronization;
mod template;
pub mod transaction;

#[cfg(test)]
mod test_util;

pub use self::{
    attribute::{RollbackRule, TransactionAttribute},
    context::TransactionContext,
    definition::{Isolation, Propagation, TransactionDefinition, TIMEOUT_DEFAULT},
    error::{BoxedError, Error, ErrorKind, SendSyncError},
    interceptor::{invoke_within_transaction, TransactionInfo},
    resource::{Bindable, ResourceHolder, ResourceKey, TransactionalResource},
    savepoint::{Savepoint, SavepointManager},
    synchronization::{
        CompletionStatus, ResourceHolderSynchronization, ResourceRelease, Synchronization,
        SynchronizationMode,
    },
    template::{
        ExecuteError, TransactionOperations, TransactionTemplate, UntransactedStatus,
        WithoutTransaction,
    },
    transaction::{
        Config, SmartTransactionObject, SuspendedResourcesHolder, TransactionBackend,
        TransactionManager, TransactionObject, TransactionStatus,
    },
};
