//! The transaction propagation engine and the backend contract it drives.

mod backend;
mod manager;
mod status;

pub use self::{
    backend::{SmartTransactionObject, TransactionBackend, TransactionObject},
    manager::{Config, TransactionManager},
    status::{SuspendedResourcesHolder, TransactionStatus},
};
