use std::{borrow::Cow, fmt::Display};

use crate::Error;

/// An opaque handle to a rollback point inside an open backend transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Savepoint {
    id: u64,
    name: Cow<'static, str>,
}

impl Savepoint {
    /// Returns a savepoint named `SAVEPOINT_{id}`.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            name: Cow::Owned(format!("SAVEPOINT_{id}")),
        }
    }

    /// Returns a savepoint with an explicit backend name.
    #[must_use]
    pub fn named(id: u64, name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Returns the backend-assigned id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the backend name of this savepoint.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for Savepoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Programmatic savepoint management, implemented by backend transaction
/// objects that can emulate nested transactions.
pub trait SavepointManager {
    /// Creates a new savepoint at the current position of the transaction.
    fn create_savepoint(&mut self) -> Result<Savepoint, Error>;

    /// Rolls the transaction back to `savepoint`. The savepoint is not
    /// released.
    fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), Error>;

    /// Releases `savepoint`, keeping all work done since it was created.
    fn release_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), Error>;
}
