use std::{
    borrow::Cow,
    fmt::{Display, Write},
    str::FromStr,
};

use crate::{Error, ErrorKind};

/// Use the default timeout of the underlying backend, or none if timeouts
/// are not supported.
pub const TIMEOUT_DEFAULT: i32 = -1;

/// How a requested transaction relates to one that may already be in
/// progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Propagation {
    /// Join the current transaction, creating a new one if none exists.
    #[default]
    Required,
    /// Join the current transaction, executing non-transactionally if none
    /// exists.
    Supports,
    /// Join the current transaction, failing if none exists.
    Mandatory,
    /// Always create a new transaction, suspending the current one if it
    /// exists.
    RequiresNew,
    /// Execute non-transactionally, suspending the current transaction if it
    /// exists.
    NotSupported,
    /// Execute non-transactionally, failing if a transaction exists.
    Never,
    /// Execute within a nested transaction if a transaction exists, behaving
    /// like [`Propagation::Required`] otherwise.
    Nested,
}

impl Propagation {
    const ALL: [Self; 7] = [
        Self::Required,
        Self::Supports,
        Self::Mandatory,
        Self::RequiresNew,
        Self::NotSupported,
        Self::Never,
        Self::Nested,
    ];

    /// Returns the canonical name, such as `PROPAGATION_REQUIRED`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Required => "PROPAGATION_REQUIRED",
            Self::Supports => "PROPAGATION_SUPPORTS",
            Self::Mandatory => "PROPAGATION_MANDATORY",
            Self::RequiresNew => "PROPAGATION_REQUIRES_NEW",
            Self::NotSupported => "PROPAGATION_NOT_SUPPORTED",
            Self::Never => "PROPAGATION_NEVER",
            Self::Nested => "PROPAGATION_NESTED",
        }
    }

    /// Returns true if this behavior starts a backend transaction when none
    /// is active.
    #[must_use]
    pub const fn creates_transaction(self) -> bool {
        matches!(self, Self::Required | Self::RequiresNew | Self::Nested)
    }
}

impl Display for Propagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Propagation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|propagation| propagation.name() == s)
            .ok_or_else(|| {
                Error::from(ErrorKind::InvalidAttribute(format!(
                    "unknown propagation behavior {s}"
                )))
            })
    }
}

/// The concurrency-control strength requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Isolation {
    /// Use the backend's default isolation level.
    #[default]
    Default,
    /// Dirty reads, non-repeatable reads and phantom reads can occur.
    ReadUncommitted,
    /// Dirty reads are prevented.
    ReadCommitted,
    /// Dirty reads and non-repeatable reads are prevented.
    RepeatableRead,
    /// Dirty reads, non-repeatable reads and phantom reads are prevented.
    Serializable,
}

impl Isolation {
    const ALL: [Self; 5] = [
        Self::Default,
        Self::ReadUncommitted,
        Self::ReadCommitted,
        Self::RepeatableRead,
        Self::Serializable,
    ];

    /// Returns the canonical name, such as `ISOLATION_READ_COMMITTED`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Default => "ISOLATION_DEFAULT",
            Self::ReadUncommitted => "ISOLATION_READ_UNCOMMITTED",
            Self::ReadCommitted => "ISOLATION_READ_COMMITTED",
            Self::RepeatableRead => "ISOLATION_REPEATABLE_READ",
            Self::Serializable => "ISOLATION_SERIALIZABLE",
        }
    }
}

impl Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Isolation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|isolation| isolation.name() == s)
            .ok_or_else(|| {
                Error::from(ErrorKind::InvalidAttribute(format!(
                    "unknown isolation level {s}"
                )))
            })
    }
}

/// A declarative description of the transaction a unit of work requires.
///
/// The timeout and isolation level only apply when a new backend transaction
/// is started; participating transactions inherit the existing settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct TransactionDefinition {
    /// The propagation behavior.
    pub propagation: Propagation,
    /// The requested isolation level.
    pub isolation: Isolation,
    /// The timeout in seconds, or [`TIMEOUT_DEFAULT`].
    pub timeout: i32,
    /// Whether the transaction is expected to only read data.
    pub read_only: bool,
    /// An optional name, exposed to synchronizations and log output.
    pub name: Option<Cow<'static, str>>,
}

impl Default for TransactionDefinition {
    fn default() -> Self {
        Self::new(Propagation::Required)
    }
}

impl TransactionDefinition {
    /// Returns a definition using `propagation` and defaults for everything
    /// else.
    pub const fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            isolation: Isolation::Default,
            timeout: TIMEOUT_DEFAULT,
            read_only: false,
            name: None,
        }
    }

    /// Sets the isolation level.
    pub const fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Sets the timeout, in seconds.
    pub const fn with_timeout(mut self, seconds: i32) -> Self {
        self.timeout = seconds;
        self
    }

    /// Marks the transaction read-only.
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Sets the transaction name.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns the name, if one was set.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn validate_timeout(&self) -> Result<(), Error> {
        if self.timeout < TIMEOUT_DEFAULT {
            Err(Error::from(ErrorKind::InvalidTimeout(self.timeout)))
        } else {
            Ok(())
        }
    }
}

impl Display for TransactionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut description = String::new();
        description.push_str(self.propagation.name());
        description.push(',');
        description.push_str(self.isolation.name());
        if self.timeout != TIMEOUT_DEFAULT {
            write!(description, ",timeout_{}", self.timeout)?;
        }
        if self.read_only {
            description.push_str(",readOnly");
        }
        f.write_str(&description)
    }
}
