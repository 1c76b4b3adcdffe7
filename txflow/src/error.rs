use std::fmt::{Debug, Display};

use backtrace::Backtrace;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

/// An error from txflow as well as an associated backtrace.
pub struct Error {
    /// The error that occurred.
    pub kind: ErrorKind,

    backtrace: Mutex<Backtrace>,
}

impl Error {
    /// Wraps an error raised by a transaction backend.
    pub fn backend(error: impl SendSyncError) -> Self {
        Self::from(ErrorKind::Backend(Box::new(error)))
    }

    /// Wraps an error raised by a [`Synchronization`](crate::Synchronization)
    /// callback.
    pub fn synchronization(error: impl SendSyncError) -> Self {
        Self::from(ErrorKind::Synchronization(Box::new(error)))
    }

    pub(crate) fn illegal_state<S: Display>(message: S) -> Self {
        Self::from(ErrorKind::IllegalState(message.to_string()))
    }

    pub(crate) fn usage<S: Display>(message: S) -> Self {
        Self::from(ErrorKind::TransactionUsage(message.to_string()))
    }

    pub(crate) fn nested_not_supported<S: Display>(message: S) -> Self {
        Self::from(ErrorKind::NestedNotSupported(message.to_string()))
    }

    pub(crate) fn unexpected_rollback<S: Display>(message: S) -> Self {
        Self::from(ErrorKind::UnexpectedRollback(message.to_string()))
    }

    /// Returns true if this error belongs to the transaction infrastructure
    /// rather than to a failing callback. Commit processing uses this to
    /// decide whether a failure is rolled back or reported as an unknown
    /// outcome.
    #[must_use]
    pub const fn is_transaction_failure(&self) -> bool {
        !matches!(self.kind, ErrorKind::Synchronization(_))
    }

    /// Returns the backtrace of where this error was created.
    pub fn backtrace(&self) -> MutexGuard<'_, Backtrace> {
        let mut backtrace = self.backtrace.lock();
        backtrace.resolve();
        backtrace
    }

    fn format_backtrace_frames(&self) -> Vec<String> {
        let mut backtrace = self.backtrace.lock();
        backtrace.resolve();
        backtrace
            .frames()
            .iter()
            .filter_map(|frame| frame.symbols().first())
            .enumerate()
            .map(|(index, symbol)| {
                let mut line = format!("{index}: ");
                if let Some(name) = symbol.name() {
                    line.push_str(&name.to_string());
                    line.push(' ');
                } else {
                    line.push_str(&format!("{symbol:?}"));
                    return line;
                }

                if let Some(file) = symbol.filename() {
                    line.push_str(&format!("at {}", file.display()));
                    if let Some(lineno) = symbol.lineno() {
                        line.push(':');
                        line.push_str(&lineno.to_string());
                    }
                }
                line
            })
            .collect()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.kind, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let frames = self.format_backtrace_frames();
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("backtrace", &&frames[..])
            .finish()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            backtrace: Mutex::new(Backtrace::new_unresolved()),
        }
    }
}

impl From<&'static str> for Error {
    fn from(message: &'static str) -> Self {
        Self::from(ErrorKind::message(message))
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::from(ErrorKind::message(message))
    }
}

/// An error from txflow.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// An error has occurred. The string contains a human-readable message.
    #[error("{0}")]
    Message(String),
    /// The API was used in a way the current transaction state does not
    /// allow, such as committing twice or requesting a propagation behavior
    /// that conflicts with an existing transaction.
    #[error("illegal transaction state: {0}")]
    IllegalState(String),
    /// A timeout below [`TIMEOUT_DEFAULT`](crate::TIMEOUT_DEFAULT) was
    /// requested.
    #[error("invalid transaction timeout: {0}")]
    InvalidTimeout(i32),
    /// Nested transactions were requested but are disallowed or the backend
    /// cannot create savepoints.
    #[error("nested transactions not supported: {0}")]
    NestedNotSupported(String),
    /// A commit was requested but the transaction was rolled back instead
    /// because it had been marked rollback-only.
    #[error("unexpected rollback: {0}")]
    UnexpectedRollback(String),
    /// A resource deadline has passed.
    #[error("transaction timed out: {0}")]
    TimedOut(String),
    /// A value is already bound to the resource key.
    #[error("a value is already bound for resource {0}")]
    AlreadyBound(String),
    /// No value is bound to the resource key.
    #[error("no value bound for resource {0}")]
    NotBound(String),
    /// A synchronization was registered while synchronization was inactive.
    #[error("transaction synchronization is not active")]
    SynchronizationNotActive,
    /// The backend does not support suspending transactions.
    #[error("transaction suspension is not supported by this backend")]
    SuspensionNotSupported,
    /// A savepoint operation was used incorrectly.
    #[error("transaction usage error: {0}")]
    TransactionUsage(String),
    /// A transaction attribute could not be parsed.
    #[error("invalid transaction attribute: {0}")]
    InvalidAttribute(String),
    /// The transaction backend failed.
    #[error("backend error: {0}")]
    Backend(#[source] BoxedError),
    /// A synchronization callback failed.
    #[error("synchronization callback failed: {0}")]
    Synchronization(#[source] BoxedError),
}

/// A boxed foreign error carried by [`ErrorKind`].
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error type that can be boxed into an [`ErrorKind`].
pub trait SendSyncError: std::error::Error + Send + Sync + 'static {}
impl<T> SendSyncError for T where T: std::error::Error + Send + Sync + 'static {}

impl ErrorKind {
    /// Returns a new [`ErrorKind::Message`] instance with the message provided.
    pub(crate) fn message<S: Display>(message: S) -> Self {
        Self::Message(message.to_string())
    }
}

impl From<&'static str> for ErrorKind {
    fn from(message: &'static str) -> Self {
        Self::message(message)
    }
}

impl From<String> for ErrorKind {
    fn from(message: String) -> Self {
        Self::message(message)
    }
}
