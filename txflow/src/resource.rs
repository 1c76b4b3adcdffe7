use std::{
    any::Any,
    fmt::Debug,
    hash::{Hash, Hasher},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{Error, ErrorKind};

/// A resource that transactional values can be bound to, such as a connection
/// pool or a session factory.
///
/// Resources are compared by identity. Wrappers that proxy another resource
/// should return the wrapped resource from
/// [`wrapped_resource()`](Self::wrapped_resource) so that bindings made
/// through the wrapper and through the target are treated as the same
/// binding.
pub trait TransactionalResource: Debug + Send + Sync + 'static {
    /// Returns the resource this resource transparently wraps, if any.
    fn wrapped_resource(&self) -> Option<ResourceKey> {
        None
    }
}

/// A handle identifying a [`TransactionalResource`].
#[derive(Clone, Debug)]
pub struct ResourceKey(Arc<dyn TransactionalResource>);

impl ResourceKey {
    /// Returns a key for a newly shared `resource`.
    pub fn new<R: TransactionalResource>(resource: R) -> Self {
        Self(Arc::new(resource))
    }

    /// Returns a key for an already shared `resource`. Keys created from
    /// clones of the same `Arc` are equal.
    #[must_use]
    pub fn from_arc(resource: Arc<dyn TransactionalResource>) -> Self {
        Self(resource)
    }

    /// Returns the resource this key refers to.
    #[must_use]
    pub fn resource(&self) -> &dyn TransactionalResource {
        self.0.as_ref()
    }

    /// Follows wrapped resources until reaching one that wraps nothing.
    #[must_use]
    pub fn unwrapped(&self) -> Self {
        let mut current = self.clone();
        while let Some(inner) = current.0.wrapped_resource() {
            current = inner;
        }
        current
    }

    fn address(&self) -> *const () {
        Arc::as_ptr(&self.0).cast::<()>()
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for ResourceKey {}

impl Hash for ResourceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

/// A value that can be bound to a [`ResourceKey`] in a
/// [`TransactionContext`](crate::TransactionContext).
pub trait Bindable: Any + Debug + Send + Sync {
    /// Returns `self` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Returns true if the value has been unbound from its transaction. Void
    /// values are treated as absent by lookups.
    fn is_void(&self) -> bool {
        false
    }
}

/// Lifecycle state for a resource bound to a transaction.
///
/// Clones share the same state, which allows a holder to be bound in a
/// context while a backend transaction object keeps its own handle to it.
#[derive(Clone, Debug, Default)]
pub struct ResourceHolder {
    state: Arc<Mutex<HolderState>>,
}

#[derive(Debug, Default)]
struct HolderState {
    synchronized_with_transaction: bool,
    rollback_only: bool,
    deadline: Option<Instant>,
    reference_count: usize,
    void: bool,
}

impl ResourceHolder {
    /// Returns a new, unreferenced holder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the resource as synchronized with a transaction.
    pub fn set_synchronized_with_transaction(&self, synchronized: bool) {
        self.state.lock().synchronized_with_transaction = synchronized;
    }

    /// Returns true if the resource is synchronized with a transaction.
    #[must_use]
    pub fn is_synchronized_with_transaction(&self) -> bool {
        self.state.lock().synchronized_with_transaction
    }

    /// Marks the resource transaction as rollback-only.
    pub fn set_rollback_only(&self) {
        self.state.lock().rollback_only = true;
    }

    /// Clears the rollback-only flag.
    pub fn reset_rollback_only(&self) {
        self.state.lock().rollback_only = false;
    }

    /// Returns true if the resource transaction is rollback-only.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.state.lock().rollback_only
    }

    /// Sets the deadline `seconds` from now.
    pub fn set_timeout_seconds(&self, seconds: u32) {
        self.set_timeout(Duration::from_secs(u64::from(seconds)));
    }

    /// Sets the deadline `timeout` from now.
    pub fn set_timeout(&self, timeout: Duration) {
        self.state.lock().deadline = Some(Instant::now() + timeout);
    }

    /// Returns true if a deadline is set.
    #[must_use]
    pub fn has_timeout(&self) -> bool {
        self.state.lock().deadline.is_some()
    }

    /// Returns the deadline, if set.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().deadline
    }

    /// Returns the time remaining before the deadline, rounded up to whole
    /// seconds.
    ///
    /// If the deadline has passed, the holder is marked rollback-only and
    /// [`ErrorKind::TimedOut`] is returned.
    pub fn time_to_live_seconds(&self) -> Result<u64, Error> {
        let remaining = self.time_to_live()?;
        let seconds = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        Ok(seconds)
    }

    /// Returns the time remaining before the deadline.
    ///
    /// Fails with [`ErrorKind::IllegalState`] if no deadline is set, and with
    /// [`ErrorKind::TimedOut`] (after marking the holder rollback-only) if the
    /// deadline has passed.
    pub fn time_to_live(&self) -> Result<Duration, Error> {
        let mut state = self.state.lock();
        let deadline = state.deadline.ok_or_else(|| {
            Error::illegal_state("no timeout specified for this resource holder")
        })?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            state.rollback_only = true;
            return Err(Error::from(ErrorKind::TimedOut(format!(
                "deadline was {deadline:?}"
            ))));
        }
        Ok(remaining)
    }

    /// Fails with [`ErrorKind::TimedOut`] if a deadline is set and has
    /// passed.
    pub fn check_timeout(&self) -> Result<(), Error> {
        if self.has_timeout() {
            self.time_to_live().map(|_| ())
        } else {
            Ok(())
        }
    }

    /// Increments the reference count.
    pub fn requested(&self) {
        self.state.lock().reference_count += 1;
    }

    /// Decrements the reference count.
    pub fn released(&self) {
        let mut state = self.state.lock();
        state.reference_count = state.reference_count.saturating_sub(1);
    }

    /// Returns true while at least one request has not been released.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().reference_count > 0
    }

    /// Returns the current reference count.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.state.lock().reference_count
    }

    /// Clears the transactional state, keeping the reference count.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.synchronized_with_transaction = false;
        state.rollback_only = false;
        state.deadline = None;
    }

    /// Clears the transactional state and the reference count.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.synchronized_with_transaction = false;
        state.rollback_only = false;
        state.deadline = None;
        state.reference_count = 0;
    }

    /// Notes that this holder has been unbound from its transaction.
    pub fn unbound(&self) {
        self.state.lock().void = true;
    }

    /// Returns true if this holder has been unbound.
    #[must_use]
    pub fn is_void(&self) -> bool {
        self.state.lock().void
    }

    /// Returns true if both handles share the same state.
    #[must_use]
    pub fn same_holder(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Bindable for ResourceHolder {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_void(&self) -> bool {
        ResourceHolder::is_void(self)
    }
}
