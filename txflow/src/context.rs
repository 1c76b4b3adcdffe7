use std::{collections::HashMap, fmt::Debug, sync::Arc};

use crate::{
    resource::Bindable, synchronization, Error, ErrorKind, Isolation, ResourceKey,
    Synchronization,
};

/// The registry of transactional state for one logical execution context.
///
/// A context holds the resources bound to the current transaction, the
/// synchronizations registered with it, and the characteristics of the
/// transaction scope that is currently active. Every
/// [`TransactionManager`](crate::TransactionManager) operation takes the
/// context explicitly; two contexts never share state.
#[derive(Default)]
#[must_use]
pub struct TransactionContext {
    resources: Option<HashMap<ResourceKey, Arc<dyn Bindable>>>,
    synchronizations: Option<Vec<Arc<dyn Synchronization>>>,
    name: Option<String>,
    read_only: bool,
    isolation: Option<Isolation>,
    actual_transaction_active: bool,
}

impl Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("resources", &self.resources)
            .field(
                "synchronizations",
                &self.synchronizations.as_ref().map(Vec::len),
            )
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("isolation", &self.isolation)
            .field("actual_transaction_active", &self.actual_transaction_active)
            .finish()
    }
}

impl TransactionContext {
    /// Returns an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a live value is bound for `key`.
    pub fn has_resource(&mut self, key: &ResourceKey) -> bool {
        self.get_resource(key).is_some()
    }

    /// Returns the value bound for `key`, if any.
    ///
    /// Values that report themselves as void are removed and treated as
    /// absent.
    pub fn get_resource(&mut self, key: &ResourceKey) -> Option<Arc<dyn Bindable>> {
        let key = key.unwrapped();
        let resources = self.resources.as_mut()?;
        let value = resources.get(&key)?.clone();
        if value.is_void() {
            resources.remove(&key);
            if resources.is_empty() {
                self.resources = None;
            }
            return None;
        }
        tracing::trace!(?key, "retrieved bound value");
        Some(value)
    }

    /// Returns a clone of the value bound for `key` if it is a `T`.
    pub fn resource<T: Bindable + Clone>(&mut self, key: &ResourceKey) -> Option<T> {
        self.get_resource(key)
            .and_then(|value| value.as_any().downcast_ref::<T>().cloned())
    }

    /// Binds `value` to `key`.
    ///
    /// Fails with [`ErrorKind::AlreadyBound`] if a live value is already bound
    /// for the key. A void value is silently replaced.
    pub fn bind_resource<V: Bindable>(&mut self, key: &ResourceKey, value: V) -> Result<(), Error> {
        self.bind_shared_resource(key, Arc::new(value))
    }

    /// Binds an already shared `value` to `key`.
    pub fn bind_shared_resource(
        &mut self,
        key: &ResourceKey,
        value: Arc<dyn Bindable>,
    ) -> Result<(), Error> {
        let key = key.unwrapped();
        let resources = self.resources.get_or_insert_with(HashMap::new);
        if let Some(existing) = resources.get(&key) {
            if !existing.is_void() {
                return Err(Error::from(ErrorKind::AlreadyBound(format!(
                    "{:?}",
                    key.resource()
                ))));
            }
        }
        tracing::trace!(?key, "bound value");
        resources.insert(key, value);
        Ok(())
    }

    /// Removes and returns the value bound for `key`.
    ///
    /// Fails with [`ErrorKind::NotBound`] if no live value is bound.
    pub fn unbind_resource(&mut self, key: &ResourceKey) -> Result<Arc<dyn Bindable>, Error> {
        self.unbind_resource_if_possible(key).ok_or_else(|| {
            Error::from(ErrorKind::NotBound(format!("{:?}", key.unwrapped().resource())))
        })
    }

    /// Removes and returns the value bound for `key`, if any.
    pub fn unbind_resource_if_possible(&mut self, key: &ResourceKey) -> Option<Arc<dyn Bindable>> {
        let key = key.unwrapped();
        let resources = self.resources.as_mut()?;
        let value = resources.remove(&key);
        if resources.is_empty() {
            self.resources = None;
        }
        let value = value.filter(|value| !value.is_void())?;
        tracing::trace!(?key, "unbound value");
        Some(value)
    }

    /// Returns a snapshot of every bound value, including void ones.
    #[must_use]
    pub fn resource_map(&self) -> HashMap<ResourceKey, Arc<dyn Bindable>> {
        self.resources.clone().unwrap_or_default()
    }

    /// Returns true if synchronizations can be registered.
    #[must_use]
    pub const fn is_synchronization_active(&self) -> bool {
        self.synchronizations.is_some()
    }

    /// Activates synchronization.
    ///
    /// Fails with [`ErrorKind::IllegalState`] if synchronization is already
    /// active.
    pub fn init_synchronization(&mut self) -> Result<(), Error> {
        if self.is_synchronization_active() {
            return Err(Error::illegal_state(
                "cannot activate transaction synchronization: already active",
            ));
        }
        tracing::trace!("initializing transaction synchronization");
        self.synchronizations = Some(Vec::new());
        Ok(())
    }

    /// Deactivates synchronization, dropping every registered
    /// synchronization.
    ///
    /// Fails with [`ErrorKind::IllegalState`] if synchronization is not
    /// active.
    pub fn clear_synchronization(&mut self) -> Result<(), Error> {
        if self.synchronizations.take().is_none() {
            return Err(Error::illegal_state(
                "cannot deactivate transaction synchronization: not active",
            ));
        }
        tracing::trace!("clearing transaction synchronization");
        Ok(())
    }

    /// Registers `synchronization` with the current scope.
    ///
    /// Fails with [`ErrorKind::SynchronizationNotActive`] if synchronization
    /// is not active.
    pub fn register_synchronization(
        &mut self,
        synchronization: Arc<dyn Synchronization>,
    ) -> Result<(), Error> {
        let synchronizations = self
            .synchronizations
            .as_mut()
            .ok_or_else(|| Error::from(ErrorKind::SynchronizationNotActive))?;
        synchronizations.push(synchronization);
        Ok(())
    }

    /// Returns the registered synchronizations in priority order.
    ///
    /// Synchronizations with an explicit order come first, lowest order
    /// first. Registration order is kept among equal priorities. Fails with
    /// [`ErrorKind::IllegalState`] if synchronization is not active.
    pub fn synchronizations(&self) -> Result<Vec<Arc<dyn Synchronization>>, Error> {
        let synchronizations = self
            .synchronizations
            .as_ref()
            .ok_or_else(|| Error::illegal_state("transaction synchronization is not active"))?;
        let mut sorted = synchronizations.clone();
        sorted.sort_by_key(|synchronization| {
            synchronization
                .order()
                .map_or((1, 0), |order| (0, order))
        });
        Ok(sorted)
    }

    /// Returns the registered synchronizations in priority order and
    /// deactivates synchronization.
    pub(crate) fn take_synchronizations(&mut self) -> Vec<Arc<dyn Synchronization>> {
        let synchronizations = self.synchronizations().unwrap_or_default();
        self.synchronizations = None;
        synchronizations
    }

    /// Invokes [`Synchronization::flush`] on every registered
    /// synchronization.
    pub fn trigger_flush(&mut self) -> Result<(), Error> {
        synchronization::trigger_flush(self)
    }

    /// Exposes the name of the current transaction.
    pub fn set_current_transaction_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    /// Returns the name of the current transaction, if any.
    #[must_use]
    pub fn current_transaction_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Exposes whether the current transaction is read-only.
    pub fn set_current_transaction_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Returns true if the current transaction is read-only.
    #[must_use]
    pub const fn is_current_transaction_read_only(&self) -> bool {
        self.read_only
    }

    /// Exposes the isolation level of the current transaction. `None`
    /// resets to the backend default.
    pub fn set_current_transaction_isolation(&mut self, isolation: Option<Isolation>) {
        self.isolation = isolation;
    }

    /// Returns the isolation level of the current transaction, if one was
    /// set.
    #[must_use]
    pub const fn current_transaction_isolation(&self) -> Option<Isolation> {
        self.isolation
    }

    /// Exposes whether an actual backend transaction is active.
    pub fn set_actual_transaction_active(&mut self, active: bool) {
        self.actual_transaction_active = active;
    }

    /// Returns true if an actual backend transaction is active, as opposed
    /// to a scope that only runs synchronizations.
    #[must_use]
    pub const fn is_actual_transaction_active(&self) -> bool {
        self.actual_transaction_active
    }

    /// Deactivates synchronization and resets every characteristic. Bound
    /// resources are left in place.
    pub fn clear(&mut self) {
        self.synchronizations = None;
        self.name = None;
        self.read_only = false;
        self.isolation = None;
        self.actual_transaction_active = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{ResourceHolder, TransactionalResource};

    #[derive(Debug)]
    struct Pool;

    impl TransactionalResource for Pool {}

    #[derive(Debug)]
    struct Proxy(ResourceKey);

    impl TransactionalResource for Proxy {
        fn wrapped_resource(&self) -> Option<ResourceKey> {
            Some(self.0.clone())
        }
    }

    struct Ordered {
        label: &'static str,
        order: Option<i32>,
        flushes: AtomicUsize,
    }

    impl Ordered {
        fn new(label: &'static str, order: Option<i32>) -> Arc<Self> {
            Arc::new(Self {
                label,
                order,
                flushes: AtomicUsize::new(0),
            })
        }
    }

    impl Synchronization for Ordered {
        fn order(&self) -> Option<i32> {
            self.order
        }

        fn flush(&self, _context: &mut TransactionContext) -> Result<(), Error> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn binding_twice_fails_until_unbound() {
        let mut context = TransactionContext::new();
        let key = ResourceKey::new(Pool);
        context.bind_resource(&key, ResourceHolder::new()).unwrap();
        let error = context
            .bind_resource(&key, ResourceHolder::new())
            .unwrap_err();
        assert!(matches!(error.kind, ErrorKind::AlreadyBound(_)));

        context.unbind_resource(&key).unwrap();
        assert!(!context.has_resource(&key));
        assert!(context.resource_map().is_empty());
        context.bind_resource(&key, ResourceHolder::new()).unwrap();
        assert!(context.has_resource(&key));
    }

    #[test]
    fn unbinding_missing_values() {
        let mut context = TransactionContext::new();
        let key = ResourceKey::new(Pool);
        assert!(context.unbind_resource_if_possible(&key).is_none());
        let error = context.unbind_resource(&key).unwrap_err();
        assert!(matches!(error.kind, ErrorKind::NotBound(_)));
    }

    #[test]
    fn wrapped_keys_share_bindings() {
        let mut context = TransactionContext::new();
        let pool = ResourceKey::new(Pool);
        let proxy = ResourceKey::new(Proxy(pool.clone()));
        let holder = ResourceHolder::new();
        context.bind_resource(&proxy, holder.clone()).unwrap();

        let bound = context.resource::<ResourceHolder>(&pool).unwrap();
        assert!(bound.same_holder(&holder));
        assert!(context.bind_resource(&pool, ResourceHolder::new()).is_err());
        assert!(context.unbind_resource(&pool).is_ok());
        assert!(!context.has_resource(&proxy));
    }

    #[test]
    fn void_holders_are_evicted() {
        let mut context = TransactionContext::new();
        let key = ResourceKey::new(Pool);
        let holder = ResourceHolder::new();
        context.bind_resource(&key, holder.clone()).unwrap();
        holder.unbound();

        assert_eq!(context.resource_map().len(), 1);
        assert!(context.get_resource(&key).is_none());
        assert!(context.resource_map().is_empty());

        // A void value never blocks a new binding.
        context.bind_resource(&key, holder).unwrap();
        context.bind_resource(&key, ResourceHolder::new()).unwrap();
        assert!(context.has_resource(&key));
    }

    #[test]
    fn synchronization_lifecycle() {
        let mut context = TransactionContext::new();
        assert!(!context.is_synchronization_active());
        let error = context
            .register_synchronization(Ordered::new("early", None))
            .unwrap_err();
        assert!(matches!(error.kind, ErrorKind::SynchronizationNotActive));
        assert!(context.synchronizations().is_err());
        assert!(context.clear_synchronization().is_err());

        context.init_synchronization().unwrap();
        assert!(context.init_synchronization().is_err());
        context
            .register_synchronization(Ordered::new("late", None))
            .unwrap();
        assert_eq!(context.synchronizations().unwrap().len(), 1);

        context.clear_synchronization().unwrap();
        assert!(!context.is_synchronization_active());
    }

    #[test]
    fn synchronizations_are_sorted_stably() {
        let mut context = TransactionContext::new();
        context.init_synchronization().unwrap();
        let registered = [
            Ordered::new("unordered-a", None),
            Ordered::new("late", Some(10)),
            Ordered::new("early", Some(-5)),
            Ordered::new("unordered-b", None),
            Ordered::new("late-again", Some(10)),
        ];
        for synchronization in &registered {
            context
                .register_synchronization(synchronization.clone())
                .unwrap();
        }

        context.trigger_flush().unwrap();
        assert!(registered
            .iter()
            .all(|synchronization| synchronization.flushes.load(Ordering::SeqCst) == 1));

        let sorted = context.synchronizations().unwrap();
        let orders = sorted
            .iter()
            .map(|synchronization| synchronization.order())
            .collect::<Vec<_>>();
        assert_eq!(orders, vec![Some(-5), Some(10), Some(10), None, None]);

        let labels = sorted
            .iter()
            .map(|synchronization| {
                let address = Arc::as_ptr(synchronization).cast::<()>();
                registered
                    .iter()
                    .find(|candidate| Arc::as_ptr(candidate).cast::<()>() == address)
                    .unwrap()
                    .label
            })
            .collect::<Vec<_>>();
        assert_eq!(
            labels,
            vec!["early", "late", "late-again", "unordered-a", "unordered-b"]
        );
    }

    #[test]
    fn clear_resets_characteristics_but_keeps_resources() {
        let mut context = TransactionContext::new();
        let key = ResourceKey::new(Pool);
        context.bind_resource(&key, ResourceHolder::new()).unwrap();
        context.init_synchronization().unwrap();
        context.set_current_transaction_name(Some(String::from("orders")));
        context.set_current_transaction_read_only(true);
        context.set_current_transaction_isolation(Some(Isolation::Serializable));
        context.set_actual_transaction_active(true);

        context.clear();
        assert!(!context.is_synchronization_active());
        assert_eq!(context.current_transaction_name(), None);
        assert!(!context.is_current_transaction_read_only());
        assert_eq!(context.current_transaction_isolation(), None);
        assert!(!context.is_actual_transaction_active());
        assert!(context.has_resource(&key));

        // Clearing an inactive context is not an error.
        context.clear();
    }
}
