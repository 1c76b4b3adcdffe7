use std::{
    any::Any,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    resource::Bindable, Error, ResourceHolder, ResourceKey, Savepoint, SavepointManager,
    SmartTransactionObject, Synchronization, TransactionBackend, TransactionContext,
    TransactionDefinition, TransactionObject, TransactionStatus, TransactionalResource,
    CompletionStatus, TIMEOUT_DEFAULT,
};

/// An ordered record of backend and synchronization calls, shared between
/// every participant of a test.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|logged| *logged == entry).count()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("injected {0} failure")]
pub struct Injected(pub &'static str);

#[derive(Debug, Default, Clone, Copy)]
pub struct Failures {
    pub begin: bool,
    pub commit: bool,
    pub rollback: bool,
    pub suspend: bool,
    pub resume: bool,
    pub release_savepoint: bool,
}

#[derive(Debug)]
pub struct Store;

impl TransactionalResource for Store {}

/// A connection bound to the context while a [`MemoryBackend`] transaction
/// runs.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: u64,
    pub holder: ResourceHolder,
    active: Arc<AtomicBool>,
    savepoints: Arc<AtomicU64>,
}

impl Connection {
    fn open(id: u64) -> Self {
        Self {
            id,
            holder: ResourceHolder::new(),
            active: Arc::new(AtomicBool::new(false)),
            savepoints: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Bindable for Connection {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_void(&self) -> bool {
        self.holder.is_void()
    }
}

impl AsRef<ResourceHolder> for Connection {
    fn as_ref(&self) -> &ResourceHolder {
        &self.holder
    }
}

pub struct MemoryTransaction {
    pub connection: Option<Connection>,
    new_connection: bool,
    savepoints: bool,
    log: CallLog,
    failures: Arc<Mutex<Failures>>,
}

impl MemoryTransaction {
    fn connection_id(&self) -> u64 {
        self.connection.as_ref().map_or(0, |connection| connection.id)
    }
}

impl TransactionObject for MemoryTransaction {
    fn savepoint_manager(&mut self) -> Option<&mut dyn SavepointManager> {
        if self.savepoints && self.connection.is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn smart(&self) -> Option<&dyn SmartTransactionObject> {
        Some(self)
    }
}

impl SmartTransactionObject for MemoryTransaction {
    fn is_rollback_only(&self) -> bool {
        self.connection
            .as_ref()
            .map_or(false, |connection| connection.holder.is_rollback_only())
    }

    fn flush(&self) -> Result<(), Error> {
        self.log.push(format!("flush {}", self.connection_id()));
        Ok(())
    }
}

impl SavepointManager for MemoryTransaction {
    fn create_savepoint(&mut self) -> Result<Savepoint, Error> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| Error::from("no connection"))?;
        let savepoint = Savepoint::new(connection.savepoints.fetch_add(1, Ordering::SeqCst) + 1);
        self.log.push(format!("savepoint {savepoint}"));
        Ok(savepoint)
    }

    fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), Error> {
        self.log.push(format!("rollback_to {savepoint}"));
        Ok(())
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), Error> {
        if self.failures.lock().release_savepoint {
            return Err(Error::backend(Injected("release")));
        }
        self.log.push(format!("release {savepoint}"));
        Ok(())
    }
}

/// A connection-per-transaction backend that records every call it
/// receives.
#[derive(Debug)]
pub struct MemoryBackend {
    key: ResourceKey,
    log: CallLog,
    failures: Arc<Mutex<Failures>>,
    next_connection: AtomicU64,
    savepoints: bool,
    use_savepoints: bool,
    commit_on_global_rollback_only: bool,
}

impl MemoryBackend {
    pub fn new(log: &CallLog) -> Self {
        Self {
            key: ResourceKey::new(Store),
            log: log.clone(),
            failures: Arc::default(),
            next_connection: AtomicU64::new(0),
            savepoints: true,
            use_savepoints: true,
            commit_on_global_rollback_only: false,
        }
    }

    /// Uses `key` instead of a new one, so that two backends see the same
    /// connections.
    pub fn with_key(mut self, key: ResourceKey) -> Self {
        self.key = key;
        self
    }

    /// Transaction objects no longer expose a savepoint capability.
    pub const fn without_savepoints(mut self) -> Self {
        self.savepoints = false;
        self
    }

    /// Nested transactions issue a nested begin instead of a savepoint.
    pub const fn nested_with_begin(mut self) -> Self {
        self.use_savepoints = false;
        self
    }

    pub const fn committing_on_global_rollback_only(mut self) -> Self {
        self.commit_on_global_rollback_only = true;
        self
    }

    pub const fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn fail(&self, configure: impl FnOnce(&mut Failures)) {
        configure(&mut self.failures.lock());
    }

    fn check(&self, failure: impl FnOnce(&Failures) -> bool, operation: &'static str) -> Result<(), Error> {
        if failure(&self.failures.lock()) {
            Err(Error::backend(Injected(operation)))
        } else {
            Ok(())
        }
    }

    fn status_connection(status: &TransactionStatus<Self>) -> Option<&Connection> {
        status
            .transaction()
            .and_then(|transaction| transaction.connection.as_ref())
    }
}

impl TransactionBackend for MemoryBackend {
    type Transaction = MemoryTransaction;
    type Suspended = Arc<dyn Bindable>;

    fn get_transaction(&self, context: &mut TransactionContext) -> Result<MemoryTransaction, Error> {
        Ok(MemoryTransaction {
            connection: context.resource::<Connection>(&self.key),
            new_connection: false,
            savepoints: self.savepoints,
            log: self.log.clone(),
            failures: self.failures.clone(),
        })
    }

    fn is_existing_transaction(&self, transaction: &MemoryTransaction) -> Result<bool, Error> {
        Ok(transaction
            .connection
            .as_ref()
            .map_or(false, Connection::is_active))
    }

    fn use_savepoint_for_nested_transaction(&self) -> bool {
        self.use_savepoints
    }

    fn begin(
        &self,
        context: &mut TransactionContext,
        transaction: &mut MemoryTransaction,
        definition: &TransactionDefinition,
    ) -> Result<(), Error> {
        self.check(|failures| failures.begin, "begin")?;
        if let Some(connection) = transaction.connection.as_ref().filter(|c| c.is_active()) {
            self.log.push(format!("begin nested {}", connection.id));
            return Ok(());
        }

        let id = self.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Connection::open(id);
        connection.holder.set_synchronized_with_transaction(true);
        if definition.timeout > 0 {
            connection
                .holder
                .set_timeout_seconds(definition.timeout.unsigned_abs());
        }
        connection.active.store(true, Ordering::SeqCst);
        context.bind_resource(&self.key, connection.clone())?;

        if definition.timeout == TIMEOUT_DEFAULT {
            self.log.push(format!("begin {id}"));
        } else {
            self.log
                .push(format!("begin {id} timeout {}", definition.timeout));
        }
        transaction.connection = Some(connection);
        transaction.new_connection = true;
        Ok(())
    }

    fn suspend(
        &self,
        context: &mut TransactionContext,
        transaction: &mut MemoryTransaction,
    ) -> Result<Self::Suspended, Error> {
        self.check(|failures| failures.suspend, "suspend")?;
        let id = transaction.connection_id();
        transaction.connection = None;
        let suspended = context.unbind_resource(&self.key)?;
        self.log.push(format!("suspend {id}"));
        Ok(suspended)
    }

    fn resume(
        &self,
        context: &mut TransactionContext,
        _transaction: Option<&mut MemoryTransaction>,
        suspended: Self::Suspended,
    ) -> Result<(), Error> {
        self.check(|failures| failures.resume, "resume")?;
        let id = suspended
            .as_any()
            .downcast_ref::<Connection>()
            .map_or(0, |connection| connection.id);
        context.bind_shared_resource(&self.key, suspended)?;
        self.log.push(format!("resume {id}"));
        Ok(())
    }

    fn should_commit_on_global_rollback_only(&self) -> bool {
        self.commit_on_global_rollback_only
    }

    fn commit(
        &self,
        _context: &mut TransactionContext,
        status: &mut TransactionStatus<Self>,
    ) -> Result<(), Error> {
        self.check(|failures| failures.commit, "commit")?;
        let id = Self::status_connection(status).map_or(0, |connection| connection.id);
        self.log.push(format!("commit {id}"));
        Ok(())
    }

    fn rollback(
        &self,
        _context: &mut TransactionContext,
        status: &mut TransactionStatus<Self>,
    ) -> Result<(), Error> {
        self.check(|failures| failures.rollback, "rollback")?;
        let id = Self::status_connection(status).map_or(0, |connection| connection.id);
        self.log.push(format!("rollback {id}"));
        Ok(())
    }

    fn set_rollback_only(
        &self,
        _context: &mut TransactionContext,
        status: &mut TransactionStatus<Self>,
    ) -> Result<(), Error> {
        if let Some(connection) = Self::status_connection(status) {
            connection.holder.set_rollback_only();
            self.log.push(format!("set_rollback_only {}", connection.id));
        }
        Ok(())
    }

    fn cleanup_after_completion(
        &self,
        context: &mut TransactionContext,
        transaction: &mut MemoryTransaction,
    ) {
        if !transaction.new_connection {
            return;
        }
        if let Some(connection) = transaction.connection.as_ref() {
            context.unbind_resource_if_possible(&self.key);
            connection.active.store(false, Ordering::SeqCst);
            connection.holder.clear();
            self.log.push(format!("cleanup {}", connection.id));
        }
    }
}

/// A synchronization that records every callback in a [`CallLog`].
pub struct Recording {
    label: &'static str,
    order: Option<i32>,
    log: CallLog,
    fail_before_commit: bool,
    fail_after_commit: bool,
    fail_after_completion: bool,
    register_on_before_commit: Mutex<Option<Arc<dyn Synchronization>>>,
}

impl Recording {
    pub fn new(label: &'static str, log: &CallLog) -> Self {
        Self {
            label,
            order: None,
            log: log.clone(),
            fail_before_commit: false,
            fail_after_commit: false,
            fail_after_completion: false,
            register_on_before_commit: Mutex::new(None),
        }
    }

    pub const fn with_order(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }

    pub const fn failing_before_commit(mut self) -> Self {
        self.fail_before_commit = true;
        self
    }

    pub const fn failing_after_commit(mut self) -> Self {
        self.fail_after_commit = true;
        self
    }

    pub const fn failing_after_completion(mut self) -> Self {
        self.fail_after_completion = true;
        self
    }

    pub fn registering_on_before_commit(self, synchronization: Arc<dyn Synchronization>) -> Self {
        *self.register_on_before_commit.lock() = Some(synchronization);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn record(&self, event: &str) {
        self.log.push(format!("{}: {event}", self.label));
    }
}

impl Synchronization for Recording {
    fn order(&self) -> Option<i32> {
        self.order
    }

    fn suspend(&self, _context: &mut TransactionContext) -> Result<(), Error> {
        self.record("suspend");
        Ok(())
    }

    fn resume(&self, _context: &mut TransactionContext) -> Result<(), Error> {
        self.record("resume");
        Ok(())
    }

    fn flush(&self, _context: &mut TransactionContext) -> Result<(), Error> {
        self.record("flush");
        Ok(())
    }

    fn before_commit(&self, context: &mut TransactionContext, read_only: bool) -> Result<(), Error> {
        if read_only {
            self.record("before_commit read-only");
        } else {
            self.record("before_commit");
        }
        if let Some(late) = self.register_on_before_commit.lock().take() {
            context.register_synchronization(late)?;
        }
        if self.fail_before_commit {
            return Err(Error::synchronization(Injected("before_commit")));
        }
        Ok(())
    }

    fn before_completion(&self, _context: &mut TransactionContext) -> Result<(), Error> {
        self.record("before_completion");
        Ok(())
    }

    fn after_commit(&self, _context: &mut TransactionContext) -> Result<(), Error> {
        self.record("after_commit");
        if self.fail_after_commit {
            return Err(Error::synchronization(Injected("after_commit")));
        }
        Ok(())
    }

    fn after_completion(
        &self,
        _context: &mut TransactionContext,
        status: CompletionStatus,
    ) -> Result<(), Error> {
        self.record(&format!("after_completion {status:?}"));
        if self.fail_after_completion {
            return Err(Error::synchronization(Injected("after_completion")));
        }
        Ok(())
    }
}
