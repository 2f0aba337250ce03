//! Transactional scopes: one commit/rollback boundary over sends and receives.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quay_core::{
    Destination, Error, Message, MessageId, MessagePayload, QueueKey, Result, TransactionId,
};
use quay_store::QueueStore;

use crate::ambient::{AmbientTransaction, TransactionParticipant};
use crate::registry::QueueRegistry;

/// Lifecycle of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Open,
    /// Committed by the caller; waiting for the ambient transaction.
    CommitPending,
    Committed,
    RolledBack,
}

impl ScopeState {
    const fn is_final(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

pub(crate) struct ScopeInner {
    id: TransactionId,
    store: Arc<QueueStore>,
    registry: Arc<QueueRegistry>,
    state: Mutex<ScopeState>,
    enlisted: bool,
}

impl ScopeInner {
    fn state(&self) -> Result<ScopeState> {
        self.state
            .lock()
            .map(|s| *s)
            .map_err(|_| Error::scope_misuse(self.id.to_string(), "scope state poisoned"))
    }

    fn set_state(&self, next: ScopeState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state()? {
            ScopeState::Open => Ok(()),
            other => Err(Error::scope_misuse(
                self.id.to_string(),
                format!("scope is {other:?}"),
            )),
        }
    }

    /// Atomically move from `from` to `to`.
    fn transition(&self, from: ScopeState, to: ScopeState) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::scope_misuse(self.id.to_string(), "scope state poisoned"))?;
        if *state != from {
            return Err(Error::scope_misuse(
                self.id.to_string(),
                format!("scope is {:?}, expected {from:?}", *state),
            ));
        }
        *state = to;
        Ok(())
    }

    fn commit_store(&self, from: ScopeState) -> Result<()> {
        self.transition(from, ScopeState::Committed)?;
        if let Err(e) = self.store.commit(self.id) {
            // The store released this scope's reservations already.
            self.set_state(ScopeState::RolledBack);
            return Err(e);
        }
        Ok(())
    }

    fn rollback_store(&self, from: ScopeState) -> Result<()> {
        self.transition(from, ScopeState::RolledBack)?;
        self.store.rollback(self.id)
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let unresolved = self.state().is_ok_and(|s| !s.is_final());
        if unresolved {
            if let Err(e) = self.store.rollback(self.id) {
                if !matches!(e, Error::ShutDown) {
                    tracing::warn!(transaction_id = %self.id, error = %e, "Rollback on drop failed");
                }
            }
        }
    }
}

/// An atomic unit of queue mutations.
///
/// Dropping a scope that was never committed rolls it back.
#[derive(Clone)]
pub struct TransactionalScope {
    inner: Arc<ScopeInner>,
}

impl std::fmt::Debug for TransactionalScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalScope")
            .field("id", &self.inner.id)
            .field("enlisted", &self.inner.enlisted)
            .field("state", &self.inner.state().ok())
            .finish()
    }
}

impl TransactionalScope {
    pub(crate) fn begin(store: Arc<QueueStore>, registry: Arc<QueueRegistry>) -> Result<Self> {
        let id = store.begin()?;
        Ok(Self {
            inner: Arc::new(ScopeInner {
                id,
                store,
                registry,
                state: Mutex::new(ScopeState::Open),
                enlisted: false,
            }),
        })
    }

    pub(crate) fn begin_in(
        store: Arc<QueueStore>,
        registry: Arc<QueueRegistry>,
        ambient: &AmbientTransaction,
    ) -> Result<Self> {
        let id = store.begin()?;
        let inner = Arc::new(ScopeInner {
            id,
            store,
            registry,
            state: Mutex::new(ScopeState::Open),
            enlisted: true,
        });
        ambient.enlist(Arc::new(EnlistedScope(Arc::clone(&inner))))?;
        Ok(Self { inner })
    }

    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    #[must_use]
    pub fn is_enlisted(&self) -> bool {
        self.inner.enlisted
    }

    /// Current state.
    ///
    /// # Errors
    ///
    /// Returns `ScopeMisuse` if the state lock is poisoned.
    pub fn state(&self) -> Result<ScopeState> {
        self.inner.state()
    }

    /// Stage a send to `destination`; nothing leaves until commit.
    ///
    /// # Errors
    ///
    /// Returns `ScopeMisuse` on a finalized scope.
    pub fn send(&self, destination: &Destination, payload: MessagePayload) -> Result<MessageId> {
        self.inner.ensure_open()?;
        let message = Message::new(destination.queue.clone(), payload);
        self.inner
            .store
            .persist_outgoing(self.inner.id, destination.endpoint.clone(), message)
    }

    /// Stage a message straight into a local queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound` for an unknown queue when auto-creation is off,
    /// or `ScopeMisuse` on a finalized scope.
    pub fn enqueue_local(&self, queue: &QueueKey, payload: MessagePayload) -> Result<MessageId> {
        self.inner.ensure_open()?;
        self.inner.registry.resolve(queue)?;
        let message = Message::new(queue.clone(), payload);
        self.inner.store.enqueue_local(self.inner.id, message)
    }

    /// Reserve the next available message of `queue` under this scope, if any.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound` or `ScopeMisuse`.
    pub fn try_receive(&self, queue: &QueueKey) -> Result<Option<Message>> {
        self.inner.ensure_open()?;
        self.inner.registry.resolve(queue)?;
        self.inner.store.dequeue_incoming(self.inner.id, queue)
    }

    /// On commit, move a message received by this scope to `subqueue`.
    ///
    /// # Errors
    ///
    /// Returns `ScopeMisuse` if this scope does not hold `message`.
    pub fn move_to(&self, message: &Message, subqueue: &str) -> Result<()> {
        self.inner.ensure_open()?;
        let target = message.queue.root().with_subqueue(subqueue)?;
        self.inner.registry.resolve(&target)?;
        self.inner.store.move_to(self.inner.id, message, subqueue)
    }

    /// Commit now, or, when enlisted, when the ambient transaction commits.
    ///
    /// # Errors
    ///
    /// Returns `ScopeMisuse` if the scope was already finalized, or the
    /// storage error that rolled it back.
    pub fn commit(&self) -> Result<()> {
        if self.inner.enlisted {
            return self
                .inner
                .transition(ScopeState::Open, ScopeState::CommitPending);
        }
        self.inner.commit_store(ScopeState::Open)
    }

    /// Discard staged sends and return received messages to their queues.
    ///
    /// # Errors
    ///
    /// Returns `ScopeMisuse` if the scope was already committed or rolled back.
    pub fn rollback(&self) -> Result<()> {
        self.inner.rollback_store(ScopeState::Open)
    }
}

/// Two-phase participant wrapping an enlisted scope.
struct EnlistedScope(Arc<ScopeInner>);

#[async_trait]
impl TransactionParticipant for EnlistedScope {
    fn name(&self) -> String {
        format!("queue-scope-{}", self.0.id)
    }

    async fn prepare(&self) -> Result<()> {
        match self.0.state()? {
            ScopeState::CommitPending => self.0.store.prepare(self.0.id),
            other => Err(Error::scope_misuse(
                self.0.id.to_string(),
                format!("scope is {other:?} at prepare"),
            )),
        }
    }

    async fn commit(&self) -> Result<()> {
        self.0.commit_store(ScopeState::CommitPending)
    }

    async fn rollback(&self) -> Result<()> {
        match self.0.state()? {
            state if state.is_final() => Ok(()),
            state => self.0.rollback_store(state),
        }
    }
}
