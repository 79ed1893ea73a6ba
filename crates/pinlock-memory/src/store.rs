use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use pinlock_common::{AcquireTimeout, LockKey, LockQuery, Session, SessionId, StoreError};
use tokio::{
    sync::Notify,
    time::{self, Instant},
};
use tracing::debug;

/// MySQL `ER_USER_LOCK_WRONG_NAME`.
pub const ER_USER_LOCK_WRONG_NAME: u16 = 3057;
pub const MAX_LOCK_NAME_LEN: usize = 64;

#[derive(Debug, Default)]
struct StoreState {
    owners: HashMap<LockKey, SessionId>,
    held: HashMap<SessionId, LockKey>,
    closed: HashSet<SessionId>,
    stalled: HashSet<&'static str>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<StoreState>,
    released: Notify,
    next_session: AtomicU64,
}

/// In-process store with MySQL user-level lock semantics.
///
/// A session holds at most one lock; taking a second name silently drops
/// the first. Closing or killing a session frees whatever it held.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StoreState::default()),
                released: Notify::new(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn open_session(&self) -> MemorySession {
        let id = SessionId(self.inner.next_session.fetch_add(1, Ordering::Relaxed));
        debug!(session = %id, "memory session opened");
        MemorySession {
            id,
            store: self.clone(),
        }
    }

    /// Simulates the server dropping a connection. Returns `false` if the
    /// session was already closed.
    pub fn kill(&self, session: SessionId) -> bool {
        let newly_closed = {
            let mut state = self.state_or_recover();
            let newly_closed = state.closed.insert(session);
            release_all(&mut state, session);
            newly_closed
        };
        self.inner.released.notify_waiters();
        debug!(session = %session, newly_closed, "memory session killed");
        newly_closed
    }

    /// Makes every later call to `function` (`"GET_LOCK"`, `"RELEASE_LOCK"`,
    /// ...) hang until the caller gives up on it.
    pub fn stall(&self, function: &'static str) {
        self.state_or_recover().stalled.insert(function);
    }

    pub fn resume(&self, function: &'static str) {
        self.state_or_recover().stalled.remove(function);
    }

    pub fn owner(&self, key: &str) -> Option<SessionId> {
        self.state_or_recover()
            .owners
            .get(&LockKey::new(key))
            .copied()
    }

    pub fn held_by(&self, session: SessionId) -> Option<LockKey> {
        self.state_or_recover().held.get(&session).cloned()
    }

    pub fn held_count(&self) -> usize {
        self.state_or_recover().owners.len()
    }

    pub fn is_closed(&self, session: SessionId) -> bool {
        self.state_or_recover().closed.contains(&session)
    }

    async fn execute(
        &self,
        session: SessionId,
        query: &LockQuery,
    ) -> Result<Option<i64>, StoreError> {
        self.ensure_open(session)?;
        validate_name(query.key())?;
        let stalled = self.state()?.stalled.contains(query.name());
        if stalled {
            debug!(session = %session, function = query.name(), "memory store stalling call");
            std::future::pending::<()>().await;
        }

        match query {
            LockQuery::GetLock { key, timeout } => self.get_lock(session, key, *timeout).await,
            LockQuery::ReleaseLock { key } => self.release_lock(session, key),
            LockQuery::IsFreeLock { key } => {
                let state = self.state()?;
                Ok(Some(i64::from(!state.owners.contains_key(key))))
            }
            LockQuery::IsUsedLock { key } => {
                let state = self.state()?;
                Ok(state
                    .owners
                    .get(key)
                    .map(|owner| i64::try_from(owner.0).unwrap_or(i64::MAX)))
            }
        }
    }

    async fn get_lock(
        &self,
        session: SessionId,
        key: &LockKey,
        timeout: AcquireTimeout,
    ) -> Result<Option<i64>, StoreError> {
        let deadline = timeout.as_duration().map(|wait| Instant::now() + wait);

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_take(session, key)? {
                return Ok(Some(1));
            }

            match deadline {
                Some(deadline) => {
                    if time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(Some(0));
                    }
                }
                None => notified.await,
            }
        }
    }

    fn try_take(&self, session: SessionId, key: &LockKey) -> Result<bool, StoreError> {
        let revoked = {
            let mut state = self.state()?;
            if state.closed.contains(&session) {
                return Err(StoreError::Closed(session));
            }

            match state.owners.get(key).copied() {
                Some(owner) if owner == session => return Ok(true),
                Some(_) => return Ok(false),
                None => {}
            }

            let previous = state.held.insert(session, key.clone());
            if let Some(previous) = &previous {
                state.owners.remove(previous);
            }
            state.owners.insert(key.clone(), session);
            previous
        };

        if let Some(previous) = revoked {
            debug!(session = %session, previous = %previous, key = %key, "second GET_LOCK revoked earlier lock");
            self.inner.released.notify_waiters();
        }
        Ok(true)
    }

    fn release_lock(&self, session: SessionId, key: &LockKey) -> Result<Option<i64>, StoreError> {
        {
            let mut state = self.state()?;
            match state.owners.get(key).copied() {
                None => return Ok(None),
                Some(owner) if owner != session => return Ok(Some(0)),
                Some(_) => {
                    state.owners.remove(key);
                    state.held.remove(&session);
                }
            }
        }

        self.inner.released.notify_waiters();
        Ok(Some(1))
    }

    fn teardown(&self, session: SessionId) {
        let released = {
            let mut state = self.state_or_recover();
            state.closed.remove(&session);
            release_all(&mut state, session)
        };
        if released {
            self.inner.released.notify_waiters();
        }
    }

    fn ensure_open(&self, session: SessionId) -> Result<(), StoreError> {
        if self.state()?.closed.contains(&session) {
            return Err(StoreError::Closed(session));
        }
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.inner
            .state
            .lock()
            .map_err(|_| StoreError::Connection("memory store state poisoned".to_string()))
    }

    fn state_or_recover(&self) -> MutexGuard<'_, StoreState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn release_all(state: &mut StoreState, session: SessionId) -> bool {
    match state.held.remove(&session) {
        Some(key) => {
            state.owners.remove(&key);
            true
        }
        None => false,
    }
}

fn validate_name(key: &LockKey) -> Result<(), StoreError> {
    if key.is_empty() || key.as_str().chars().count() > MAX_LOCK_NAME_LEN {
        return Err(StoreError::InvalidKey {
            code: ER_USER_LOCK_WRONG_NAME,
            message: format!("Incorrect user-level lock name '{key}'."),
        });
    }
    Ok(())
}

/// Connection to a [`MemoryStore`]. Dropping it closes the session.
#[derive(Debug)]
pub struct MemorySession {
    id: SessionId,
    store: MemoryStore,
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.store.is_closed(self.id)
    }

    async fn query(&mut self, query: &LockQuery) -> Result<Option<i64>, StoreError> {
        self.store.execute(self.id, query).await
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.store.teardown(self.id);
    }
}
