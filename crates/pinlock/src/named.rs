use std::{sync::Arc, time::Instant};

use pinlock_common::{AcquireTimeout, LockError, LockKey, Result, SessionId, SessionPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::LockConfig,
    events::{EventSink, LockEvent, Operation, Outcome, TracingEventSink},
    primitive::{AcquireOutcome, ReleaseOutcome},
    session::SessionHandle,
};

/// Where a [`NamedLock`] is in its acquire/release cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldState {
    Unheld,
    Acquiring,
    Held,
    Releasing,
    Failed,
}

/// Ownership of a key as seen by one probe of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    HeldByOther(SessionId),
    HeldBySelf,
}

/// Cross-process mutex over one store-side user-level lock.
///
/// Each instance pins its own session while the lock is held, so the
/// `RELEASE_LOCK` always runs on the connection that ran `GET_LOCK`. An
/// instance belongs to one logical owner; give every holder its own.
pub struct NamedLock {
    key: LockKey,
    config: LockConfig,
    pool: Arc<dyn SessionPool>,
    session: Option<SessionHandle>,
    state: HoldState,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for NamedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLock")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("session", &self.session)
            .field("state", &self.state)
            .finish()
    }
}

impl NamedLock {
    pub fn new(
        pool: Arc<dyn SessionPool>,
        key: impl Into<LockKey>,
        config: LockConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            key: key.into(),
            config,
            pool,
            session: None,
            state: HoldState::Unheld,
            events: Arc::new(TracingEventSink),
        })
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn hold_state(&self) -> HoldState {
        self.state
    }

    /// Whether this instance holds the lock on a session that is still open.
    /// Once the pinned session dies the store has dropped the lock, even if
    /// [`hold_state`](Self::hold_state) still says `Held`.
    pub fn is_held(&self) -> bool {
        self.state == HoldState::Held
            && self.session.as_ref().is_some_and(SessionHandle::is_open)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(SessionHandle::id)
    }

    /// One `GET_LOCK` attempt bounded by the configured acquire timeout.
    /// `Ok(false)` means the timeout ran out while someone else held it.
    pub async fn lock(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let timeout = self.config.acquire_timeout;
        self.acquire_as(Operation::Lock, timeout, cancel).await
    }

    pub async fn try_lock(&mut self, cancel: &CancellationToken) -> Result<bool> {
        self.acquire_as(Operation::TryLock, AcquireTimeout::NO_WAIT, cancel)
            .await
    }

    /// Releases the lock on the session that took it. `Ok(false)` means
    /// there was nothing to release: never locked, already unlocked, or the
    /// session died and the store dropped the lock.
    pub async fn unlock(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let started = Instant::now();
        let session = self.session_id();
        let result = self.release_inner(cancel).await;

        let event = match &result {
            Ok(true) => self.event(Operation::Unlock, Outcome::Released, started),
            Ok(false) => self.event(Operation::Unlock, Outcome::NotHeld, started),
            Err(err) => self
                .event(Operation::Unlock, Outcome::Failed, started)
                .with_error(err),
        };
        self.events.emit(&event.with_session(session));
        result
    }

    /// Who owns the key right now, asked on a transient pool session.
    pub async fn holder(&self, cancel: &CancellationToken) -> Result<Option<SessionId>> {
        let started = Instant::now();
        let result = self.holder_inner(cancel).await;
        self.emit_probe(Operation::Holder, started, &result);
        result
    }

    pub async fn state(&self, cancel: &CancellationToken) -> Result<LockState> {
        let started = Instant::now();
        let result = self.holder_inner(cancel).await.map(|holder| match holder {
            None => LockState::Free,
            Some(owner) if Some(owner) == self.session_id() => LockState::HeldBySelf,
            Some(owner) => LockState::HeldByOther(owner),
        });
        self.emit_probe(Operation::State, started, &result);
        result
    }

    /// Advisory `IS_FREE_LOCK` probe; a `true` answer can be stale immediately.
    pub async fn is_free(&self, cancel: &CancellationToken) -> Result<bool> {
        let started = Instant::now();
        let result = self.is_free_inner(cancel).await;
        self.emit_probe(Operation::IsFree, started, &result);
        result
    }

    /// Unlocks if held and hands the session back to the pool.
    pub async fn close(mut self, cancel: &CancellationToken) -> Result<bool> {
        if self.session.is_none() {
            return Ok(false);
        }
        self.unlock(cancel).await
    }

    pub(crate) async fn acquire_as(
        &mut self,
        operation: Operation,
        timeout: AcquireTimeout,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let started = Instant::now();
        let result = self.acquire_inner(timeout, cancel).await;

        let event = match &result {
            Ok(true) => self.event(operation, Outcome::Acquired, started),
            Ok(false) => self.event(operation, Outcome::TimedOut, started),
            Err(err) => self.event(operation, Outcome::Failed, started).with_error(err),
        };
        self.events.emit(&event.with_session(self.session_id()));
        result
    }

    async fn acquire_inner(
        &mut self,
        timeout: AcquireTimeout,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if self.is_held() {
            debug!(key = %self.key, "lock already held by this instance");
            return Ok(true);
        }
        if cancel.is_cancelled() {
            return Err(self.cancelled("GET_LOCK"));
        }

        self.state = HoldState::Acquiring;
        let mut handle = match self.pin_session(cancel).await {
            Ok(handle) => handle,
            Err(err) => {
                self.state = if err.is_cancelled() {
                    HoldState::Unheld
                } else {
                    HoldState::Failed
                };
                return Err(err);
            }
        };

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = handle.acquire(&self.key, timeout) => Some(result),
        };

        match attempt {
            None => {
                // GET_LOCK may have been granted before the call was dropped;
                // closing the session makes the store forget it either way.
                handle.discard().await;
                self.state = HoldState::Unheld;
                Err(self.cancelled("GET_LOCK"))
            }
            Some(Ok(AcquireOutcome::Acquired)) => {
                self.session = Some(handle);
                self.state = HoldState::Held;
                Ok(true)
            }
            Some(Ok(AcquireOutcome::TimedOut)) => {
                handle.release().await;
                self.state = HoldState::Unheld;
                Ok(false)
            }
            Some(Err(err)) if err.is_connection() => {
                handle.discard().await;
                self.state = HoldState::Failed;
                Err(err)
            }
            Some(Err(err)) => {
                handle.release().await;
                self.state = HoldState::Unheld;
                Err(err)
            }
        }
    }

    async fn release_inner(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let Some(mut handle) = self.session.take() else {
            if self.state != HoldState::Failed {
                self.state = HoldState::Unheld;
            }
            return Ok(false);
        };
        if cancel.is_cancelled() {
            self.session = Some(handle);
            return Err(self.cancelled("RELEASE_LOCK"));
        }

        self.state = HoldState::Releasing;
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = handle.release_lock(&self.key) => Some(result),
        };

        match attempt {
            None => {
                handle.discard().await;
                self.state = HoldState::Unheld;
                Err(self.cancelled("RELEASE_LOCK"))
            }
            Some(Ok(ReleaseOutcome::Released)) => {
                handle.release().await;
                self.state = HoldState::Unheld;
                Ok(true)
            }
            Some(Ok(ReleaseOutcome::NotHeld(reason))) => {
                warn!(key = %self.key, session = %handle.id(), reason = reason.as_str(), "RELEASE_LOCK found nothing to release");
                handle.release().await;
                self.state = HoldState::Unheld;
                Ok(false)
            }
            Some(Err(err)) => {
                handle.discard().await;
                self.state = HoldState::Failed;
                Err(err)
            }
        }
    }

    /// Forgets a lock whose pinned session died. The store already dropped
    /// it; the dead session is closed rather than pooled.
    pub(crate) async fn drop_dead_session(&mut self) {
        if self.session.as_ref().is_some_and(SessionHandle::is_open) {
            return;
        }
        if let Some(handle) = self.session.take() {
            warn!(key = %self.key, session = %handle.id(), "pinned session died; lock lost");
            handle.discard().await;
        }
        if self.state == HoldState::Held {
            self.state = HoldState::Unheld;
        }
    }

    async fn holder_inner(&self, cancel: &CancellationToken) -> Result<Option<SessionId>> {
        let mut handle = self.transient_session(cancel).await?;
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = handle.is_held_by(&self.key) => Some(result),
        };
        self.finish_probe(handle, answer, "IS_USED_LOCK").await
    }

    pub(crate) async fn is_free_inner(&self, cancel: &CancellationToken) -> Result<bool> {
        let mut handle = self.transient_session(cancel).await?;
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = handle.is_free(&self.key) => Some(result),
        };
        self.finish_probe(handle, answer, "IS_FREE_LOCK").await
    }

    async fn finish_probe<T>(
        &self,
        handle: SessionHandle,
        answer: Option<Result<T>>,
        operation: &'static str,
    ) -> Result<T> {
        match answer {
            None => {
                handle.discard().await;
                Err(self.cancelled(operation))
            }
            Some(Err(err)) if err.is_connection() => {
                handle.discard().await;
                Err(err)
            }
            Some(result) => {
                handle.release().await;
                result
            }
        }
    }

    async fn pin_session(&mut self, cancel: &CancellationToken) -> Result<SessionHandle> {
        if let Some(handle) = self.session.take() {
            if handle.is_open() {
                return Ok(handle);
            }
            handle.discard().await;
        }
        self.transient_session(cancel).await
    }

    async fn transient_session(&self, cancel: &CancellationToken) -> Result<SessionHandle> {
        if cancel.is_cancelled() {
            return Err(self.cancelled("checkout"));
        }
        let checkout = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = SessionHandle::obtain(Arc::clone(&self.pool)) => Some(result),
        };
        match checkout {
            None => Err(self.cancelled("checkout")),
            Some(result) => result.map_err(|err| LockError::from_store("checkout", &self.key, err)),
        }
    }

    pub(crate) fn cancelled(&self, operation: &'static str) -> LockError {
        LockError::Cancelled {
            operation,
            key: self.key.clone(),
        }
    }

    pub(crate) fn event(&self, operation: Operation, outcome: Outcome, started: Instant) -> LockEvent {
        LockEvent::new(operation, &self.key, outcome, started.elapsed())
    }

    pub(crate) fn emit(&self, event: LockEvent) {
        self.events.emit(&event);
    }

    fn emit_probe<T>(&self, operation: Operation, started: Instant, result: &Result<T>) {
        let event = match result {
            Ok(_) => self.event(operation, Outcome::Answered, started),
            Err(err) => self.event(operation, Outcome::Failed, started).with_error(err),
        };
        self.events.emit(&event);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use pinlock_common::SessionPool;
    use pinlock_memory::{MemoryPool, MemoryStore};
    use tokio_util::sync::CancellationToken;

    use super::{HoldState, LockState, NamedLock};
    use crate::{
        config::LockConfig,
        events::{Operation, Outcome, testing::RecordingSink},
    };

    fn pool() -> (MemoryPool, Arc<dyn SessionPool>) {
        let pool = MemoryPool::new(MemoryStore::new());
        let shared: Arc<dyn SessionPool> = Arc::new(pool.clone());
        (pool, shared)
    }

    fn quick() -> LockConfig {
        LockConfig::default().with_acquire_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn second_instance_times_out_until_first_unlocks() {
        let (_, shared) = pool();
        let cancel = CancellationToken::new();
        let mut first = NamedLock::new(Arc::clone(&shared), "orders:42", quick()).unwrap();
        let mut second = NamedLock::new(shared, "orders:42", quick()).unwrap();

        assert!(first.lock(&cancel).await.unwrap());
        assert!(!second.lock(&cancel).await.unwrap());
        assert_eq!(second.hold_state(), HoldState::Unheld);
        assert!(first.unlock(&cancel).await.unwrap());
        assert!(second.lock(&cancel).await.unwrap());
        assert!(second.unlock(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn unlock_twice_reports_not_held_the_second_time() {
        let (pool, shared) = pool();
        let cancel = CancellationToken::new();
        let mut lock = NamedLock::new(shared, "orders:42", quick()).unwrap();

        assert!(lock.lock(&cancel).await.unwrap());
        assert!(lock.unlock(&cancel).await.unwrap());
        assert!(!lock.unlock(&cancel).await.unwrap());
        assert_eq!(pool.stats().in_use(), 0);
    }

    #[tokio::test]
    async fn unlock_without_lock_is_not_an_error() {
        let (pool, shared) = pool();
        let mut lock = NamedLock::new(shared, "orders:42", quick()).unwrap();

        assert!(!lock.unlock(&CancellationToken::new()).await.unwrap());
        assert_eq!(pool.stats().checkouts, 0);
    }

    #[tokio::test]
    async fn empty_key_is_invalid_and_never_locks() {
        let (pool, shared) = pool();
        let mut lock = NamedLock::new(shared, "", quick()).unwrap();

        let err = lock.lock(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_invalid_key(), "unexpected error: {err}");
        assert!(!lock.is_held());
        assert_eq!(pool.stats().in_use(), 0);
    }

    #[tokio::test]
    async fn session_death_turns_unlock_into_not_held() {
        let (pool, shared) = pool();
        let cancel = CancellationToken::new();
        let mut lock = NamedLock::new(shared, "orders:42", quick()).unwrap();

        assert!(lock.lock(&cancel).await.unwrap());
        let session = lock.session_id().unwrap();
        pool.store().kill(session);

        assert!(!lock.unlock(&cancel).await.unwrap());
        assert_eq!(lock.hold_state(), HoldState::Unheld);
        assert_eq!(pool.idle().await, 0);
    }

    #[tokio::test]
    async fn locked_session_is_pinned_not_pooled() {
        let (pool, shared) = pool();
        let cancel = CancellationToken::new();
        let mut lock = NamedLock::new(Arc::clone(&shared), "orders:42", quick()).unwrap();

        assert!(lock.lock(&cancel).await.unwrap());
        assert_eq!(pool.idle().await, 0);

        // Another user of the pool must get a different session.
        let other = shared.checkout().await.unwrap();
        assert_ne!(Some(other.id()), lock.session_id());
        shared.checkin(other).await;

        assert!(lock.unlock(&cancel).await.unwrap());
        assert_eq!(pool.store().owner("orders:42"), None);
    }

    #[tokio::test]
    async fn checkout_failure_marks_lock_failed() {
        let (pool, shared) = pool();
        let cancel = CancellationToken::new();
        let mut lock = NamedLock::new(shared, "orders:42", quick()).unwrap();

        pool.fail_next_checkouts(1);
        let err = lock.lock(&cancel).await.unwrap_err();
        assert!(err.is_connection());
        assert_eq!(lock.hold_state(), HoldState::Failed);

        assert!(lock.lock(&cancel).await.unwrap());
        assert_eq!(lock.hold_state(), HoldState::Held);
    }

    #[tokio::test]
    async fn cancellation_aborts_a_blocked_acquire() {
        let (pool, shared) = pool();
        let cancel = CancellationToken::new();
        let mut holder = NamedLock::new(Arc::clone(&shared), "orders:42", quick()).unwrap();
        assert!(holder.lock(&cancel).await.unwrap());

        let patient = LockConfig::default().with_acquire_timeout(Duration::from_secs(30));
        let mut blocked = NamedLock::new(shared, "orders:42", patient).unwrap();
        let waiter_cancel = CancellationToken::new();
        let trigger = waiter_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), blocked.lock(&waiter_cancel))
            .await
            .expect("cancellation should interrupt GET_LOCK");
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(blocked.hold_state(), HoldState::Unheld);
        assert_eq!(pool.stats().discards, 1);
        assert_eq!(pool.store().owner("orders:42"), holder.session_id());
    }

    #[tokio::test]
    async fn lock_after_session_death_pins_a_fresh_session() {
        let (pool, shared) = pool();
        let cancel = CancellationToken::new();
        let mut lock = NamedLock::new(shared, "orders:42", quick()).unwrap();

        assert!(lock.lock(&cancel).await.unwrap());
        let dead = lock.session_id().unwrap();
        pool.store().kill(dead);
        assert!(!lock.is_held());

        assert!(lock.lock(&cancel).await.unwrap());
        let fresh = lock.session_id().unwrap();
        assert_ne!(fresh, dead);
        assert_eq!(pool.store().owner("orders:42"), Some(fresh));
        assert_eq!(pool.stats().discards, 1);
    }

    #[tokio::test]
    async fn cancelling_an_in_flight_unlock_discards_the_session() {
        let (pool, shared) = pool();
        let mut lock = NamedLock::new(shared, "orders:42", quick()).unwrap();
        assert!(lock.lock(&CancellationToken::new()).await.unwrap());

        pool.store().stall("RELEASE_LOCK");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), lock.unlock(&cancel))
            .await
            .expect("cancellation should interrupt RELEASE_LOCK");
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(lock.hold_state(), HoldState::Unheld);
        assert_eq!(lock.session_id(), None);
        assert_eq!(pool.stats().discards, 1);
        assert_eq!(pool.stats().in_use(), 0);
        assert_eq!(pool.store().owner("orders:42"), None);
    }

    #[tokio::test]
    async fn try_lock_does_not_wait() {
        let (_, shared) = pool();
        let cancel = CancellationToken::new();
        let mut holder = NamedLock::new(Arc::clone(&shared), "orders:42", quick()).unwrap();
        let patient = LockConfig::default().with_acquire_timeout(Duration::from_secs(30));
        let mut other = NamedLock::new(shared, "orders:42", patient).unwrap();

        assert!(holder.try_lock(&cancel).await.unwrap());
        let attempt = tokio::time::timeout(Duration::from_millis(500), other.try_lock(&cancel))
            .await
            .expect("try_lock must not block");
        assert!(!attempt.unwrap());
    }

    #[tokio::test]
    async fn state_distinguishes_self_from_others() {
        let (_, shared) = pool();
        let cancel = CancellationToken::new();
        let mut mine = NamedLock::new(Arc::clone(&shared), "orders:42", quick()).unwrap();
        let theirs = NamedLock::new(shared, "orders:42", quick()).unwrap();

        assert_eq!(mine.state(&cancel).await.unwrap(), LockState::Free);
        assert!(mine.is_free(&cancel).await.unwrap());

        assert!(mine.lock(&cancel).await.unwrap());
        let owner = mine.session_id().unwrap();
        assert_eq!(mine.state(&cancel).await.unwrap(), LockState::HeldBySelf);
        assert_eq!(
            theirs.state(&cancel).await.unwrap(),
            LockState::HeldByOther(owner)
        );
        assert_eq!(theirs.holder(&cancel).await.unwrap(), Some(owner));
        assert!(!theirs.is_free(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn relocking_a_held_lock_is_a_no_op() {
        let (pool, shared) = pool();
        let cancel = CancellationToken::new();
        let mut lock = NamedLock::new(shared, "orders:42", quick()).unwrap();

        assert!(lock.lock(&cancel).await.unwrap());
        let checkouts = pool.stats().checkouts;
        assert!(lock.lock(&cancel).await.unwrap());
        assert_eq!(pool.stats().checkouts, checkouts);
    }

    #[tokio::test]
    async fn operations_emit_events() {
        let (_, shared) = pool();
        let cancel = CancellationToken::new();
        let sink = Arc::new(RecordingSink::default());
        let mut lock = NamedLock::new(shared, "orders:42", quick())
            .unwrap()
            .with_event_sink(sink.clone());

        lock.lock(&cancel).await.unwrap();
        lock.unlock(&cancel).await.unwrap();
        lock.unlock(&cancel).await.unwrap();

        let seen: Vec<_> = sink
            .events()
            .iter()
            .map(|event| (event.operation, event.outcome))
            .collect();
        assert_eq!(
            seen,
            vec![
                (Operation::Lock, Outcome::Acquired),
                (Operation::Unlock, Outcome::Released),
                (Operation::Unlock, Outcome::NotHeld),
            ]
        );
        assert!(sink.events()[0].session.is_some());
    }

    #[test]
    fn zero_poll_interval_is_rejected_up_front() {
        let (_, shared) = pool();
        let config = LockConfig::default().with_poll_interval(Duration::ZERO);
        assert!(NamedLock::new(shared, "orders:42", config).is_err());
    }
}
