use std::sync::Arc;

use chrono::{DateTime, Utc};
use pinlock_common::{
    AcquireTimeout, LockError, LockKey, Result, Session, SessionId, SessionPool, StoreError,
};
use tracing::{debug, warn};

use crate::primitive::{AcquireOutcome, LockPrimitive, NotHeldReason, ReleaseOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Open,
    Closed,
}

/// A session checked out of the pool and pinned for exclusive use.
///
/// Every lock taken through the handle is released through the same
/// session. The session goes back to the pool only once nothing is held on
/// it; a dead session is closed instead of being returned. Dropping a handle
/// that still owns a session runs the same cleanup on the current tokio
/// runtime, or just closes the session when there is none.
pub struct SessionHandle {
    pool: Arc<dyn SessionPool>,
    session: Option<Box<dyn Session>>,
    id: SessionId,
    held: Option<LockKey>,
    liveness: Liveness,
    pinned_at: DateTime<Utc>,
    primitive: LockPrimitive,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("held", &self.held)
            .field("liveness", &self.liveness)
            .field("pinned_at", &self.pinned_at)
            .finish()
    }
}

impl SessionHandle {
    pub async fn obtain(pool: Arc<dyn SessionPool>) -> std::result::Result<Self, StoreError> {
        let session = pool.checkout().await?;
        let id = session.id();
        debug!(session = %id, "session pinned");

        Ok(Self {
            pool,
            session: Some(session),
            id,
            held: None,
            liveness: Liveness::Open,
            pinned_at: Utc::now(),
            primitive: LockPrimitive,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn held(&self) -> Option<&LockKey> {
        self.held.as_ref()
    }

    pub fn pinned_at(&self) -> DateTime<Utc> {
        self.pinned_at
    }

    pub fn liveness(&self) -> Liveness {
        if self.liveness == Liveness::Open
            && self.session.as_ref().is_some_and(|session| session.is_open())
        {
            Liveness::Open
        } else {
            Liveness::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.liveness() == Liveness::Open
    }

    /// Takes `key` on this session. A different key still held here is
    /// released first, so the session never carries two locks.
    pub async fn acquire(&mut self, key: &LockKey, timeout: AcquireTimeout) -> Result<AcquireOutcome> {
        if let Some(previous) = self.held.clone()
            && previous != *key
        {
            self.release_lock(&previous).await?;
        }

        let primitive = self.primitive;
        let session = self.live_session("GET_LOCK", key)?;
        let result = primitive.acquire(session, key, timeout).await;
        match &result {
            Ok(AcquireOutcome::Acquired) => self.held = Some(key.clone()),
            Ok(AcquireOutcome::TimedOut) => {}
            Err(err) => self.observe(err),
        }
        result
    }

    /// Releases `key` on this session. A session that died reports
    /// `NotHeld(SessionClosed)`: the store already dropped its locks.
    pub async fn release_lock(&mut self, key: &LockKey) -> Result<ReleaseOutcome> {
        if !self.is_open() {
            self.mark_closed();
            self.forget(key);
            return Ok(ReleaseOutcome::NotHeld(NotHeldReason::SessionClosed));
        }

        let primitive = self.primitive;
        let session = self.live_session("RELEASE_LOCK", key)?;
        match primitive.release(session, key).await {
            Ok(outcome) => {
                self.forget(key);
                Ok(outcome)
            }
            Err(LockError::Connection {
                source: StoreError::Closed(_),
                ..
            }) => {
                self.mark_closed();
                self.forget(key);
                Ok(ReleaseOutcome::NotHeld(NotHeldReason::SessionClosed))
            }
            Err(err) => {
                self.observe(&err);
                Err(err)
            }
        }
    }

    pub async fn is_free(&mut self, key: &LockKey) -> Result<bool> {
        let primitive = self.primitive;
        let session = self.live_session("IS_FREE_LOCK", key)?;
        let result = primitive.is_free(session, key).await;
        if let Err(err) = &result {
            self.observe(err);
        }
        result
    }

    pub async fn is_held_by(&mut self, key: &LockKey) -> Result<Option<SessionId>> {
        let primitive = self.primitive;
        let session = self.live_session("IS_USED_LOCK", key)?;
        let result = primitive.is_held_by(session, key).await;
        if let Err(err) = &result {
            self.observe(err);
        }
        result
    }

    pub fn mark_closed(&mut self) {
        if self.liveness == Liveness::Open {
            debug!(session = %self.id, "session marked closed");
        }
        self.liveness = Liveness::Closed;
    }

    /// Best-effort release of anything still held, then back to the pool.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            let open = self.liveness == Liveness::Open && session.is_open();
            return_session(Arc::clone(&self.pool), session, self.held.take(), open).await;
        }
    }

    /// Closes the session without reusing it; the store drops its locks.
    pub async fn discard(mut self) {
        if let Some(session) = self.session.take() {
            self.held = None;
            self.pool.discard(session).await;
        }
    }

    fn live_session(&mut self, operation: &'static str, key: &LockKey) -> Result<&mut dyn Session> {
        if self.liveness == Liveness::Closed {
            return Err(closed(operation, key, self.id));
        }
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(closed(operation, key, self.id)),
        }
    }

    fn observe(&mut self, err: &LockError) {
        if err.is_connection() {
            self.mark_closed();
        }
    }

    fn forget(&mut self, key: &LockKey) {
        if self.held.as_ref() == Some(key) {
            self.held = None;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let held = self.held.take();
        let open = self.liveness == Liveness::Open;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = Arc::clone(&self.pool);
                runtime.spawn(return_session(pool, session, held, open));
            }
            Err(_) => {
                if let Some(key) = held {
                    warn!(session = %self.id, key = %key, "no runtime to release lock; closing session");
                }
                self.pool.discard_now(session);
            }
        }
    }
}

async fn return_session(
    pool: Arc<dyn SessionPool>,
    mut session: Box<dyn Session>,
    held: Option<LockKey>,
    mut open: bool,
) {
    let id = session.id();

    if open && let Some(key) = held {
        match LockPrimitive.release(session.as_mut(), &key).await {
            Ok(outcome) => {
                debug!(session = %id, key = %key, ?outcome, "released lock before returning session");
            }
            Err(err) => {
                warn!(session = %id, key = %key, error = %err, "release before return failed; closing session");
                open = false;
            }
        }
    }

    if open && session.is_open() {
        pool.checkin(session).await;
    } else {
        pool.discard(session).await;
    }
}

fn closed(operation: &'static str, key: &LockKey, id: SessionId) -> LockError {
    LockError::Connection {
        operation,
        key: key.clone(),
        source: StoreError::Closed(id),
    }
}
