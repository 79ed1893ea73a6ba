use pinlock_common::{
    AcquireTimeout, LockError, LockKey, LockQuery, Result, Session, SessionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotHeldReason {
    /// `RELEASE_LOCK` returned 0: another session owns the lock.
    HeldByOther,
    /// `RELEASE_LOCK` returned NULL: nobody owns the lock.
    NoSuchLock,
    /// The session died, so the store already dropped whatever it held.
    SessionClosed,
}

impl NotHeldReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HeldByOther => "held by another session",
            Self::NoSuchLock => "lock does not exist",
            Self::SessionClosed => "session closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotHeld(NotHeldReason),
}

/// Maps the store's user-level lock functions onto typed outcomes.
///
/// Stateless: every call runs on the session it is given and never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockPrimitive;

impl LockPrimitive {
    pub async fn acquire(
        &self,
        session: &mut dyn Session,
        key: &LockKey,
        timeout: AcquireTimeout,
    ) -> Result<AcquireOutcome> {
        let query = LockQuery::GetLock {
            key: key.clone(),
            timeout,
        };
        match run(session, &query).await? {
            Some(1) => Ok(AcquireOutcome::Acquired),
            Some(0) => Ok(AcquireOutcome::TimedOut),
            value => Err(unexpected(&query, value)),
        }
    }

    pub async fn release(&self, session: &mut dyn Session, key: &LockKey) -> Result<ReleaseOutcome> {
        let query = LockQuery::ReleaseLock { key: key.clone() };
        match run(session, &query).await? {
            Some(1) => Ok(ReleaseOutcome::Released),
            Some(0) => Ok(ReleaseOutcome::NotHeld(NotHeldReason::HeldByOther)),
            None => Ok(ReleaseOutcome::NotHeld(NotHeldReason::NoSuchLock)),
            value => Err(unexpected(&query, value)),
        }
    }

    pub async fn is_free(&self, session: &mut dyn Session, key: &LockKey) -> Result<bool> {
        let query = LockQuery::IsFreeLock { key: key.clone() };
        match run(session, &query).await? {
            Some(1) => Ok(true),
            Some(0) => Ok(false),
            value => Err(unexpected(&query, value)),
        }
    }

    /// Diagnostics only: the answer may be stale by the time it arrives.
    pub async fn is_held_by(
        &self,
        session: &mut dyn Session,
        key: &LockKey,
    ) -> Result<Option<SessionId>> {
        let query = LockQuery::IsUsedLock { key: key.clone() };
        match run(session, &query).await? {
            None => Ok(None),
            Some(id) => u64::try_from(id)
                .map(|id| Some(SessionId(id)))
                .map_err(|_| unexpected(&query, Some(id))),
        }
    }
}

async fn run(session: &mut dyn Session, query: &LockQuery) -> Result<Option<i64>> {
    session
        .query(query)
        .await
        .map_err(|err| LockError::from_store(query.name(), query.key(), err))
}

fn unexpected(query: &LockQuery, value: Option<i64>) -> LockError {
    LockError::UnexpectedResult {
        operation: query.name(),
        key: query.key().clone(),
        value,
    }
}
