use async_trait::async_trait;

use crate::{
    error::StoreError,
    types::{AcquireTimeout, LockKey, SessionId},
};

/// One round trip against the store's user-level lock functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockQuery {
    GetLock {
        key: LockKey,
        timeout: AcquireTimeout,
    },
    ReleaseLock {
        key: LockKey,
    },
    IsFreeLock {
        key: LockKey,
    },
    IsUsedLock {
        key: LockKey,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlValue<'a> {
    Text(&'a str),
    Int(i64),
}

impl LockQuery {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetLock { .. } => "GET_LOCK",
            Self::ReleaseLock { .. } => "RELEASE_LOCK",
            Self::IsFreeLock { .. } => "IS_FREE_LOCK",
            Self::IsUsedLock { .. } => "IS_USED_LOCK",
        }
    }

    pub fn key(&self) -> &LockKey {
        match self {
            Self::GetLock { key, .. }
            | Self::ReleaseLock { key }
            | Self::IsFreeLock { key }
            | Self::IsUsedLock { key } => key,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            Self::GetLock { .. } => "SELECT GET_LOCK(?, ?)",
            Self::ReleaseLock { .. } => "SELECT RELEASE_LOCK(?)",
            Self::IsFreeLock { .. } => "SELECT IS_FREE_LOCK(?)",
            Self::IsUsedLock { .. } => "SELECT IS_USED_LOCK(?)",
        }
    }

    pub fn params(&self) -> Vec<SqlValue<'_>> {
        match self {
            Self::GetLock { key, timeout } => vec![
                SqlValue::Text(key.as_str()),
                SqlValue::Int(timeout.as_sql_seconds()),
            ],
            Self::ReleaseLock { key } | Self::IsFreeLock { key } | Self::IsUsedLock { key } => {
                vec![SqlValue::Text(key.as_str())]
            }
        }
    }
}

/// A single connection to the store.
///
/// Locks taken through a session belong to that session and disappear when
/// it is closed. Dropping a `Session` must close the underlying connection;
/// an implementation that hands its connection back to a driver-level pool
/// on drop would leak whatever lock is still held on it.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    fn is_open(&self) -> bool;

    /// Runs `query` and returns its single, nullable integer column.
    async fn query(&mut self, query: &LockQuery) -> Result<Option<i64>, StoreError>;
}

/// Pool of interchangeable sessions, configured outside this workspace.
#[async_trait]
pub trait SessionPool: Send + Sync {
    async fn checkout(&self) -> Result<Box<dyn Session>, StoreError>;

    /// Hands a healthy session back for reuse.
    async fn checkin(&self, session: Box<dyn Session>);

    /// Closes a session instead of reusing it.
    async fn discard(&self, session: Box<dyn Session>);

    /// Synchronous [`discard`](Self::discard), for cleanup that runs with no
    /// async runtime available.
    fn discard_now(&self, session: Box<dyn Session>) {
        drop(session);
    }
}
