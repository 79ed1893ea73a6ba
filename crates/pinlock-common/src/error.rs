use std::time::Duration;

use thiserror::Error;

use crate::types::{LockKey, SessionId};

/// Failure reported by a session or pool while talking to the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("error {code}: {message}")]
    InvalidKey { code: u16, message: String },
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("session {0} is closed")]
    Closed(SessionId),
}

impl StoreError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("invalid lock key {key:?}: {source}")]
    InvalidKey {
        key: LockKey,
        #[source]
        source: StoreError,
    },
    #[error("{operation} failed for lock {key}: {source}")]
    Connection {
        operation: &'static str,
        key: LockKey,
        #[source]
        source: StoreError,
    },
    #[error("{operation} returned unexpected result {value:?} for lock {key}")]
    UnexpectedResult {
        operation: &'static str,
        key: LockKey,
        value: Option<i64>,
    },
    #[error("{operation} on lock {key} cancelled")]
    Cancelled {
        operation: &'static str,
        key: LockKey,
    },
    #[error("gave up waiting for lock {key} after {waited:?}")]
    WaitDeadlineExceeded { key: LockKey, waited: Duration },
    #[error("invalid lock configuration: {0}")]
    InvalidConfig(String),
}

impl LockError {
    pub fn from_store(operation: &'static str, key: &LockKey, source: StoreError) -> Self {
        match source {
            StoreError::InvalidKey { .. } => Self::InvalidKey {
                key: key.clone(),
                source,
            },
            StoreError::Connection(_) | StoreError::Closed(_) => Self::Connection {
                operation,
                key: key.clone(),
                source,
            },
        }
    }

    /// Errors after which the session they happened on must not be reused.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::UnexpectedResult { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::WaitDeadlineExceeded { .. })
    }

    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::InvalidKey { .. })
    }

    /// Stable short name used in structured events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidKey { .. } => "invalid_key",
            Self::Connection { .. } => "connection",
            Self::UnexpectedResult { .. } => "unexpected_result",
            Self::Cancelled { .. } => "cancelled",
            Self::WaitDeadlineExceeded { .. } => "wait_deadline_exceeded",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}

pub type Result<T> = std::result::Result<T, LockError>;

#[cfg(test)]
mod tests {
    use super::{LockError, StoreError};
    use crate::types::{LockKey, SessionId};

    #[test]
    fn store_errors_map_to_distinct_kinds() {
        let key = LockKey::new("");
        let invalid = LockError::from_store(
            "GET_LOCK",
            &key,
            StoreError::InvalidKey {
                code: 3057,
                message: "Incorrect user-level lock name ''.".to_string(),
            },
        );
        assert!(invalid.is_invalid_key());
        assert!(!invalid.is_connection());

        let closed = LockError::from_store("RELEASE_LOCK", &key, StoreError::Closed(SessionId(7)));
        assert!(closed.is_connection());
        assert_eq!(closed.kind(), "connection");
    }
}
