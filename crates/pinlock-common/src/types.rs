use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

/// Name of a user-level lock.
///
/// Keys are opaque: the backing store decides what is a valid name and
/// reports rejections as [`StoreError::InvalidKey`](crate::StoreError::InvalidKey).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct LockKey(Arc<str>);

impl LockKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Arc::from(key.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LockKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LockKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for LockKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<LockKey> for String {
    fn from(value: LockKey) -> Self {
        value.0.to_string()
    }
}

impl From<&LockKey> for LockKey {
    fn from(value: &LockKey) -> Self {
        value.clone()
    }
}

/// Store-assigned identity of one session (`CONNECTION_ID()` on MySQL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How long a single `GET_LOCK` call may block inside the store.
///
/// No `Default`: waiting forever has to be asked for with
/// [`AcquireTimeout::Unbounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireTimeout {
    Bounded(Duration),
    Unbounded,
}

impl AcquireTimeout {
    pub const NO_WAIT: Self = Self::Bounded(Duration::ZERO);

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Bounded(duration) => Some(*duration),
            Self::Unbounded => None,
        }
    }

    /// Whole seconds as `GET_LOCK` expects them, rounded up so a sub-second
    /// bound never turns into a zero-wait probe. `-1` means no limit.
    pub fn as_sql_seconds(&self) -> i64 {
        match self {
            Self::Bounded(duration) => {
                let mut secs = duration.as_secs();
                if duration.subsec_nanos() > 0 {
                    secs = secs.saturating_add(1);
                }
                i64::try_from(secs).unwrap_or(i64::MAX)
            }
            Self::Unbounded => -1,
        }
    }

    /// The tighter of `self` and `limit`.
    pub fn clamp_to(self, limit: Duration) -> Self {
        match self {
            Self::Bounded(duration) => Self::Bounded(duration.min(limit)),
            Self::Unbounded => Self::Bounded(limit),
        }
    }
}

impl fmt::Display for AcquireTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(duration) => write!(f, "{duration:?}"),
            Self::Unbounded => f.write_str("unbounded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::AcquireTimeout;

    #[test]
    fn sql_seconds_round_up() {
        assert_eq!(AcquireTimeout::NO_WAIT.as_sql_seconds(), 0);
        assert_eq!(
            AcquireTimeout::Bounded(Duration::from_millis(50)).as_sql_seconds(),
            1
        );
        assert_eq!(
            AcquireTimeout::Bounded(Duration::from_secs(3)).as_sql_seconds(),
            3
        );
        assert_eq!(AcquireTimeout::Unbounded.as_sql_seconds(), -1);
    }

    #[test]
    fn clamp_bounds_unbounded_waits() {
        let limit = Duration::from_millis(250);
        assert_eq!(
            AcquireTimeout::Unbounded.clamp_to(limit),
            AcquireTimeout::Bounded(limit)
        );
        assert_eq!(
            AcquireTimeout::Bounded(Duration::from_millis(100)).clamp_to(limit),
            AcquireTimeout::Bounded(Duration::from_millis(100))
        );
    }
}
