use std::time::Duration;

use pinlock_common::{AcquireTimeout, LockError, Result};
use serde::Deserialize;

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "PINLOCK_ACQUIRE_TIMEOUT_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "PINLOCK_POLL_INTERVAL_MS";
pub const ENV_MAX_WAIT_MS: &str = "PINLOCK_MAX_WAIT_MS";

/// Acquisition policy for a [`NamedLock`](crate::NamedLock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawLockConfig")]
pub struct LockConfig {
    /// Bound on a single `lock` call, forwarded to `GET_LOCK`.
    pub acquire_timeout: AcquireTimeout,
    /// Sleep between `wait_lock` attempts.
    pub poll_interval: Duration,
    /// Overall deadline for `wait_lock`; `None` waits until cancelled.
    pub max_wait: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: AcquireTimeout::Bounded(DEFAULT_ACQUIRE_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: None,
        }
    }
}

impl LockConfig {
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = AcquireTimeout::Bounded(timeout);
        self
    }

    /// Lets `lock` block inside the store until the lock is granted.
    pub fn with_unbounded_acquire(mut self) -> Self {
        self.acquire_timeout = AcquireTimeout::Unbounded;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(LockError::InvalidConfig(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from `PINLOCK_*` variables resolved through `lookup`,
    /// keeping defaults for unset ones.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = read_var(&lookup, ENV_ACQUIRE_TIMEOUT_MS) {
            config.acquire_timeout = parse_acquire_timeout(parse_i64(ENV_ACQUIRE_TIMEOUT_MS, &raw)?)?;
        }
        if let Some(raw) = read_var(&lookup, ENV_POLL_INTERVAL_MS) {
            config.poll_interval = Duration::from_millis(parse_u64(ENV_POLL_INTERVAL_MS, &raw)?);
        }
        if let Some(raw) = read_var(&lookup, ENV_MAX_WAIT_MS) {
            config.max_wait = Some(Duration::from_millis(parse_u64(ENV_MAX_WAIT_MS, &raw)?));
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLockConfig {
    #[serde(default = "default_acquire_timeout_ms")]
    acquire_timeout_ms: i64,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default)]
    max_wait_ms: Option<u64>,
}

impl TryFrom<RawLockConfig> for LockConfig {
    type Error = LockError;

    fn try_from(raw: RawLockConfig) -> Result<Self> {
        let config = Self {
            acquire_timeout: parse_acquire_timeout(raw.acquire_timeout_ms)?,
            poll_interval: Duration::from_millis(raw.poll_interval_ms),
            max_wait: raw.max_wait_ms.map(Duration::from_millis),
        };
        config.validate()?;
        Ok(config)
    }
}

fn default_acquire_timeout_ms() -> i64 {
    DEFAULT_ACQUIRE_TIMEOUT.as_millis() as i64
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

// -1 is the explicit "wait forever" opt-in; other negatives are mistakes.
fn parse_acquire_timeout(millis: i64) -> Result<AcquireTimeout> {
    match millis {
        -1 => Ok(AcquireTimeout::Unbounded),
        millis if millis < 0 => Err(LockError::InvalidConfig(format!(
            "acquire timeout must be -1 or a non-negative number of milliseconds, got {millis}"
        ))),
        millis => Ok(AcquireTimeout::Bounded(Duration::from_millis(
            millis.unsigned_abs(),
        ))),
    }
}

fn read_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_i64(name: &str, raw: &str) -> Result<i64> {
    raw.parse()
        .map_err(|err| LockError::InvalidConfig(format!("{name}={raw:?}: {err}")))
}

fn parse_u64(name: &str, raw: &str) -> Result<u64> {
    raw.parse()
        .map_err(|err| LockError::InvalidConfig(format!("{name}={raw:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use pinlock_common::AcquireTimeout;

    use super::LockConfig;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_bounded() {
        let config = LockConfig::default();
        assert_eq!(
            config.acquire_timeout,
            AcquireTimeout::Bounded(Duration::from_secs(1))
        );
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.max_wait, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_defaults() {
        let config = LockConfig::from_lookup(lookup(&[
            ("PINLOCK_ACQUIRE_TIMEOUT_MS", "250"),
            ("PINLOCK_POLL_INTERVAL_MS", "5"),
            ("PINLOCK_MAX_WAIT_MS", "2000"),
        ]))
        .unwrap();

        assert_eq!(
            config.acquire_timeout,
            AcquireTimeout::Bounded(Duration::from_millis(250))
        );
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.max_wait, Some(Duration::from_secs(2)));
    }

    #[test]
    fn unbounded_acquire_must_be_spelled_out() {
        let config =
            LockConfig::from_lookup(lookup(&[("PINLOCK_ACQUIRE_TIMEOUT_MS", "-1")])).unwrap();
        assert_eq!(config.acquire_timeout, AcquireTimeout::Unbounded);

        assert!(LockConfig::from_lookup(lookup(&[("PINLOCK_ACQUIRE_TIMEOUT_MS", "-5")])).is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        assert!(LockConfig::from_lookup(lookup(&[("PINLOCK_POLL_INTERVAL_MS", "0")])).is_err());
        assert!(
            LockConfig::default()
                .with_poll_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn deserializes_from_json() {
        let config: LockConfig =
            serde_json::from_str(r#"{"acquire_timeout_ms": 50, "max_wait_ms": 500}"#).unwrap();
        assert_eq!(
            config.acquire_timeout,
            AcquireTimeout::Bounded(Duration::from_millis(50))
        );
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.max_wait, Some(Duration::from_millis(500)));

        assert!(serde_json::from_str::<LockConfig>(r#"{"poll_interval_ms": 0}"#).is_err());
    }
}
