use std::time::{Duration, Instant};

use pinlock_common::{AcquireTimeout, LockError, Result};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::LockConfig,
    events::{Operation, Outcome},
    named::NamedLock,
};

/// Polling acquisition: probe `IS_FREE_LOCK`, try `GET_LOCK` when it looks
/// free, sleep and repeat.
///
/// The free probe only decides whether an attempt is worth making. Losing
/// the race after a `true` probe shows up as a timed-out attempt and the
/// loop simply goes round again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub poll_interval: Duration,
    pub max_wait: Option<Duration>,
}

impl Waiter {
    pub fn new(poll_interval: Duration, max_wait: Option<Duration>) -> Self {
        Self {
            poll_interval,
            max_wait,
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(config.poll_interval, config.max_wait)
    }

    pub async fn wait(&self, lock: &mut NamedLock, cancel: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        let result = self.run(lock, cancel, started).await;

        let event = match &result {
            Ok(()) => lock.event(Operation::WaitLock, Outcome::Acquired, started),
            Err(err) => lock
                .event(Operation::WaitLock, Outcome::Failed, started)
                .with_error(err),
        };
        lock.emit(event.with_session(lock.session_id()));
        result
    }

    async fn run(
        &self,
        lock: &mut NamedLock,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<()> {
        if lock.is_held() {
            return Ok(());
        }
        lock.drop_dead_session().await;

        let deadline = self.max_wait.map(|max_wait| time::Instant::from_std(started) + max_wait);
        let mut attempts = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(lock.cancelled("wait_lock"));
            }

            let mut timeout = lock.config().acquire_timeout;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(time::Instant::now());
                if remaining.is_zero() {
                    return Err(deadline_exceeded(lock, started));
                }
                timeout = timeout.clamp_to(remaining);
            }

            attempts = attempts.saturating_add(1);
            if lock.is_free_inner(cancel).await?
                && attempt(lock, timeout, cancel, deadline, started).await?
            {
                debug!(key = %lock.key(), attempts, "wait_lock acquired");
                return Ok(());
            }

            let mut wake = time::Instant::now() + self.poll_interval;
            if let Some(deadline) = deadline {
                wake = wake.min(deadline);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(lock.cancelled("wait_lock")),
                _ = time::sleep_until(wake) => {}
            }
        }
    }
}

/// One `GET_LOCK` attempt that also stops at `deadline`. A SQL store only
/// takes whole seconds, so the clamped timeout alone can overshoot it.
async fn attempt(
    lock: &mut NamedLock,
    timeout: AcquireTimeout,
    cancel: &CancellationToken,
    deadline: Option<time::Instant>,
    started: Instant,
) -> Result<bool> {
    let Some(deadline) = deadline else {
        return lock.acquire_as(Operation::Lock, timeout, cancel).await;
    };

    let attempt_cancel = cancel.child_token();
    let result = {
        let acquire = lock.acquire_as(Operation::Lock, timeout, &attempt_cancel);
        tokio::pin!(acquire);
        let finished = tokio::select! {
            biased;
            result = &mut acquire => Some(result),
            _ = time::sleep_until(deadline) => None,
        };
        match finished {
            Some(result) => result,
            None => {
                // Let the attempt unwind so it closes its session.
                attempt_cancel.cancel();
                acquire.await
            }
        }
    };

    match result {
        Err(err) if err.is_cancelled() && !cancel.is_cancelled() => {
            Err(deadline_exceeded(lock, started))
        }
        other => other,
    }
}

fn deadline_exceeded(lock: &NamedLock, started: Instant) -> LockError {
    LockError::WaitDeadlineExceeded {
        key: lock.key().clone(),
        waited: started.elapsed(),
    }
}

impl NamedLock {
    /// Blocks until the lock is held, the token is cancelled, or the
    /// configured `max_wait` runs out. Store and key errors end the wait
    /// immediately.
    pub async fn wait_lock(&mut self, cancel: &CancellationToken) -> Result<()> {
        Waiter::from_config(self.config()).wait(self, cancel).await
    }
}
