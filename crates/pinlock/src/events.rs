use std::time::Duration;

use chrono::{DateTime, Utc};
use pinlock_common::{LockError, LockKey, SessionId};
use serde::Serialize;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Lock,
    TryLock,
    Unlock,
    WaitLock,
    IsFree,
    Holder,
    State,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::TryLock => "try_lock",
            Self::Unlock => "unlock",
            Self::WaitLock => "wait_lock",
            Self::IsFree => "is_free",
            Self::Holder => "holder",
            Self::State => "state",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Acquired,
    TimedOut,
    Released,
    NotHeld,
    Answered,
    Cancelled,
    Failed,
}

/// Structured record of one lock operation.
#[derive(Debug, Clone, Serialize)]
pub struct LockEvent {
    pub operation: Operation,
    pub key: LockKey,
    pub outcome: Outcome,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    pub session: Option<SessionId>,
    pub elapsed: Duration,
    pub at: DateTime<Utc>,
}

impl LockEvent {
    pub fn new(operation: Operation, key: &LockKey, outcome: Outcome, elapsed: Duration) -> Self {
        Self {
            operation,
            key: key.clone(),
            outcome,
            error: None,
            error_kind: None,
            session: None,
            elapsed,
            at: Utc::now(),
        }
    }

    pub fn with_session(mut self, session: Option<SessionId>) -> Self {
        self.session = session;
        self
    }

    pub fn with_error(mut self, err: &LockError) -> Self {
        self.outcome = if err.is_cancelled() {
            Outcome::Cancelled
        } else {
            Outcome::Failed
        };
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind());
        self
    }
}

/// Receives every [`LockEvent`]; formatting and transport are up to the sink.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LockEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &LockEvent) {
        let operation = event.operation.as_str();
        let key = event.key.as_str();
        let elapsed_ms = event.elapsed.as_millis() as u64;
        let session = event.session.map(|id| id.0);

        match (event.outcome, event.error.as_deref()) {
            (Outcome::Failed, error) => {
                error!(operation, key, session, elapsed_ms, error, "lock operation failed")
            }
            (Outcome::Cancelled, error) => {
                info!(operation, key, session, elapsed_ms, error, "lock operation cancelled")
            }
            (Outcome::NotHeld, _) => {
                warn!(operation, key, session, elapsed_ms, "lock was not held")
            }
            (Outcome::TimedOut, _) | (Outcome::Answered, _) => {
                debug!(operation, key, session, elapsed_ms, outcome = ?event.outcome, "lock operation")
            }
            (outcome, _) => {
                info!(operation, key, session, elapsed_ms, ?outcome, "lock operation")
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pinlock_common::{LockError, LockKey};

    use super::{LockEvent, Operation, Outcome};

    #[test]
    fn error_events_carry_kind_and_message() {
        let key = LockKey::new("orders:42");
        let err = LockError::Cancelled {
            operation: "wait_lock",
            key: key.clone(),
        };
        let event = LockEvent::new(Operation::WaitLock, &key, Outcome::Failed, Duration::ZERO)
            .with_error(&err);

        assert_eq!(event.outcome, Outcome::Cancelled);
        assert_eq!(event.error_kind, Some("cancelled"));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["operation"], "wait_lock");
        assert_eq!(json["key"], "orders:42");
        assert_eq!(json["outcome"], "cancelled");
    }
}
