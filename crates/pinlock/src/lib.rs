pub mod config;
pub mod events;
pub mod named;
pub mod primitive;
pub mod session;
pub mod waiter;

pub use config::LockConfig;
pub use events::{EventSink, LockEvent, Operation, Outcome, TracingEventSink};
pub use named::{HoldState, LockState, NamedLock};
pub use pinlock_common::{
    AcquireTimeout, LockError, LockKey, LockQuery, Result, Session, SessionId, SessionPool,
    SqlValue, StoreError,
};
pub use primitive::{AcquireOutcome, LockPrimitive, NotHeldReason, ReleaseOutcome};
pub use session::{Liveness, SessionHandle};
pub use tokio_util::sync::CancellationToken;
pub use waiter::Waiter;
