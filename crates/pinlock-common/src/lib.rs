pub mod error;
pub mod store;
pub mod types;

pub use error::{LockError, Result, StoreError};
pub use store::{LockQuery, Session, SessionPool, SqlValue};
pub use types::{AcquireTimeout, LockKey, SessionId};
