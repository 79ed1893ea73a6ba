pub mod pool;
pub mod store;

pub use pool::{MemoryPool, PoolStats};
pub use store::{ER_USER_LOCK_WRONG_NAME, MAX_LOCK_NAME_LEN, MemorySession, MemoryStore};
