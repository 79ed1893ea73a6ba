use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use pinlock_common::{Session, SessionPool, StoreError};
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::MemoryStore;

#[derive(Debug, Default)]
struct PoolCounters {
    opened: AtomicUsize,
    checkouts: AtomicUsize,
    checkins: AtomicUsize,
    discards: AtomicUsize,
    failing_checkouts: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub opened: usize,
    pub checkouts: usize,
    pub checkins: usize,
    pub discards: usize,
}

impl PoolStats {
    pub fn in_use(&self) -> usize {
        self.checkouts
            .saturating_sub(self.checkins)
            .saturating_sub(self.discards)
    }
}

/// Session pool over a [`MemoryStore`] that reuses returned sessions,
/// most recently returned first.
#[derive(Clone)]
pub struct MemoryPool {
    store: MemoryStore,
    idle: Arc<Mutex<Vec<Box<dyn Session>>>>,
    counters: Arc<PoolCounters>,
}

impl MemoryPool {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            idle: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            opened: self.counters.opened.load(Ordering::Relaxed),
            checkouts: self.counters.checkouts.load(Ordering::Relaxed),
            checkins: self.counters.checkins.load(Ordering::Relaxed),
            discards: self.counters.discards.load(Ordering::Relaxed),
        }
    }

    pub async fn idle(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Makes the next `count` checkouts fail with a connection error.
    pub fn fail_next_checkouts(&self, count: usize) {
        self.counters
            .failing_checkouts
            .store(count, Ordering::Relaxed);
    }

    fn take_injected_failure(&self) -> bool {
        self.counters
            .failing_checkouts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl SessionPool for MemoryPool {
    async fn checkout(&self) -> Result<Box<dyn Session>, StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Connection(
                "memory pool refused checkout".to_string(),
            ));
        }

        let mut idle = self.idle.lock().await;
        while let Some(session) = idle.pop() {
            if session.is_open() {
                self.counters.checkouts.fetch_add(1, Ordering::Relaxed);
                return Ok(session);
            }
            debug!(session = %session.id(), "dropping dead idle session");
        }
        drop(idle);

        let session = self.store.open_session();
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        self.counters.checkouts.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(session))
    }

    async fn checkin(&self, session: Box<dyn Session>) {
        if !session.is_open() {
            self.discard(session).await;
            return;
        }

        self.counters.checkins.fetch_add(1, Ordering::Relaxed);
        self.idle.lock().await.push(session);
    }

    async fn discard(&self, session: Box<dyn Session>) {
        self.discard_now(session);
    }

    fn discard_now(&self, session: Box<dyn Session>) {
        self.counters.discards.fetch_add(1, Ordering::Relaxed);
        debug!(session = %session.id(), "memory session discarded");
        drop(session);
    }
}
