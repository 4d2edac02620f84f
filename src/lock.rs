//! Async locking for concurrent logical transactions.
//!
//! Database lock (one per engine):
//! - Closed: 0 readers, no writer.
//! - Shared: n>=1 transactions. Reentrant: cloning a `TransactionGuard` adds a reader
//!   without waiting, even while a writer is queued.
//! - Exclusive: one writer (checkpoint, shutdown), 0 readers. A queued writer blocks
//!   new transactions until it has entered and left.
//!
//! Collection locks: 256 writer-only gates, one per ColID. Entering one requires a
//! live `TransactionGuard`, so the order is always database -> collection.
//!
//! Every wait honours the configured timeout and fails with `FolioError::LockTimeout`.
//! Guards release on Drop.

use anyhow::Result;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedMutexGuard};

use crate::consts::MAX_COLLECTIONS;
use crate::error::FolioError;
use crate::metrics::record_lock_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Closed,
    Shared(usize),
    Exclusive,
}

#[derive(Default)]
struct Counters {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
}

struct LockInner {
    state: Mutex<Counters>,
    changed: Notify,
}

impl LockInner {
    fn release_reader(&self) {
        let wake = {
            let mut s = self.state.lock();
            s.readers = s.readers.saturating_sub(1);
            s.readers == 0
        };
        if wake {
            self.changed.notify_waiters();
        }
    }

    fn release_writer(&self) {
        self.state.lock().writer = false;
        self.changed.notify_waiters();
    }
}

pub struct LockService {
    inner: Arc<LockInner>,
    collections: Vec<Arc<tokio::sync::Mutex<()>>>,
    timeout: Duration,
}

/// Shared database lock held by a transaction.
pub struct TransactionGuard {
    inner: Arc<LockInner>,
}

/// Exclusive database lock (no transaction is running while it is held).
pub struct ExclusiveGuard {
    inner: Arc<LockInner>,
}

/// Write gate of a single collection.
pub struct CollectionGuard {
    col_id: u8,
    _guard: OwnedMutexGuard<()>,
}

impl CollectionGuard {
    pub fn col_id(&self) -> u8 {
        self.col_id
    }
}

/// Decrements `writers_waiting` even if the waiting future is dropped.
struct WaitingWriter<'a> {
    inner: &'a LockInner,
    armed: bool,
}

impl Drop for WaitingWriter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().writers_waiting -= 1;
            self.inner.changed.notify_waiters();
        }
    }
}

impl LockService {
    pub fn new(timeout: Duration) -> Self {
        let inner = Arc::new(LockInner {
            state: Mutex::new(Counters::default()),
            changed: Notify::new(),
        });
        let collections = (0..MAX_COLLECTIONS)
            .map(|_| Arc::new(tokio::sync::Mutex::new(())))
            .collect();
        Self {
            inner,
            collections,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> LockState {
        let s = self.inner.state.lock();
        if s.writer {
            LockState::Exclusive
        } else if s.readers > 0 {
            LockState::Shared(s.readers)
        } else {
            LockState::Closed
        }
    }

    /// Enter the shared database lock (waits while a writer holds or waits).
    pub async fn enter_transaction(&self) -> Result<TransactionGuard> {
        let inner = self.inner.clone();
        let fut = async {
            loop {
                let notified = inner.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let mut s = inner.state.lock();
                    if !s.writer && s.writers_waiting == 0 {
                        s.readers += 1;
                        return;
                    }
                }
                notified.await;
            }
        };
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(()) => Ok(TransactionGuard {
                inner: self.inner.clone(),
            }),
            Err(_) => Err(self.timed_out("database shared lock")),
        }
    }

    /// Enter the exclusive database lock: waits for every current reader to exit.
    pub async fn enter_exclusive(&self) -> Result<ExclusiveGuard> {
        let inner = &*self.inner;
        inner.state.lock().writers_waiting += 1;
        let mut waiting = WaitingWriter { inner, armed: true };

        let fut = async {
            loop {
                let notified = inner.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let mut s = inner.state.lock();
                    if !s.writer && s.readers == 0 {
                        s.writer = true;
                        s.writers_waiting -= 1;
                        return;
                    }
                }
                notified.await;
            }
        };

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(()) => {
                waiting.armed = false;
                debug!("lock: exclusive entered");
                Ok(ExclusiveGuard {
                    inner: self.inner.clone(),
                })
            }
            Err(_) => {
                drop(waiting);
                Err(self.timed_out("database exclusive lock"))
            }
        }
    }

    /// Exclusive lock only if nobody holds or waits for the database lock right now.
    pub fn try_enter_exclusive(&self) -> Option<ExclusiveGuard> {
        let mut s = self.inner.state.lock();
        if s.writer || s.readers > 0 || s.writers_waiting > 0 {
            return None;
        }
        s.writer = true;
        Some(ExclusiveGuard {
            inner: self.inner.clone(),
        })
    }

    /// Per-collection write gate. Readers and other collections are not blocked.
    pub async fn enter_collection_write_lock(
        &self,
        _txn: &TransactionGuard,
        col_id: u8,
    ) -> Result<CollectionGuard> {
        let gate = self.collections[col_id as usize].clone();
        match tokio::time::timeout(self.timeout, gate.lock_owned()).await {
            Ok(guard) => Ok(CollectionGuard {
                col_id,
                _guard: guard,
            }),
            Err(_) => Err(self.timed_out(&format!("collection {} write lock", col_id))),
        }
    }

    fn timed_out(&self, what: &str) -> anyhow::Error {
        record_lock_timeout();
        warn!("lock: timeout after {:?} on {}", self.timeout, what);
        FolioError::LockTimeout {
            what: what.to_string(),
            timeout: self.timeout,
        }
        .into()
    }
}

impl Clone for TransactionGuard {
    /// Reentrant enter: the holder already excludes writers, so no wait.
    fn clone(&self) -> Self {
        self.inner.state.lock().readers += 1;
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.inner.release_reader();
    }
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        self.inner.release_writer();
        debug!("lock: exclusive released");
    }
}
