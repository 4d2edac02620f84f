//! memory/factory - пул буферов страниц.
//!
//! allocate_new_page() всегда отдаёт обнулённый буфер; deallocate_page() забирает
//! буфер по значению, поэтому повторный возврат или использование после возврата
//! невозможны на уровне типов.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::page::PageBuffer;

pub struct MemoryFactory {
    free: Mutex<Vec<PageBuffer>>,
    max_free: usize,
    in_use: AtomicUsize,
    created: AtomicUsize,
}

impl MemoryFactory {
    /// `max_free` bounds how many idle buffers are kept for reuse.
    pub fn new(max_free: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_free.min(1024))),
            max_free,
            in_use: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
        }
    }

    pub fn allocate_new_page(&self) -> PageBuffer {
        let reused = self.free.lock().pop();
        let page = match reused {
            Some(mut p) => {
                p.clear();
                p
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                PageBuffer::new_zeroed()
            }
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);
        page
    }

    pub fn deallocate_page(&self, page: PageBuffer) {
        self.in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
            .ok();
        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(page);
        }
    }

    /// Buffers currently checked out (including ones held by the cache).
    pub fn pages_in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Idle buffers waiting for reuse.
    pub fn pool_len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn pages_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_returns_zeroed_buffer() {
        let f = MemoryFactory::new(4);
        let mut p = f.allocate_new_page();
        p.as_bytes_mut()[0] = 0xFF;
        assert_eq!(f.pages_in_use(), 1);
        f.deallocate_page(p);
        assert_eq!(f.pages_in_use(), 0);
        assert_eq!(f.pool_len(), 1);

        let p2 = f.allocate_new_page();
        assert!(p2.is_zeroed());
        assert_eq!(f.pages_created(), 1);
        f.deallocate_page(p2);
    }

    #[test]
    fn pool_is_bounded() {
        let f = MemoryFactory::new(1);
        let a = f.allocate_new_page();
        let b = f.allocate_new_page();
        f.deallocate_page(a);
        f.deallocate_page(b);
        assert_eq!(f.pool_len(), 1);
    }
}
