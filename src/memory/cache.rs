//! O(1) LRU cache of pages keyed by PositionID.
//!
//! Design:
//! - HashMap<position_id, Entry> stores a shared page handle and doubly-linked pointers.
//! - head = MRU, tail = LRU.
//! - The share counter of an entry is the strong count of its `Arc<SharedPage>` minus
//!   the cache's own reference. When the last handle drops, the buffer goes back to
//!   `MemoryFactory` (see `SharedPage::drop`).
//! - Only unshared entries can be taken out (`try_remove`) or evicted.
//! - Capacity=0 disables the cache (every add is rejected).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use crate::metrics::{record_cache_hit, record_cache_miss};
use crate::page::PageBuffer;

use super::factory::MemoryFactory;

/// Read-only page shared between the cache and concurrent readers.
pub struct SharedPage {
    page: Option<PageBuffer>,
    factory: Arc<MemoryFactory>,
}

impl SharedPage {
    pub(crate) fn new(page: PageBuffer, factory: Arc<MemoryFactory>) -> Self {
        Self {
            page: Some(page),
            factory,
        }
    }

    fn into_inner(mut self) -> Option<PageBuffer> {
        self.page.take()
    }
}

impl Deref for SharedPage {
    type Target = PageBuffer;

    fn deref(&self) -> &PageBuffer {
        // `page` is only None after into_inner(), which consumes self.
        match self.page.as_ref() {
            Some(p) => p,
            None => unreachable!("SharedPage used after into_inner"),
        }
    }
}

impl Drop for SharedPage {
    fn drop(&mut self) {
        if let Some(p) = self.page.take() {
            self.factory.deallocate_page(p);
        }
    }
}

pub type PageRef = Arc<SharedPage>;

struct Entry {
    page: PageRef,
    prev: Option<u32>,
    next: Option<u32>,
}

struct CacheInner {
    cap: usize,
    map: HashMap<u32, Entry>,
    head: Option<u32>, // Most-recently used
    tail: Option<u32>, // Least-recently used
}

pub struct MemoryCache {
    factory: Arc<MemoryFactory>,
    inner: Mutex<CacheInner>,
}

impl MemoryCache {
    pub fn new(factory: Arc<MemoryFactory>, cap: usize) -> Self {
        Self {
            factory,
            inner: Mutex::new(CacheInner {
                cap,
                map: HashMap::with_capacity(cap.min(4096)),
                head: None,
                tail: None,
            }),
        }
    }

    pub fn factory(&self) -> &Arc<MemoryFactory> {
        &self.factory
    }

    /// Shared handle to a cached page; moves the entry to MRU.
    pub fn get_page_read_only(&self, position_id: u32) -> Option<PageRef> {
        let mut inner = self.inner.lock();
        let page = match inner.map.get(&position_id) {
            Some(e) => e.page.clone(),
            None => {
                record_cache_miss();
                return None;
            }
        };
        inner.detach(position_id);
        inner.attach_front(position_id);
        record_cache_hit();
        Some(page)
    }

    /// Take exclusive ownership of a cached page. None if absent or still shared.
    pub fn try_remove(&self, position_id: u32) -> Option<PageBuffer> {
        let mut inner = self.inner.lock();
        let shared = inner
            .map
            .get(&position_id)
            .map(|e| Arc::strong_count(&e.page) > 1)?;
        if shared {
            return None;
        }
        inner.detach(position_id);
        let entry = inner.map.remove(&position_id)?;
        Arc::try_unwrap(entry.page).ok().and_then(SharedPage::into_inner)
    }

    /// Put a page under its current PositionID.
    /// Err(page) = cache is full of shared pages; caller must deallocate it.
    pub fn add_page_in_cache(&self, page: PageBuffer) -> Result<(), PageBuffer> {
        self.insert(page).map(|_| ())
    }

    /// Cache `page` and return a shared handle to it. When the cache is full the
    /// handle is simply not cached; the buffer still returns to the pool on drop.
    pub fn add_and_share(&self, page: PageBuffer) -> PageRef {
        match self.insert(page) {
            Ok(handle) => handle,
            Err(page) => Arc::new(SharedPage::new(page, self.factory.clone())),
        }
    }

    fn insert(&self, page: PageBuffer) -> Result<PageRef, PageBuffer> {
        let position_id = page.position_id();
        let mut inner = self.inner.lock();
        if inner.cap == 0 {
            return Err(page);
        }

        if inner.map.contains_key(&position_id) {
            // Old version stays alive for its readers and returns to the pool on their drop.
            inner.detach(position_id);
            inner.map.remove(&position_id);
        } else if inner.map.len() >= inner.cap && !inner.evict_one_unshared() {
            return Err(page);
        }

        let handle = Arc::new(SharedPage::new(page, self.factory.clone()));
        let entry = Entry {
            page: handle.clone(),
            prev: None,
            next: None,
        };
        inner.map.insert(position_id, entry);
        inner.attach_front(position_id);
        Ok(handle)
    }

    /// Drop every entry that is not a checkpointed data-file page.
    pub fn clear_log_pages(&self) -> usize {
        let mut inner = self.inner.lock();
        let victims: Vec<u32> = inner
            .map
            .iter()
            .filter(|(pos, e)| e.page.page_id() != **pos || e.page.transaction_id() != 0)
            .map(|(pos, _)| *pos)
            .collect();
        for pos in &victims {
            inner.detach(*pos);
            inner.map.remove(pos);
        }
        victims.len()
    }

    /// Drop a single entry regardless of readers (they keep their handle).
    pub fn invalidate(&self, position_id: u32) {
        let mut inner = self.inner.lock();
        inner.detach(position_id);
        inner.map.remove(&position_id);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.head = None;
        inner.tail = None;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of outside handles on a cached page (0 = only the cache holds it).
    pub fn share_count(&self, position_id: u32) -> Option<usize> {
        let inner = self.inner.lock();
        inner
            .map
            .get(&position_id)
            .map(|e| Arc::strong_count(&e.page) - 1)
    }
}

impl CacheInner {
    /// Walk from LRU towards MRU and drop the first entry nobody else holds.
    fn evict_one_unshared(&mut self) -> bool {
        let mut cur = self.tail;
        while let Some(pos) = cur {
            let (shared, prev) = match self.map.get(&pos) {
                Some(e) => (Arc::strong_count(&e.page) > 1, e.prev),
                None => return false,
            };
            if !shared {
                self.detach(pos);
                self.map.remove(&pos);
                return true;
            }
            cur = prev;
        }
        false
    }

    fn detach(&mut self, pos: u32) {
        let (prev, next) = match self.map.get(&pos) {
            Some(e) => (e.prev, e.next),
            None => return,
        };

        if self.head == Some(pos) {
            self.head = next;
        }
        if self.tail == Some(pos) {
            self.tail = prev;
        }

        if let Some(p) = prev {
            if let Some(pe) = self.map.get_mut(&p) {
                pe.next = next;
            }
        }
        if let Some(n) = next {
            if let Some(ne) = self.map.get_mut(&n) {
                ne.prev = prev;
            }
        }

        if let Some(e) = self.map.get_mut(&pos) {
            e.prev = None;
            e.next = None;
        }
    }

    fn attach_front(&mut self, pos: u32) {
        if self.head == Some(pos) {
            return;
        }

        if let Some(e) = self.map.get_mut(&pos) {
            e.prev = None;
            e.next = self.head;
        }

        if let Some(old_head) = self.head {
            if let Some(he) = self.map.get_mut(&old_head) {
                he.prev = Some(pos);
            }
        }

        self.head = Some(pos);

        if self.tail.is_none() {
            self.tail = Some(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PageHeader, PageType};

    fn data_page(factory: &MemoryFactory, page_id: u32, position_id: u32) -> PageBuffer {
        let mut p = factory.allocate_new_page();
        let mut h = PageHeader::new(page_id, PageType::Data, 0);
        h.position_id = position_id;
        p.set_header(&h).unwrap();
        p
    }

    #[test]
    fn shared_page_cannot_be_removed() {
        let f = Arc::new(MemoryFactory::new(8));
        let cache = MemoryCache::new(f.clone(), 4);
        cache.add_page_in_cache(data_page(&f, 3, 3)).unwrap();

        let reader = cache.get_page_read_only(3).unwrap();
        assert_eq!(cache.share_count(3), Some(1));
        assert!(cache.try_remove(3).is_none());

        drop(reader);
        let owned = cache.try_remove(3).unwrap();
        assert_eq!(owned.page_id(), 3);
        assert!(cache.is_empty());
        f.deallocate_page(owned);
        assert_eq!(f.pages_in_use(), 0);
    }

    #[test]
    fn full_cache_evicts_lru_unshared_or_rejects() {
        let f = Arc::new(MemoryFactory::new(8));
        let cache = MemoryCache::new(f.clone(), 2);
        cache.add_page_in_cache(data_page(&f, 1, 1)).unwrap();
        cache.add_page_in_cache(data_page(&f, 2, 2)).unwrap();

        // 1 is LRU and unshared -> evicted
        cache.add_page_in_cache(data_page(&f, 3, 3)).unwrap();
        assert!(cache.get_page_read_only(1).is_none());

        let _h2 = cache.get_page_read_only(2).unwrap();
        let _h3 = cache.get_page_read_only(3).unwrap();
        let rejected = cache.add_page_in_cache(data_page(&f, 4, 4)).unwrap_err();
        assert_eq!(rejected.page_id(), 4);
        f.deallocate_page(rejected);
    }

    #[test]
    fn dropping_last_handle_returns_buffer_to_pool() {
        let f = Arc::new(MemoryFactory::new(8));
        let cache = MemoryCache::new(f.clone(), 4);
        cache.add_page_in_cache(data_page(&f, 7, 7)).unwrap();
        let handle = cache.get_page_read_only(7).unwrap();
        cache.invalidate(7);
        assert_eq!(f.pages_in_use(), 1);
        drop(handle);
        assert_eq!(f.pages_in_use(), 0);
        assert_eq!(f.pool_len(), 1);
    }

    #[test]
    fn clear_log_pages_keeps_data_pages() {
        let f = Arc::new(MemoryFactory::new(8));
        let cache = MemoryCache::new(f.clone(), 8);
        cache.add_page_in_cache(data_page(&f, 5, 5)).unwrap();
        cache.add_page_in_cache(data_page(&f, 5, 40)).unwrap();
        assert_eq!(cache.clear_log_pages(), 1);
        assert!(cache.get_page_read_only(5).is_some());
        assert!(cache.get_page_read_only(40).is_none());
    }
}
