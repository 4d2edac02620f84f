//! engine/transaction - логическая транзакция поверх лога.
//!
//! - держит разделяемую блокировку БД всё время жизни;
//! - страницы меняются только в собственных копиях (copy-on-write из кэша / лога / данных);
//! - commit: все грязные страницы уходят в лог одним WriteLogPages, последняя с IsConfirmed;
//! - rollback / Drop: буферы возвращаются в пул, резервирования в карте откатываются.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::alloc_map::extent::has_room_for;
use crate::alloc_map::{free_code, ExtendLocation};
use crate::error::FolioError;
use crate::lock::{CollectionGuard, TransactionGuard};
use crate::memory::PageRef;
use crate::page::{PageBuffer, PageHeader, PageType};

use super::EngineInner;

pub struct Transaction {
    engine: Arc<EngineInner>,
    guard: Option<TransactionGuard>,
    id: u32,
    pages: BTreeMap<u32, PageBuffer>,
    collections: HashMap<u8, CollectionGuard>,
    cursors: HashMap<u8, ExtendLocation>,
    undo: HashMap<ExtendLocation, u32>,
}

impl Transaction {
    pub(crate) fn new(engine: Arc<EngineInner>, guard: TransactionGuard, id: u32) -> Self {
        Self {
            engine,
            guard: Some(guard),
            id,
            pages: BTreeMap::new(),
            collections: HashMap::new(),
            cursors: HashMap::new(),
            undo: HashMap::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Dirty pages held by this transaction.
    pub fn dirty_count(&self) -> usize {
        self.pages.len()
    }

    /// Take the write gate of a collection for the rest of the transaction.
    pub async fn enter_collection_write(&mut self, col_id: u8) -> Result<()> {
        if self.collections.contains_key(&col_id) {
            return Ok(());
        }
        let guard = self.guard.as_ref().ok_or_else(finished)?;
        let gate = self
            .engine
            .locks
            .enter_collection_write_lock(guard, col_id)
            .await?;
        self.collections.insert(col_id, gate);
        Ok(())
    }

    /// A page of `page_type` in collection `col_id` with room to write into.
    /// Brand-new pages come back zeroed with their header set; otherwise the
    /// existing page is copied for write. Requires the collection write gate.
    pub fn get_free_page(&mut self, col_id: u8, page_type: PageType) -> Result<&mut PageBuffer> {
        self.require_collection(col_id)?;
        let free = loop {
            let current = self.cursors.get(&col_id).copied().unwrap_or_default();
            let free = self
                .engine
                .alloc
                .get_free_extend(current, col_id, page_type)?;
            self.undo.entry(free.location).or_insert(free.previous_value);
            self.cursors.insert(col_id, free.next);
            if free.is_new {
                break free;
            }

            // the map may lag behind pages this transaction already filled
            let h = match self.pages.get(&free.page_id) {
                Some(page) => page.header()?,
                None => self.read_page(free.page_id)?.header()?,
            };
            let code = free_code(h.page_type, h.free_bytes);
            if has_room_for(code, page_type) {
                return self.get_page_for_write(free.page_id);
            }
            self.engine.alloc.update_page_map(free.page_id, col_id, code)?;
        };

        let mut page = self.engine.factory.allocate_new_page();
        let mut h = PageHeader::new(free.page_id, page_type, col_id);
        h.transaction_id = self.id;
        h.is_dirty = true;
        if let Err(e) = page.set_header(&h) {
            self.engine.factory.deallocate_page(page);
            return Err(e);
        }
        debug!("txn {}: new {:?} page {}", self.id, page_type, free.page_id);
        Ok(self.pages.entry(free.page_id).or_insert(page))
    }

    /// Private writable copy of the newest committed version of `page_id`.
    /// Requires the write gate of the page's collection.
    pub fn get_page_for_write(&mut self, page_id: u32) -> Result<&mut PageBuffer> {
        if !self.pages.contains_key(&page_id) {
            let source = self.read_page(page_id)?;
            self.require_collection(source.col_id())?;
            let mut page = self.engine.factory.allocate_new_page();
            page.copy_from(&source);
            page.set_transaction_id(self.id);
            page.set_confirmed(false);
            page.set_dirty(true);
            self.pages.insert(page_id, page);
        }
        self.pages
            .get_mut(&page_id)
            .ok_or_else(|| FolioError::Invariant(format!("page {} vanished", page_id)).into())
    }

    fn require_collection(&self, col_id: u8) -> Result<()> {
        if !self.collections.contains_key(&col_id) {
            return Err(FolioError::InvalidState(format!(
                "collection {} write lock is not held by transaction {}",
                col_id, self.id
            ))
            .into());
        }
        Ok(())
    }

    /// Committed version of a page (this transaction's own changes are not visible here).
    pub fn read_page(&self, page_id: u32) -> Result<PageRef> {
        if self.guard.is_none() {
            return Err(finished());
        }
        self.engine.read_page_locked(page_id)
    }

    /// Write every dirty page through the log, confirm, update the allocation map.
    pub async fn commit(mut self) -> Result<()> {
        if self.guard.is_none() {
            return Err(finished());
        }
        if self.pages.is_empty() {
            self.release();
            return Ok(());
        }

        let mut pages: Vec<PageBuffer> = std::mem::take(&mut self.pages)
            .into_iter()
            .map(|(page_id, mut page)| {
                page.set_page_id(page_id);
                page.set_transaction_id(self.id);
                page.set_confirmed(false);
                page
            })
            .collect();
        if let Some(last) = pages.last_mut() {
            last.set_confirmed(true);
        }

        // everything that can refuse the commit runs before the log write
        let checked = pages
            .iter()
            .map(|page| -> Result<(u32, u8, u8)> {
                let h = page.header()?;
                self.engine.alloc.check_page_owner(h.page_id, h.col_id)?;
                Ok((h.page_id, h.col_id, free_code(h.page_type, h.free_bytes)))
            })
            .collect::<Result<Vec<_>>>();
        let codes = match checked {
            Ok(codes) => codes,
            Err(e) => {
                self.abort_commit(pages);
                return Err(e);
            }
        };

        if let Err(e) = self.engine.log.write_log_pages(&mut pages) {
            self.engine.log.discard_transaction(self.id);
            self.abort_commit(pages);
            return Err(e);
        }

        // confirmed in the log from here on
        for (page_id, col_id, code) in codes {
            if let Err(e) = self.engine.alloc.update_page_map(page_id, col_id, code) {
                warn!(
                    "txn {}: allocation map not updated for page {}: {}",
                    self.id, page_id, e
                );
            }
        }

        let count = pages.len();
        for page in pages {
            if let Err(page) = self.engine.cache.add_page_in_cache(page) {
                self.engine.factory.deallocate_page(page);
            }
        }
        debug!("txn {}: committed {} page(s)", self.id, count);

        self.undo.clear();
        self.release();
        self.engine
            .try_auto_checkpoint()
            .context("auto checkpoint after commit")?;
        Ok(())
    }

    fn abort_commit(&mut self, pages: Vec<PageBuffer>) {
        for page in pages {
            self.engine.factory.deallocate_page(page);
        }
        self.rollback_inner();
    }

    /// Discard every change of this transaction.
    pub fn rollback(mut self) {
        self.rollback_inner();
    }

    fn rollback_inner(&mut self) {
        for (_, page) in std::mem::take(&mut self.pages) {
            self.engine.factory.deallocate_page(page);
        }
        if !self.undo.is_empty() {
            self.engine.alloc.restore_extend_values(&self.undo);
            self.undo.clear();
        }
        if self.guard.is_some() {
            debug!("txn {}: rolled back", self.id);
        }
        self.release();
    }

    fn release(&mut self) {
        self.collections.clear();
        self.guard = None;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.guard.is_some() {
            self.rollback_inner();
        }
    }
}

fn finished() -> anyhow::Error {
    FolioError::InvalidState("transaction already finished".into()).into()
}
