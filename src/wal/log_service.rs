//! wal/log_service - путь записи лога и checkpoint.
//!
//! Лог живёт в том же файле, что и данные: каждая грязная страница получает новый
//! физический слот (PositionID) за концом области данных. Страницы никогда не
//! пишутся на место. Checkpoint переносит подтверждённые версии в их дом (PageID)
//! по плану `CheckpointActions`.
//!
//! Состояние:
//! - last_page_id    - конец области данных;
//! - log_position_id - последний выданный слот лога;
//! - log_pages       - LogPageHeader каждой записанной страницы с последнего checkpoint;
//! - confirmed       - подтверждённые TransactionID;
//! - wal_index       - PageID → PositionID новейшей подтверждённой версии.

use anyhow::Result;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::consts::{is_allocation_map_slot, slot_offset, AM_EXTEND_SIZE, PAGE_SIZE};
use crate::disk::Disk;
use crate::error::FolioError;
use crate::memory::{MemoryCache, MemoryFactory};
use crate::metrics::{
    record_checkpoint, record_checkpoint_clear, record_checkpoint_copy_to_data,
    record_checkpoint_copy_to_temp, record_log_batch,
};
use crate::page::{LogPageHeader, PageBuffer};

use super::checkpoint::{CheckpointAction, CheckpointActions};

#[derive(Default)]
struct LogState {
    last_page_id: u32,
    log_position_id: u32,
    log_pages: Vec<LogPageHeader>,
    confirmed: HashSet<u32>,
    wal_index: HashMap<u32, u32>,
    /// Versions written by transactions that are not confirmed yet.
    pending: HashMap<u32, Vec<(u32, u32)>>,
}

impl LogState {
    fn reset(&mut self, last_page_id: u32) {
        self.last_page_id = last_page_id;
        self.log_position_id = LogService::calc_init_log_position_id(last_page_id) - 1;
        self.log_pages.clear();
        self.confirmed.clear();
        self.wal_index.clear();
        self.pending.clear();
    }

    fn next_position(&mut self) -> u32 {
        loop {
            self.log_position_id += 1;
            if self.log_position_id != 0 && !is_allocation_map_slot(self.log_position_id) {
                return self.log_position_id;
            }
        }
    }
}

pub struct LogService {
    disk: Arc<dyn Disk>,
    factory: Arc<MemoryFactory>,
    state: Mutex<LogState>,
}

impl LogService {
    pub fn new(disk: Arc<dyn Disk>, factory: Arc<MemoryFactory>) -> Self {
        Self {
            disk,
            factory,
            state: Mutex::new(LogState::default()),
        }
    }

    /// First log slot for a data region ending at `last_page_id`: two extents of headroom.
    pub fn calc_init_log_position_id(last_page_id: u32) -> u32 {
        last_page_id + 2 * AM_EXTEND_SIZE
    }

    /// Read the end of the data region from the file length and reset the log.
    pub fn initialize(&self) -> Result<()> {
        let len = self.disk.get_length()?;
        let last_page_id = (len / PAGE_SIZE as u64).saturating_sub(1) as u32;
        let mut st = self.state.lock();
        st.reset(last_page_id);
        debug!(
            "log: initialized, last page {}, first log slot {}",
            last_page_id,
            Self::calc_init_log_position_id(last_page_id)
        );
        Ok(())
    }

    /// Next free log slot (never slot 0 nor an allocation-map slot).
    pub fn get_next_log_position_id(&self) -> u32 {
        self.state.lock().next_position()
    }

    pub fn last_page_id(&self) -> u32 {
        self.state.lock().last_page_id
    }

    pub fn log_position_id(&self) -> u32 {
        self.state.lock().log_position_id
    }

    /// Pages written to the log since the last checkpoint.
    pub fn log_page_count(&self) -> usize {
        self.state.lock().log_pages.len()
    }

    pub fn log_pages(&self) -> Vec<LogPageHeader> {
        self.state.lock().log_pages.clone()
    }

    pub fn is_confirmed(&self, transaction_id: u32) -> bool {
        self.state.lock().confirmed.contains(&transaction_id)
    }

    /// Slot of the newest confirmed log version of `page_id`, if any.
    pub fn wal_position(&self, page_id: u32) -> Option<u32> {
        self.state.lock().wal_index.get(&page_id).copied()
    }

    /// A slot beyond the data region was written outside the log (allocation map).
    pub fn extend_data_region(&self, page_id: u32) {
        let mut st = self.state.lock();
        if page_id > st.last_page_id {
            st.last_page_id = page_id;
            if st.log_pages.is_empty() {
                st.reset(page_id);
            }
        }
    }

    /// Forget versions of a transaction that will never be confirmed.
    pub fn discard_transaction(&self, transaction_id: u32) {
        self.state.lock().pending.remove(&transaction_id);
    }

    /// Append dirty pages to the log. Each page gets a fresh PositionID, is sealed
    /// and written; a page flagged IsConfirmed confirms its transaction.
    pub fn write_log_pages(&self, pages: &mut [PageBuffer]) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let mut st = self.state.lock();

        let mut highest = 0u32;
        for page in pages.iter_mut() {
            if page.transaction_id() == 0 {
                return Err(FolioError::InvalidState(format!(
                    "page {} has no transaction id",
                    page.page_id()
                ))
                .into());
            }
            let pos = st.next_position();
            page.set_position_id(pos);
            page.set_recovery_position_id(pos);
            page.seal()?;
            highest = highest.max(pos);
        }

        let need = slot_offset(highest + 1);
        if self.disk.get_length()? < need {
            self.disk.set_length(need)?;
        }

        for page in pages.iter() {
            let pos = page.position_id();
            self.disk.write_buffer(page.as_bytes(), slot_offset(pos))?;

            let header = LogPageHeader {
                position_id: pos,
                recovery_position_id: pos,
                page_id: page.page_id(),
                transaction_id: page.transaction_id(),
                is_confirmed: page.is_confirmed(),
            };
            st.log_pages.push(header);
            st.pending
                .entry(header.transaction_id)
                .or_default()
                .push((header.page_id, pos));

            if header.is_confirmed {
                st.confirmed.insert(header.transaction_id);
                if let Some(versions) = st.pending.remove(&header.transaction_id) {
                    for (page_id, position_id) in versions {
                        st.wal_index.insert(page_id, position_id);
                    }
                }
            }
        }
        self.disk.flush()?;
        record_log_batch(pages.len());
        Ok(())
    }

    /// Merge confirmed log pages into the data region.
    ///
    /// `crop = true` truncates the file right after the data region;
    /// otherwise the log area is zero-filled in ascending order and kept as headroom.
    /// Returns the number of pages copied to the data region.
    pub fn checkpoint(&self, crop: bool, add_to_cache: bool, cache: &MemoryCache) -> Result<usize> {
        let mut st = self.state.lock();
        if st.log_pages.is_empty() && !crop {
            return Ok(0);
        }

        let last_page_id = st
            .log_pages
            .iter()
            .map(|h| h.page_id)
            .fold(st.last_page_id, u32::max);
        let start_temp = last_page_id.max(st.log_position_id) + 1;

        let actions = CheckpointActions::new(&st.log_pages, &st.confirmed, last_page_id, start_temp)
            .actions()?;
        debug!(
            "checkpoint: {} log page(s), {} action(s), last page {}",
            st.log_pages.len(),
            actions.len(),
            last_page_id
        );

        let copied = self.apply(&actions, add_to_cache, cache)?;

        let len = self.disk.get_length()?;
        if crop {
            self.disk.set_length(slot_offset(last_page_id + 1))?;
        } else {
            let zero = self.factory.allocate_new_page();
            let last_used = (len / PAGE_SIZE as u64).saturating_sub(1) as u32;
            let res = (|| -> Result<()> {
                for pos in (last_page_id + 1)..=last_used {
                    if is_allocation_map_slot(pos) {
                        continue;
                    }
                    self.disk.write_buffer(zero.as_bytes(), slot_offset(pos))?;
                }
                Ok(())
            })();
            self.factory.deallocate_page(zero);
            res?;
        }
        self.disk.flush()?;

        cache.clear_log_pages();
        st.reset(last_page_id);
        record_checkpoint();
        info!(
            "checkpoint: {} page(s) copied, crop={}, data region ends at {}",
            copied, crop, last_page_id
        );
        Ok(copied)
    }

    fn apply(
        &self,
        actions: &[CheckpointAction],
        add_to_cache: bool,
        cache: &MemoryCache,
    ) -> Result<usize> {
        let zero = self.factory.allocate_new_page();
        let res = (|| -> Result<usize> {
            let mut copied = 0usize;
            for action in actions {
                match *action {
                    CheckpointAction::ClearPage { position_id } => {
                        self.disk
                            .write_buffer(zero.as_bytes(), slot_offset(position_id))?;
                        cache.invalidate(position_id);
                        record_checkpoint_clear();
                    }
                    CheckpointAction::CopyToDataFile {
                        position_id,
                        target_position_id,
                        ..
                    } => {
                        let mut page = self.take_page(position_id, cache)?;
                        if page.page_id() != target_position_id {
                            let found = page.page_id();
                            self.factory.deallocate_page(page);
                            return Err(FolioError::Invariant(format!(
                                "slot {} holds page {}, expected {}",
                                position_id, found, target_position_id
                            ))
                            .into());
                        }
                        page.make_data_page()?;
                        if let Err(e) = self
                            .disk
                            .write_buffer(page.as_bytes(), slot_offset(target_position_id))
                        {
                            self.factory.deallocate_page(page);
                            return Err(e);
                        }
                        cache.invalidate(target_position_id);
                        if add_to_cache {
                            if let Err(page) = cache.add_page_in_cache(page) {
                                self.factory.deallocate_page(page);
                            }
                        } else {
                            self.factory.deallocate_page(page);
                        }
                        copied += 1;
                        record_checkpoint_copy_to_data();
                    }
                    CheckpointAction::CopyToTempFile {
                        position_id,
                        target_position_id,
                    } => {
                        // RecoveryPositionID keeps the log slot; flags stay as logged
                        let mut page = self.take_page(position_id, cache)?;
                        page.set_position_id(target_position_id);
                        let res = page.seal().and_then(|_| {
                            self.disk
                                .write_buffer(page.as_bytes(), slot_offset(target_position_id))
                        });
                        self.factory.deallocate_page(page);
                        res?;
                        record_checkpoint_copy_to_temp();
                    }
                }
            }
            Ok(copied)
        })();
        self.factory.deallocate_page(zero);
        res
    }

    /// Exclusive copy of the page at `position_id`: from the cache if nobody shares it,
    /// otherwise from disk. The cache entry is dropped either way.
    fn take_page(&self, position_id: u32, cache: &MemoryCache) -> Result<PageBuffer> {
        if let Some(page) = cache.try_remove(position_id) {
            return Ok(page);
        }
        cache.invalidate(position_id);
        let mut page = self.factory.allocate_new_page();
        match self
            .disk
            .read_buffer(page.as_bytes_mut(), slot_offset(position_id))
        {
            Ok(true) => Ok(page),
            Ok(false) => {
                self.factory.deallocate_page(page);
                Err(FolioError::ShortRead {
                    position: slot_offset(position_id),
                    wanted: PAGE_SIZE,
                }
                .into())
            }
            Err(e) => {
                self.factory.deallocate_page(page);
                Err(e)
            }
        }
    }
}
