//! alloc_map - карта свободного места по экстентам.
//!
//! - extent.rs - кодирование значения экстента, PageID ↔ (amIndex, extendIndex, pageIndex).
//! - page.rs   - AllocationMapPage: in-memory копия страницы карты.
//!
//! Политика:
//! - Страницы карты пишутся напрямую на свой слот (не через лог): после грязного
//!   закрытия они всегда пересобираются из страниц данных (`rebuild_from_data`).
//! - `get_free_extend` - единственный путь получить PageID для новой страницы;
//!   экстент принадлежит ровно одной коллекции.
//! - Вызовы для одной коллекции сериализуются её write-lock'ом; внутреннее состояние
//!   защищено своим mutex.

use anyhow::Result;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::consts::{
    is_allocation_map_slot, slot_offset, AM_EXTEND_COUNT, AM_EXTEND_SIZE, AM_PAGE_STEP,
    PAGE_BODY_SIZE,
};
use crate::disk::Disk;
use crate::error::FolioError;
use crate::memory::MemoryFactory;
use crate::page::PageType;

pub mod extent;
pub mod page;

pub use extent::{
    am_page_id, extent_col, free_code, page_address, page_code, page_id_of, ExtendLocation,
    PageAddress,
};
pub use page::AllocationMapPage;

use extent::{has_room_for, is_owned, with_col, with_page_code, CODE_EMPTY};

/// Result of `get_free_extend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeExtend {
    pub page_id: u32,
    /// Page slot was empty: caller must start from a zeroed page.
    pub is_new: bool,
    /// Where the next scan for this collection should start.
    pub next: ExtendLocation,
    /// Extent that served the request and its value before this call (for rollback).
    pub location: ExtendLocation,
    pub previous_value: u32,
}

pub struct AllocationMapService {
    disk: Arc<dyn Disk>,
    factory: Arc<MemoryFactory>,
    pages: Mutex<Vec<AllocationMapPage>>,
}

impl AllocationMapService {
    pub fn new(disk: Arc<dyn Disk>, factory: Arc<MemoryFactory>) -> Self {
        Self {
            disk,
            factory,
            pages: Mutex::new(Vec::new()),
        }
    }

    /// Load every allocation-map page, AM_FIRST_PAGE_ID then +AM_PAGE_STEP, until EOF.
    pub fn initialize(&self) -> Result<()> {
        let mut loaded = Vec::new();
        let mut buf = self.factory.allocate_new_page();
        let res = (|| -> Result<()> {
            loop {
                let am_index = loaded.len() as u32;
                let pos = am_page_id(am_index);
                if !self.disk.read_buffer(buf.as_bytes_mut(), slot_offset(pos))? {
                    return Ok(());
                }
                if buf.is_zeroed() {
                    // slot reserved by a larger file but never written
                    loaded.push(AllocationMapPage::new(am_index));
                } else {
                    loaded.push(AllocationMapPage::read(am_index, &buf)?);
                }
            }
        })();
        self.factory.deallocate_page(buf);
        res?;

        if loaded.is_empty() {
            loaded.push(AllocationMapPage::new(0));
        }
        debug!("alloc_map: {} allocation map page(s) loaded", loaded.len());
        *self.pages.lock() = loaded;
        Ok(())
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Find room for a page of `page_type` owned by `col_id`, starting at `current`.
    ///
    /// Order: extents of `col_id` (existing page with room first, then an empty slot),
    /// then the first unowned extent, then a brand-new allocation-map page.
    /// New pages are reserved in memory right away.
    pub fn get_free_extend(
        &self,
        current: ExtendLocation,
        col_id: u8,
        page_type: PageType,
    ) -> Result<FreeExtend> {
        if !matches!(page_type, PageType::Data | PageType::Index) {
            return Err(FolioError::Invariant(format!(
                "cannot allocate a {:?} page through the allocation map",
                page_type
            ))
            .into());
        }

        let mut pages = self.pages.lock();
        let total = pages.len() as u32 * AM_EXTEND_COUNT;
        let start = if current.am_index as usize >= pages.len() {
            0
        } else {
            current.am_index * AM_EXTEND_COUNT + current.extend_index.min(AM_EXTEND_COUNT - 1)
        };
        let order = (start..total).chain(0..start);

        // pass 1: extents already owned by this collection
        for linear in order.clone() {
            let loc = ExtendLocation::new(linear / AM_EXTEND_COUNT, linear % AM_EXTEND_COUNT);
            let value = pages[loc.am_index as usize].extent(loc.extend_index);
            if !is_owned(value) || extent_col(value) != col_id {
                continue;
            }
            if let Some(found) = pick_in_extent(&mut pages, loc, value, col_id, page_type) {
                return Ok(found);
            }
        }

        // pass 2: first unowned extent
        for linear in order {
            let loc = ExtendLocation::new(linear / AM_EXTEND_COUNT, linear % AM_EXTEND_COUNT);
            let value = pages[loc.am_index as usize].extent(loc.extend_index);
            if is_owned(value) {
                continue;
            }
            if let Some(found) = pick_in_extent(&mut pages, loc, value, col_id, page_type) {
                return Ok(found);
            }
        }

        // every extent is taken: new allocation-map page
        let am_index = pages.len() as u32;
        pages.push(AllocationMapPage::new(am_index));
        info!(
            "alloc_map: new allocation map page {} (index {})",
            am_page_id(am_index),
            am_index
        );
        let loc = ExtendLocation::new(am_index, 0);
        pick_in_extent(&mut pages, loc, 0, col_id, page_type).ok_or_else(|| {
            FolioError::Invariant("fresh allocation map page has no free extent".into()).into()
        })
    }

    /// Current extent value holding `page_id`.
    pub fn extend_value(&self, page_id: u32) -> Result<u32> {
        let addr = page_address(page_id)?;
        let pages = self.pages.lock();
        let am = pages.get(addr.am_index as usize).ok_or_else(|| {
            FolioError::Invariant(format!("page {} is beyond the allocation map", page_id))
        })?;
        Ok(am.extent(addr.extend_index))
    }

    /// Fails if `page_id` cannot be recorded for `col_id` (bad slot or foreign extent).
    pub fn check_page_owner(&self, page_id: u32, col_id: u8) -> Result<()> {
        let addr = page_address(page_id)?;
        let pages = self.pages.lock();
        let value = pages
            .get(addr.am_index as usize)
            .map_or(0, |am| am.extent(addr.extend_index));
        check_owner(value, page_id, col_id)
    }

    /// Write the page code of `page_id` (owned by `col_id`) into its allocation-map page.
    pub fn update_page_map(&self, page_id: u32, col_id: u8, code: u8) -> Result<()> {
        let addr = page_address(page_id)?;
        let mut pages = self.pages.lock();
        while pages.len() <= addr.am_index as usize {
            let idx = pages.len() as u32;
            pages.push(AllocationMapPage::new(idx));
        }
        let am = &mut pages[addr.am_index as usize];
        let value = am.extent(addr.extend_index);
        check_owner(value, page_id, col_id)?;
        let updated = with_page_code(with_col(value, col_id), addr.page_index, code);
        // empty extent of collection 0 collapses back to unowned
        let updated = if updated & 0x00FF_FFFF == 0 && col_id == 0 { 0 } else { updated };
        am.set_extent(addr.extend_index, updated);
        Ok(())
    }

    /// Roll back in-memory extent accounting (transaction rollback). No disk I/O.
    pub fn restore_extend_values(&self, values: &HashMap<ExtendLocation, u32>) {
        let mut pages = self.pages.lock();
        for (loc, value) in values {
            if let Some(am) = pages.get_mut(loc.am_index as usize) {
                am.set_extent(loc.extend_index, *value);
            }
        }
    }

    /// Write every dirty allocation-map page straight to its slot.
    /// Returns the highest slot written, if any.
    pub fn write_all_changes(&self) -> Result<Option<u32>> {
        let mut pages = self.pages.lock();
        let mut buf = self.factory.allocate_new_page();
        let mut highest = None;
        let res = (|| -> Result<()> {
            for am in pages.iter_mut().filter(|p| p.is_dirty()) {
                am.write(&mut buf)?;
                self.disk
                    .write_buffer(buf.as_bytes(), slot_offset(am.page_id()))?;
                am.set_dirty(false);
                highest = Some(am.page_id());
            }
            Ok(())
        })();
        self.factory.deallocate_page(buf);
        res?;
        if let Some(h) = highest {
            debug!("alloc_map: changes written (highest slot {})", h);
        }
        Ok(highest)
    }

    /// Regenerate the whole map from the data pages in slots `2..=last_page_id`
    /// and write it to disk. Returns the number of allocation-map pages written.
    pub fn rebuild_from_data(&self, last_page_id: u32) -> Result<usize> {
        let am_count = if last_page_id < 2 || is_allocation_map_slot(last_page_id) {
            last_page_id.saturating_sub(1) / AM_PAGE_STEP + 1
        } else {
            page_address(last_page_id)?.am_index + 1
        };
        let mut fresh: Vec<AllocationMapPage> =
            (0..am_count).map(AllocationMapPage::new).collect();
        let mut owners: HashMap<ExtendLocation, u8> = HashMap::new();

        let mut buf = self.factory.allocate_new_page();
        let res = (|| -> Result<()> {
            for slot in 2..=last_page_id {
                if is_allocation_map_slot(slot) {
                    continue;
                }
                if !self.disk.read_buffer(buf.as_bytes_mut(), slot_offset(slot))? {
                    break;
                }
                if buf.is_zeroed() {
                    continue;
                }
                if !buf.verify_checksum() || buf.page_id() != slot {
                    warn!("alloc_map rebuild: slot {} is not a valid data page, left empty", slot);
                    continue;
                }
                let page_type = match buf.page_type() {
                    Some(t @ (PageType::Data | PageType::Index)) => t,
                    _ => continue,
                };
                let h = buf.header()?;
                let addr = page_address(slot)?;
                let loc = addr.location();
                match owners.get(&loc) {
                    Some(col) if *col != h.col_id => {
                        return Err(FolioError::Invariant(format!(
                            "extent starting at page {} mixes collections {} and {}",
                            loc.first_page_id(),
                            col,
                            h.col_id
                        ))
                        .into());
                    }
                    _ => {
                        owners.insert(loc, h.col_id);
                    }
                }
                let am = &mut fresh[addr.am_index as usize];
                let value = with_col(am.extent(addr.extend_index), h.col_id);
                let code = free_code(page_type, h.free_bytes);
                am.set_extent(
                    addr.extend_index,
                    with_page_code(value, addr.page_index, code),
                );
            }
            Ok(())
        })();
        self.factory.deallocate_page(buf);
        res?;

        let written = fresh.len();
        *self.pages.lock() = fresh;
        self.write_all_changes()?;
        info!(
            "alloc_map: rebuilt {} allocation map page(s) up to page {}",
            written, last_page_id
        );
        Ok(written)
    }

    /// All PageIDs whose code is non-empty and whose extent belongs to `col_id`.
    pub fn pages_of_collection(&self, col_id: u8) -> Vec<u32> {
        let pages = self.pages.lock();
        let mut out = Vec::new();
        for am in pages.iter() {
            for (e, value) in am.extents().iter().enumerate() {
                if !is_owned(*value) || extent_col(*value) != col_id {
                    continue;
                }
                for p in 0..AM_EXTEND_SIZE {
                    if page_code(*value, p) != CODE_EMPTY {
                        out.push(page_id_of(am.am_index(), e as u32, p));
                    }
                }
            }
        }
        out
    }

    /// Serialized image of every allocation-map page (tests, diagnostics).
    pub fn page_images(&self) -> Result<Vec<Vec<u8>>> {
        let pages = self.pages.lock();
        let mut buf = self.factory.allocate_new_page();
        let mut out = Vec::with_capacity(pages.len());
        let res = (|| -> Result<()> {
            for am in pages.iter() {
                am.write(&mut buf)?;
                out.push(buf.as_bytes().to_vec());
            }
            Ok(())
        })();
        self.factory.deallocate_page(buf);
        res?;
        Ok(out)
    }
}

/// Try to serve the request from one extent; reserves an empty slot when taken.
fn check_owner(value: u32, page_id: u32, col_id: u8) -> Result<()> {
    if is_owned(value) && extent_col(value) != col_id {
        return Err(FolioError::Invariant(format!(
            "page {} belongs to an extent of collection {}, not {}",
            page_id,
            extent_col(value),
            col_id
        ))
        .into());
    }
    Ok(())
}

fn pick_in_extent(
    pages: &mut [AllocationMapPage],
    loc: ExtendLocation,
    value: u32,
    col_id: u8,
    page_type: PageType,
) -> Option<FreeExtend> {
    let existing = (0..AM_EXTEND_SIZE).find(|p| has_room_for(page_code(value, *p), page_type));
    if let Some(p) = existing {
        return Some(FreeExtend {
            page_id: page_id_of(loc.am_index, loc.extend_index, p),
            is_new: false,
            next: loc,
            location: loc,
            previous_value: value,
        });
    }

    let empty = (0..AM_EXTEND_SIZE).find(|p| page_code(value, *p) == CODE_EMPTY)?;
    let code = free_code(page_type, PAGE_BODY_SIZE as u16);
    let reserved = with_page_code(with_col(value, col_id), empty, code);
    pages[loc.am_index as usize].set_extent(loc.extend_index, reserved);

    let has_more = (0..AM_EXTEND_SIZE).any(|p| page_code(reserved, p) == CODE_EMPTY);
    Some(FreeExtend {
        page_id: page_id_of(loc.am_index, loc.extend_index, empty),
        is_new: true,
        next: if has_more { loc } else { loc.next() },
        location: loc,
        previous_value: value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemoryDisk;

    fn service() -> AllocationMapService {
        let disk = MemoryDisk::new();
        disk.create_new().unwrap();
        let svc = AllocationMapService::new(Arc::new(disk), Arc::new(MemoryFactory::new(4)));
        svc.initialize().unwrap();
        svc
    }

    #[test]
    fn new_pages_fill_one_extent_then_move_on() {
        let svc = service();
        let mut cur = ExtendLocation::default();
        let mut ids = Vec::new();
        for _ in 0..9 {
            let fe = svc.get_free_extend(cur, 1, PageType::Index).unwrap();
            assert!(fe.is_new);
            ids.push(fe.page_id);
            // mark full so the page is not offered again as "with room"
            svc.update_page_map(fe.page_id, 1, extent::CODE_INDEX_FULL).unwrap();
            cur = fe.next;
        }
        assert_eq!(ids[..8], [2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(ids[8], 10);
    }

    #[test]
    fn page_with_room_is_reused() {
        let svc = service();
        let fe = svc
            .get_free_extend(ExtendLocation::default(), 0, PageType::Data)
            .unwrap();
        assert!(fe.is_new);
        let again = svc
            .get_free_extend(ExtendLocation::default(), 0, PageType::Data)
            .unwrap();
        assert!(!again.is_new);
        assert_eq!(again.page_id, fe.page_id);
    }

    #[test]
    fn collections_never_share_an_extent() {
        let svc = service();
        let a = svc
            .get_free_extend(ExtendLocation::default(), 1, PageType::Data)
            .unwrap();
        let b = svc
            .get_free_extend(ExtendLocation::default(), 2, PageType::Data)
            .unwrap();
        assert_ne!(a.location, b.location);
        assert!(svc.check_page_owner(a.page_id, 2).is_err());
        assert!(svc.check_page_owner(a.page_id, 1).is_ok());
        assert!(svc.check_page_owner(1, 1).is_err());
        assert!(svc.update_page_map(a.page_id, 2, 1).is_err());
        assert_eq!(svc.pages_of_collection(1), vec![a.page_id]);
        assert_eq!(svc.pages_of_collection(2), vec![b.page_id]);
    }

    #[test]
    fn restore_undoes_reservation() {
        let svc = service();
        let fe = svc
            .get_free_extend(ExtendLocation::default(), 4, PageType::Data)
            .unwrap();
        let mut undo = HashMap::new();
        undo.insert(fe.location, fe.previous_value);
        svc.restore_extend_values(&undo);
        assert_eq!(svc.extend_value(fe.page_id).unwrap(), 0);
        assert!(svc.pages_of_collection(4).is_empty());
    }
}
