//! alloc_map/extent - кодирование экстента и адресация страниц.
//!
//! Extent value (u32):
//!   [ColID u8][p0 3b][p1 3b]...[p7 3b]   (page 0 in the highest triple)
//! value == 0 → unowned extent.
//!
//! Page codes:
//!   0 empty, 1..=4 data (>=4096 / >=1024 / >0 / 0 free bytes),
//!   5 index with room, 6 full index, 7 reserved.
//!
//! Addressing (slot 0 = file header):
//!   amPageID = AM_FIRST_PAGE_ID + amIndex * AM_PAGE_STEP
//!   pageID   = amPageID + 1 + extendIndex * AM_EXTEND_SIZE + pageIndex

use anyhow::Result;

use crate::consts::{
    is_allocation_map_slot, AM_EXTEND_COUNT, AM_EXTEND_SIZE, AM_FIRST_PAGE_ID, AM_PAGE_BITS,
    AM_PAGE_STEP,
};
use crate::error::FolioError;
use crate::page::PageType;

pub const CODE_EMPTY: u8 = 0;
pub const CODE_DATA_LARGE: u8 = 1;
pub const CODE_DATA_MEDIUM: u8 = 2;
pub const CODE_DATA_SMALL: u8 = 3;
pub const CODE_DATA_FULL: u8 = 4;
pub const CODE_INDEX: u8 = 5;
pub const CODE_INDEX_FULL: u8 = 6;

/// Index pages with less free space than this are reported as full.
pub const INDEX_PAGE_MIN_FREE: u16 = 1024;

const CODE_MASK: u32 = (1 << AM_PAGE_BITS) - 1;
const CODES_MASK: u32 = 0x00FF_FFFF;

/// Where a scan for free space stands: allocation-map page index + extent index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ExtendLocation {
    pub am_index: u32,
    pub extend_index: u32,
}

impl ExtendLocation {
    pub fn new(am_index: u32, extend_index: u32) -> Self {
        Self {
            am_index,
            extend_index,
        }
    }

    /// Next extent in scan order (rolls over into the next allocation-map page).
    pub fn next(self) -> Self {
        if self.extend_index + 1 >= AM_EXTEND_COUNT {
            Self::new(self.am_index + 1, 0)
        } else {
            Self::new(self.am_index, self.extend_index + 1)
        }
    }

    pub fn first_page_id(self) -> u32 {
        page_id_of(self.am_index, self.extend_index, 0)
    }
}

/// Decomposed PageID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAddress {
    pub am_index: u32,
    pub extend_index: u32,
    pub page_index: u32,
}

impl PageAddress {
    pub fn location(&self) -> ExtendLocation {
        ExtendLocation::new(self.am_index, self.extend_index)
    }
}

#[inline]
pub fn am_page_id(am_index: u32) -> u32 {
    AM_FIRST_PAGE_ID + am_index * AM_PAGE_STEP
}

#[inline]
pub fn page_id_of(am_index: u32, extend_index: u32, page_index: u32) -> u32 {
    am_page_id(am_index) + 1 + extend_index * AM_EXTEND_SIZE + page_index
}

/// PageID → (amIndex, extendIndex, pageIndex). Slot 0 and allocation-map slots have no address.
pub fn page_address(page_id: u32) -> Result<PageAddress> {
    if page_id <= AM_FIRST_PAGE_ID || is_allocation_map_slot(page_id) {
        return Err(FolioError::Invariant(format!(
            "page {} is not a data/index page id",
            page_id
        ))
        .into());
    }
    let rel = page_id - AM_FIRST_PAGE_ID;
    let am_index = rel / AM_PAGE_STEP;
    let within = rel % AM_PAGE_STEP - 1;
    Ok(PageAddress {
        am_index,
        extend_index: within / AM_EXTEND_SIZE,
        page_index: within % AM_EXTEND_SIZE,
    })
}

#[inline]
pub fn extent_col(value: u32) -> u8 {
    (value >> 24) as u8
}

#[inline]
pub fn page_code(value: u32, page_index: u32) -> u8 {
    let shift = (AM_EXTEND_SIZE - 1 - page_index) * AM_PAGE_BITS;
    ((value >> shift) & CODE_MASK) as u8
}

#[inline]
pub fn with_page_code(value: u32, page_index: u32, code: u8) -> u32 {
    let shift = (AM_EXTEND_SIZE - 1 - page_index) * AM_PAGE_BITS;
    (value & !(CODE_MASK << shift)) | (((code as u32) & CODE_MASK) << shift)
}

#[inline]
pub fn with_col(value: u32, col_id: u8) -> u32 {
    (value & CODES_MASK) | ((col_id as u32) << 24)
}

/// Extent is claimed by some collection.
#[inline]
pub fn is_owned(value: u32) -> bool {
    value != 0
}

/// Page code for a page of `page_type` with `free_bytes` left.
pub fn free_code(page_type: PageType, free_bytes: u16) -> u8 {
    match page_type {
        PageType::Data => match free_bytes {
            f if f >= 4096 => CODE_DATA_LARGE,
            f if f >= 1024 => CODE_DATA_MEDIUM,
            0 => CODE_DATA_FULL,
            _ => CODE_DATA_SMALL,
        },
        PageType::Index => {
            if free_bytes >= INDEX_PAGE_MIN_FREE {
                CODE_INDEX
            } else {
                CODE_INDEX_FULL
            }
        }
        PageType::Empty | PageType::AllocationMap => CODE_EMPTY,
    }
}

/// Existing page with this code can take more content of `page_type`.
pub fn has_room_for(code: u8, page_type: PageType) -> bool {
    match page_type {
        PageType::Data => code == CODE_DATA_LARGE || code == CODE_DATA_MEDIUM,
        PageType::Index => code == CODE_INDEX,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrip_skips_am_slots() {
        assert!(page_address(0).is_err());
        assert!(page_address(1).is_err());
        assert!(page_address(am_page_id(1)).is_err());

        let a = page_address(2).unwrap();
        assert_eq!((a.am_index, a.extend_index, a.page_index), (0, 0, 0));

        let a = page_address(12).unwrap();
        assert_eq!((a.am_index, a.extend_index, a.page_index), (0, 1, 2));
        assert_eq!(page_id_of(0, 1, 2), 12);

        // last page of AM 0, first page of AM 1
        let last = am_page_id(1) - 1;
        let a = page_address(last).unwrap();
        assert_eq!((a.am_index, a.extend_index, a.page_index), (0, AM_EXTEND_COUNT - 1, 7));
        let a = page_address(am_page_id(1) + 1).unwrap();
        assert_eq!((a.am_index, a.extend_index, a.page_index), (1, 0, 0));
    }

    #[test]
    fn codes_pack_high_to_low() {
        let mut v = with_col(0, 9);
        v = with_page_code(v, 0, CODE_INDEX_FULL);
        v = with_page_code(v, 7, CODE_DATA_SMALL);
        assert_eq!(extent_col(v), 9);
        assert_eq!(page_code(v, 0), CODE_INDEX_FULL);
        assert_eq!(page_code(v, 7), CODE_DATA_SMALL);
        assert_eq!(page_code(v, 3), CODE_EMPTY);
        assert_eq!(v & 0x7, CODE_DATA_SMALL as u32);

        v = with_page_code(v, 0, CODE_EMPTY);
        assert_eq!(page_code(v, 0), CODE_EMPTY);
    }

    #[test]
    fn free_code_thresholds() {
        assert_eq!(free_code(PageType::Data, 8000), CODE_DATA_LARGE);
        assert_eq!(free_code(PageType::Data, 4095), CODE_DATA_MEDIUM);
        assert_eq!(free_code(PageType::Data, 10), CODE_DATA_SMALL);
        assert_eq!(free_code(PageType::Data, 0), CODE_DATA_FULL);
        assert_eq!(free_code(PageType::Index, 2000), CODE_INDEX);
        assert_eq!(free_code(PageType::Index, 100), CODE_INDEX_FULL);
    }
}
