//! alloc_map/page - in-memory allocation-map page.
//!
//! Body layout: AM_EXTEND_COUNT × u32 LE extent values right after the page header.
//! The page lives at its own slot (PageID == PositionID) and is never logged.

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{AM_EXTEND_COUNT, PAGE_HEADER_SIZE};
use crate::error::FolioError;
use crate::page::{PageBuffer, PageHeader, PageType};

use super::extent::am_page_id;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationMapPage {
    am_index: u32,
    extents: Vec<u32>,
    dirty: bool,
}

impl AllocationMapPage {
    pub fn new(am_index: u32) -> Self {
        Self {
            am_index,
            extents: vec![0u32; AM_EXTEND_COUNT as usize],
            dirty: true,
        }
    }

    /// Parse a page read from slot `am_page_id(am_index)`.
    pub fn read(am_index: u32, page: &PageBuffer) -> Result<Self> {
        let expected = am_page_id(am_index);
        let h = page.header()?;
        if h.page_type != PageType::AllocationMap || h.page_id != expected {
            return Err(FolioError::InvalidPage {
                position_id: expected,
                reason: format!(
                    "expected allocation map {}, found {:?} page {}",
                    expected, h.page_type, h.page_id
                ),
            }
            .into());
        }
        if !page.verify_checksum() {
            return Err(FolioError::InvalidPage {
                position_id: expected,
                reason: "allocation map checksum mismatch".into(),
            }
            .into());
        }
        let bytes = page.as_bytes();
        let extents = (0..AM_EXTEND_COUNT as usize)
            .map(|i| {
                let off = PAGE_HEADER_SIZE + i * 4;
                LittleEndian::read_u32(&bytes[off..off + 4])
            })
            .collect();
        Ok(Self {
            am_index,
            extents,
            dirty: false,
        })
    }

    /// Serialize into `page` (overwrites everything, seals the CRC).
    pub fn write(&self, page: &mut PageBuffer) -> Result<()> {
        page.clear();
        let mut h = PageHeader::new(self.page_id(), PageType::AllocationMap, 0);
        h.free_bytes = 0;
        h.items_count = self.extents.iter().filter(|v| **v != 0).count() as u16;
        page.set_header(&h)?;
        let bytes = page.as_bytes_mut();
        for (i, v) in self.extents.iter().enumerate() {
            let off = PAGE_HEADER_SIZE + i * 4;
            LittleEndian::write_u32(&mut bytes[off..off + 4], *v);
        }
        page.seal()
    }

    pub fn am_index(&self) -> u32 {
        self.am_index
    }

    pub fn page_id(&self) -> u32 {
        am_page_id(self.am_index)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    #[inline]
    pub fn extent(&self, extend_index: u32) -> u32 {
        self.extents[extend_index as usize]
    }

    pub fn set_extent(&mut self, extend_index: u32, value: u32) {
        let slot = &mut self.extents[extend_index as usize];
        if *slot != value {
            *slot = value;
            self.dirty = true;
        }
    }

    pub fn extents(&self) -> &[u32] {
        &self.extents
    }
}
