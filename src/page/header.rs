//! page/header - заголовок страницы (32 байта, LE).
//!
//! Layout:
//! [page_id u32][position_id u32][recovery_position_id u32][type u8][col_id u8][flags u8][pad u8]
//! [transaction_id u32][free_bytes u16][items_count u16][used_bytes u16][reserved 6]

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{PAGE_BODY_SIZE, PAGE_HEADER_SIZE};

pub const OFF_PAGE_ID: usize = 0;
pub const OFF_POSITION_ID: usize = 4;
pub const OFF_RECOVERY_POSITION_ID: usize = 8;
pub const OFF_PAGE_TYPE: usize = 12;
pub const OFF_COL_ID: usize = 13;
pub const OFF_FLAGS: usize = 14;
pub const OFF_TRANSACTION_ID: usize = 16;
pub const OFF_FREE_BYTES: usize = 20;
pub const OFF_ITEMS_COUNT: usize = 22;
pub const OFF_USED_BYTES: usize = 24;

pub const FLAG_CONFIRMED: u8 = 0x1;
pub const FLAG_DIRTY: u8 = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    Empty = 0,
    AllocationMap = 1,
    Data = 2,
    Index = 3,
}

impl PageType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(PageType::Empty),
            1 => Ok(PageType::AllocationMap),
            2 => Ok(PageType::Data),
            3 => Ok(PageType::Index),
            other => Err(anyhow!("unknown page type {}", other)),
        }
    }
}

/// Decoded page header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHeader {
    pub page_id: u32,
    pub position_id: u32,
    pub recovery_position_id: u32,
    pub page_type: PageType,
    pub col_id: u8,
    pub transaction_id: u32,
    pub is_confirmed: bool,
    pub is_dirty: bool,
    pub free_bytes: u16,
    pub items_count: u16,
    pub used_bytes: u16,
}

impl PageHeader {
    /// Header of a freshly created page that lives at its home slot.
    pub fn new(page_id: u32, page_type: PageType, col_id: u8) -> Self {
        Self {
            page_id,
            position_id: page_id,
            recovery_position_id: page_id,
            page_type,
            col_id,
            transaction_id: 0,
            is_confirmed: false,
            is_dirty: false,
            free_bytes: PAGE_BODY_SIZE as u16,
            items_count: 0,
            used_bytes: 0,
        }
    }

    pub fn read(page: &[u8]) -> Result<Self> {
        if page.len() < PAGE_HEADER_SIZE {
            return Err(anyhow!("page buffer too small for header"));
        }
        let flags = page[OFF_FLAGS];
        Ok(Self {
            page_id: LittleEndian::read_u32(&page[OFF_PAGE_ID..OFF_PAGE_ID + 4]),
            position_id: LittleEndian::read_u32(&page[OFF_POSITION_ID..OFF_POSITION_ID + 4]),
            recovery_position_id: LittleEndian::read_u32(
                &page[OFF_RECOVERY_POSITION_ID..OFF_RECOVERY_POSITION_ID + 4],
            ),
            page_type: PageType::from_u8(page[OFF_PAGE_TYPE])?,
            col_id: page[OFF_COL_ID],
            transaction_id: LittleEndian::read_u32(
                &page[OFF_TRANSACTION_ID..OFF_TRANSACTION_ID + 4],
            ),
            is_confirmed: flags & FLAG_CONFIRMED != 0,
            is_dirty: flags & FLAG_DIRTY != 0,
            free_bytes: LittleEndian::read_u16(&page[OFF_FREE_BYTES..OFF_FREE_BYTES + 2]),
            items_count: LittleEndian::read_u16(&page[OFF_ITEMS_COUNT..OFF_ITEMS_COUNT + 2]),
            used_bytes: LittleEndian::read_u16(&page[OFF_USED_BYTES..OFF_USED_BYTES + 2]),
        })
    }

    /// Записать заголовок (без пересчёта CRC).
    pub fn write(&self, page: &mut [u8]) -> Result<()> {
        if page.len() < PAGE_HEADER_SIZE {
            return Err(anyhow!("page buffer too small for header"));
        }
        LittleEndian::write_u32(&mut page[OFF_PAGE_ID..OFF_PAGE_ID + 4], self.page_id);
        LittleEndian::write_u32(&mut page[OFF_POSITION_ID..OFF_POSITION_ID + 4], self.position_id);
        LittleEndian::write_u32(
            &mut page[OFF_RECOVERY_POSITION_ID..OFF_RECOVERY_POSITION_ID + 4],
            self.recovery_position_id,
        );
        page[OFF_PAGE_TYPE] = self.page_type as u8;
        page[OFF_COL_ID] = self.col_id;
        let mut flags = 0u8;
        if self.is_confirmed {
            flags |= FLAG_CONFIRMED;
        }
        if self.is_dirty {
            flags |= FLAG_DIRTY;
        }
        page[OFF_FLAGS] = flags;
        page[OFF_FLAGS + 1] = 0;
        LittleEndian::write_u32(
            &mut page[OFF_TRANSACTION_ID..OFF_TRANSACTION_ID + 4],
            self.transaction_id,
        );
        LittleEndian::write_u16(&mut page[OFF_FREE_BYTES..OFF_FREE_BYTES + 2], self.free_bytes);
        LittleEndian::write_u16(&mut page[OFF_ITEMS_COUNT..OFF_ITEMS_COUNT + 2], self.items_count);
        LittleEndian::write_u16(&mut page[OFF_USED_BYTES..OFF_USED_BYTES + 2], self.used_bytes);
        for b in &mut page[OFF_USED_BYTES + 2..PAGE_HEADER_SIZE] {
            *b = 0;
        }
        Ok(())
    }
}

/// Projection of a logged page header kept in memory until the next checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPageHeader {
    pub position_id: u32,
    /// Log slot the version was first written to; differs from `position_id` for temp copies.
    pub recovery_position_id: u32,
    pub page_id: u32,
    pub transaction_id: u32,
    pub is_confirmed: bool,
}

impl From<&PageHeader> for LogPageHeader {
    fn from(h: &PageHeader) -> Self {
        Self {
            position_id: h.position_id,
            recovery_position_id: h.recovery_position_id,
            page_id: h.page_id,
            transaction_id: h.transaction_id,
            is_confirmed: h.is_confirmed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::PAGE_SIZE;

    #[test]
    fn header_write_read() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut h = PageHeader::new(42, PageType::Index, 7);
        h.position_id = 900;
        h.recovery_position_id = 901;
        h.transaction_id = 12;
        h.is_confirmed = true;
        h.free_bytes = 100;
        h.items_count = 3;
        h.used_bytes = 8000;
        h.write(&mut page).unwrap();

        let got = PageHeader::read(&page).unwrap();
        assert_eq!(got, h);
        assert!(!got.is_dirty);
    }

    #[test]
    fn unknown_page_type_rejected() {
        let mut page = vec![0u8; PAGE_SIZE];
        page[OFF_PAGE_TYPE] = 9;
        assert!(PageHeader::read(&page).is_err());
    }
}
