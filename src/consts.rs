//! Общие константы формата: страницы, заголовок файла, allocation map.
//!
//! Slot 0 is the file header page. Allocation-map pages sit at
//! `AM_FIRST_PAGE_ID + k * AM_PAGE_STEP`; everything else is a data/index slot.

// -------- Pages --------
pub const PAGE_SIZE: usize = 8192;
pub const PAGE_HEADER_SIZE: usize = 32;
/// Trailing CRC32 (LE) over `[0 .. PAGE_CRC_OFFSET)`.
pub const PAGE_CRC_OFFSET: usize = PAGE_SIZE - 4;
/// Usable body bytes between header and CRC trailer.
pub const PAGE_BODY_SIZE: usize = PAGE_CRC_OFFSET - PAGE_HEADER_SIZE;

// -------- File header page (slot 0) --------
pub const FILE_HEADER_SIZE: usize = 192;
pub const PRAGMA_OFFSET: usize = FILE_HEADER_SIZE;
pub const PRAGMA_SIZE: usize = 64;
pub const FILE_MAGIC: &[u8; 16] = b"** FolioDB v1 **";
pub const FILE_VERSION: u8 = 1;
pub const ENGINE_VERSION: (u8, u8, u8) = (0, 1, 0);

// -------- Allocation map --------
pub const AM_FIRST_PAGE_ID: u32 = 1;
pub const AM_EXTEND_SIZE: u32 = 8;
pub const AM_EXTEND_COUNT: u32 = ((PAGE_SIZE - PAGE_HEADER_SIZE - 4) / 4) as u32;
pub const AM_PAGE_STEP: u32 = AM_EXTEND_COUNT * AM_EXTEND_SIZE + 1;
/// Bits per page code inside an extent value.
pub const AM_PAGE_BITS: u32 = 3;

// -------- Misc --------
pub const MAX_COLLECTIONS: usize = 256;
pub const DEFAULT_CHECKPOINT_PAGES: u32 = 1000;

/// Absolute byte offset of a physical slot.
#[inline]
pub fn slot_offset(position_id: u32) -> u64 {
    position_id as u64 * PAGE_SIZE as u64
}

/// true if `position_id` is the slot of an allocation-map page.
#[inline]
pub fn is_allocation_map_slot(position_id: u32) -> bool {
    position_id >= AM_FIRST_PAGE_ID && (position_id - AM_FIRST_PAGE_ID) % AM_PAGE_STEP == 0
}
