//! page/buffer - владеющий буфер одной страницы.
//!
//! Buffers are handed out by `MemoryFactory` and returned to it by value, so a
//! returned buffer can't be touched again. Header fields are read/written in
//! place through typed accessors instead of pointer arithmetic.

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{PAGE_CRC_OFFSET, PAGE_HEADER_SIZE, PAGE_SIZE};

use super::checksum::{page_is_zeroed, page_update_checksum, page_verify_checksum};
use super::header::{
    PageHeader, PageType, FLAG_CONFIRMED, FLAG_DIRTY, OFF_COL_ID, OFF_FLAGS, OFF_PAGE_ID,
    OFF_PAGE_TYPE, OFF_POSITION_ID, OFF_RECOVERY_POSITION_ID, OFF_TRANSACTION_ID,
};

pub struct PageBuffer {
    data: Box<[u8; PAGE_SIZE]>,
}

impl PageBuffer {
    /// Zeroed buffer. Outside the crate buffers come from `MemoryFactory`.
    pub(crate) fn new_zeroed() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Bytes between the header and the CRC trailer.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..PAGE_CRC_OFFSET]
    }

    #[inline]
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..PAGE_CRC_OFFSET]
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    pub fn copy_from(&mut self, other: &PageBuffer) {
        self.data.copy_from_slice(&other.data[..]);
    }

    pub fn is_zeroed(&self) -> bool {
        page_is_zeroed(self.as_bytes())
    }

    // ---------- header ----------

    pub fn header(&self) -> Result<PageHeader> {
        PageHeader::read(self.as_bytes())
    }

    pub fn set_header(&mut self, h: &PageHeader) -> Result<()> {
        h.write(self.as_bytes_mut())
    }

    #[inline]
    pub fn page_id(&self) -> u32 {
        LittleEndian::read_u32(&self.data[OFF_PAGE_ID..OFF_PAGE_ID + 4])
    }

    #[inline]
    pub fn set_page_id(&mut self, v: u32) {
        LittleEndian::write_u32(&mut self.data[OFF_PAGE_ID..OFF_PAGE_ID + 4], v);
    }

    #[inline]
    pub fn position_id(&self) -> u32 {
        LittleEndian::read_u32(&self.data[OFF_POSITION_ID..OFF_POSITION_ID + 4])
    }

    #[inline]
    pub fn set_position_id(&mut self, v: u32) {
        LittleEndian::write_u32(&mut self.data[OFF_POSITION_ID..OFF_POSITION_ID + 4], v);
    }

    #[inline]
    pub fn recovery_position_id(&self) -> u32 {
        LittleEndian::read_u32(
            &self.data[OFF_RECOVERY_POSITION_ID..OFF_RECOVERY_POSITION_ID + 4],
        )
    }

    #[inline]
    pub fn set_recovery_position_id(&mut self, v: u32) {
        LittleEndian::write_u32(
            &mut self.data[OFF_RECOVERY_POSITION_ID..OFF_RECOVERY_POSITION_ID + 4],
            v,
        );
    }

    /// Raw page type byte; unknown values map to `None`.
    #[inline]
    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_u8(self.data[OFF_PAGE_TYPE]).ok()
    }

    #[inline]
    pub fn col_id(&self) -> u8 {
        self.data[OFF_COL_ID]
    }

    #[inline]
    pub fn transaction_id(&self) -> u32 {
        LittleEndian::read_u32(&self.data[OFF_TRANSACTION_ID..OFF_TRANSACTION_ID + 4])
    }

    #[inline]
    pub fn set_transaction_id(&mut self, v: u32) {
        LittleEndian::write_u32(&mut self.data[OFF_TRANSACTION_ID..OFF_TRANSACTION_ID + 4], v);
    }

    #[inline]
    pub fn is_confirmed(&self) -> bool {
        self.data[OFF_FLAGS] & FLAG_CONFIRMED != 0
    }

    #[inline]
    pub fn set_confirmed(&mut self, on: bool) {
        self.set_flag(FLAG_CONFIRMED, on);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.data[OFF_FLAGS] & FLAG_DIRTY != 0
    }

    #[inline]
    pub fn set_dirty(&mut self, on: bool) {
        self.set_flag(FLAG_DIRTY, on);
    }

    #[inline]
    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.data[OFF_FLAGS] |= flag;
        } else {
            self.data[OFF_FLAGS] &= !flag;
        }
    }

    // ---------- checksum ----------

    pub fn update_checksum(&mut self) -> Result<()> {
        page_update_checksum(self.as_bytes_mut())
    }

    pub fn verify_checksum(&self) -> bool {
        page_verify_checksum(self.as_bytes()).unwrap_or(false)
    }

    /// Prepare the bytes for disk: drop the in-memory dirty bit and seal the CRC.
    pub fn seal(&mut self) -> Result<()> {
        self.set_dirty(false);
        self.update_checksum()
    }

    /// Rewrite as a checkpointed data page at its home slot.
    pub fn make_data_page(&mut self) -> Result<()> {
        let page_id = self.page_id();
        self.set_position_id(page_id);
        self.set_recovery_position_id(page_id);
        self.set_transaction_id(0);
        self.set_confirmed(false);
        self.seal()
    }
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer")
            .field("page_id", &self.page_id())
            .field("position_id", &self.position_id())
            .field("transaction_id", &self.transaction_id())
            .field("confirmed", &self.is_confirmed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_match_header() {
        let mut p = PageBuffer::new_zeroed();
        let mut h = PageHeader::new(5, PageType::Data, 3);
        h.position_id = 40;
        h.transaction_id = 9;
        p.set_header(&h).unwrap();

        assert_eq!(p.page_id(), 5);
        assert_eq!(p.position_id(), 40);
        assert_eq!(p.transaction_id(), 9);
        assert_eq!(p.col_id(), 3);
        assert_eq!(p.page_type(), Some(PageType::Data));

        p.set_confirmed(true);
        p.set_dirty(true);
        assert!(p.header().unwrap().is_confirmed);
        p.seal().unwrap();
        assert!(!p.is_dirty());
        assert!(p.verify_checksum());
    }

    #[test]
    fn make_data_page_resets_log_fields() {
        let mut p = PageBuffer::new_zeroed();
        let mut h = PageHeader::new(12, PageType::Data, 0);
        h.position_id = 300;
        h.recovery_position_id = 300;
        h.transaction_id = 4;
        h.is_confirmed = true;
        p.set_header(&h).unwrap();
        p.body_mut()[0] = 0x55;

        p.make_data_page().unwrap();
        let got = p.header().unwrap();
        assert_eq!(got.position_id, 12);
        assert_eq!(got.recovery_position_id, 12);
        assert_eq!(got.transaction_id, 0);
        assert!(!got.is_confirmed);
        assert_eq!(p.body()[0], 0x55);
        assert!(p.verify_checksum());
    }
}
