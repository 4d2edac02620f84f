//! page/checksum - 4-байтовый CRC32 трейлер страницы.
//!
//! - trailer = CRC32 (crc32fast, IEEE) по `page[0 .. PAGE_CRC_OFFSET)`, LE;
//! - полностью нулевая страница - «никогда не писалась», проверку CRC не проходит
//!   (recovery классифицирует её отдельно через page_is_zeroed).

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{PAGE_CRC_OFFSET, PAGE_SIZE};

#[inline]
pub fn page_crc32(page: &[u8]) -> u32 {
    crc32fast::hash(&page[..PAGE_CRC_OFFSET])
}

/// Пересчитать трейлер.
pub fn page_update_checksum(page: &mut [u8]) -> Result<()> {
    if page.len() != PAGE_SIZE {
        return Err(anyhow!("page buffer must be {} bytes, got {}", PAGE_SIZE, page.len()));
    }
    let crc = page_crc32(page);
    LittleEndian::write_u32(&mut page[PAGE_CRC_OFFSET..PAGE_SIZE], crc);
    Ok(())
}

/// true = stored CRC matches the body.
pub fn page_verify_checksum(page: &[u8]) -> Result<bool> {
    if page.len() != PAGE_SIZE {
        return Err(anyhow!("page buffer must be {} bytes, got {}", PAGE_SIZE, page.len()));
    }
    let stored = LittleEndian::read_u32(&page[PAGE_CRC_OFFSET..PAGE_SIZE]);
    Ok(stored == page_crc32(page))
}

#[inline]
pub fn page_is_zeroed(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_detects_flip() {
        let mut page = vec![0u8; PAGE_SIZE];
        page[100] = 0xAB;
        page_update_checksum(&mut page).unwrap();
        assert!(page_verify_checksum(&page).unwrap());

        page[101] ^= 0x01;
        assert!(!page_verify_checksum(&page).unwrap());
    }

    #[test]
    fn zero_page_is_not_valid() {
        let page = vec![0u8; PAGE_SIZE];
        assert!(page_is_zeroed(&page));
        // crc32 of zeros is non-zero, stored is zero
        assert!(!page_verify_checksum(&page).unwrap());
    }

    #[test]
    fn wrong_size_is_error() {
        let mut small = vec![0u8; 16];
        assert!(page_update_checksum(&mut small).is_err());
    }
}
