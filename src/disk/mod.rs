//! disk - сырой ввод/вывод целых страниц (или sub-page блоков заголовка) по абсолютной позиции.
//!
//! - file.rs   - FileDisk: обычный файл + эксклюзивная advisory-блокировка (fs2).
//! - memory.rs - MemoryDisk: in-memory поток (тесты, временные базы, crash-симуляция).
//!
//! Callers serialize structural access through `LockService`; each implementation
//! still guards its handle with a mutex so single reads/writes never interleave.

use anyhow::{anyhow, Result};

use crate::consts::{FILE_HEADER_SIZE, PAGE_SIZE, PRAGMA_OFFSET, PRAGMA_SIZE};

pub mod file;
pub mod memory;

pub use file::FileDisk;
pub use memory::MemoryDisk;

pub trait Disk: Send + Sync {
    /// true if the backing store already exists.
    fn exists(&self) -> bool;

    /// Open an existing store. Idempotent.
    fn open(&self) -> Result<()>;

    /// Create an empty store. Fails if it already exists.
    fn create_new(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Fill `buf` from `position`. Ok(false) = short read / EOF.
    fn read_buffer(&self, buf: &mut [u8], position: u64) -> Result<bool>;

    /// Write `buf` at `position`. Length must be one page or one of the header block sizes.
    fn write_buffer(&self, buf: &[u8], position: u64) -> Result<()>;

    fn get_length(&self) -> Result<u64>;

    fn set_length(&self, len: u64) -> Result<()>;

    /// Durability barrier (no-op for memory streams).
    fn flush(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Проверка допустимой длины записи: страница или один из двух блоков заголовка.
pub(crate) fn check_write_span(len: usize, position: u64) -> Result<()> {
    match len {
        PAGE_SIZE => {
            if position % PAGE_SIZE as u64 != 0 {
                return Err(anyhow!("page write at unaligned position {}", position));
            }
            Ok(())
        }
        FILE_HEADER_SIZE if position == 0 => Ok(()),
        PRAGMA_SIZE if position == PRAGMA_OFFSET as u64 => Ok(()),
        _ => Err(anyhow!(
            "invalid write span: {} bytes at position {}",
            len,
            position
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_span_rules() {
        assert!(check_write_span(PAGE_SIZE, 0).is_ok());
        assert!(check_write_span(PAGE_SIZE, PAGE_SIZE as u64 * 3).is_ok());
        assert!(check_write_span(PAGE_SIZE, 17).is_err());
        assert!(check_write_span(FILE_HEADER_SIZE, 0).is_ok());
        assert!(check_write_span(FILE_HEADER_SIZE, 8).is_err());
        assert!(check_write_span(PRAGMA_SIZE, PRAGMA_OFFSET as u64).is_ok());
        assert!(check_write_span(100, 0).is_err());
    }
}
