//! disk/memory - in-memory stream.
//!
//! Clones share the same bytes, so a test can keep a handle, "crash" the engine
//! by dropping it without shutdown, and reopen the very same image.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::FolioError;

use super::{check_write_span, Disk};

#[derive(Clone, Default)]
pub struct MemoryDisk {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
    open: Arc<AtomicBool>,
}

impl MemoryDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream pre-filled with an existing image (e.g. a copy taken mid-run).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(Some(bytes))),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Copy of the current image.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone().unwrap_or_default()
    }

    /// A fresh handle over a copy of the current bytes (nothing shared).
    pub fn fork(&self) -> Self {
        Self::from_bytes(self.snapshot())
    }

    fn not_open() -> anyhow::Error {
        FolioError::InvalidState("memory disk is not open".into()).into()
    }
}

impl Disk for MemoryDisk {
    fn exists(&self) -> bool {
        self.bytes.lock().is_some()
    }

    fn open(&self) -> Result<()> {
        if self.bytes.lock().is_none() {
            return Err(FolioError::InvalidState("memory disk was never created".into()).into());
        }
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn create_new(&self) -> Result<()> {
        let mut guard = self.bytes.lock();
        if guard.is_some() {
            return Err(FolioError::AlreadyExists("memory disk".into()).into());
        }
        *guard = Some(Vec::new());
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn read_buffer(&self, buf: &mut [u8], position: u64) -> Result<bool> {
        if !self.is_open() {
            return Err(Self::not_open());
        }
        let guard = self.bytes.lock();
        let data = guard.as_ref().ok_or_else(Self::not_open)?;
        let start = position as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Ok(false);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(true)
    }

    fn write_buffer(&self, buf: &[u8], position: u64) -> Result<()> {
        check_write_span(buf.len(), position)?;
        if !self.is_open() {
            return Err(Self::not_open());
        }
        let mut guard = self.bytes.lock();
        let data = guard.as_mut().ok_or_else(Self::not_open)?;
        let start = position as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn get_length(&self) -> Result<u64> {
        let guard = self.bytes.lock();
        Ok(guard.as_ref().map(|d| d.len() as u64).unwrap_or(0))
    }

    fn set_length(&self, len: u64) -> Result<()> {
        let mut guard = self.bytes.lock();
        let data = guard.as_mut().ok_or_else(Self::not_open)?;
        data.resize(len as usize, 0);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::PAGE_SIZE;

    #[test]
    fn page_write_then_read_back() {
        let disk = MemoryDisk::new();
        disk.create_new().unwrap();

        let mut page = vec![0u8; PAGE_SIZE];
        page[10] = 7;
        disk.write_buffer(&page, PAGE_SIZE as u64 * 2).unwrap();
        assert_eq!(disk.get_length().unwrap(), PAGE_SIZE as u64 * 3);

        let mut back = vec![0u8; PAGE_SIZE];
        assert!(disk.read_buffer(&mut back, PAGE_SIZE as u64 * 2).unwrap());
        assert_eq!(back, page);

        // past EOF -> short read, not an error
        assert!(!disk.read_buffer(&mut back, PAGE_SIZE as u64 * 3).unwrap());
    }

    #[test]
    fn create_new_twice_fails() {
        let disk = MemoryDisk::new();
        disk.create_new().unwrap();
        assert!(disk.create_new().is_err());
    }

    #[test]
    fn clones_share_bytes_fork_does_not() {
        let disk = MemoryDisk::new();
        disk.create_new().unwrap();
        let other = disk.clone();
        let forked = disk.fork();

        let page = vec![1u8; PAGE_SIZE];
        disk.write_buffer(&page, 0).unwrap();
        assert_eq!(other.snapshot().len(), PAGE_SIZE);
        assert_eq!(forked.snapshot().len(), 0);
    }
}
