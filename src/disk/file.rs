//! disk/file - файл данных на диске.
//!
//! Cross-platform (fs2) advisory lock: the file is locked exclusively while open,
//! a second engine on the same path fails fast instead of corrupting the log.
//! Lock is released on close()/Drop.

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use log::debug;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::FolioError;

use super::{check_write_span, Disk};

pub struct FileDisk {
    path: PathBuf,
    fsync: bool,
    file: Mutex<Option<File>>,
}

impl FileDisk {
    pub fn new(path: &Path, fsync: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            fsync,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self, f: &File) -> Result<()> {
        f.try_lock_exclusive()
            .with_context(|| format!("lock_exclusive {}", self.path.display()))
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let mut guard = self.file.lock();
        match guard.as_mut() {
            Some(f) => op(f),
            None => Err(FolioError::InvalidState(format!(
                "disk {} is not open",
                self.path.display()
            ))
            .into()),
        }
    }
}

impl Disk for FileDisk {
    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn open(&self) -> Result<()> {
        let mut guard = self.file.lock();
        if guard.is_some() {
            return Ok(());
        }
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("open data file {}", self.path.display()))?;
        self.lock_file(&f)?;
        debug!("FileDisk::open {}", self.path.display());
        *guard = Some(f);
        Ok(())
    }

    fn create_new(&self) -> Result<()> {
        let mut guard = self.file.lock();
        if guard.is_some() || self.path.exists() {
            return Err(FolioError::AlreadyExists(self.path.display().to_string()).into());
        }
        let f = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("create data file {}", self.path.display()))?;
        self.lock_file(&f)?;
        debug!("FileDisk::create_new {}", self.path.display());
        *guard = Some(f);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }

    fn read_buffer(&self, buf: &mut [u8], position: u64) -> Result<bool> {
        self.with_file(|f| {
            f.seek(SeekFrom::Start(position))?;
            let mut filled = 0usize;
            while filled < buf.len() {
                match f.read(&mut buf[filled..]) {
                    Ok(0) => return Ok(false),
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        return Err(anyhow!(e).context(format!(
                            "read {} bytes at {} from {}",
                            buf.len(),
                            position,
                            self.path.display()
                        )))
                    }
                }
            }
            Ok(true)
        })
    }

    fn write_buffer(&self, buf: &[u8], position: u64) -> Result<()> {
        check_write_span(buf.len(), position)?;
        self.with_file(|f| {
            f.seek(SeekFrom::Start(position))?;
            f.write_all(buf).with_context(|| {
                format!("write {} bytes at {} to {}", buf.len(), position, self.path.display())
            })?;
            Ok(())
        })
    }

    fn get_length(&self) -> Result<u64> {
        self.with_file(|f| Ok(f.metadata()?.len()))
    }

    fn set_length(&self, len: u64) -> Result<()> {
        self.with_file(|f| {
            f.set_len(len)
                .with_context(|| format!("set_len {} on {}", len, self.path.display()))?;
            Ok(())
        })
    }

    fn flush(&self) -> Result<()> {
        let fsync = self.fsync;
        self.with_file(|f| {
            f.flush()?;
            if fsync {
                f.sync_all()?;
            }
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.file.lock();
        if let Some(f) = guard.take() {
            f.sync_all()?;
            // fs2 unlock errors on close are ignored deliberately.
            let _ = f.unlock();
            debug!("FileDisk::close {}", self.path.display());
        }
        Ok(())
    }
}

impl Drop for FileDisk {
    fn drop(&mut self) {
        if let Some(f) = self.file.get_mut().take() {
            let _ = f.unlock();
        }
    }
}
