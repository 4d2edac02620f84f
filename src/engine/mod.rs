//! engine - точка входа: Engine (один экземпляр на файл) и Transaction.
//!
//! Открытие:
//! - новый файл: заголовок + прагмы в слот 0, пустая страница карты в слот 1;
//! - существующий: читаем заголовок/прагмы; если is_dirty - RecoveryService;
//! - затем AllocationMapService::initialize, LogService::initialize и is_dirty=1 на диске.
//!
//! Checkpoint и shutdown идут под эксклюзивной блокировкой БД. Drop без shutdown
//! оставляет файл грязным: следующий open выполнит recovery.

use anyhow::{Context, Result};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::alloc_map::AllocationMapService;
use crate::config::EngineConfig;
use crate::consts::{slot_offset, FILE_HEADER_SIZE, PAGE_SIZE, PRAGMA_OFFSET};
use crate::disk::{Disk, FileDisk, MemoryDisk};
use crate::error::FolioError;
use crate::lock::{LockService, LockState};
use crate::memory::{MemoryCache, MemoryFactory, PageRef};
use crate::meta::{FileHeader, Pragmas};
use crate::recovery::{RecoveryReport, RecoveryService};
use crate::wal::LogService;

pub mod transaction;

pub use transaction::Transaction;

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) disk: Arc<dyn Disk>,
    pub(crate) factory: Arc<MemoryFactory>,
    pub(crate) cache: MemoryCache,
    pub(crate) locks: LockService,
    pub(crate) alloc: AllocationMapService,
    pub(crate) log: LogService,
    header: Mutex<FileHeader>,
    pragmas: Mutex<Pragmas>,
    next_transaction_id: AtomicU32,
    last_recovery: Option<RecoveryReport>,
    closed: AtomicBool,
}

pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open (or create) the configured data file.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let disk: Arc<dyn Disk> = match &config.filename {
            Some(path) => Arc::new(FileDisk::new(path, config.fsync)),
            None => Arc::new(MemoryDisk::new()),
        };
        Self::open_with_disk(config, disk).await
    }

    /// Open over an explicit disk (e.g. a shared `MemoryDisk` in crash tests).
    pub async fn open_with_disk(config: EngineConfig, disk: Arc<dyn Disk>) -> Result<Self> {
        match Self::open_inner(config, disk.clone()) {
            Ok(engine) => Ok(engine),
            Err(e) => {
                let _ = disk.close();
                Err(e)
            }
        }
    }

    fn open_inner(config: EngineConfig, disk: Arc<dyn Disk>) -> Result<Self> {
        let factory = Arc::new(MemoryFactory::new(config.cache_pages.max(16)));

        let (mut header, pragmas) = if disk.exists() {
            disk.open()?;
            let mut buf = vec![0u8; PAGE_SIZE];
            if !disk.read_buffer(&mut buf, 0)? {
                return Err(FolioError::ShortRead {
                    position: 0,
                    wanted: PAGE_SIZE,
                }
                .into());
            }
            let header = FileHeader::read(&buf[..FILE_HEADER_SIZE]).context("read file header")?;
            let pragmas = Pragmas::read(&buf[PRAGMA_OFFSET..]).context("read pragmas")?;
            (header, pragmas)
        } else {
            if config.readonly {
                return Err(FolioError::InvalidState(
                    "cannot create a new data file in read-only mode".into(),
                )
                .into());
            }
            disk.create_new()?;
            Self::create_file(&config, disk.as_ref(), &factory)?
        };

        let last_recovery = if header.is_dirty {
            info!("engine: data file was not closed cleanly, running recovery");
            let report = RecoveryService::new(disk.clone(), factory.clone()).do_recovery()?;
            Some(report)
        } else {
            None
        };

        let alloc = AllocationMapService::new(disk.clone(), factory.clone());
        alloc.initialize()?;
        let log = LogService::new(disk.clone(), factory.clone());
        log.initialize()?;

        if !config.readonly {
            header.is_dirty = true;
            disk.write_buffer(&header.to_bytes()?, 0)?;
            disk.flush()?;
        }

        let locks = LockService::new(config.lock_timeout);
        let cache = MemoryCache::new(factory.clone(), config.cache_pages);
        info!("engine: opened ({})", config);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                disk,
                factory,
                cache,
                locks,
                alloc,
                log,
                header: Mutex::new(header),
                pragmas: Mutex::new(pragmas),
                next_transaction_id: AtomicU32::new(1),
                last_recovery,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Header page + pragma block in slot 0, empty allocation map in slot 1.
    fn create_file(
        config: &EngineConfig,
        disk: &dyn Disk,
        factory: &Arc<MemoryFactory>,
    ) -> Result<(FileHeader, Pragmas)> {
        let header = FileHeader::new(config.collation);
        let pragmas = Pragmas {
            checkpoint: config.checkpoint_pages,
            timeout_secs: config.lock_timeout.as_secs() as u32,
            ..Pragmas::default()
        };
        let mut page = vec![0u8; PAGE_SIZE];
        header.write(&mut page[..FILE_HEADER_SIZE])?;
        pragmas.write(&mut page[PRAGMA_OFFSET..])?;
        disk.write_buffer(&page, 0)?;

        let mut am_page = factory.allocate_new_page();
        let res = crate::alloc_map::AllocationMapPage::new(0)
            .write(&mut am_page)
            .and_then(|_| disk.write_buffer(am_page.as_bytes(), slot_offset(am_page.page_id())));
        factory.deallocate_page(am_page);
        res?;
        disk.flush()?;
        debug!("engine: new data file created");
        Ok((header, pragmas))
    }

    /// Start a transaction (shared database lock).
    pub async fn begin_transaction(&self) -> Result<Transaction> {
        self.inner.ensure_writable()?;
        let guard = self.inner.locks.enter_transaction().await?;
        let id = self
            .inner
            .next_transaction_id
            .fetch_add(1, Ordering::Relaxed);
        Ok(Transaction::new(self.inner.clone(), guard, id))
    }

    /// Newest committed version of a page.
    pub async fn read_page(&self, page_id: u32) -> Result<PageRef> {
        self.inner.ensure_open()?;
        let _guard = self.inner.locks.enter_transaction().await?;
        self.inner.read_page_locked(page_id)
    }

    /// Merge the log into the data region under the exclusive lock.
    pub async fn checkpoint(&self, crop: bool, add_to_cache: bool) -> Result<usize> {
        self.inner.ensure_writable()?;
        let _ex = self.inner.locks.enter_exclusive().await?;
        self.inner.checkpoint_locked(crop, add_to_cache)
    }

    /// Final checkpoint with crop, clear the dirty flag, release the file.
    pub async fn shutdown(self) -> Result<()> {
        self.inner.ensure_open()?;
        let _ex = self.inner.locks.enter_exclusive().await?;
        if !self.inner.config.readonly {
            self.inner.checkpoint_locked(true, false)?;
            let mut header = self.inner.header.lock();
            header.is_dirty = false;
            self.inner.disk.write_buffer(&header.to_bytes()?, 0)?;
            self.inner.disk.flush()?;
        }
        self.inner.cache.clear();
        self.inner.closed.store(true, Ordering::Release);
        self.inner.disk.close()?;
        info!("engine: shut down cleanly");
        Ok(())
    }

    pub fn pragmas(&self) -> Pragmas {
        self.inner.pragmas.lock().clone()
    }

    pub async fn set_user_version(&self, user_version: i32) -> Result<()> {
        self.update_pragmas(|p| p.user_version = user_version).await
    }

    /// Log pages that trigger an automatic soft checkpoint after commit (0 disables).
    pub async fn set_checkpoint_threshold(&self, pages: u32) -> Result<()> {
        self.update_pragmas(|p| p.checkpoint = pages).await
    }

    async fn update_pragmas(&self, f: impl FnOnce(&mut Pragmas)) -> Result<()> {
        self.inner.ensure_writable()?;
        let _guard = self.inner.locks.enter_transaction().await?;
        let mut pragmas = self.inner.pragmas.lock();
        let mut next = pragmas.clone();
        f(&mut next);
        self.inner
            .disk
            .write_buffer(&next.to_bytes()?, PRAGMA_OFFSET as u64)?;
        self.inner.disk.flush()?;
        *pragmas = next;
        Ok(())
    }

    pub fn header(&self) -> FileHeader {
        self.inner.header.lock().clone()
    }

    /// Report of the recovery run during open, if the file was dirty.
    pub fn last_recovery(&self) -> Option<&RecoveryReport> {
        self.inner.last_recovery.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn lock_state(&self) -> LockState {
        self.inner.locks.state()
    }

    pub fn allocation_map(&self) -> &AllocationMapService {
        &self.inner.alloc
    }

    pub fn log(&self) -> &LogService {
        &self.inner.log
    }

    pub fn cache(&self) -> &MemoryCache {
        &self.inner.cache
    }
}

impl EngineInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FolioError::InvalidState("engine is closed".into()).into());
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.config.readonly {
            return Err(FolioError::InvalidState("engine is read-only".into()).into());
        }
        Ok(())
    }

    /// Caller holds the exclusive lock.
    pub(crate) fn checkpoint_locked(&self, crop: bool, add_to_cache: bool) -> Result<usize> {
        let copied = self.log.checkpoint(crop, add_to_cache, &self.cache)?;
        if let Some(highest) = self.alloc.write_all_changes()? {
            self.log.extend_data_region(highest);
        }
        self.disk.flush()?;
        Ok(copied)
    }

    /// Soft checkpoint once the log reaches the pragma threshold and nobody else
    /// holds the database lock.
    pub(crate) fn try_auto_checkpoint(&self) -> Result<Option<usize>> {
        let threshold = self.pragmas.lock().checkpoint;
        if threshold == 0 || self.log.log_page_count() < threshold as usize {
            return Ok(None);
        }
        match self.locks.try_enter_exclusive() {
            Some(_ex) => {
                debug!("engine: auto checkpoint at {} log page(s)", self.log.log_page_count());
                self.checkpoint_locked(false, true).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Caller holds at least the shared lock.
    pub(crate) fn read_page_locked(&self, page_id: u32) -> Result<PageRef> {
        let position_id = match self.log.wal_position(page_id) {
            Some(pos) => pos,
            None if page_id > 0 && page_id <= self.log.last_page_id() => page_id,
            None => {
                return Err(FolioError::InvalidPage {
                    position_id: page_id,
                    reason: format!("page {} does not exist", page_id),
                }
                .into())
            }
        };

        if let Some(page) = self.cache.get_page_read_only(position_id) {
            return Ok(page);
        }

        let mut buf = self.factory.allocate_new_page();
        let invalid = |reason: &str| -> anyhow::Error {
            FolioError::InvalidPage {
                position_id,
                reason: reason.to_string(),
            }
            .into()
        };
        let checked = match self
            .disk
            .read_buffer(buf.as_bytes_mut(), slot_offset(position_id))
        {
            Err(e) => Err(e),
            Ok(false) => Err(invalid("short read")),
            Ok(true) if buf.is_zeroed() => Err(invalid("empty slot")),
            Ok(true) if !buf.verify_checksum() => Err(invalid("checksum mismatch")),
            Ok(true) if buf.page_id() != page_id => Err(invalid("slot holds another page")),
            Ok(true) => Ok(()),
        };
        if let Err(e) = checked {
            self.factory.deallocate_page(buf);
            return Err(e);
        }
        Ok(self.cache.add_and_share(buf))
    }
}
