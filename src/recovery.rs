//! recovery - восстановление после грязного закрытия (header.is_dirty == true).
//!
//! Pass 1 (read_datafile): сканируем все слоты с 1 до EOF, пропуская слоты карты.
//!   Нулевые страницы и страницы с неверным CRC считаются «не дописанными» и
//!   пропускаются (учитываются в RecoveryReport). Остальные классифицируются:
//!   - data: TransactionID == 0 и PageID == слот;
//!   - temp: RecoveryPositionID != PositionID (копия из прерванного checkpoint);
//!   - log : всё остальное.
//!   Результат подаётся в тот же CheckpointActions, что и в LogService, и план
//!   исполняется прямо на диске одним буфером, без кэша. Temp-копия и её ещё
//!   не переписанный лог-слот описывают одну версию (RecoveryPositionID).
//!   Затем файл усекается.
//! Pass 2 (rebuild): карта размещения пересобирается из страниц данных.

use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::alloc_map::AllocationMapService;
use crate::consts::{is_allocation_map_slot, slot_offset, PAGE_SIZE};
use crate::disk::Disk;
use crate::error::FolioError;
use crate::memory::MemoryFactory;
use crate::metrics::record_recovery_run;
use crate::page::{LogPageHeader, PageBuffer};
use crate::wal::{CheckpointAction, CheckpointActions};

/// What a recovery pass found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub scanned_pages: u64,
    pub zero_pages: u64,
    pub crc_mismatch_pages: u64,
    /// CRC-valid pages whose header disagrees with the slot they were read from.
    pub misplaced_pages: u64,
    pub data_pages: u64,
    pub log_pages: u64,
    pub temp_pages: u64,
    pub confirmed_transactions: u64,
    pub actions_applied: u64,
    pub last_page_id: u32,
    pub allocation_map_pages: u64,
}

struct DatafileScan {
    log_pages: Vec<LogPageHeader>,
    temp_pages: Vec<LogPageHeader>,
    confirmed: HashSet<u32>,
    last_page_id: u32,
    max_position_id: u32,
}

pub struct RecoveryService {
    disk: Arc<dyn Disk>,
    factory: Arc<MemoryFactory>,
}

impl RecoveryService {
    pub fn new(disk: Arc<dyn Disk>, factory: Arc<MemoryFactory>) -> Self {
        Self { disk, factory }
    }

    pub fn do_recovery(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut buf = self.factory.allocate_new_page();
        let mut zero = self.factory.allocate_new_page();

        let res = self.run(&mut report, &mut buf, &mut zero);
        self.factory.deallocate_page(buf);
        self.factory.deallocate_page(zero);
        res?;

        record_recovery_run(report.zero_pages, report.crc_mismatch_pages);
        info!(
            "recovery: scanned {} page(s) (zero {}, crc {}, misplaced {}), data {}, log {}, temp {}, \
             {} confirmed txn(s), {} action(s), last page {}",
            report.scanned_pages,
            report.zero_pages,
            report.crc_mismatch_pages,
            report.misplaced_pages,
            report.data_pages,
            report.log_pages,
            report.temp_pages,
            report.confirmed_transactions,
            report.actions_applied,
            report.last_page_id
        );
        Ok(report)
    }

    fn run(
        &self,
        report: &mut RecoveryReport,
        buf: &mut PageBuffer,
        zero: &mut PageBuffer,
    ) -> Result<()> {
        zero.clear();
        let scan = self.read_datafile(report, buf)?;

        let start_temp = scan.last_page_id.max(scan.max_position_id) + 1;
        let actions = CheckpointActions::new(
            &scan.log_pages,
            &scan.confirmed,
            scan.last_page_id,
            start_temp,
        )
        .with_temp_pages(&scan.temp_pages)
        .actions()?;

        for action in &actions {
            self.apply(action, buf, zero)?;
        }
        report.actions_applied = actions.len() as u64;

        self.disk.flush()?;
        self.disk.set_length(slot_offset(scan.last_page_id + 1))?;

        let alloc = AllocationMapService::new(self.disk.clone(), self.factory.clone());
        report.allocation_map_pages = alloc.rebuild_from_data(scan.last_page_id)? as u64;
        self.disk.flush()?;
        Ok(())
    }

    /// Pass 1: classify every slot.
    fn read_datafile(
        &self,
        report: &mut RecoveryReport,
        buf: &mut PageBuffer,
    ) -> Result<DatafileScan> {
        let slots = (self.disk.get_length()? / PAGE_SIZE as u64) as u32;
        let mut scan = DatafileScan {
            log_pages: Vec::new(),
            temp_pages: Vec::new(),
            confirmed: HashSet::new(),
            last_page_id: 0,
            max_position_id: 0,
        };

        for slot in 1..slots {
            if is_allocation_map_slot(slot) {
                continue;
            }
            if !self.disk.read_buffer(buf.as_bytes_mut(), slot_offset(slot))? {
                break;
            }
            report.scanned_pages += 1;

            if buf.is_zeroed() {
                report.zero_pages += 1;
                continue;
            }
            if !buf.verify_checksum() {
                debug!("recovery: slot {} fails CRC, skipped", slot);
                report.crc_mismatch_pages += 1;
                continue;
            }
            let h = match buf.header() {
                Ok(h) => h,
                Err(e) => {
                    warn!("recovery: slot {} has an unreadable header: {}", slot, e);
                    report.crc_mismatch_pages += 1;
                    continue;
                }
            };
            if h.position_id != slot || h.page_id == 0 || is_allocation_map_slot(h.page_id) {
                warn!(
                    "recovery: slot {} holds page {} claiming position {}, skipped",
                    slot, h.page_id, h.position_id
                );
                report.misplaced_pages += 1;
                continue;
            }

            let entry = LogPageHeader::from(&h);
            if h.transaction_id == 0 {
                if h.page_id != slot {
                    report.misplaced_pages += 1;
                    continue;
                }
                report.data_pages += 1;
            } else if h.recovery_position_id != h.position_id {
                report.temp_pages += 1;
                scan.temp_pages.push(entry);
                scan.max_position_id = scan.max_position_id.max(slot);
            } else {
                report.log_pages += 1;
                scan.log_pages.push(entry);
                scan.max_position_id = scan.max_position_id.max(slot);
            }
            if h.transaction_id != 0 && h.is_confirmed {
                scan.confirmed.insert(h.transaction_id);
            }
            scan.last_page_id = scan.last_page_id.max(h.page_id);
        }

        report.confirmed_transactions = scan.confirmed.len() as u64;
        report.last_page_id = scan.last_page_id;
        Ok(scan)
    }

    fn apply(&self, action: &CheckpointAction, buf: &mut PageBuffer, zero: &PageBuffer) -> Result<()> {
        match *action {
            CheckpointAction::ClearPage { position_id } => {
                self.disk
                    .write_buffer(zero.as_bytes(), slot_offset(position_id))?;
            }
            CheckpointAction::CopyToDataFile {
                position_id,
                target_position_id,
                ..
            } => {
                self.read_slot(position_id, buf)?;
                if buf.page_id() != target_position_id {
                    return Err(FolioError::Invariant(format!(
                        "recovery: slot {} holds page {}, expected {}",
                        position_id,
                        buf.page_id(),
                        target_position_id
                    ))
                    .into());
                }
                buf.make_data_page()?;
                self.disk
                    .write_buffer(buf.as_bytes(), slot_offset(target_position_id))?;
            }
            CheckpointAction::CopyToTempFile {
                position_id,
                target_position_id,
            } => {
                self.read_slot(position_id, buf)?;
                buf.set_position_id(target_position_id);
                buf.seal()?;
                self.disk
                    .write_buffer(buf.as_bytes(), slot_offset(target_position_id))?;
            }
        }
        Ok(())
    }

    fn read_slot(&self, position_id: u32, buf: &mut PageBuffer) -> Result<()> {
        if !self
            .disk
            .read_buffer(buf.as_bytes_mut(), slot_offset(position_id))?
        {
            return Err(FolioError::ShortRead {
                position: slot_offset(position_id),
                wanted: PAGE_SIZE,
            }
            .into());
        }
        Ok(())
    }
}
