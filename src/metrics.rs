//! Lightweight global metrics for FolioDB.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Log writer / checkpoint
//! - Page cache
//! - Lock service
//! - Recovery

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Log / checkpoint -----
static LOG_PAGES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static LOG_BATCHES: AtomicU64 = AtomicU64::new(0);
static CHECKPOINTS: AtomicU64 = AtomicU64::new(0);
static CHECKPOINT_CLEAR: AtomicU64 = AtomicU64::new(0);
static CHECKPOINT_COPY_DATA: AtomicU64 = AtomicU64::new(0);
static CHECKPOINT_COPY_TEMP: AtomicU64 = AtomicU64::new(0);

// ----- Page cache -----
static PAGE_CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static PAGE_CACHE_MISSES: AtomicU64 = AtomicU64::new(0);

// ----- Locks -----
static LOCK_TIMEOUTS: AtomicU64 = AtomicU64::new(0);

// ----- Recovery -----
static RECOVERY_RUNS: AtomicU64 = AtomicU64::new(0);
static RECOVERY_SKIPPED_ZERO: AtomicU64 = AtomicU64::new(0);
static RECOVERY_SKIPPED_CRC: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Log / checkpoint
    pub log_pages_written: u64,
    pub log_batches: u64,
    pub checkpoints: u64,
    pub checkpoint_clear_pages: u64,
    pub checkpoint_copy_to_data: u64,
    pub checkpoint_copy_to_temp: u64,

    // Page cache
    pub page_cache_hits: u64,
    pub page_cache_misses: u64,

    // Locks
    pub lock_timeouts: u64,

    // Recovery
    pub recovery_runs: u64,
    pub recovery_skipped_zero: u64,
    pub recovery_skipped_crc: u64,
}

impl MetricsSnapshot {
    pub fn avg_log_batch_pages(&self) -> f64 {
        if self.log_batches == 0 {
            0.0
        } else {
            self.log_pages_written as f64 / self.log_batches as f64
        }
    }

    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.page_cache_hits + self.page_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.page_cache_hits as f64 / total as f64
        }
    }
}

// ----- Recorders (log) -----
pub fn record_log_batch(pages: usize) {
    LOG_BATCHES.fetch_add(1, Ordering::Relaxed);
    LOG_PAGES_WRITTEN.fetch_add(pages as u64, Ordering::Relaxed);
}

pub fn record_checkpoint() {
    CHECKPOINTS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_checkpoint_clear() {
    CHECKPOINT_CLEAR.fetch_add(1, Ordering::Relaxed);
}

pub fn record_checkpoint_copy_to_data() {
    CHECKPOINT_COPY_DATA.fetch_add(1, Ordering::Relaxed);
}

pub fn record_checkpoint_copy_to_temp() {
    CHECKPOINT_COPY_TEMP.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Page cache) -----
pub fn record_cache_hit() {
    PAGE_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_cache_miss() {
    PAGE_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (locks) -----
pub fn record_lock_timeout() {
    LOCK_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (recovery) -----
pub fn record_recovery_run(skipped_zero: u64, skipped_crc: u64) {
    RECOVERY_RUNS.fetch_add(1, Ordering::Relaxed);
    RECOVERY_SKIPPED_ZERO.fetch_add(skipped_zero, Ordering::Relaxed);
    RECOVERY_SKIPPED_CRC.fetch_add(skipped_crc, Ordering::Relaxed);
}

/// Снимок всех метрик.
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        log_pages_written: LOG_PAGES_WRITTEN.load(Ordering::Relaxed),
        log_batches: LOG_BATCHES.load(Ordering::Relaxed),
        checkpoints: CHECKPOINTS.load(Ordering::Relaxed),
        checkpoint_clear_pages: CHECKPOINT_CLEAR.load(Ordering::Relaxed),
        checkpoint_copy_to_data: CHECKPOINT_COPY_DATA.load(Ordering::Relaxed),
        checkpoint_copy_to_temp: CHECKPOINT_COPY_TEMP.load(Ordering::Relaxed),

        page_cache_hits: PAGE_CACHE_HITS.load(Ordering::Relaxed),
        page_cache_misses: PAGE_CACHE_MISSES.load(Ordering::Relaxed),

        lock_timeouts: LOCK_TIMEOUTS.load(Ordering::Relaxed),

        recovery_runs: RECOVERY_RUNS.load(Ordering::Relaxed),
        recovery_skipped_zero: RECOVERY_SKIPPED_ZERO.load(Ordering::Relaxed),
        recovery_skipped_crc: RECOVERY_SKIPPED_CRC.load(Ordering::Relaxed),
    }
}

/// Сброс всех метрик (для тестов/бенчей).
pub fn reset() {
    for c in [
        &LOG_PAGES_WRITTEN,
        &LOG_BATCHES,
        &CHECKPOINTS,
        &CHECKPOINT_CLEAR,
        &CHECKPOINT_COPY_DATA,
        &CHECKPOINT_COPY_TEMP,
        &PAGE_CACHE_HITS,
        &PAGE_CACHE_MISSES,
        &LOCK_TIMEOUTS,
        &RECOVERY_RUNS,
        &RECOVERY_SKIPPED_ZERO,
        &RECOVERY_SKIPPED_CRC,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}
