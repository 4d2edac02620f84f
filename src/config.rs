//! Centralized configuration and builder for FolioDB.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - EngineConfig::from_env() reads FOLIO_* variables.
//! - EngineBuilder returns an EngineConfig, which Engine::open consumes.
//!
//! Defaults:
//! - filename = None (in-memory stream)
//! - lock_timeout = 60s
//! - cache_pages = 1024
//! - checkpoint_pages = 1000 (written into the pragma block of new files; 0 disables auto checkpoint)
//! - fsync = true

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::consts::DEFAULT_CHECKPOINT_PAGES;
use crate::meta::Collation;

/// Top-level configuration for one engine instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Data file. None keeps everything in memory.
    /// Env: FOLIO_FILENAME
    pub filename: Option<PathBuf>,

    /// Timeout for every lock acquisition.
    /// Env: FOLIO_LOCK_TIMEOUT_MS (default 60000)
    pub lock_timeout: Duration,

    /// Page cache size in pages (0 disables).
    /// Env: FOLIO_CACHE_PAGES (default 1024)
    pub cache_pages: usize,

    /// Reject transactions and checkpoints; recovery still runs on a dirty file.
    /// Env: FOLIO_READONLY = 0|1|true|false
    pub readonly: bool,

    /// Auto checkpoint threshold in log pages for newly created files.
    /// Env: FOLIO_CHECKPOINT_PAGES (default 1000)
    pub checkpoint_pages: u32,

    /// Collation stored in the header of newly created files.
    pub collation: Collation,

    /// sync_all() on every flush of a file-backed disk.
    /// Env: FOLIO_FSYNC = 0|1|true|false (default true)
    pub fsync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            filename: None,
            lock_timeout: Duration::from_secs(60),
            cache_pages: 1024,
            readonly: false,
            checkpoint_pages: DEFAULT_CHECKPOINT_PAGES,
            collation: Collation::default(),
            fsync: true,
        }
    }
}

fn env_flag(v: &str) -> bool {
    let s = v.trim().to_ascii_lowercase();
    s == "1" || s == "true" || s == "on" || s == "yes"
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("FOLIO_FILENAME") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.filename = Some(PathBuf::from(s));
            }
        }

        if let Ok(v) = std::env::var("FOLIO_LOCK_TIMEOUT_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.lock_timeout = Duration::from_millis(n);
            }
        }

        if let Ok(v) = std::env::var("FOLIO_CACHE_PAGES") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.cache_pages = n;
            }
        }

        if let Ok(v) = std::env::var("FOLIO_READONLY") {
            cfg.readonly = env_flag(&v);
        }

        if let Ok(v) = std::env::var("FOLIO_CHECKPOINT_PAGES") {
            if let Ok(n) = v.trim().parse::<u32>() {
                cfg.checkpoint_pages = n;
            }
        }

        if let Ok(v) = std::env::var("FOLIO_FSYNC") {
            cfg.fsync = env_flag(&v);
        }

        cfg
    }

    /// Fluent setters (builder-style) to override specific fields.

    pub fn with_filename<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
        self.filename = path.map(Into::into);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    pub fn with_readonly(mut self, on: bool) -> Self {
        self.readonly = on;
        self
    }

    pub fn with_checkpoint_pages(mut self, pages: u32) -> Self {
        self.checkpoint_pages = pages;
        self
    }

    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = collation;
        self
    }

    pub fn with_fsync(mut self, on: bool) -> Self {
        self.fsync = on;
        self
    }
}

impl fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EngineConfig {{ \
             filename: {}, \
             lock_timeout_ms: {}, \
             cache_pages: {}, \
             readonly: {}, \
             checkpoint_pages: {}, \
             collation: {}/{}, \
             fsync: {} \
             }}",
            self.filename
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string()),
            self.lock_timeout.as_millis(),
            self.cache_pages,
            self.readonly,
            self.checkpoint_pages,
            self.collation.lcid,
            self.collation.options,
            self.fsync,
        )
    }
}

/// Lightweight builder that produces an EngineConfig.
#[derive(Clone, Debug)]
pub struct EngineBuilder {
    cfg: EngineConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        // Start from env, then allow overrides.
        Self {
            cfg: EngineConfig::from_env(),
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: EngineConfig::default(),
        }
    }

    pub fn filename<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cfg.filename = Some(path.into());
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.cfg.filename = None;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.lock_timeout = timeout;
        self
    }

    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cfg.cache_pages = pages;
        self
    }

    pub fn readonly(mut self, on: bool) -> Self {
        self.cfg.readonly = on;
        self
    }

    pub fn checkpoint_pages(mut self, pages: u32) -> Self {
        self.cfg.checkpoint_pages = pages;
        self
    }

    pub fn collation(mut self, collation: Collation) -> Self {
        self.cfg.collation = collation;
        self
    }

    pub fn fsync(mut self, on: bool) -> Self {
        self.cfg.fsync = on;
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> EngineConfig {
        self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = EngineBuilder::from_default()
            .filename("/tmp/x.db")
            .cache_pages(0)
            .checkpoint_pages(0)
            .lock_timeout(Duration::from_millis(250))
            .build();
        assert_eq!(cfg.filename.as_deref(), Some(std::path::Path::new("/tmp/x.db")));
        assert_eq!(cfg.cache_pages, 0);
        assert_eq!(cfg.checkpoint_pages, 0);
        assert!(cfg.to_string().contains("lock_timeout_ms: 250"));
    }

    #[test]
    fn default_display_is_in_memory() {
        let cfg = EngineConfig::default().with_fsync(false);
        let s = cfg.to_string();
        assert!(s.contains(":memory:"));
        assert!(s.contains("fsync: false"));
    }
}
