#![allow(non_snake_case)]

// Формат файла
pub mod consts;
pub mod meta;
pub mod page;

// Ввод-вывод и память
pub mod disk;
pub mod memory;

// Карта размещения, лог, восстановление
pub mod alloc_map;
pub mod recovery;
pub mod wal;

// Движок
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod metrics;

// Удобные реэкспорты
pub use alloc_map::{AllocationMapService, ExtendLocation, FreeExtend};
pub use config::{EngineBuilder, EngineConfig};
pub use disk::{Disk, FileDisk, MemoryDisk};
pub use engine::{Engine, Transaction};
pub use error::FolioError;
pub use lock::{LockService, LockState};
pub use memory::{MemoryCache, MemoryFactory, PageRef};
pub use meta::{Collation, FileHeader, Pragmas};
pub use page::{LogPageHeader, PageBuffer, PageHeader, PageType};
pub use recovery::{RecoveryReport, RecoveryService};
pub use wal::{CheckpointAction, CheckpointActions, LogService};
