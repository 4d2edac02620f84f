//! wal - лог, встроенный в файл данных.
//!
//! Разделение:
//! - checkpoint.rs  - CheckpointActions: чистый план слияния лога (общий для checkpoint и recovery).
//! - log_service.rs - LogService: выдача PositionID, запись лог-страниц, WAL-индекс, checkpoint.

pub mod checkpoint;
pub mod log_service;

pub use checkpoint::{CheckpointAction, CheckpointActions};
pub use log_service::LogService;
