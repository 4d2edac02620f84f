//! page - фиксированная 8 KiB страница: заголовок, тело, CRC32-трейлер.
//!
//! Подмодули:
//! - header.rs   - offsets заголовка, PageType, PageHeader (read/write).
//! - checksum.rs - CRC32 трейлер (crc32fast) и проверка «нулевой» страницы.
//! - buffer.rs   - PageBuffer: владеющий буфер страницы с типизированными accessor'ами.
//!
//! Pure data: no I/O happens here.

pub mod buffer;
pub mod checksum;
pub mod header;

pub use buffer::PageBuffer;
pub use checksum::{page_crc32, page_is_zeroed, page_update_checksum, page_verify_checksum};
pub use header::{LogPageHeader, PageHeader, PageType};
