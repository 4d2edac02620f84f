//! memory - буферы страниц и кэш.
//!
//! - factory.rs - MemoryFactory: пул обнулённых буферов (allocate/deallocate).
//! - cache.rs   - MemoryCache: LRU по PositionID с разделяемыми read-only хэндлами.

pub mod cache;
pub mod factory;

pub use cache::{MemoryCache, PageRef, SharedPage};
pub use factory::MemoryFactory;
