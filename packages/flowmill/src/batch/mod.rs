//! Batch engine: fan-out of homogeneous work items under a parent
//! aggregate with derived progress counters.

pub mod engine;
pub mod memory;
mod model;
pub mod store;

pub use engine::BatchEngine;
pub use memory::MemoryBatchStore;
pub use model::{
    Batch, BatchCounters, BatchFilter, BatchItem, BatchPart, BatchPartStatus, BatchSpec,
    BatchStatus,
};
pub use store::{BatchStore, PostgresBatchStore};
