//! Job engine: fire-and-forget continuations with bounded retry and a
//! dead-letter sink.
//!
//! ```text
//! JobEngine
//!     │
//!     ├─► create_job (pending row + job.created)
//!     ├─► acquire_jobs (lock arbiter claim per row)
//!     ├─► execute_job (registry dispatch, retry/dead-letter on failure)
//!     └─► retry_dead_letter_job (replay from the sink)
//! ```

pub mod engine;
pub mod memory;
mod model;
pub mod store;

pub use engine::{JobEngine, JobOutcome};
pub use memory::MemoryJobStore;
pub use model::{DeadLetterJob, Job, JobFailure, JobFilter, JobSpec, JobStatus};
pub use store::{JobStore, PostgresJobStore};
