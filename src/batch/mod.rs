//! Batch Controller (C6): task registry, bounded concurrent runner, and a
//! per-task event bus for long-running admin operations.
//!
//! Grounded on the teacher's `jobs::manager` (`JobManager`: bounded queue
//! plus worker pool plus per-job status snapshots via `JobManagerConfig`/
//! `JobStatusSnapshot`), generalized from single-turn background jobs to
//! item-batch operations with a broadcast-style subscriber fanout instead of
//! a single completion channel — spec.md §4.6's SSE bridge needs N
//! independent observers, not one.

mod registry;
mod runner;
mod task;

pub use registry::BatchRegistry;
pub use runner::{run_bounded, CancelFlag, ItemOutcome};
pub use task::{BatchEvent, BatchTask};
