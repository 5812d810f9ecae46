//! Unit validation pipeline
//!
//! - [`batch`]: chunked, checkpointed validation against the inventory authority
//! - [`chunking`]: chunk sizing and the retry policy
//! - [`reconcile`]: valid quantity vs. expected quantity

pub mod batch;
pub mod chunking;
pub mod reconcile;

pub use batch::{
    BatchValidator, CheckpointEntry, CheckpointKey, EntryResult, Resolution, ValidationRequest,
    ValidationRun, ValidatorConfig,
};
pub use chunking::{ChunkingPolicy, RetryPolicy};
pub use reconcile::{Reconciliation, reconcile};
