//! Token-level training batches.

pub mod batch;
pub mod dynamic_batch;

pub use batch::{BatchMeta, TrainingBatch};
pub use dynamic_batch::{rearrange_micro_batches, reverse_index, DynamicBatchError};
