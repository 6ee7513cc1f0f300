//! Adapter merging
//!
//! - [`merge_lora_to_base_model`] folds a saved LoRA adapter into its base
//!   model, writes the dense result, and backfills the base directory's
//!   auxiliary files.
//! - [`copy_missing_files`] is the backfill step on its own.
//! - [`MergeBackend`] is the seam for the load/merge/save pass, so the
//!   CPU-retry wrapper can be driven by any implementation.

mod adapter_merge;
mod copy;

pub use adapter_merge::{
    merge_lora_to_base_model, merge_with_backend, MergeBackend, MergeOutcome, MergeRequest,
    MergeSummary, NativeMergeBackend,
};
pub use copy::{copy_missing_files, CopyReport};
