//! Training data: JSONL records, formatting and batching

mod collator;
mod dataset;
pub mod formatter;
mod record;

pub use collator::{Batch, PaddingCollator};
pub use dataset::{read_jsonl, TokenizedDataset};
pub use formatter::{format_record, LengthPolicy};
pub use record::{ConversationRecord, TokenizedExample, Turn};

/// Label value excluded from the loss
pub const IGNORE_INDEX: i64 = -100;
