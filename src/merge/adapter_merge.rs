//! Fold a LoRA adapter into its base model and write a standalone model

use std::fs;
use std::path::{Path, PathBuf};

use super::copy::copy_missing_files;
use crate::lora::PeftModel;
use crate::model::{CacheScope, CausalLm, DeviceCache, DevicePlacement, HostCache, WeightDtype};
use crate::tokenizer::PretrainedTokenizer;
use crate::Result;

/// Inputs of one merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    /// Base model directory (read only)
    pub base: PathBuf,
    /// Adapter directory (read only)
    pub adapter: PathBuf,
    /// Output directory, created if needed
    pub output: PathBuf,
}

impl MergeRequest {
    pub fn new(
        base: impl Into<PathBuf>,
        adapter: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base: base.into(),
            adapter: adapter.into(),
            output: output.into(),
        }
    }
}

/// What a successful merge produced
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSummary {
    pub output: PathBuf,
    /// Modules whose adapter was folded into the base weight
    pub merged_modules: Vec<String>,
    pub dtype: WeightDtype,
    pub placement: DevicePlacement,
    /// Auxiliary base files backfilled into the output
    pub copied_files: Vec<String>,
}

/// Result of [`merge_with_backend`]. Failures are reported, never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged(MergeSummary),
    /// Both the automatic and the CPU attempt failed
    Failed(String),
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged(_))
    }

    pub fn summary(&self) -> Option<&MergeSummary> {
        match self {
            MergeOutcome::Merged(summary) => Some(summary),
            MergeOutcome::Failed(_) => None,
        }
    }
}

/// One load → merge → save pass at a given placement
pub trait MergeBackend {
    fn merge(&self, request: &MergeRequest, placement: DevicePlacement) -> Result<MergeSummary>;
}

/// Merges with the in-crate model, LoRA and tokenizer implementations
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeMergeBackend;

impl MergeBackend for NativeMergeBackend {
    fn merge(&self, request: &MergeRequest, placement: DevicePlacement) -> Result<MergeSummary> {
        let tokenizer = PretrainedTokenizer::from_pretrained(&request.base)?;
        let base = CausalLm::from_pretrained(&request.base, placement)?;
        let dtype = base.dtype();

        let peft = PeftModel::from_pretrained(base, &request.adapter)?;
        let merged_modules = peft.adapted_modules().to_vec();
        let merged = peft.merge_and_unload();

        tokenizer.save_pretrained(&request.output)?;
        merged.save_pretrained(&request.output)?;
        let report = copy_missing_files(&request.base, &request.output)?;

        Ok(MergeSummary {
            output: request.output.clone(),
            merged_modules,
            dtype,
            placement,
            copied_files: report.copied,
        })
    }
}

/// Merge through `backend`, retrying once on CPU.
///
/// The device cache is emptied on entry and again on every exit path.
pub fn merge_with_backend(
    backend: &dyn MergeBackend,
    cache: &dyn DeviceCache,
    request: &MergeRequest,
) -> MergeOutcome {
    let _scope = CacheScope::enter(cache);

    if let Err(e) = fs::create_dir_all(&request.output) {
        tracing::error!("cannot create {}: {e}", request.output.display());
        return MergeOutcome::Failed(e.to_string());
    }

    tracing::info!(
        "merging adapter {} into {} -> {}",
        request.adapter.display(),
        request.base.display(),
        request.output.display()
    );
    let first = match backend.merge(request, DevicePlacement::Auto) {
        Ok(summary) => return merged(summary),
        Err(e) => e,
    };
    tracing::warn!("merge failed ({first}), retrying on cpu");

    match backend.merge(request, DevicePlacement::Cpu) {
        Ok(summary) => merged(summary),
        Err(e) => {
            tracing::error!("merge failed on cpu: {e}");
            MergeOutcome::Failed(e.to_string())
        }
    }
}

fn merged(summary: MergeSummary) -> MergeOutcome {
    tracing::info!(
        "merged {} modules ({:?}, {}) into {}",
        summary.merged_modules.len(),
        summary.dtype,
        summary.placement,
        summary.output.display()
    );
    MergeOutcome::Merged(summary)
}

/// Merge `adapter` into `base` and write the result to `output`
pub fn merge_lora_to_base_model(
    base: impl AsRef<Path>,
    adapter: impl AsRef<Path>,
    output: impl AsRef<Path>,
) -> MergeOutcome {
    let request = MergeRequest::new(base.as_ref(), adapter.as_ref(), output.as_ref());
    merge_with_backend(&NativeMergeBackend, &HostCache::new(), &request)
}
