//! Backfill auxiliary files from a base model directory
//!
//! Everything in the base directory that the merge output lacks is copied
//! over, except entries whose name marks them as weights. Existing names in
//! the destination are never touched, so a second run copies nothing.

use std::fs;
use std::path::Path;

use crate::{Error, Result};

/// Name fragments of weight files that are never copied
const WEIGHT_MARKERS: [&str; 2] = [".bin", "safetensors"];

/// What one [`copy_missing_files`] call did, by top-level entry name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub copied: Vec<String>,
    /// Weight files left behind
    pub skipped_weights: Vec<String>,
    pub already_present: Vec<String>,
}

impl CopyReport {
    /// True when nothing was copied
    pub fn is_noop(&self) -> bool {
        self.copied.is_empty()
    }
}

fn is_weight_file(name: &str) -> bool {
    WEIGHT_MARKERS.iter().any(|m| name.contains(m))
}

/// Copy every entry of `src` whose name is absent from `dst` and is not a
/// weight file. Directories are copied with their whole contents.
pub fn copy_missing_files(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<CopyReport> {
    let src = src.as_ref();
    let dst = dst.as_ref();
    if !src.exists() {
        return Err(Error::NotFound(src.to_path_buf()));
    }
    fs::create_dir_all(dst)?;

    let mut entries: Vec<_> = fs::read_dir(src)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut report = CopyReport::default();
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_weight_file(&name) {
            report.skipped_weights.push(name);
            continue;
        }
        let target = dst.join(entry.file_name());
        if target.exists() {
            report.already_present.push(name);
            continue;
        }

        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
        tracing::debug!("copied {name} into {}", dst.display());
        report.copied.push(name);
    }
    Ok(report)
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
