//! Metrics reporting to `<output_dir>/metrics.jsonl`

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::callback::{CallbackContext, TrainerCallback};
use super::state::LogRecord;
use crate::Result;

pub const METRICS_FILE: &str = "metrics.jsonl";

/// Appends one JSON object per log record
pub struct JsonlReporter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlReporter {
    /// Open (or create) `metrics.jsonl` in `dir` for appending
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(METRICS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, record: &LogRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

impl TrainerCallback for JsonlReporter {
    fn on_log(&mut self, _ctx: &CallbackContext, record: &LogRecord) {
        if let Err(e) = self.append(record) {
            tracing::warn!("failed to append to {}: {e}", self.path.display());
        }
    }

    fn on_train_end(&mut self, _ctx: &CallbackContext) {
        let _ = self.writer.flush();
    }

    fn name(&self) -> &str {
        "JsonlReporter"
    }
}

impl Drop for JsonlReporter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
