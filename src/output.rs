//! Result types produced by a batch: per-file outcomes, the task record and
//! the summary handed back to the caller.

use crate::config::Quality;
use crate::error::{ErrorKind, FileError};
use crate::pipeline::validate::FileKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One JPG written into the task directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    pub size_bytes: u64,
}

/// Outcome for a single uploaded file. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    /// Filename as declared by the uploader.
    pub source_filename: String,
    /// Detected kind; `None` when validation rejected the file.
    pub kind: Option<FileKind>,
    pub success: bool,
    /// JPGs produced, in deterministic order. A PDF may produce many or none.
    pub outputs: Vec<OutputFile>,
    /// First output, for single-image inputs.
    pub output_filename: Option<String>,
    /// Sum of all output sizes.
    pub output_size_bytes: u64,
    pub error_kind: Option<ErrorKind>,
    /// Human-readable failure reason.
    pub error: Option<String>,
}

impl ConversionResult {
    pub fn succeeded(
        source_filename: impl Into<String>,
        kind: FileKind,
        outputs: Vec<OutputFile>,
    ) -> Self {
        Self {
            source_filename: source_filename.into(),
            kind: Some(kind),
            success: true,
            output_filename: outputs.first().map(|o| o.filename.clone()),
            output_size_bytes: outputs.iter().map(|o| o.size_bytes).sum(),
            outputs,
            error_kind: None,
            error: None,
        }
    }

    pub fn failed(
        source_filename: impl Into<String>,
        kind: Option<FileKind>,
        error: &FileError,
    ) -> Self {
        Self {
            source_filename: source_filename.into(),
            kind,
            success: false,
            outputs: Vec::new(),
            output_filename: None,
            output_size_bytes: 0,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
        }
    }
}

/// One batch's isolated unit of output storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub directory: PathBuf,
    pub archive: PathBuf,
    /// Per-file results, in upload order.
    pub results: Vec<ConversionResult>,
    pub created_at: DateTime<Utc>,
    pub quality: Quality,
    pub compression: Quality,
}

impl Task {
    /// Number of input files that converted successfully.
    pub fn processed_files(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed_files(&self) -> usize {
        self.results.len() - self.processed_files()
    }

    /// Build the caller-facing summary. `download_prefix` is joined with the
    /// task id, e.g. `/api/download`.
    pub fn summary(&self, download_prefix: &str) -> BatchSummary {
        let count = |pred: fn(&FileKind) -> bool| {
            self.results
                .iter()
                .filter(|r| r.kind.as_ref().is_some_and(pred))
                .count()
        };

        BatchSummary {
            success: true,
            task_id: self.task_id.clone(),
            total_files: self.results.len(),
            processed_files: self.processed_files(),
            failed_files: self.failed_files(),
            heic_files: count(|k| matches!(k, FileKind::Heic)),
            pdf_files: count(|k| matches!(k, FileKind::Pdf)),
            image_files: count(|k| matches!(k, FileKind::Image(_))),
            quality: self.quality,
            compression: self.compression,
            download_url: format!("{}/{}", download_prefix.trim_end_matches('/'), self.task_id),
            results: self.results.clone(),
        }
    }
}

/// Summary returned to the uploader after a batch completes.
///
/// `success` reports whether the batch itself completed; individual file
/// outcomes are always enumerated in `results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub success: bool,
    pub task_id: String,
    pub total_files: usize,
    pub processed_files: usize,
    pub failed_files: usize,
    pub heic_files: usize,
    pub pdf_files: usize,
    pub image_files: usize,
    pub quality: Quality,
    pub compression: Quality,
    pub download_url: String,
    pub results: Vec<ConversionResult>,
}
