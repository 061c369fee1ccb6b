//! Error types for the jpgconv library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ConvertError`] — **Batch-fatal**: the batch cannot proceed or cannot
//!   be delivered (bad parameters, disk full, cancelled, task not found).
//!   Returned as `Err(ConvertError)` from [`crate::batch::BatchProcessor`]
//!   and [`crate::store::TaskStore`].
//!
//! * [`FileError`] — **Per-file**: one upload was rejected or failed to
//!   convert while every other file in the batch is fine. Stored inside
//!   [`crate::output::ConversionResult`] so the caller sees exactly which
//!   files succeeded and why the others did not.
//!
//! Both map onto the flat [`ErrorKind`] taxonomy that is serialised into
//! results and HTTP error bodies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Flat, serialisable error classification shared by results and API bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnsupportedFileType,
    FileTooLarge,
    InvalidFilename,
    InvalidParameter,
    DecodeError,
    EncodeError,
    CorruptPDF,
    LimitExceeded,
    NotFound,
    Cancelled,
    StorageError,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::UnsupportedFileType => "UnsupportedFileType",
            ErrorKind::FileTooLarge => "FileTooLarge",
            ErrorKind::InvalidFilename => "InvalidFilename",
            ErrorKind::InvalidParameter => "InvalidParameter",
            ErrorKind::DecodeError => "DecodeError",
            ErrorKind::EncodeError => "EncodeError",
            ErrorKind::CorruptPDF => "CorruptPDF",
            ErrorKind::LimitExceeded => "LimitExceeded",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::StorageError => "StorageError",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(s)
    }
}

/// Which configured limit a PDF exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    /// `max_pdf_pages`
    Pages,
    /// `max_images_per_page`
    ImagesPerPage,
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Pages => f.write_str("pages"),
            Limit::ImagesPerPage => f.write_str("images_per_page"),
        }
    }
}

/// All batch-fatal errors returned by the jpgconv library.
///
/// Per-file failures use [`FileError`] and are stored in
/// [`crate::output::ConversionResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Request errors ────────────────────────────────────────────────────
    /// Batch parameters were rejected before any file was touched.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    // ── Task errors ───────────────────────────────────────────────────────
    /// Task never existed, was already purged, or is still processing.
    #[error("Task '{task_id}' not found")]
    NotFound { task_id: String },

    /// The batch was cancelled or exceeded its time budget; its partial
    /// output has been purged.
    #[error("Task '{task_id}' cancelled: {reason}")]
    Cancelled { task_id: String, reason: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create, write or package task output.
    #[error("Storage failure at '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The ZIP writer rejected an entry or could not finalise the archive.
    #[error("Failed to package archive '{path}': {detail}")]
    Packaging { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            ConvertError::NotFound { .. } => ErrorKind::NotFound,
            ConvertError::Cancelled { .. } => ErrorKind::Cancelled,
            ConvertError::Storage { .. } | ConvertError::Packaging { .. } => {
                ErrorKind::StorageError
            }
            ConvertError::InvalidConfig(_) | ConvertError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConvertError::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_parameter(name: &str, reason: impl Into<String>) -> Self {
        ConvertError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// A non-fatal error for a single uploaded file.
///
/// Stored alongside [`crate::output::ConversionResult`] when a file fails.
/// The batch always continues with the next file.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum FileError {
    /// Content could not be positively classified as HEIC, PDF or a
    /// supported raster image, or it disagrees with the declared extension.
    #[error("Unsupported file type for '{filename}': {detail}")]
    UnsupportedFileType { filename: String, detail: String },

    /// Upload exceeds `max_file_size`; rejected before any decode.
    #[error("File '{filename}' is too large: {size} bytes (max {max})")]
    FileTooLarge {
        filename: String,
        size: usize,
        max: usize,
    },

    /// Filename contains path-traversal or script-injection patterns.
    #[error("Filename not allowed: '{filename}'")]
    InvalidFilename { filename: String },

    /// No usable image could be decoded from the input.
    #[error("Could not decode '{filename}': {detail}")]
    DecodeError { filename: String, detail: String },

    /// Decoded pixels could not be re-encoded as JPG.
    #[error("Could not encode JPG for '{filename}': {detail}")]
    EncodeError { filename: String, detail: String },

    /// The PDF container could not be parsed at all.
    #[error("PDF '{filename}' is corrupt: {detail}")]
    CorruptPdf { filename: String, detail: String },

    /// A configured PDF limit was exceeded.
    #[error("PDF '{filename}' exceeds the {limit} limit: {actual} (max {max})")]
    LimitExceeded {
        filename: String,
        limit: Limit,
        actual: usize,
        max: usize,
    },

    /// Conversion was abandoned because the batch was cancelled.
    #[error("Conversion of '{filename}' was cancelled")]
    Cancelled { filename: String },
}

impl FileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FileError::UnsupportedFileType { .. } => ErrorKind::UnsupportedFileType,
            FileError::FileTooLarge { .. } => ErrorKind::FileTooLarge,
            FileError::InvalidFilename { .. } => ErrorKind::InvalidFilename,
            FileError::DecodeError { .. } => ErrorKind::DecodeError,
            FileError::EncodeError { .. } => ErrorKind::EncodeError,
            FileError::CorruptPdf { .. } => ErrorKind::CorruptPDF,
            FileError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            FileError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn decode(filename: &str, detail: impl fmt::Display) -> Self {
        FileError::DecodeError {
            filename: filename.to_string(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn encode(filename: &str, detail: impl fmt::Display) -> Self {
        FileError::EncodeError {
            filename: filename.to_string(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn unsupported(filename: &str, detail: impl Into<String>) -> Self {
        FileError::UnsupportedFileType {
            filename: filename.to_string(),
            detail: detail.into(),
        }
    }
}
