//! # jpgconv
//!
//! Batch-convert HEIC/HEIF photos, PDF documents and ordinary raster images
//! to JPG, and hand the results back as a single ZIP per batch.
//!
//! ## Pipeline Overview
//!
//! ```text
//! uploads (N files + quality)
//!  │
//!  ├─ 1. Validate  size, filename, content sniffing, extension agreement
//!  ├─ 2. Convert   HEIC (libheif) │ PDF (pdfium) │ raster (image), on the blocking pool
//!  ├─ 3. Write     JPGs into a task-scoped directory, names deduplicated
//!  ├─ 4. Package   {task_id}.zip, written atomically
//!  └─ 5. Deliver   retrieve by task id, then purge
//! ```
//!
//! One bad file never sinks the batch: each upload gets its own
//! [`ConversionResult`] with either its outputs or the reason it failed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jpgconv::{BatchProcessor, BatchRequest, ConversionConfig, TaskStore, UploadedFile};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(TaskStore::new("/tmp/jpgconv")?);
//!     let processor = BatchProcessor::new(ConversionConfig::default(), store.clone());
//!
//!     let files = vec![UploadedFile::new("IMG_0001.heic", std::fs::read("IMG_0001.heic")?)];
//!     let task = processor.process(BatchRequest::new(files).quality(80)).await?;
//!
//!     println!("{} of {} converted", task.processed_files(), task.results.len());
//!     let zip = store.read_archive(&task.task_id).await?;
//!     std::fs::write("converted.zip", zip)?;
//!     store.purge(&task.task_id).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `heic`   | on      | HEIC/HEIF decoding via the system libheif |
//! | `server` | via `cli` | axum HTTP service ([`server`]) |
//! | `cli`    | on      | The `jpgconv` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! PDF support needs the pdfium shared library at runtime, found via
//! [`ConversionConfig::pdfium_lib_path`] or the system library path.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
#[cfg(feature = "server")]
pub mod server;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{BatchProcessor, BatchRequest, UploadedFile};
pub use config::{ConversionConfig, ConversionConfigBuilder, Quality};
pub use error::{ConvertError, ErrorKind, FileError, Limit};
pub use output::{BatchSummary, ConversionResult, OutputFile, Task};
pub use pipeline::validate::{FileKind, FileValidator, RasterFormat};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use store::{TaskHandle, TaskStatus, TaskStore};
