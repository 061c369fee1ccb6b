//! Progress-callback trait for per-file batch events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to receive
//! events as the batch processor works through each upload. The CLI renders
//! them as an `indicatif` bar; a service could forward them to a websocket.
//!
//! # Example
//!
//! ```rust
//! use jpgconv::{ConversionProgressCallback, ConversionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     converted: Arc<AtomicUsize>,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_file_complete(&self, index: usize, total: usize, filename: &str, outputs: usize) {
//!         self.converted.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{}/{} {} → {} jpg", index, total, filename, outputs);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     converted: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ConversionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the batch processor as it handles each file.
///
/// Implementations must be `Send + Sync`: files are converted concurrently,
/// so `on_file_start`, `on_file_complete` and `on_file_error` may arrive
/// from different threads and out of order. All methods default to no-ops.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once before the first file is validated.
    fn on_batch_start(&self, task_id: &str, total_files: usize) {
        let _ = (task_id, total_files);
    }

    /// Called when a file enters conversion.
    ///
    /// # Arguments
    /// * `index` — 1-indexed position of the file in the upload
    /// * `total` — number of files in the batch
    fn on_file_start(&self, index: usize, total: usize, filename: &str) {
        let _ = (index, total, filename);
    }

    /// Called when a file converted successfully.
    ///
    /// `outputs` is the number of JPGs produced (zero for an image-less PDF).
    fn on_file_complete(&self, index: usize, total: usize, filename: &str, outputs: usize) {
        let _ = (index, total, filename, outputs);
    }

    /// Called when a file was rejected or failed to convert.
    fn on_file_error(&self, index: usize, total: usize, filename: &str, error: &str) {
        let _ = (index, total, filename, error);
    }

    /// Called once after packaging, with the number of successful files.
    fn on_batch_complete(&self, total_files: usize, success_count: usize) {
        let _ = (total_files, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
