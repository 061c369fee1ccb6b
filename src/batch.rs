//! Batch orchestration: validate → convert → write → package.
//!
//! ## Per-file isolation
//!
//! Every upload ends up as exactly one [`ConversionResult`]. Validation
//! failures, decoder errors and even panics inside a converter are recorded
//! on that file's result; the loop always moves on to the next file. Only
//! problems with the batch as a whole (bad parameters, storage, timeout,
//! cancellation) surface as [`ConvertError`].
//!
//! ## Concurrency
//!
//! Conversions are CPU-bound and partly FFI-backed, so each runs on tokio's
//! blocking pool. A semaphore shared by every clone of a [`BatchProcessor`]
//! caps running conversions at `config.concurrency` across all batches, and
//! `StreamExt::buffered` hands results back in upload order, which keeps
//! output naming and the archive layout deterministic.
//!
//! ## Abort
//!
//! A batch that exceeds `batch_timeout_secs`, or whose cancellation token
//! fires, stops scheduling work, signals in-flight PDF conversions to stop
//! at the next page, purges everything it wrote and returns
//! [`ConvertError::Cancelled`].

use crate::config::{ConversionConfig, Quality};
use crate::error::{ConvertError, FileError};
use crate::output::{ConversionResult, OutputFile, Task};
use crate::pipeline::pdf::PdfOptions;
use crate::pipeline::validate::{FileKind, FileValidator};
use crate::pipeline::{heic, pdf, raster};
use crate::store::{TaskHandle, TaskStore};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Filename as declared by the uploader. Untrusted.
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Set when the upload passed the size ceiling and its bytes were
    /// dropped while receiving it.
    discarded_len: Option<usize>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
            discarded_len: None,
        }
    }

    /// An upload of `len` bytes that was not kept. It is reported as
    /// `FileTooLarge` without ever reaching a decoder.
    pub fn discarded(filename: impl Into<String>, len: usize) -> Self {
        Self {
            filename: filename.into(),
            bytes: Vec::new(),
            discarded_len: Some(len),
        }
    }

    /// Size of the upload as received, including discarded bytes.
    pub fn len(&self) -> usize {
        self.discarded_len.unwrap_or(self.bytes.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded_len.is_some()
    }
}

/// An ordered set of uploads plus the requested quality settings.
#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub files: Vec<UploadedFile>,
    /// Requested JPEG quality; clamped, never rejected.
    pub quality: Option<i64>,
    /// Alternative name for quality used by older clients; clamped the same way.
    pub compression: Option<i64>,
}

impl BatchRequest {
    pub fn new(files: Vec<UploadedFile>) -> Self {
        Self {
            files,
            ..Default::default()
        }
    }

    pub fn quality(mut self, q: i64) -> Self {
        self.quality = Some(q);
        self
    }

    pub fn compression(mut self, c: i64) -> Self {
        self.compression = Some(c);
        self
    }
}

/// Drives a batch through validation, conversion and packaging.
///
/// Cheap to clone; all clones share the same [`TaskStore`] and the same
/// conversion slots.
#[derive(Clone)]
pub struct BatchProcessor {
    config: Arc<ConversionConfig>,
    store: Arc<TaskStore>,
    validator: FileValidator,
    slots: Arc<Semaphore>,
}

/// What a blocking conversion hands back for one file.
type Converted = Result<(FileKind, Vec<(String, Vec<u8>)>), (Option<FileKind>, FileError)>;

impl BatchProcessor {
    pub fn new(config: ConversionConfig, store: Arc<TaskStore>) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self::with_slots(config, store, slots)
    }

    /// Like [`BatchProcessor::new`], but conversions draw from `slots`, which
    /// may be shared with other processors.
    pub fn with_slots(
        config: ConversionConfig,
        store: Arc<TaskStore>,
        slots: Arc<Semaphore>,
    ) -> Self {
        let validator = FileValidator::new(config.max_file_size);
        Self {
            config: Arc::new(config),
            store,
            validator,
            slots,
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Process a batch with no external cancellation.
    pub async fn process(&self, request: BatchRequest) -> Result<Task, ConvertError> {
        self.process_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Process a batch, aborting if `cancel` fires or the batch runs past
    /// `batch_timeout_secs`.
    pub async fn process_with_cancel(
        &self,
        request: BatchRequest,
        cancel: CancellationToken,
    ) -> Result<Task, ConvertError> {
        let BatchRequest {
            files,
            quality,
            compression,
        } = request;

        if files.is_empty() {
            return Err(ConvertError::invalid_parameter("files", "no files uploaded"));
        }
        if files.len() > self.config.max_batch_files {
            return Err(ConvertError::invalid_parameter(
                "files",
                format!(
                    "{} files uploaded, at most {} allowed",
                    files.len(),
                    self.config.max_batch_files
                ),
            ));
        }

        let (quality, compression) = self.config.resolve_quality(quality, compression);
        let task = self.store.create().await?;
        let task_id = task.id();
        let total = files.len();

        info!(
            "Task {}: {} file(s), quality {}, compression {}",
            task_id, total, quality, compression
        );
        if let Some(cb) = &self.config.progress_callback {
            cb.on_batch_start(&task_id, total);
        }

        let work_cancel = cancel.child_token();
        let budget = Duration::from_secs(self.config.batch_timeout_secs);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConvertError::Cancelled {
                task_id: task_id.clone(),
                reason: "cancelled by caller".into(),
            }),
            r = tokio::time::timeout(budget, self.run(&task, files, quality, &work_cancel)) => {
                r.unwrap_or_else(|_| Err(ConvertError::Cancelled {
                    task_id: task_id.clone(),
                    reason: format!("exceeded the {}s batch time limit", budget.as_secs()),
                }))
            }
        };

        let results = match outcome {
            Ok(results) => results,
            Err(e) => {
                work_cancel.cancel();
                warn!("Task {} aborted: {}", task_id, e);
                if let Err(purge_err) = self.store.purge(&task_id).await {
                    warn!("Task {}: purge after abort failed: {}", task_id, purge_err);
                }
                return Err(e);
            }
        };

        let task = Task {
            task_id: task_id.clone(),
            directory: task.directory().to_path_buf(),
            archive: task.archive().to_path_buf(),
            results,
            created_at: task.created_at(),
            quality,
            compression,
        };

        info!(
            "Task {}: {}/{} file(s) converted",
            task_id,
            task.processed_files(),
            total
        );
        if let Some(cb) = &self.config.progress_callback {
            cb.on_batch_complete(total, task.processed_files());
        }
        Ok(task)
    }

    /// Convert, write and package. Results come back in upload order.
    async fn run(
        &self,
        task: &TaskHandle,
        files: Vec<UploadedFile>,
        quality: Quality,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConversionResult>, ConvertError> {
        let total = files.len();
        let pdf_options = PdfOptions::from(self.config.as_ref());
        let pdf_options = &pdf_options;

        let mut conversions = stream::iter(files.into_iter().enumerate())
            .map(move |(i, file)| {
                let filename = file.filename.clone();
                let fut = self.convert_one(i + 1, total, file, quality, pdf_options, cancel);
                async move { (filename, fut.await) }
            })
            .buffered(self.config.concurrency.max(1));

        let mut results = Vec::with_capacity(total);
        let mut packaged: Vec<OutputFile> = Vec::new();
        let mut taken = HashSet::new();
        let mut index = 0;

        while let Some((filename, converted)) = conversions.next().await {
            index += 1;
            let result = match converted {
                Ok((kind, images)) => {
                    let mut outputs = Vec::with_capacity(images.len());
                    for (name, bytes) in images {
                        let name = unique_name(&mut taken, &name);
                        outputs.push(self.store.write_output(task, &name, &bytes).await?);
                    }
                    debug!("{}: wrote {} output(s)", filename, outputs.len());
                    if let Some(cb) = &self.config.progress_callback {
                        cb.on_file_complete(index, total, &filename, outputs.len());
                    }
                    packaged.extend(outputs.iter().cloned());
                    ConversionResult::succeeded(filename, kind, outputs)
                }
                Err((kind, err)) => {
                    warn!("{}: {}", filename, err);
                    if let Some(cb) = &self.config.progress_callback {
                        cb.on_file_error(index, total, &filename, &err.to_string());
                    }
                    ConversionResult::failed(filename, kind, &err)
                }
            };
            results.push(result);
        }

        self.store.package(task, &packaged).await?;
        Ok(results)
    }

    async fn convert_one(
        &self,
        index: usize,
        total: usize,
        file: UploadedFile,
        quality: Quality,
        pdf_options: &PdfOptions,
        cancel: &CancellationToken,
    ) -> Converted {
        self.validator
            .check_size(&file.filename, file.len())
            .map_err(|e| (None, e))?;
        let UploadedFile {
            filename, bytes, ..
        } = file;

        let kind = self
            .validator
            .validate(&filename, &bytes)
            .map_err(|e| (None, e))?;

        let permit = Arc::clone(&self.slots).acquire_owned().await.map_err(|_| {
            (
                Some(kind),
                FileError::decode(&filename, "conversion slots were closed"),
            )
        })?;

        if let Some(cb) = &self.config.progress_callback {
            cb.on_file_start(index, total, &filename);
        }
        debug!("{}: detected {}, {} bytes", filename, kind, bytes.len());

        let options = pdf_options.clone();
        let cancel = cancel.clone();
        let name = filename.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            convert_blocking(kind, &name, &bytes, quality, &options, &cancel)
        })
        .await;

        match joined {
            Ok(Ok(images)) => Ok((kind, images)),
            Ok(Err(e)) => Err((Some(kind), e)),
            Err(join_err) => Err((
                Some(kind),
                FileError::decode(&filename, format!("converter crashed: {join_err}")),
            )),
        }
    }
}

/// Dispatch one validated file to its converter.
fn convert_blocking(
    kind: FileKind,
    filename: &str,
    bytes: &[u8],
    quality: Quality,
    pdf_options: &PdfOptions,
    cancel: &CancellationToken,
) -> Result<Vec<(String, Vec<u8>)>, FileError> {
    match kind {
        FileKind::Heic => {
            heic::convert(filename, bytes, quality).map(|jpg| vec![(jpg_name(filename), jpg)])
        }
        FileKind::Pdf => pdf::convert(filename, bytes, quality, pdf_options, cancel),
        FileKind::Image(format) => raster::convert(filename, bytes, format, quality)
            .map(|jpg| vec![(jpg_name(filename), jpg)]),
    }
}

/// `{stem}.jpg` for a single-image input.
fn jpg_name(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image");
    format!("{stem}.jpg")
}

/// Claim `name`, or the first free `{stem}_{n}.{ext}` with `n ≥ 2`.
fn unique_name(taken: &mut HashSet<String>, name: &str) -> String {
    if taken.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, Some(e)),
        _ => (name, None),
    };
    let mut n = 2;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpg_name_replaces_extension() {
        assert_eq!(jpg_name("IMG_0001.HEIC"), "IMG_0001.jpg");
        assert_eq!(jpg_name("holiday.photo.png"), "holiday.photo.jpg");
        assert_eq!(jpg_name("nested/dir/x.webp"), "x.jpg");
    }

    #[test]
    fn unique_name_suffixes_in_order() {
        let mut taken = HashSet::new();
        assert_eq!(unique_name(&mut taken, "a.jpg"), "a.jpg");
        assert_eq!(unique_name(&mut taken, "a.jpg"), "a_2.jpg");
        assert_eq!(unique_name(&mut taken, "a.jpg"), "a_3.jpg");
        assert_eq!(unique_name(&mut taken, "b.jpg"), "b.jpg");
    }

    #[test]
    fn unique_name_skips_names_already_claimed() {
        let mut taken = HashSet::new();
        unique_name(&mut taken, "a_2.jpg");
        unique_name(&mut taken, "a.jpg");
        assert_eq!(unique_name(&mut taken, "a.jpg"), "a_3.jpg");
    }

    #[test]
    fn discarded_upload_reports_received_size() {
        let file = UploadedFile::discarded("huge.heic", 5_000);
        assert!(file.is_discarded());
        assert!(file.bytes.is_empty());
        assert_eq!(file.len(), 5_000);
        assert!(!file.is_empty());
    }

    #[tokio::test]
    async fn discarded_upload_fails_as_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new(dir.path()).unwrap());
        let config = ConversionConfig::builder().max_file_size(1_000).build().unwrap();
        let processor = BatchProcessor::new(config, store);
        let task = processor
            .process(BatchRequest::new(vec![UploadedFile::discarded("huge.png", 4_096)]))
            .await
            .unwrap();
        assert_eq!(
            task.results[0].error_kind,
            Some(crate::error::ErrorKind::FileTooLarge)
        );
        assert!(task.results[0].error.as_deref().unwrap().contains("4096"));
    }

    #[test]
    fn request_builder_sets_quality() {
        let req = BatchRequest::new(vec![UploadedFile::new("a.png", vec![1u8])])
            .quality(70)
            .compression(40);
        assert_eq!(req.quality, Some(70));
        assert_eq!(req.compression, Some(40));
        assert_eq!(req.files[0].len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_is_rejected_before_task_creation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new(dir.path()).unwrap());
        let processor = BatchProcessor::new(ConversionConfig::default(), store);
        let err = processor.process(BatchRequest::default()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParameter);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new(dir.path()).unwrap());
        let config = ConversionConfig::builder().max_batch_files(2).build().unwrap();
        let processor = BatchProcessor::new(config, store);
        let files = (0..3)
            .map(|i| UploadedFile::new(format!("{i}.png"), vec![0u8; 4]))
            .collect();
        let err = processor.process(BatchRequest::new(files)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParameter);
    }
}
