//! Configuration types for batch conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. The same struct is shared by the CLI,
//! the HTTP service and library callers, so every limit is set in one place.

use crate::error::ConvertError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A JPEG quality on the linear 1–100 scale.
///
/// Values are clamped on construction, never rejected: a request for
/// quality `0` encodes at `1`, a request for `250` encodes at `100`. Every
/// converter takes a `Quality`, so the policy cannot diverge between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quality(u8);

impl Quality {
    pub const MIN: Quality = Quality(1);
    pub const MAX: Quality = Quality(100);

    /// Clamp an arbitrary integer into `1..=100`.
    pub fn new(value: i64) -> Self {
        Quality(value.clamp(1, 100) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality(85)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for a batch conversion.
///
/// Built via [`ConversionConfig::builder()`] or using
/// [`ConversionConfig::default()`].
///
/// # Example
/// ```rust
/// use jpgconv::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .max_pdf_pages(20)
///     .render_page_fallback(true)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Largest accepted upload in bytes. Default: 100 MiB.
    ///
    /// Checked before any content inspection so hostile input never reaches
    /// a decoder.
    pub max_file_size: usize,

    /// Largest number of files accepted in one batch. Default: 50.
    pub max_batch_files: usize,

    /// Maximum page count of an accepted PDF. Default: 100.
    pub max_pdf_pages: usize,

    /// Maximum embedded images on any single PDF page. Default: 10.
    pub max_images_per_page: usize,

    /// Quality used when a request names neither quality nor compression. Default: 85.
    pub default_quality: Quality,

    /// Lower clamp bound for requested quality/compression. Default: 1.
    pub min_quality: Quality,

    /// Upper clamp bound for requested quality/compression. Default: 100.
    pub max_quality: Quality,

    /// Rasterise PDF pages that carry no embedded image. Default: false.
    pub render_page_fallback: bool,

    /// Longest edge, in pixels, of a rasterised PDF page. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Conversions running at once, across every batch handled by one
    /// [`crate::BatchProcessor`] and its clones. Default: available CPUs.
    pub concurrency: usize,

    /// Wall-clock budget for a whole batch in seconds. Default: 300.
    pub batch_timeout_secs: u64,

    /// Directory holding the pdfium shared library. `None` binds the system library.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Optional per-file progress events.
    pub progress_callback: Option<ProgressCallback>,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            max_batch_files: 50,
            max_pdf_pages: 100,
            max_images_per_page: 10,
            default_quality: Quality::default(),
            min_quality: Quality::MIN,
            max_quality: Quality::MAX,
            render_page_fallback: false,
            max_rendered_pixels: 2000,
            concurrency: default_concurrency(),
            batch_timeout_secs: 300,
            pdfium_lib_path: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("max_file_size", &self.max_file_size)
            .field("max_batch_files", &self.max_batch_files)
            .field("max_pdf_pages", &self.max_pdf_pages)
            .field("max_images_per_page", &self.max_images_per_page)
            .field("default_quality", &self.default_quality)
            .field("min_quality", &self.min_quality)
            .field("max_quality", &self.max_quality)
            .field("render_page_fallback", &self.render_page_fallback)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("batch_timeout_secs", &self.batch_timeout_secs)
            .field("pdfium_lib_path", &self.pdfium_lib_path)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Clamp a requested value into `[min_quality, max_quality]`.
    ///
    /// Inverted bounds, possible when the fields are set without `build()`,
    /// resolve to `min_quality`.
    pub fn clamp_quality(&self, requested: i64) -> Quality {
        let q = Quality::new(requested);
        if q < self.min_quality {
            self.min_quality
        } else if q > self.max_quality {
            self.max_quality
        } else {
            q
        }
    }

    /// Resolve the effective `(quality, compression)` pair for a batch.
    ///
    /// A missing quality falls back to compression, then to
    /// `default_quality`; compression mirrors that the other way round.
    /// Both are clamped independently.
    pub fn resolve_quality(
        &self,
        quality: Option<i64>,
        compression: Option<i64>,
    ) -> (Quality, Quality) {
        let default = self.default_quality.value() as i64;
        let q = self.clamp_quality(quality.or(compression).unwrap_or(default));
        let c = self.clamp_quality(compression.or(quality).unwrap_or(default));
        (q, c)
    }
}

/// Builder for [`ConversionConfig`].
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl fmt::Debug for ConversionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ConversionConfigBuilder {
    pub fn max_file_size(mut self, bytes: usize) -> Self {
        self.config.max_file_size = bytes;
        self
    }

    pub fn max_batch_files(mut self, n: usize) -> Self {
        self.config.max_batch_files = n;
        self
    }

    pub fn max_pdf_pages(mut self, n: usize) -> Self {
        self.config.max_pdf_pages = n;
        self
    }

    pub fn max_images_per_page(mut self, n: usize) -> Self {
        self.config.max_images_per_page = n;
        self
    }

    pub fn default_quality(mut self, q: i64) -> Self {
        self.config.default_quality = Quality::new(q);
        self
    }

    pub fn quality_bounds(mut self, min: i64, max: i64) -> Self {
        self.config.min_quality = Quality::new(min);
        self.config.max_quality = Quality::new(max);
        self
    }

    pub fn render_page_fallback(mut self, v: bool) -> Self {
        self.config.render_page_fallback = v;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn batch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.batch_timeout_secs = secs;
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, ConvertError> {
        let c = &self.config;
        if c.max_file_size == 0 {
            return Err(ConvertError::InvalidConfig(
                "max_file_size must be ≥ 1 byte".into(),
            ));
        }
        if c.max_batch_files == 0 {
            return Err(ConvertError::InvalidConfig(
                "max_batch_files must be ≥ 1".into(),
            ));
        }
        if c.max_pdf_pages == 0 || c.max_images_per_page == 0 {
            return Err(ConvertError::InvalidConfig(
                "PDF page and image limits must be ≥ 1".into(),
            ));
        }
        if c.min_quality > c.max_quality {
            return Err(ConvertError::InvalidConfig(format!(
                "min quality {} exceeds max quality {}",
                c.min_quality, c.max_quality
            )));
        }
        if c.default_quality < c.min_quality || c.default_quality > c.max_quality {
            return Err(ConvertError::InvalidConfig(format!(
                "default quality {} is outside {}–{}",
                c.default_quality, c.min_quality, c.max_quality
            )));
        }
        if c.batch_timeout_secs == 0 {
            return Err(ConvertError::InvalidConfig(
                "batch timeout must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}
