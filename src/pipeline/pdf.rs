//! PDF → JPG: extract embedded images page by page via pdfium.
//!
//! ## Why blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which keeps
//! thread-local state and is not safe to call from async contexts. Callers
//! run [`convert`] inside `tokio::task::spawn_blocking`, and the only
//! cooperation with the async side is the [`CancellationToken`], checked
//! between pages.
//!
//! ## Limits
//!
//! The page count is checked before any page is touched; a document over
//! `max_pdf_pages` fails as a whole rather than being silently truncated.
//! The image count of each page is checked before that page is extracted.
//!
//! ## Naming
//!
//! Outputs are named `{stem}_page{NNN}_img{NN}.jpg`, 1-indexed. An embedded
//! image pdfium cannot decode is skipped but keeps its index, so the names of
//! its siblings never depend on which images happened to fail.

use crate::config::{ConversionConfig, Quality};
use crate::error::{FileError, Limit};
use crate::pipeline::encode::encode_jpeg;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The subset of [`ConversionConfig`] the PDF stage needs, owned so it can
/// move into a blocking task.
#[derive(Debug, Clone)]
pub struct PdfOptions {
    pub max_pages: usize,
    pub max_images_per_page: usize,
    pub render_page_fallback: bool,
    pub max_rendered_pixels: u32,
    pub pdfium_lib_path: Option<PathBuf>,
}

impl From<&ConversionConfig> for PdfOptions {
    fn from(config: &ConversionConfig) -> Self {
        Self {
            max_pages: config.max_pdf_pages,
            max_images_per_page: config.max_images_per_page,
            render_page_fallback: config.render_page_fallback,
            max_rendered_pixels: config.max_rendered_pixels,
            pdfium_lib_path: config.pdfium_lib_path.clone(),
        }
    }
}

/// Output name for image `image` (1-based) on page `page` (1-based).
pub fn page_image_filename(stem: &str, page: usize, image: usize) -> String {
    format!("{stem}_page{page:03}_img{image:02}.jpg")
}

/// Bind pdfium from `lib_path` (the library file or the directory holding
/// it), else from the system library search path.
pub fn bind_pdfium(lib_path: Option<&Path>) -> Result<Pdfium, PdfiumError> {
    let bindings = match lib_path {
        Some(p) if p.is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(p))?
        }
        Some(p) => Pdfium::bind_to_library(p)?,
        None => Pdfium::bind_to_system_library()?,
    };
    Ok(Pdfium::new(bindings))
}

/// Convert every embedded image of a PDF to JPG.
///
/// Returns `(filename, jpg_bytes)` in page order, then image order. A
/// document with no images yields an empty vector.
pub fn convert(
    filename: &str,
    bytes: &[u8],
    quality: Quality,
    options: &PdfOptions,
    cancel: &CancellationToken,
) -> Result<Vec<(String, Vec<u8>)>, FileError> {
    let pdfium = bind_pdfium(options.pdfium_lib_path.as_deref())
        .map_err(|e| FileError::decode(filename, format!("pdfium unavailable: {e:?}")))?;

    let document = pdfium.load_pdf_from_byte_slice(bytes, None).map_err(|e| {
        let err_str = format!("{:?}", e);
        let detail = if err_str.contains("Password") || err_str.contains("password") {
            "document is password protected".to_string()
        } else {
            err_str
        };
        FileError::CorruptPdf {
            filename: filename.to_string(),
            detail,
        }
    })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    if total_pages > options.max_pages {
        return Err(FileError::LimitExceeded {
            filename: filename.to_string(),
            limit: Limit::Pages,
            actual: total_pages,
            max: options.max_pages,
        });
    }
    info!("{}: PDF loaded, {} pages", filename, total_pages);

    let stem = source_stem(filename);
    let render_config = PdfRenderConfig::new()
        .set_target_width(options.max_rendered_pixels as i32)
        .set_maximum_height(options.max_rendered_pixels as i32);

    let mut outputs = Vec::new();

    for (idx, page) in pages.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(FileError::Cancelled {
                filename: filename.to_string(),
            });
        }
        let page_no = idx + 1;

        let image_count = page
            .objects()
            .iter()
            .filter(|o| o.as_image_object().is_some())
            .count();
        if image_count > options.max_images_per_page {
            return Err(FileError::LimitExceeded {
                filename: filename.to_string(),
                limit: Limit::ImagesPerPage,
                actual: image_count,
                max: options.max_images_per_page,
            });
        }

        let mut extracted = 0usize;
        let mut image_no = 0usize;
        for object in page.objects().iter() {
            let Some(image_object) = object.as_image_object() else {
                continue;
            };
            image_no += 1;

            let img = match image_object.get_raw_image() {
                Ok(img) if img.width() > 0 && img.height() > 0 => img,
                Ok(_) => {
                    warn!(
                        "{}: page {} image {} is empty, skipping",
                        filename, page_no, image_no
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        "{}: page {} image {} could not be decoded, skipping: {:?}",
                        filename, page_no, image_no, e
                    );
                    continue;
                }
            };

            let jpg = encode_jpeg(&img, quality).map_err(|e| FileError::encode(filename, e))?;
            debug!(
                "{}: page {} image {} → {}x{} px, {} bytes",
                filename,
                page_no,
                image_no,
                img.width(),
                img.height(),
                jpg.len()
            );
            outputs.push((page_image_filename(&stem, page_no, image_no), jpg));
            extracted += 1;
        }

        if extracted == 0 && options.render_page_fallback {
            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                FileError::decode(filename, format!("page {page_no} failed to render: {e:?}"))
            })?;
            let img = bitmap.as_image();
            debug!(
                "{}: rendered page {} → {}x{} px",
                filename,
                page_no,
                img.width(),
                img.height()
            );
            let jpg = encode_jpeg(&img, quality).map_err(|e| FileError::encode(filename, e))?;
            outputs.push((page_image_filename(&stem, page_no, 1), jpg));
        }
    }

    info!("{}: {} JPG(s) from {} pages", filename, outputs.len(), total_pages);
    Ok(outputs)
}

/// Filename without directories or extension.
fn source_stem(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("document")
        .to_string()
}
