//! Ordinary raster input (PNG, JPEG, WebP, BMP, TIFF, GIF) → JPG.

use crate::config::Quality;
use crate::error::FileError;
use crate::pipeline::encode::encode_jpeg;
use crate::pipeline::validate::RasterFormat;
use tracing::debug;

/// Decode `bytes` as `format` and re-encode as JPG.
///
/// The format is the one detected from content, never guessed from the
/// filename. Animated GIFs yield their first frame.
pub fn convert(
    filename: &str,
    bytes: &[u8],
    format: RasterFormat,
    quality: Quality,
) -> Result<Vec<u8>, FileError> {
    let img = image::load_from_memory_with_format(bytes, format.image_format())
        .map_err(|e| FileError::decode(filename, e))?;
    debug!(
        "Decoded {} as {:?}: {}x{}",
        filename,
        format,
        img.width(),
        img.height()
    );

    encode_jpeg(&img, quality).map_err(|e| FileError::encode(filename, e))
}
