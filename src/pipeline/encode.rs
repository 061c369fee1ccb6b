//! JPEG encoding: `DynamicImage` → JPG bytes at a given [`Quality`].
//!
//! JPEG has no alpha channel and the encoder rejects 16-bit and float
//! buffers, so every frame is flattened to 8-bit RGB first. Alpha is
//! dropped, not composited.

use crate::config::Quality;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use tracing::debug;

/// Encode an image as baseline JPEG.
pub fn encode_jpeg(img: &DynamicImage, quality: Quality) -> Result<Vec<u8>, image::ImageError> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.value());
    rgb.write_with_encoder(encoder)?;

    debug!(
        "Encoded {}x{} frame at quality {} → {} bytes",
        rgb.width(),
        rgb.height(),
        quality,
        buf.len()
    );
    Ok(buf)
}
