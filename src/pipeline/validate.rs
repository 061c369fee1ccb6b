//! Upload validation: classify bytes by content before anything is decoded.
//!
//! The declared extension is only ever used to *reject*: content must be
//! positively identified as HEIC/HEIF, PDF or a supported raster format, and
//! the extension must name that same kind. A PNG renamed to `photo.heic`
//! therefore fails with `UnsupportedFileType` even though PNG is accepted
//! on its own.
//!
//! Checks run cheapest-first and the size ceiling comes before any content
//! inspection, so oversized hostile input never reaches a decoder.

use crate::error::FileError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// The closed set of input kinds the batch processor knows how to convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "format", rename_all = "snake_case")]
pub enum FileKind {
    Heic,
    Pdf,
    Image(RasterFormat),
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Heic => f.write_str("HEIC"),
            FileKind::Pdf => f.write_str("PDF"),
            FileKind::Image(raster) => write!(f, "IMAGE/{raster:?}"),
        }
    }
}

/// Raster formats accepted as plain image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RasterFormat {
    Png,
    Jpeg,
    WebP,
    Bmp,
    Tiff,
    Gif,
}

impl RasterFormat {
    pub fn image_format(self) -> image::ImageFormat {
        match self {
            RasterFormat::Png => image::ImageFormat::Png,
            RasterFormat::Jpeg => image::ImageFormat::Jpeg,
            RasterFormat::WebP => image::ImageFormat::WebP,
            RasterFormat::Bmp => image::ImageFormat::Bmp,
            RasterFormat::Tiff => image::ImageFormat::Tiff,
            RasterFormat::Gif => image::ImageFormat::Gif,
        }
    }

    fn from_image_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Png => Some(RasterFormat::Png),
            image::ImageFormat::Jpeg => Some(RasterFormat::Jpeg),
            image::ImageFormat::WebP => Some(RasterFormat::WebP),
            image::ImageFormat::Bmp => Some(RasterFormat::Bmp),
            image::ImageFormat::Tiff => Some(RasterFormat::Tiff),
            image::ImageFormat::Gif => Some(RasterFormat::Gif),
            _ => None,
        }
    }
}

/// HEIF brands that identify a still image or image sequence decodable by libheif.
const HEIF_BRANDS: &[&[u8; 4]] = &[
    b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"hevm", b"hevs", b"mif1", b"msf1",
];

/// AV1 flavours of HEIF share `mif1` but are not HEIC.
const AVIF_BRANDS: &[&[u8; 4]] = &[b"avif", b"avis"];

/// Substrings that are never allowed in an uploaded filename.
const FORBIDDEN_NAME_PATTERNS: &[&str] = &[
    "..",
    "\\",
    "//",
    "javascript:",
    "data:",
    "vbscript:",
    "onload",
    "onerror",
];

const PDF_MAGIC: &[u8] = b"%PDF-";

/// How far into the file a `%PDF-` header may appear.
const PDF_HEADER_WINDOW: usize = 1024;

/// Pure content/size/name inspection of uploads.
#[derive(Debug, Clone)]
pub struct FileValidator {
    max_file_size: usize,
}

impl FileValidator {
    pub fn new(max_file_size: usize) -> Self {
        Self { max_file_size }
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    /// Reject an upload of `size` bytes that exceeds the ceiling.
    pub fn check_size(&self, filename: &str, size: usize) -> Result<(), FileError> {
        if size > self.max_file_size {
            return Err(FileError::FileTooLarge {
                filename: filename.to_string(),
                size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }

    /// Classify an upload or explain why it is rejected.
    pub fn validate(&self, filename: &str, bytes: &[u8]) -> Result<FileKind, FileError> {
        self.check_size(filename, bytes.len())?;
        if bytes.is_empty() {
            return Err(FileError::unsupported(filename, "file is empty"));
        }
        if is_forbidden_name(filename) {
            return Err(FileError::InvalidFilename {
                filename: filename.to_string(),
            });
        }

        let claimed = kind_from_extension(filename).ok_or_else(|| {
            FileError::unsupported(
                filename,
                format!(
                    "extension '{}' is not accepted",
                    extension(filename).unwrap_or_default()
                ),
            )
        })?;

        let detected = sniff(bytes).ok_or_else(|| {
            FileError::unsupported(filename, "content matches no supported format")
        })?;

        if !same_family(claimed, detected) {
            return Err(FileError::unsupported(
                filename,
                format!("extension says {claimed} but content is {detected}"),
            ));
        }

        Ok(detected)
    }
}

/// Identify a supported format from magic bytes alone.
///
/// Signatures anchored at offset 0 are checked first. The `%PDF-` window
/// search only runs when none of them match, so text embedded in image
/// metadata cannot turn an image into a PDF.
pub fn sniff(bytes: &[u8]) -> Option<FileKind> {
    if bytes.starts_with(PDF_MAGIC) {
        return Some(FileKind::Pdf);
    }
    if is_heif(bytes) {
        return Some(FileKind::Heic);
    }
    if let Some(raster) = image::guess_format(bytes)
        .ok()
        .and_then(RasterFormat::from_image_format)
    {
        return Some(FileKind::Image(raster));
    }
    is_pdf(bytes).then_some(FileKind::Pdf)
}

fn is_pdf(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(PDF_HEADER_WINDOW)];
    window.windows(PDF_MAGIC.len()).any(|w| w == PDF_MAGIC)
}

/// ISO-BMFF: `[size:4]["ftyp"][major:4][minor:4][compatible:4 × n]`.
fn is_heif(bytes: &[u8]) -> bool {
    if bytes.len() < 16 || &bytes[4..8] != b"ftyp" {
        return false;
    }
    let box_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if box_len < 16 {
        return false;
    }
    let end = box_len.min(bytes.len());

    let major = &bytes[8..12];
    if AVIF_BRANDS.iter().any(|b| major == &b[..]) {
        return false;
    }

    let brand_matches = |brand: &[u8]| HEIF_BRANDS.iter().any(|b| brand == &b[..]);
    brand_matches(major) || bytes[16..end].chunks_exact(4).any(brand_matches)
}

fn extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn kind_from_extension(filename: &str) -> Option<FileKind> {
    let kind = match extension(filename)?.as_str() {
        "heic" | "heif" | "hif" => FileKind::Heic,
        "pdf" => FileKind::Pdf,
        "png" => FileKind::Image(RasterFormat::Png),
        "jpg" | "jpeg" => FileKind::Image(RasterFormat::Jpeg),
        "webp" => FileKind::Image(RasterFormat::WebP),
        "bmp" => FileKind::Image(RasterFormat::Bmp),
        "tif" | "tiff" => FileKind::Image(RasterFormat::Tiff),
        "gif" => FileKind::Image(RasterFormat::Gif),
        _ => return None,
    };
    Some(kind)
}

/// Extension and content must agree on the exact format.
fn same_family(claimed: FileKind, detected: FileKind) -> bool {
    claimed == detected
}

fn is_forbidden_name(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    lower.trim().is_empty() || FORBIDDEN_NAME_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use image::{DynamicImage, RgbImage};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, image::Rgb([9, 9, 9])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn jpeg_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, image::Rgb([9, 9, 9])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    fn ftyp(major: &[u8; 4], compatible: &[&[u8; 4]]) -> Vec<u8> {
        let len = 16 + 4 * compatible.len();
        let mut v = (len as u32).to_be_bytes().to_vec();
        v.extend_from_slice(b"ftyp");
        v.extend_from_slice(major);
        v.extend_from_slice(&[0, 0, 0, 0]);
        for b in compatible {
            v.extend_from_slice(&b[..]);
        }
        v.extend_from_slice(&[0u8; 32]);
        v
    }

    fn validator() -> FileValidator {
        FileValidator::new(1024 * 1024)
    }

    #[test]
    fn detects_heic_by_major_brand() {
        let bytes = ftyp(b"heic", &[b"mif1", b"heic"]);
        assert_eq!(validator().validate("IMG_0001.HEIC", &bytes), Ok(FileKind::Heic));
    }

    #[test]
    fn detects_heif_by_compatible_brand() {
        let bytes = ftyp(b"mp41", &[b"mif1"]);
        assert_eq!(validator().validate("burst.heif", &bytes), Ok(FileKind::Heic));
    }

    #[test]
    fn avif_is_not_heic() {
        let bytes = ftyp(b"avif", &[b"mif1", b"avif"]);
        let err = validator().validate("photo.heic", &bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFileType);
    }

    #[test]
    fn png_disguised_as_heic_is_rejected() {
        let err = validator().validate("holiday.heic", &png_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFileType);
    }

    #[test]
    fn jpeg_disguised_as_heic_is_rejected() {
        let err = validator().validate("holiday.heif", &jpeg_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFileType);
    }

    #[test]
    fn text_disguised_as_pdf_is_rejected() {
        let err = validator()
            .validate("invoice.pdf", b"hello, this is not a pdf")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFileType);
    }

    #[test]
    fn pdf_header_after_leading_junk_is_accepted() {
        let mut bytes = b"\xef\xbb\xbf\r\n".to_vec();
        bytes.extend_from_slice(b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n");
        assert_eq!(validator().validate("doc.pdf", &bytes), Ok(FileKind::Pdf));
    }

    /// Insert a `tEXt` chunk right after IHDR. Sniffing never checks CRCs.
    fn png_with_text(text: &str) -> Vec<u8> {
        let png = png_bytes();
        let ihdr_end = 8 + 4 + 4 + 13 + 4;
        let mut chunk = (text.len() as u32).to_be_bytes().to_vec();
        chunk.extend_from_slice(b"tEXt");
        chunk.extend_from_slice(text.as_bytes());
        chunk.extend_from_slice(&[0, 0, 0, 0]);
        let mut out = png[..ihdr_end].to_vec();
        out.extend_from_slice(&chunk);
        out.extend_from_slice(&png[ihdr_end..]);
        out
    }

    #[test]
    fn pdf_marker_inside_image_metadata_is_still_an_image() {
        let bytes = png_with_text("Comment\0exported from %PDF-1.4 viewer");
        assert_eq!(
            validator().validate("scan.png", &bytes),
            Ok(FileKind::Image(RasterFormat::Png))
        );
        // The same bytes named as a PDF disagree with their content.
        let err = validator().validate("scan.pdf", &bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFileType);
    }

    #[test]
    fn raster_images_are_classified() {
        assert_eq!(
            validator().validate("a.png", &png_bytes()),
            Ok(FileKind::Image(RasterFormat::Png))
        );
        assert_eq!(
            validator().validate("a.JPEG", &jpeg_bytes()),
            Ok(FileKind::Image(RasterFormat::Jpeg))
        );
    }

    #[test]
    fn png_named_jpg_is_rejected() {
        let err = validator().validate("a.jpg", &png_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFileType);
    }

    #[test]
    fn unknown_extension_is_rejected_even_with_valid_content() {
        let err = validator().validate("a.bin", &png_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFileType);
        let err = validator().validate("no_extension", &png_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFileType);
    }

    #[test]
    fn oversized_file_is_rejected_before_sniffing() {
        let v = FileValidator::new(8);
        // Garbage content: the size check must fire first.
        let err = v.validate("big.heic", &[0u8; 9]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileTooLarge);
    }

    #[test]
    fn empty_file_is_rejected() {
        let err = validator().validate("empty.pdf", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFileType);
    }

    #[test]
    fn traversal_names_are_rejected() {
        for name in ["../etc/passwd.pdf", "a\\b.png", "x//y.pdf", "onerror.png"] {
            let err = validator().validate(name, &png_bytes()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidFilename, "{name}");
        }
    }
}
