//! HEIC/HEIF decoding via libheif, re-encoded as a single JPG.
//!
//! Only top-level images are candidates. Auxiliary items (depth maps, alpha
//! planes, HDR gain maps) and thumbnails hang off a top-level handle and are
//! never decoded here.
//!
//! When a container holds several top-level images the declared primary is
//! tried first, then the remaining ones in file order; the first that decodes
//! to a non-empty frame wins.
//!
//! ## Surplus auxiliary references
//!
//! libheif refuses the whole container while parsing it when an `auxl` or
//! `thmb` item reference does not name exactly one target ("Too many
//! auxiliary image references"). Phone cameras write such files. If the
//! first read fails, [`detach_surplus_references`] renames those reference
//! entries in the `iref` box to a type libheif ignores and the read is
//! retried once. The rename is in place, so the file keeps its length and
//! every `iloc` offset stays valid. A detached auxiliary image becomes an
//! ordinary top-level image; the declared primary still comes first.
//!
//! Built without the `heic` feature every HEIC input fails with
//! `DecodeError`; validation still recognises the format.

use crate::config::Quality;
use crate::error::FileError;

/// HEIF item identifier as libheif reports it.
pub type ItemId = u32;

/// Item reference types libheif accepts with exactly one target.
const SINGLE_TARGET_REFERENCES: &[&[u8; 4]] = &[b"auxl", b"thmb"];

/// Reference type written over a detached reference. Unknown to libheif.
const DETACHED_REFERENCE: &[u8; 4] = b"xdet";

/// Decode the primary HEIC image in `bytes` and encode it as JPG.
pub fn convert(filename: &str, bytes: &[u8], quality: Quality) -> Result<Vec<u8>, FileError> {
    imp::convert(filename, bytes, quality)
}

/// Order in which top-level items are attempted.
///
/// The primary comes first when it is one of the top-level items; the rest
/// keep their container order. Duplicates are ignored.
pub fn candidate_order(primary: Option<ItemId>, top_level: &[ItemId]) -> Vec<ItemId> {
    let mut order = Vec::with_capacity(top_level.len());
    if let Some(p) = primary.filter(|p| top_level.contains(p)) {
        order.push(p);
    }
    for &id in top_level {
        if !order.contains(&id) {
            order.push(id);
        }
    }
    order
}

/// One ISO-BMFF box: `start` is the size field, `payload` follows the header.
#[derive(Debug, Clone, Copy)]
struct BoxSpan {
    kind: [u8; 4],
    start: usize,
    payload: usize,
    end: usize,
}

/// Boxes laid end to end in `data[start..end]`, or `None` if any is malformed.
fn child_boxes(data: &[u8], start: usize, end: usize) -> Option<Vec<BoxSpan>> {
    let mut boxes = Vec::new();
    let mut pos = start;
    while pos + 8 <= end {
        let size = u32::from_be_bytes(data.get(pos..pos + 4)?.try_into().ok()?);
        let kind: [u8; 4] = data.get(pos + 4..pos + 8)?.try_into().ok()?;
        let (header, len) = match size {
            0 => (8, end - pos),
            1 => {
                let large = u64::from_be_bytes(data.get(pos + 8..pos + 16)?.try_into().ok()?);
                (16, usize::try_from(large).ok()?)
            }
            n => (8, n as usize),
        };
        if len < header || pos.checked_add(len)? > end {
            return None;
        }
        boxes.push(BoxSpan {
            kind,
            start: pos,
            payload: pos + header,
            end: pos + len,
        });
        pos += len;
    }
    Some(boxes)
}

fn find_box(boxes: Vec<BoxSpan>, kind: &[u8; 4]) -> Option<BoxSpan> {
    boxes.into_iter().find(|b| &b.kind == kind)
}

/// Rewrite `auxl`/`thmb` references that do not have exactly one target.
///
/// Returns the patched container, or `None` when there is nothing to detach
/// or the box structure cannot be walked. Only the 4-byte type of each
/// offending reference changes.
pub fn detach_surplus_references(bytes: &[u8]) -> Option<Vec<u8>> {
    let meta = find_box(child_boxes(bytes, 0, bytes.len())?, b"meta")?;
    // `meta` and `iref` are full boxes: version and flags come first.
    let iref = find_box(child_boxes(bytes, meta.payload + 4, meta.end)?, b"iref")?;
    let id_len = if *bytes.get(iref.payload)? == 0 { 2 } else { 4 };

    let mut patched: Option<Vec<u8>> = None;
    for reference in child_boxes(bytes, iref.payload + 4, iref.end)? {
        if !SINGLE_TARGET_REFERENCES.iter().any(|t| **t == reference.kind) {
            continue;
        }
        let count_at = reference.payload + id_len;
        let count = u16::from_be_bytes(bytes.get(count_at..count_at + 2)?.try_into().ok()?);
        if count == 1 {
            continue;
        }
        let out = patched.get_or_insert_with(|| bytes.to_vec());
        out[reference.start + 4..reference.start + 8].copy_from_slice(DETACHED_REFERENCE);
    }
    patched
}

#[cfg(feature = "heic")]
mod imp {
    use super::{candidate_order, detach_surplus_references, ItemId};
    use crate::config::Quality;
    use crate::error::FileError;
    use crate::pipeline::encode::encode_jpeg;
    use image::{DynamicImage, RgbImage};
    use libheif_rs::{ColorSpace, HeifContext, ImageHandle, LibHeif, RgbChroma};
    use tracing::{debug, warn};

    pub(super) fn convert(
        filename: &str,
        bytes: &[u8],
        quality: Quality,
    ) -> Result<Vec<u8>, FileError> {
        let lib = LibHeif::new();
        let unreadable =
            |e: String| FileError::decode(filename, format!("unreadable HEIF container: {e}"));

        let repaired: Vec<u8>;
        let ctx = match HeifContext::read_from_bytes(bytes) {
            Ok(ctx) => ctx,
            Err(first) => {
                repaired = detach_surplus_references(bytes)
                    .ok_or_else(|| unreadable(first.to_string()))?;
                warn!(
                    "{}: {}; retrying with surplus auxiliary references detached",
                    filename, first
                );
                HeifContext::read_from_bytes(&repaired).map_err(|e| unreadable(e.to_string()))?
            }
        };

        let mut ids: Vec<ItemId> = vec![0; ctx.number_of_top_level_images()];
        let n = ctx.top_level_image_ids(&mut ids);
        ids.truncate(n);

        let primary = ctx.primary_image_handle().ok().map(|h| h.item_id());
        let order = candidate_order(primary, &ids);
        debug!(
            "{}: {} top-level image(s), primary={:?}",
            filename,
            order.len(),
            primary
        );

        let mut last_err = String::from("container has no top-level images");
        for id in order {
            let handle = match ctx.image_handle(id) {
                Ok(h) => h,
                Err(e) => {
                    warn!("{}: item {} has no usable handle: {}", filename, id, e);
                    last_err = e.to_string();
                    continue;
                }
            };
            match decode_handle(&lib, &handle) {
                Ok(frame) => {
                    debug!(
                        "{}: decoded item {} ({}x{})",
                        filename,
                        id,
                        frame.width(),
                        frame.height()
                    );
                    return encode_jpeg(&DynamicImage::ImageRgb8(frame), quality)
                        .map_err(|e| FileError::encode(filename, e));
                }
                Err(e) => {
                    warn!("{}: item {} failed to decode: {}", filename, id, e);
                    last_err = e;
                }
            }
        }

        Err(FileError::decode(filename, last_err))
    }

    fn decode_handle(lib: &LibHeif, handle: &ImageHandle) -> Result<RgbImage, String> {
        let image = lib
            .decode(handle, ColorSpace::Rgb(RgbChroma::Rgb), None)
            .map_err(|e| e.to_string())?;
        let planes = image.planes();
        let plane = planes
            .interleaved
            .ok_or_else(|| "decoded image has no interleaved RGB plane".to_string())?;

        let (width, height, stride) = (plane.width, plane.height, plane.stride);
        if width == 0 || height == 0 {
            return Err("decoded image is empty".into());
        }

        let row_len = width as usize * 3;
        if stride < row_len {
            return Err(format!("stride {stride} shorter than row of {row_len} bytes"));
        }
        let mut pixels = Vec::with_capacity(row_len * height as usize);
        for row in plane.data.chunks(stride).take(height as usize) {
            let row = row
                .get(..row_len)
                .ok_or_else(|| "decoded plane shorter than its stride".to_string())?;
            pixels.extend_from_slice(row);
        }

        RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| "decoded plane has fewer rows than its height".to_string())
    }
}

#[cfg(not(feature = "heic"))]
mod imp {
    use crate::config::Quality;
    use crate::error::FileError;

    pub(super) fn convert(
        filename: &str,
        _bytes: &[u8],
        _quality: Quality,
    ) -> Result<Vec<u8>, FileError> {
        Err(FileError::decode(
            filename,
            "HEIC support was not compiled in (enable the `heic` feature)",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bmff(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut v = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        v.extend_from_slice(kind);
        v.extend_from_slice(payload);
        v
    }

    fn full(kind: &[u8; 4], version: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![version, 0, 0, 0];
        body.extend_from_slice(payload);
        bmff(kind, &body)
    }

    /// Version-0 reference entry: 16-bit item ids.
    fn reference(kind: &[u8; 4], from: u16, to: &[u16]) -> Vec<u8> {
        let mut body = from.to_be_bytes().to_vec();
        body.extend_from_slice(&(to.len() as u16).to_be_bytes());
        for id in to {
            body.extend_from_slice(&id.to_be_bytes());
        }
        bmff(kind, &body)
    }

    fn container(iref: Vec<u8>) -> Vec<u8> {
        let mut out = bmff(b"ftyp", b"mif1\0\0\0\0mif1heic");
        let mut meta = full(b"hdlr", 0, b"\0\0\0\0pict\0\0\0\0\0\0\0\0\0\0\0\0\0");
        meta.extend_from_slice(&full(b"pitm", 0, &1u16.to_be_bytes()));
        meta.extend_from_slice(&iref);
        out.extend_from_slice(&full(b"meta", 0, &meta));
        out.extend_from_slice(&bmff(b"mdat", &[0xAA; 16]));
        out
    }

    fn changed_offsets(a: &[u8], b: &[u8]) -> Vec<usize> {
        a.iter()
            .zip(b)
            .enumerate()
            .filter(|(_, (x, y))| x != y)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn surplus_auxiliary_reference_is_detached_in_place() {
        let mut refs = reference(b"auxl", 2, &[1, 1]);
        refs.extend_from_slice(&reference(b"thmb", 3, &[1]));
        refs.extend_from_slice(&reference(b"cdsc", 4, &[1, 2]));
        let original = container(full(b"iref", 0, &refs));

        let patched = detach_surplus_references(&original).expect("auxl must be detached");
        assert_eq!(patched.len(), original.len());
        assert_eq!(changed_offsets(&original, &patched).len(), 4);

        let at = patched
            .windows(4)
            .position(|w| w == DETACHED_REFERENCE)
            .unwrap();
        assert_eq!(&original[at..at + 4], b"auxl");
        // Single-target thumbnail and multi-target descriptions are untouched.
        assert!(patched.windows(4).any(|w| w == b"thmb"));
        assert!(patched.windows(4).any(|w| w == b"cdsc"));
    }

    #[test]
    fn thumbnail_without_target_is_detached() {
        let original = container(full(b"iref", 0, &reference(b"thmb", 5, &[])));
        let patched = detach_surplus_references(&original).unwrap();
        assert!(!patched.windows(4).any(|w| w == b"thmb"));
    }

    #[test]
    fn well_formed_references_need_no_repair() {
        let mut refs = reference(b"auxl", 2, &[1]);
        refs.extend_from_slice(&reference(b"thmb", 3, &[1]));
        assert_eq!(detach_surplus_references(&container(full(b"iref", 0, &refs))), None);
    }

    #[test]
    fn wide_item_ids_are_handled() {
        let mut body = 2u32.to_be_bytes().to_vec();
        body.extend_from_slice(&3u16.to_be_bytes());
        for _ in 0..3 {
            body.extend_from_slice(&1u32.to_be_bytes());
        }
        let original = container(full(b"iref", 1, &bmff(b"auxl", &body)));
        let patched = detach_surplus_references(&original).unwrap();
        assert_eq!(changed_offsets(&original, &patched).len(), 4);
    }

    #[test]
    fn containers_without_references_or_garbage_are_left_alone() {
        let mut no_iref = bmff(b"ftyp", b"heic\0\0\0\0mif1");
        no_iref.extend_from_slice(&full(b"meta", 0, &full(b"pitm", 0, &1u16.to_be_bytes())));
        assert_eq!(detach_surplus_references(&no_iref), None);
        assert_eq!(detach_surplus_references(b"not a heif file at all"), None);

        // Declared box size runs past the end of the data.
        let mut truncated = container(full(b"iref", 0, &reference(b"auxl", 2, &[1, 1])));
        truncated.truncate(40);
        assert_eq!(detach_surplus_references(&truncated), None);
    }
    use crate::error::ErrorKind;

    #[test]
    fn primary_is_tried_first() {
        assert_eq!(candidate_order(Some(7), &[3, 5, 7, 9]), vec![7, 3, 5, 9]);
    }

    #[test]
    fn file_order_without_primary() {
        assert_eq!(candidate_order(None, &[4, 2, 8]), vec![4, 2, 8]);
    }

    #[test]
    fn primary_outside_top_level_is_ignored() {
        // A primary that points at an auxiliary item is never decoded.
        assert_eq!(candidate_order(Some(99), &[1, 2]), vec![1, 2]);
    }

    #[test]
    fn duplicate_ids_are_attempted_once() {
        assert_eq!(candidate_order(Some(2), &[1, 2, 2, 1]), vec![2, 1]);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = convert("broken.heic", b"\0\0\0\x18ftypheic\0\0\0\0mif1heic", Quality::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeError);
    }
}
