//! Pipeline stages for converting uploads to JPG.
//!
//! Each submodule implements exactly one transformation step and is
//! independently testable.
//!
//! ## Data Flow
//!
//! ```text
//! validate ──▶ heic ──┐
//! (sniff)     pdf  ──┼──▶ encode
//!             raster ┘    (JPEG)
//! ```
//!
//! 1. [`validate`] — classify bytes by content; size and filename checks come
//!    first so nothing hostile reaches a decoder
//! 2. [`heic`]     — decode the primary top-level HEIF image via libheif
//! 3. [`pdf`]      — extract embedded images (or rasterise pages) via pdfium;
//!    blocking, so callers run it in `spawn_blocking`
//! 4. [`raster`]   — decode ordinary PNG/JPEG/WebP/BMP/TIFF/GIF input
//! 5. [`encode`]   — the single JPEG encoder every converter funnels into

pub mod encode;
pub mod heic;
pub mod pdf;
pub mod raster;
pub mod validate;
