//! Raster handling for the tile proxy: the georeferenced image buffer, the
//! transformer (resampling, reprojection, composition) and the wire format
//! codecs (PNG, paletted PNG, JPEG, GeoTIFF, mixed).
//!
//! Images enter the system from sources or cache reads and are only modified
//! through the functions here, each of which returns a new logical image or
//! mutates a buffer it exclusively owns.

mod compose;
pub mod format;
mod image_buf;
mod quantize;
mod transform;
mod watermark;

pub use compose::{BandPick, apply_coverage_mask, apply_opacity, composite_over, merge_bands, paste, substitute_color};
pub use format::{EncodingOptions, TiffCompression, decode_image, encode_image};
pub use image_buf::GeoImage;
pub use quantize::quantize_median_cut;
pub use transform::{Resampling, extract, reproject};
pub use watermark::{draw_label, draw_watermark};
