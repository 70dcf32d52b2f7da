//! Wire format encoding and decoding.
//!
//! One file per codec; this module dispatches on [`TileFormat`] and carries
//! the shared [`EncodingOptions`].

mod jpeg;
mod mixed;
mod png_codec;
mod tiff_codec;

use crate::GeoImage;
use anyhow::{Context, Result};
use tilerelay_core::{ImageError, MapBBox, Srs, TileFormat};

pub use tiff_codec::TiffCompression;

/// Knobs for the encoders; defaults match common proxy setups.
#[derive(Debug, Clone)]
pub struct EncodingOptions {
	pub jpeg_quality: u8,
	/// Palette size for 8-bit PNG output.
	pub png_colors: usize,
	pub tiff_compression: TiffCompression,
}

impl Default for EncodingOptions {
	fn default() -> EncodingOptions {
		EncodingOptions {
			jpeg_quality: 90,
			png_colors: 256,
			tiff_compression: TiffCompression::Uncompressed,
		}
	}
}

/// Encodes an image for the wire, returning the bytes and their content type.
///
/// For [`TileFormat::Mixed`] the content type depends on the pixel data: PNG
/// when any alpha is below 255, JPEG otherwise.
pub fn encode_image(image: &GeoImage, format: TileFormat, options: &EncodingOptions) -> Result<(Vec<u8>, &'static str)> {
	Ok(match format {
		TileFormat::Png => (png_codec::encode(image)?, "image/png"),
		TileFormat::Png8 => (png_codec::encode_paletted(image, options.png_colors)?, "image/png"),
		TileFormat::Jpeg => (jpeg::encode(image, options.jpeg_quality)?, "image/jpeg"),
		TileFormat::Tiff => (tiff_codec::encode(image, options.tiff_compression)?, "image/tiff"),
		TileFormat::Mixed => mixed::encode(image, options)?,
	})
}

/// Decodes tile bytes (PNG, JPEG or TIFF, sniffed from the data) into a
/// georeferenced image.
pub fn decode_image(bytes: &[u8], bbox: MapBBox, srs: Srs) -> Result<GeoImage> {
	let image = image::load_from_memory(bytes)
		.map_err(|e| ImageError(format!("decoding {} bytes failed: {e}", bytes.len())))
		.context("decoding tile")?;
	GeoImage::new(image, bbox, srs)
}
