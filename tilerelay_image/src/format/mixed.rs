//! The `mixed` format: PNG when any pixel has alpha below 255, JPEG
//! otherwise. Keeps opaque areas small while preserving transparency at
//! coverage edges.

use super::{EncodingOptions, jpeg, png_codec};
use crate::GeoImage;
use anyhow::Result;

pub fn encode(image: &GeoImage, options: &EncodingOptions) -> Result<(Vec<u8>, &'static str)> {
	if image.is_opaque() {
		Ok((jpeg::encode(image, options.jpeg_quality)?, "image/jpeg"))
	} else {
		Ok((png_codec::encode(image)?, "image/png"))
	}
}
