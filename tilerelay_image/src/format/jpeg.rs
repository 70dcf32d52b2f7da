//! JPEG encoding. Alpha is flattened (JPEG cannot carry it); sources that
//! need transparency must be stored as PNG or `mixed`.

use crate::GeoImage;
use anyhow::{Context, Result};
use image::{DynamicImage, ExtendedColorType, codecs::jpeg::JpegEncoder};

pub fn encode(image: &GeoImage, quality: u8) -> Result<Vec<u8>> {
	let (w, h) = image.size();
	let rgb = DynamicImage::ImageRgba8(image.as_rgba().clone()).into_rgb8();
	let mut buffer = Vec::new();
	let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
	encoder
		.encode(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
		.context("encoding JPEG")?;
	Ok(buffer)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tilerelay_core::{MapBBox, Srs};

	#[test]
	fn higher_quality_is_larger() {
		let img = {
			let mut rgba = image::RgbaImage::new(64, 64);
			for (x, y, p) in rgba.enumerate_pixels_mut() {
				*p = image::Rgba([(x * 4) as u8, (y * 4) as u8, ((x ^ y) * 4) as u8, 255]);
			}
			GeoImage::from_rgba(
				rgba,
				MapBBox::new(0.0, 0.0, 64.0, 64.0).unwrap(),
				Srs::from_epsg(3857).unwrap(),
			)
			.unwrap()
		};
		let low = encode(&img, 30).unwrap();
		let high = encode(&img, 95).unwrap();
		assert!(high.len() > low.len());
	}
}
