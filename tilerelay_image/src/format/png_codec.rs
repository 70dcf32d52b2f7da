//! PNG encoding: 24/32-bit via the `image` codec, 8-bit paletted via the
//! `png` crate directly (the `image` encoder cannot write indexed data).

use crate::{GeoImage, quantize::quantize_median_cut};
use anyhow::{Context, Result};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, codecs::png::PngEncoder};
use std::borrow::Cow;

/// Encodes as RGB or RGBA PNG. A fully opaque image drops its alpha channel
/// to save bytes.
pub fn encode(image: &GeoImage) -> Result<Vec<u8>> {
	let mut buffer = Vec::new();
	let encoder = PngEncoder::new(&mut buffer);
	let (w, h) = image.size();
	if image.is_opaque() {
		let rgb = DynamicImage::ImageRgba8(image.as_rgba().clone()).into_rgb8();
		encoder
			.write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
			.context("encoding RGB PNG")?;
	} else {
		encoder
			.write_image(image.as_rgba().as_raw(), w, h, ExtendedColorType::Rgba8)
			.context("encoding RGBA PNG")?;
	}
	Ok(buffer)
}

/// Encodes as 8-bit paletted PNG with at most `max_colors` entries. One
/// palette index is reserved for transparency when the image is not opaque.
pub fn encode_paletted(image: &GeoImage, max_colors: usize) -> Result<Vec<u8>> {
	let with_transparency = !image.is_opaque();
	let quantized = quantize_median_cut(image.as_rgba(), max_colors, with_transparency);

	let palette: Vec<u8> = quantized.palette.iter().flat_map(|c| [c[0], c[1], c[2]]).collect();
	let trns: Vec<u8> = quantized.palette.iter().map(|c| c[3]).collect();

	let (w, h) = image.size();
	let mut buffer = Vec::new();
	{
		let mut encoder = png::Encoder::new(&mut buffer, w, h);
		encoder.set_color(png::ColorType::Indexed);
		encoder.set_depth(png::BitDepth::Eight);
		encoder.set_palette(Cow::Owned(palette));
		if with_transparency {
			encoder.set_trns(Cow::Owned(trns));
		}
		let mut writer = encoder.write_header().context("writing PNG header")?;
		writer
			.write_image_data(&quantized.indices)
			.context("writing paletted PNG data")?;
	}
	Ok(buffer)
}
