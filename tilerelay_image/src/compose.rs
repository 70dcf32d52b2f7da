//! Image composition: alpha blending, opacity, color keying, coverage masks
//! and band merging.

use crate::GeoImage;
use anyhow::{Result, ensure};
use image::{Rgba, RgbaImage};

/// Source-over compositing of `overlay` onto `base`.
///
/// Real alpha math, not a paste: partially transparent overlay pixels blend
/// with the base instead of replacing it. Both images must cover the same
/// bbox at the same size.
pub fn composite_over(base: &mut GeoImage, overlay: &GeoImage) -> Result<()> {
	ensure!(
		base.size() == overlay.size(),
		"cannot composite {:?} onto {:?}",
		overlay.size(),
		base.size()
	);
	ensure!(
		base.bbox() == overlay.bbox(),
		"cannot composite images with different georeferences"
	);
	for (dst, src) in base.as_rgba_mut().pixels_mut().zip(overlay.as_rgba().pixels()) {
		*dst = blend(*dst, *src);
	}
	Ok(())
}

fn blend(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
	let sa = f64::from(src.0[3]) / 255.0;
	if sa >= 1.0 {
		return src;
	}
	if sa <= 0.0 {
		return dst;
	}
	let da = f64::from(dst.0[3]) / 255.0;
	let out_a = sa + da * (1.0 - sa);
	let mut out = [0u8; 4];
	for c in 0..3 {
		let sc = f64::from(src.0[c]);
		let dc = f64::from(dst.0[c]);
		out[c] = ((sc * sa + dc * da * (1.0 - sa)) / out_a).round().clamp(0.0, 255.0) as u8;
	}
	out[3] = (out_a * 255.0).round() as u8;
	Rgba(out)
}

/// Scales the alpha channel by `opacity` (0.0..=1.0).
pub fn apply_opacity(image: &mut GeoImage, opacity: f64) {
	let opacity = opacity.clamp(0.0, 1.0);
	for pixel in image.as_rgba_mut().pixels_mut() {
		pixel.0[3] = (f64::from(pixel.0[3]) * opacity).round() as u8;
	}
}

/// Replaces every pixel matching `color` (RGB, ignoring alpha) with full
/// transparency. Used for sources that cannot produce real alpha.
pub fn substitute_color(image: &mut GeoImage, color: [u8; 3]) {
	for pixel in image.as_rgba_mut().pixels_mut() {
		if pixel.0[0] == color[0] && pixel.0[1] == color[1] && pixel.0[2] == color[2] {
			pixel.0 = [0, 0, 0, 0];
		}
	}
}

/// Applies a coverage mask (row-major, 0 or 255 per pixel, as produced by
/// `Coverage::mask`): pixels outside the coverage become fully transparent.
pub fn apply_coverage_mask(image: &mut GeoImage, mask: &[u8]) -> Result<()> {
	let (w, h) = image.size();
	ensure!(
		mask.len() == (w as usize) * (h as usize),
		"mask size {} does not match image {}x{}",
		mask.len(),
		w,
		h
	);
	for (pixel, m) in image.as_rgba_mut().pixels_mut().zip(mask.iter()) {
		if *m == 0 {
			pixel.0 = [0, 0, 0, 0];
		}
	}
	Ok(())
}

/// Copies `tile` into `canvas` at pixel position `(x, y)`, replacing pixels
/// (no blending). Used for mosaic assembly of already-composed tiles.
pub fn paste(canvas: &mut GeoImage, tile: &GeoImage, x: i64, y: i64) {
	image::imageops::replace(canvas.as_rgba_mut(), tile.as_rgba(), x, y);
}

/// One output channel assignment for [`merge_bands`]: take channel
/// `source_band` of source image `source` and write it to channel
/// `target_band` of the result.
#[derive(Debug, Clone, Copy)]
pub struct BandPick {
	pub source: usize,
	pub source_band: usize,
	pub target_band: usize,
}

/// Synthesizes an image by picking channels from several equally sized
/// sources. Unassigned color channels stay 0; an unassigned alpha channel
/// stays fully opaque.
pub fn merge_bands(sources: &[GeoImage], picks: &[BandPick]) -> Result<GeoImage> {
	ensure!(!sources.is_empty(), "band merge needs at least one source");
	let first = &sources[0];
	let (w, h) = first.size();
	for source in sources {
		ensure!(source.size() == (w, h), "band merge sources must have equal size");
	}
	for pick in picks {
		ensure!(pick.source < sources.len(), "band pick references source {}", pick.source);
		ensure!(
			pick.source_band < 4 && pick.target_band < 4,
			"band index out of range"
		);
	}

	let mut out = RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 255]));
	for pick in picks {
		let src = sources[pick.source].as_rgba();
		for (dst, s) in out.pixels_mut().zip(src.pixels()) {
			dst.0[pick.target_band] = s.0[pick.source_band];
		}
	}
	GeoImage::from_rgba(out, *first.bbox(), first.srs().clone())
}
