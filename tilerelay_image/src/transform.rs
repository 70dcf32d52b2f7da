//! Resampling, rescaling and reprojection.
//!
//! Same-SRS work (crop + scale) goes through `fast_image_resize`; reprojection
//! inverse-maps destination pixels through the SRS transform over a subdivided
//! mesh, interpolating source positions between mesh nodes and sampling with
//! the requested kernel.

use crate::GeoImage;
use anyhow::{Result, ensure};
use fast_image_resize::{FilterType, ResizeAlg, ResizeOptions, Resizer};
use image::{DynamicImage, Rgba, RgbaImage};
use tilerelay_core::{MapBBox, Srs};

/// Pixel distance between reprojection mesh nodes.
const MESH_STEP: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampling {
	/// Required for paletted data so indices survive.
	Nearest,
	Bilinear,
	#[default]
	Bicubic,
}

impl Resampling {
	pub fn from_str(value: &str) -> Result<Resampling> {
		Ok(match value.trim().to_ascii_lowercase().as_str() {
			"nearest" => Resampling::Nearest,
			"bilinear" => Resampling::Bilinear,
			"bicubic" => Resampling::Bicubic,
			_ => anyhow::bail!("unknown resampling method '{value}'"),
		})
	}

	fn resize_alg(self) -> ResizeAlg {
		match self {
			Resampling::Nearest => ResizeAlg::Nearest,
			Resampling::Bilinear => ResizeAlg::Convolution(FilterType::Bilinear),
			Resampling::Bicubic => ResizeAlg::Convolution(FilterType::CatmullRom),
		}
	}
}

pub(crate) fn scale_rgba(src: &RgbaImage, dst_size: (u32, u32), resampling: Resampling) -> Result<RgbaImage> {
	if src.dimensions() == dst_size {
		return Ok(src.clone());
	}
	let src_dyn = DynamicImage::ImageRgba8(src.clone());
	let mut dst_dyn = DynamicImage::new_rgba8(dst_size.0, dst_size.1);
	let mut resizer = Resizer::new();
	resizer.resize(
		&src_dyn,
		&mut dst_dyn,
		&ResizeOptions::new().resize_alg(resampling.resize_alg()),
	)?;
	Ok(dst_dyn.into_rgba8())
}

/// Renders `dst_bbox` at `dst_size` from `src` (same SRS). Areas outside the
/// source stay transparent.
pub fn extract(src: &GeoImage, dst_bbox: &MapBBox, dst_size: (u32, u32), resampling: Resampling) -> Result<GeoImage> {
	let mut canvas = GeoImage::blank(dst_size, [0, 0, 0, 0], *dst_bbox, src.srs().clone())?;
	let Some(overlap) = src.bbox().intersection(dst_bbox) else {
		return Ok(canvas);
	};

	let (sw, sh) = src.size();
	let src_px_w = src.bbox().width() / f64::from(sw);
	let src_px_h = src.bbox().height() / f64::from(sh);
	let dst_px_w = dst_bbox.width() / f64::from(dst_size.0);
	let dst_px_h = dst_bbox.height() / f64::from(dst_size.1);

	let sx0 = (((overlap.x_min - src.bbox().x_min) / src_px_w).floor() as u32).min(sw - 1);
	let sy0 = (((src.bbox().y_max - overlap.y_max) / src_px_h).floor() as u32).min(sh - 1);
	let sx1 = (((overlap.x_max - src.bbox().x_min) / src_px_w).ceil() as u32).clamp(sx0 + 1, sw);
	let sy1 = (((src.bbox().y_max - overlap.y_min) / src_px_h).ceil() as u32).clamp(sy0 + 1, sh);

	let dx0 = ((overlap.x_min - dst_bbox.x_min) / dst_px_w).round() as i64;
	let dy0 = ((dst_bbox.y_max - overlap.y_max) / dst_px_h).round() as i64;
	let dw = ((overlap.width() / dst_px_w).round() as u32).max(1);
	let dh = ((overlap.height() / dst_px_h).round() as u32).max(1);

	let cropped = image::imageops::crop_imm(src.as_rgba(), sx0, sy0, sx1 - sx0, sy1 - sy0).to_image();
	let resized = scale_rgba(&cropped, (dw, dh), resampling)?;
	image::imageops::replace(canvas.as_rgba_mut(), &resized, dx0, dy0);
	Ok(canvas)
}

fn catmull_rom(t: f64, p0: f64, p1: f64, p2: f64, p3: f64) -> f64 {
	0.5 * ((2.0 * p1) + (-p0 + p2) * t + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t * t
		+ (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t * t * t)
}

fn sample_nearest(img: &RgbaImage, fx: f64, fy: f64) -> Rgba<u8> {
	let (w, h) = img.dimensions();
	let x = fx.floor();
	let y = fy.floor();
	if x < 0.0 || y < 0.0 || x >= f64::from(w) || y >= f64::from(h) {
		return Rgba([0, 0, 0, 0]);
	}
	*img.get_pixel(x as u32, y as u32)
}

fn sample_bilinear(img: &RgbaImage, fx: f64, fy: f64) -> Rgba<u8> {
	let (w, h) = img.dimensions();
	if fx < 0.0 || fy < 0.0 || fx >= f64::from(w) || fy >= f64::from(h) {
		return Rgba([0, 0, 0, 0]);
	}
	let x = (fx - 0.5).max(0.0);
	let y = (fy - 0.5).max(0.0);
	let x0 = x.floor() as u32;
	let y0 = y.floor() as u32;
	let x1 = (x0 + 1).min(w - 1);
	let y1 = (y0 + 1).min(h - 1);
	let tx = x - x.floor();
	let ty = y - y.floor();
	let mut out = [0u8; 4];
	for c in 0..4 {
		let p00 = f64::from(img.get_pixel(x0, y0).0[c]);
		let p10 = f64::from(img.get_pixel(x1, y0).0[c]);
		let p01 = f64::from(img.get_pixel(x0, y1).0[c]);
		let p11 = f64::from(img.get_pixel(x1, y1).0[c]);
		let v = p00 * (1.0 - tx) * (1.0 - ty) + p10 * tx * (1.0 - ty) + p01 * (1.0 - tx) * ty + p11 * tx * ty;
		out[c] = v.round().clamp(0.0, 255.0) as u8;
	}
	Rgba(out)
}

fn sample_bicubic(img: &RgbaImage, fx: f64, fy: f64) -> Rgba<u8> {
	let (w, h) = img.dimensions();
	if fx < 0.0 || fy < 0.0 || fx >= f64::from(w) || fy >= f64::from(h) {
		return Rgba([0, 0, 0, 0]);
	}
	let x = fx - 0.5;
	let y = fy - 0.5;
	let x1 = x.floor() as i64;
	let y1 = y.floor() as i64;
	let tx = x - x.floor();
	let ty = y - y.floor();
	let pick = |px: i64, py: i64| -> [f64; 4] {
		let cx = px.clamp(0, i64::from(w) - 1) as u32;
		let cy = py.clamp(0, i64::from(h) - 1) as u32;
		let p = img.get_pixel(cx, cy).0;
		[f64::from(p[0]), f64::from(p[1]), f64::from(p[2]), f64::from(p[3])]
	};
	let mut out = [0u8; 4];
	for c in 0..4 {
		let mut rows = [0.0; 4];
		for (i, row) in rows.iter_mut().enumerate() {
			let py = y1 - 1 + i as i64;
			*row = catmull_rom(
				tx,
				pick(x1 - 1, py)[c],
				pick(x1, py)[c],
				pick(x1 + 1, py)[c],
				pick(x1 + 2, py)[c],
			);
		}
		let v = catmull_rom(ty, rows[0], rows[1], rows[2], rows[3]);
		out[c] = v.round().clamp(0.0, 255.0) as u8;
	}
	Rgba(out)
}

/// Renders `dst_bbox` (in `dst_srs`) at `dst_size` from a source in another
/// SRS.
///
/// Destination pixel centers are inverse-mapped into source pixel space over
/// a mesh of [`MESH_STEP`]-pixel cells; positions between nodes are bilinearly
/// interpolated, which keeps the transform-per-pixel cost negligible while
/// staying well under a pixel of error at tile sizes.
pub fn reproject(
	src: &GeoImage,
	dst_bbox: &MapBBox,
	dst_srs: &Srs,
	dst_size: (u32, u32),
	resampling: Resampling,
) -> Result<GeoImage> {
	if src.srs().is_same(dst_srs) {
		return extract(src, dst_bbox, dst_size, resampling);
	}
	ensure!(dst_size.0 > 0 && dst_size.1 > 0, "target size must not be empty");

	let (sw, sh) = src.size();
	let src_px_w = src.bbox().width() / f64::from(sw);
	let src_px_h = src.bbox().height() / f64::from(sh);
	let dst_px_w = dst_bbox.width() / f64::from(dst_size.0);
	let dst_px_h = dst_bbox.height() / f64::from(dst_size.1);

	// source pixel position of a destination pixel center
	let map_px = |dx: f64, dy: f64| -> (f64, f64) {
		let map_x = dst_bbox.x_min + dx * dst_px_w;
		let map_y = dst_bbox.y_max - dy * dst_px_h;
		let (sx, sy) = dst_srs.transform_point(src.srs(), map_x, map_y);
		(
			(sx - src.bbox().x_min) / src_px_w,
			(src.bbox().y_max - sy) / src_px_h,
		)
	};

	// mesh of exact source positions; nodes keep their regular spacing even
	// past the image edge, the interpolation below relies on it
	let cols = dst_size.0.div_ceil(MESH_STEP) as usize;
	let rows = dst_size.1.div_ceil(MESH_STEP) as usize;
	let mut mesh = vec![(0.0f64, 0.0f64); (cols + 1) * (rows + 1)];
	for j in 0..=rows {
		for i in 0..=cols {
			let dx = f64::from(MESH_STEP) * i as f64;
			let dy = f64::from(MESH_STEP) * j as f64;
			mesh[j * (cols + 1) + i] = map_px(dx + 0.5, dy + 0.5);
		}
	}

	let sample = match resampling {
		Resampling::Nearest => sample_nearest,
		Resampling::Bilinear => sample_bilinear,
		Resampling::Bicubic => sample_bicubic,
	};

	let mut out = RgbaImage::new(dst_size.0, dst_size.1);
	let src_img = src.as_rgba();
	for y in 0..dst_size.1 {
		let j = (y / MESH_STEP) as usize;
		let ty = f64::from(y % MESH_STEP) / f64::from(MESH_STEP);
		for x in 0..dst_size.0 {
			let i = (x / MESH_STEP) as usize;
			let tx = f64::from(x % MESH_STEP) / f64::from(MESH_STEP);
			let p00 = mesh[j * (cols + 1) + i];
			let p10 = mesh[j * (cols + 1) + i + 1];
			let p01 = mesh[(j + 1) * (cols + 1) + i];
			let p11 = mesh[(j + 1) * (cols + 1) + i + 1];
			let fx = p00.0 * (1.0 - tx) * (1.0 - ty) + p10.0 * tx * (1.0 - ty) + p01.0 * (1.0 - tx) * ty + p11.0 * tx * ty;
			let fy = p00.1 * (1.0 - tx) * (1.0 - ty) + p10.1 * tx * (1.0 - ty) + p01.1 * (1.0 - tx) * ty + p11.1 * tx * ty;
			out.put_pixel(x, y, sample(src_img, fx, fy));
		}
	}
	GeoImage::from_rgba(out, *dst_bbox, dst_srs.clone())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn merc() -> Srs {
		Srs::from_epsg(3857).unwrap()
	}

	fn geo() -> Srs {
		Srs::from_epsg(4326).unwrap()
	}

	fn checker(size: u32, bbox: MapBBox) -> GeoImage {
		let mut img = RgbaImage::new(size, size);
		for y in 0..size {
			for x in 0..size {
				let on = ((x / 8) + (y / 8)) % 2 == 0;
				img.put_pixel(x, y, if on { Rgba([255, 255, 255, 255]) } else { Rgba([0, 0, 0, 255]) });
			}
		}
		GeoImage::from_rgba(img, bbox, merc()).unwrap()
	}

	#[test]
	fn extract_identity() {
		let bbox = MapBBox::new(0.0, 0.0, 256.0, 256.0).unwrap();
		let src = checker(64, bbox);
		let out = extract(&src, &bbox, (64, 64), Resampling::Nearest).unwrap();
		assert_eq!(out.as_rgba().as_raw(), src.as_rgba().as_raw());
	}

	#[test]
	fn extract_pads_outside_with_transparency() {
		let bbox = MapBBox::new(0.0, 0.0, 100.0, 100.0).unwrap();
		let src = GeoImage::blank((10, 10), [10, 20, 30, 255], bbox, merc()).unwrap();
		let wider = MapBBox::new(-100.0, 0.0, 100.0, 100.0).unwrap();
		let out = extract(&src, &wider, (20, 10), Resampling::Nearest).unwrap();
		// left half outside the source
		assert_eq!(out.as_rgba().get_pixel(2, 5).0, [0, 0, 0, 0]);
		assert_eq!(out.as_rgba().get_pixel(15, 5).0, [10, 20, 30, 255]);
	}

	#[test]
	fn extract_scales_up() {
		let bbox = MapBBox::new(0.0, 0.0, 100.0, 100.0).unwrap();
		let src = GeoImage::blank((10, 10), [9, 9, 9, 255], bbox, merc()).unwrap();
		let out = extract(&src, &bbox, (40, 40), Resampling::Bilinear).unwrap();
		assert_eq!(out.size(), (40, 40));
		assert_eq!(out.single_color(), Some([9, 9, 9, 255]));
	}

	#[test]
	fn reproject_same_srs_falls_back_to_extract() {
		let bbox = MapBBox::new(0.0, 0.0, 256.0, 256.0).unwrap();
		let src = checker(32, bbox);
		let out = reproject(&src, &bbox, &merc(), (32, 32), Resampling::Nearest).unwrap();
		assert_eq!(out.as_rgba().as_raw(), src.as_rgba().as_raw());
	}

	#[test]
	fn reproject_mercator_to_geographic_keeps_solid_color() {
		let extent = 20_037_508.342789244;
		let bbox = MapBBox::new(-extent, -extent, extent, extent).unwrap();
		let src = GeoImage::blank((64, 64), [50, 100, 150, 255], bbox, merc()).unwrap();
		let dst_bbox = MapBBox::new(-180.0, -85.0, 180.0, 85.0).unwrap();
		let out = reproject(&src, &dst_bbox, &geo(), (64, 32), Resampling::Bicubic).unwrap();
		assert_eq!(out.size(), (64, 32));
		assert_eq!(out.single_color(), Some([50, 100, 150, 255]));
	}

	#[test]
	fn reproject_outside_source_is_transparent() {
		let bbox = MapBBox::new(0.0, 0.0, 10_000.0, 10_000.0).unwrap();
		let src = GeoImage::blank((16, 16), [1, 2, 3, 255], bbox, merc()).unwrap();
		// far away in geographic coordinates
		let dst_bbox = MapBBox::new(100.0, 10.0, 110.0, 20.0).unwrap();
		let out = reproject(&src, &dst_bbox, &geo(), (16, 16), Resampling::Nearest).unwrap();
		assert!(out.is_transparent());
	}
}
