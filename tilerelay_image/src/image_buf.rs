//! The georeferenced image buffer.

use anyhow::{Result, ensure};
use image::{DynamicImage, Rgba, RgbaImage};
use tilerelay_core::{MapBBox, Srs};

/// A raster with a georeference.
///
/// Pixels are kept as RGBA8 internally; paletted and grayscale data is
/// expanded on decode and only reduced again at encode time. Row 0 is the
/// northern edge of `bbox`.
#[derive(Debug, Clone)]
pub struct GeoImage {
	image: RgbaImage,
	bbox: MapBBox,
	srs: Srs,
}

impl GeoImage {
	pub fn new(image: DynamicImage, bbox: MapBBox, srs: Srs) -> Result<GeoImage> {
		ensure!(image.width() > 0 && image.height() > 0, "image must not be empty");
		Ok(GeoImage {
			image: image.into_rgba8(),
			bbox,
			srs,
		})
	}

	pub fn from_rgba(image: RgbaImage, bbox: MapBBox, srs: Srs) -> Result<GeoImage> {
		ensure!(image.width() > 0 && image.height() > 0, "image must not be empty");
		Ok(GeoImage { image, bbox, srs })
	}

	/// A uniformly colored image; `[0, 0, 0, 0]` for a fully transparent one.
	pub fn blank(size: (u32, u32), color: [u8; 4], bbox: MapBBox, srs: Srs) -> Result<GeoImage> {
		ensure!(size.0 > 0 && size.1 > 0, "image must not be empty");
		Ok(GeoImage {
			image: RgbaImage::from_pixel(size.0, size.1, Rgba(color)),
			bbox,
			srs,
		})
	}

	pub fn size(&self) -> (u32, u32) {
		(self.image.width(), self.image.height())
	}

	pub fn bbox(&self) -> &MapBBox {
		&self.bbox
	}

	pub fn srs(&self) -> &Srs {
		&self.srs
	}

	pub fn as_rgba(&self) -> &RgbaImage {
		&self.image
	}

	pub fn as_rgba_mut(&mut self) -> &mut RgbaImage {
		&mut self.image
	}

	pub fn into_rgba(self) -> RgbaImage {
		self.image
	}

	/// Map units per pixel.
	pub fn resolution(&self) -> f64 {
		self.bbox.resolution(self.size())
	}

	pub fn is_opaque(&self) -> bool {
		self.image.pixels().all(|p| p.0[3] == 255)
	}

	pub fn is_transparent(&self) -> bool {
		self.image.pixels().all(|p| p.0[3] == 0)
	}

	/// Returns the color when every pixel carries the same RGBA value.
	pub fn single_color(&self) -> Option<[u8; 4]> {
		let first = self.image.pixels().next()?.0;
		self.image.pixels().all(|p| p.0 == first).then_some(first)
	}

	/// Pixel-aligned crop of `bbox` out of this image. The requested bbox must
	/// lie within the image bbox; fractional pixel positions are rounded.
	pub fn crop(&self, bbox: &MapBBox) -> Result<GeoImage> {
		ensure!(
			self.bbox.contains(bbox),
			"crop bbox {bbox:?} leaves image bbox {:?}",
			self.bbox
		);
		let (w, h) = self.size();
		let px_w = self.bbox.width() / f64::from(w);
		let px_h = self.bbox.height() / f64::from(h);
		let x0 = ((bbox.x_min - self.bbox.x_min) / px_w).round() as u32;
		let y0 = ((self.bbox.y_max - bbox.y_max) / px_h).round() as u32;
		let cw = ((bbox.width() / px_w).round() as u32).clamp(1, w - x0.min(w - 1));
		let ch = ((bbox.height() / px_h).round() as u32).clamp(1, h - y0.min(h - 1));
		let view = image::imageops::crop_imm(&self.image, x0.min(w - 1), y0.min(h - 1), cw, ch).to_image();
		GeoImage::from_rgba(view, *bbox, self.srs.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn merc() -> Srs {
		Srs::from_epsg(3857).unwrap()
	}

	#[test]
	fn blank_is_transparent() {
		let bbox = MapBBox::new(0.0, 0.0, 256.0, 256.0).unwrap();
		let img = GeoImage::blank((16, 16), [0, 0, 0, 0], bbox, merc()).unwrap();
		assert!(img.is_transparent());
		assert!(!img.is_opaque());
		assert_eq!(img.single_color(), Some([0, 0, 0, 0]));
	}

	#[test]
	fn resolution_from_bbox() {
		let bbox = MapBBox::new(0.0, 0.0, 512.0, 512.0).unwrap();
		let img = GeoImage::blank((256, 256), [1, 2, 3, 255], bbox, merc()).unwrap();
		assert_eq!(img.resolution(), 2.0);
	}

	#[test]
	fn crop_takes_quadrant() {
		let bbox = MapBBox::new(0.0, 0.0, 100.0, 100.0).unwrap();
		let mut img = GeoImage::blank((10, 10), [0, 0, 0, 255], bbox, merc()).unwrap();
		// paint the north-west quadrant red
		for y in 0..5 {
			for x in 0..5 {
				img.as_rgba_mut().put_pixel(x, y, Rgba([255, 0, 0, 255]));
			}
		}
		let nw = MapBBox::new(0.0, 50.0, 50.0, 100.0).unwrap();
		let cropped = img.crop(&nw).unwrap();
		assert_eq!(cropped.size(), (5, 5));
		assert_eq!(cropped.single_color(), Some([255, 0, 0, 255]));

		let se = MapBBox::new(50.0, 0.0, 100.0, 50.0).unwrap();
		let cropped = img.crop(&se).unwrap();
		assert_eq!(cropped.single_color(), Some([0, 0, 0, 255]));
	}

	#[test]
	fn crop_outside_fails() {
		let bbox = MapBBox::new(0.0, 0.0, 100.0, 100.0).unwrap();
		let img = GeoImage::blank((10, 10), [0, 0, 0, 255], bbox, merc()).unwrap();
		let outside = MapBBox::new(50.0, 50.0, 150.0, 150.0).unwrap();
		assert!(img.crop(&outside).is_err());
	}
}
