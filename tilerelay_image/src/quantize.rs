//! Median-cut palette quantization for 8-bit PNG output.

use image::RgbaImage;

/// Alpha below this maps to the reserved transparent palette index.
const ALPHA_CUTOFF: u8 = 128;

/// Result of a quantization pass: palette entries plus one index byte per
/// pixel. When `transparent_index` is set, that entry is fully transparent
/// and reserved for pixels below the alpha cutoff.
pub struct QuantizedImage {
	pub palette: Vec<[u8; 4]>,
	pub indices: Vec<u8>,
	pub transparent_index: Option<u8>,
}

struct ColorBox {
	colors: Vec<[u8; 3]>,
}

impl ColorBox {
	fn widest_channel(&self) -> usize {
		let mut min = [255u8; 3];
		let mut max = [0u8; 3];
		for c in &self.colors {
			for i in 0..3 {
				min[i] = min[i].min(c[i]);
				max[i] = max[i].max(c[i]);
			}
		}
		let ranges = [max[0] - min[0], max[1] - min[1], max[2] - min[2]];
		(0..3).max_by_key(|&i| ranges[i]).unwrap()
	}

	fn split(mut self) -> (ColorBox, ColorBox) {
		let channel = self.widest_channel();
		self.colors.sort_by_key(|c| c[channel]);
		let right = self.colors.split_off(self.colors.len() / 2);
		(self, ColorBox { colors: right })
	}

	fn average(&self) -> [u8; 4] {
		let n = self.colors.len().max(1) as u64;
		let mut sum = [0u64; 3];
		for c in &self.colors {
			for i in 0..3 {
				sum[i] += u64::from(c[i]);
			}
		}
		[
			(sum[0] / n) as u8,
			(sum[1] / n) as u8,
			(sum[2] / n) as u8,
			255,
		]
	}
}

/// Quantizes an RGBA image to at most `max_colors` palette entries using
/// median-cut. With `with_transparency`, one entry is reserved as the fully
/// transparent index and low-alpha pixels map to it.
pub fn quantize_median_cut(image: &RgbaImage, max_colors: usize, with_transparency: bool) -> QuantizedImage {
	let max_colors = max_colors.clamp(2, 256);
	let color_budget = if with_transparency { max_colors - 1 } else { max_colors };

	// unique opaque colors
	let mut uniques: Vec<[u8; 3]> = image
		.pixels()
		.filter(|p| !with_transparency || p.0[3] >= ALPHA_CUTOFF)
		.map(|p| [p.0[0], p.0[1], p.0[2]])
		.collect();
	uniques.sort_unstable();
	uniques.dedup();

	let mut boxes = vec![ColorBox { colors: uniques }];
	while boxes.len() < color_budget {
		// split the box with the most colors
		let (idx, _) = match boxes
			.iter()
			.enumerate()
			.filter(|(_, b)| b.colors.len() > 1)
			.max_by_key(|(_, b)| b.colors.len())
		{
			Some(found) => found,
			None => break,
		};
		let (left, right) = boxes.swap_remove(idx).split();
		boxes.push(left);
		boxes.push(right);
	}

	let mut palette: Vec<[u8; 4]> = boxes.iter().map(ColorBox::average).collect();
	if palette.is_empty() {
		palette.push([0, 0, 0, 255]);
	}
	let transparent_index = if with_transparency {
		palette.push([0, 0, 0, 0]);
		Some((palette.len() - 1) as u8)
	} else {
		None
	};

	let nearest = |color: [u8; 4]| -> u8 {
		let mut best = 0usize;
		let mut best_dist = u32::MAX;
		for (i, entry) in palette.iter().enumerate() {
			if Some(i as u8) == transparent_index {
				continue;
			}
			let dist = (0..3)
				.map(|c| {
					let d = i32::from(entry[c]) - i32::from(color[c]);
					(d * d) as u32
				})
				.sum();
			if dist < best_dist {
				best_dist = dist;
				best = i;
			}
		}
		best as u8
	};

	let indices = image
		.pixels()
		.map(|p| {
			if let Some(t) = transparent_index {
				if p.0[3] < ALPHA_CUTOFF {
					return t;
				}
			}
			nearest(p.0)
		})
		.collect();

	QuantizedImage {
		palette,
		indices,
		transparent_index,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::Rgba;

	#[test]
	fn two_color_image_keeps_exact_colors() {
		let mut img = RgbaImage::new(8, 8);
		for (x, _, p) in img.enumerate_pixels_mut() {
			*p = if x < 4 { Rgba([255, 0, 0, 255]) } else { Rgba([0, 0, 255, 255]) };
		}
		let q = quantize_median_cut(&img, 256, false);
		assert!(q.palette.len() >= 2);
		assert!(q.palette.contains(&[255, 0, 0, 255]));
		assert!(q.palette.contains(&[0, 0, 255, 255]));
		assert!(q.transparent_index.is_none());
	}

	#[test]
	fn transparency_reserves_an_index() {
		let mut img = RgbaImage::new(4, 4);
		for (x, _, p) in img.enumerate_pixels_mut() {
			*p = if x == 0 { Rgba([0, 0, 0, 0]) } else { Rgba([10, 200, 10, 255]) };
		}
		let q = quantize_median_cut(&img, 16, true);
		let t = q.transparent_index.unwrap();
		assert_eq!(q.palette[t as usize], [0, 0, 0, 0]);
		assert_eq!(q.indices[0], t);
		assert_ne!(q.indices[1], t);
	}

	#[test]
	fn palette_never_exceeds_limit() {
		let mut img = RgbaImage::new(32, 32);
		for (x, y, p) in img.enumerate_pixels_mut() {
			*p = Rgba([(x * 8) as u8, (y * 8) as u8, ((x + y) * 4) as u8, 255]);
		}
		let q = quantize_median_cut(&img, 16, true);
		assert!(q.palette.len() <= 16);
	}

	#[test]
	fn indices_cover_every_pixel() {
		let img = RgbaImage::from_pixel(7, 5, Rgba([1, 2, 3, 255]));
		let q = quantize_median_cut(&img, 8, false);
		assert_eq!(q.indices.len(), 35);
	}
}
