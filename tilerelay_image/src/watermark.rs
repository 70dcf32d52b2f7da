//! Watermark and label drawing.
//!
//! Uses a built-in 5×7 bitmap font (digits, upper-case letters and a few
//! symbols) so no font assets need to be shipped. Unknown characters render
//! as a filled box.

use crate::GeoImage;
use image::Rgba;

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
/// Horizontal advance including one column of spacing.
const GLYPH_ADVANCE: u32 = 6;

#[rustfmt::skip]
fn glyph(c: char) -> [u8; 7] {
	match c.to_ascii_uppercase() {
		'0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
		'1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
		'2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
		'3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
		'4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
		'5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
		'6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
		'7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
		'8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
		'9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
		'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
		'B' => [0b11110, 0b10001, 0b11110, 0b10001, 0b10001, 0b10001, 0b11110],
		'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
		'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
		'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
		'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
		'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
		'H' => [0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001, 0b10001],
		'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
		'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
		'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
		'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
		'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
		'N' => [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001],
		'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
		'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
		'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
		'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
		'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
		'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
		'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
		'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
		'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001],
		'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
		'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
		'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
		':' => [0b00000, 0b00100, 0b00000, 0b00000, 0b00100, 0b00000, 0b00000],
		'.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00100],
		',' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00100, 0b00100, 0b01000],
		'-' => [0b00000, 0b00000, 0b00000, 0b01110, 0b00000, 0b00000, 0b00000],
		'/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
		' ' => [0b00000; 7],
		_ => [0b11111; 7],
	}
}

fn draw_text(image: &mut GeoImage, text: &str, x: i64, y: i64, scale: u32, color: [u8; 4]) {
	let (w, h) = image.size();
	let buffer = image.as_rgba_mut();
	let mut pen_x = x;
	for c in text.chars() {
		let rows = glyph(c);
		for (row, bits) in rows.iter().enumerate() {
			for col in 0..GLYPH_WIDTH {
				if bits & (1u8 << (GLYPH_WIDTH - 1 - col)) == 0 {
					continue;
				}
				for sy in 0..scale {
					for sx in 0..scale {
						let px = pen_x + i64::from(col * scale + sx);
						let py = y + i64::from(row as u32 * scale + sy);
						if px >= 0 && py >= 0 && px < i64::from(w) && py < i64::from(h) {
							buffer.put_pixel(px as u32, py as u32, Rgba(color));
						}
					}
				}
			}
		}
		pen_x += i64::from(GLYPH_ADVANCE * scale);
	}
}

fn text_width(text: &str, scale: u32) -> u32 {
	text.chars().count() as u32 * GLYPH_ADVANCE * scale
}

/// Draws `lines` centered on the image, one below the other. Used by the
/// debug source to label tiles with their coordinates.
pub fn draw_label(image: &mut GeoImage, lines: &[String], color: [u8; 4]) {
	let (w, h) = image.size();
	let scale = (w / 128).clamp(1, 4);
	let line_height = (GLYPH_HEIGHT + 3) * scale;
	let total = line_height * lines.len() as u32;
	let mut y = i64::from(h / 2) - i64::from(total / 2);
	for line in lines {
		let x = i64::from(w / 2) - i64::from(text_width(line, scale) / 2);
		draw_text(image, line, x, y, scale, color);
		y += i64::from(line_height);
	}
}

/// Overlays a repeated translucent text watermark.
///
/// `opacity` is 0.0..=1.0; rows are offset by half a period so the marks fall
/// diagonally across tile boundaries.
pub fn draw_watermark(image: &mut GeoImage, text: &str, opacity: f64) {
	if text.is_empty() {
		return;
	}
	let (w, h) = image.size();
	let alpha = (opacity.clamp(0.0, 1.0) * 255.0).round() as u8;
	if alpha == 0 {
		return;
	}
	let color = [128, 128, 128, alpha];
	let scale = 1;
	let step_x = (text_width(text, scale) + 40).max(64);
	let step_y = 80u32;
	let mut row = 0;
	let mut y = 20i64;
	while y < i64::from(h) {
		let offset = if row % 2 == 0 { 0 } else { i64::from(step_x / 2) };
		let mut x = -offset;
		while x < i64::from(w) {
			draw_text(image, text, x, y, scale, color);
			x += i64::from(step_x);
		}
		y += i64::from(step_y);
		row += 1;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tilerelay_core::{MapBBox, Srs};

	fn blank(size: u32) -> GeoImage {
		GeoImage::blank(
			(size, size),
			[0, 0, 0, 0],
			MapBBox::new(0.0, 0.0, 1.0, 1.0).unwrap(),
			Srs::from_epsg(3857).unwrap(),
		)
		.unwrap()
	}

	#[test]
	fn label_marks_pixels() {
		let mut image = blank(256);
		draw_label(&mut image, &["5/1/2".to_string()], [255, 0, 0, 255]);
		assert!(!image.is_transparent());
		// label is centered, corners stay empty
		assert_eq!(image.as_rgba().get_pixel(0, 0).0, [0, 0, 0, 0]);
	}

	#[test]
	fn watermark_is_translucent() {
		let mut image = blank(256);
		draw_watermark(&mut image, "SAMPLE", 0.2);
		let max_alpha = image.as_rgba().pixels().map(|p| p.0[3]).max().unwrap();
		assert_eq!(max_alpha, 51);
	}

	#[test]
	fn zero_opacity_draws_nothing() {
		let mut image = blank(64);
		draw_watermark(&mut image, "SAMPLE", 0.0);
		assert!(image.is_transparent());
	}
}
