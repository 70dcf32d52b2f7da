//! Wire image formats produced by the proxy.

use anyhow::{Result, bail};
use std::fmt;

/// Image format of a stored or served tile.
///
/// `Mixed` stores PNG for tiles with any transparency and JPEG otherwise; the
/// concrete content type of a mixed entry is only known per tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileFormat {
	Png,
	/// 8-bit paletted PNG with one palette index reserved for transparency.
	Png8,
	Jpeg,
	/// Georeferenced TIFF.
	Tiff,
	Mixed,
}

impl TileFormat {
	pub fn from_str(value: &str) -> Result<TileFormat> {
		Ok(match value.trim().to_ascii_lowercase().as_str() {
			"png" | "image/png" => TileFormat::Png,
			"png8" | "image/png; mode=8bit" => TileFormat::Png8,
			"jpeg" | "jpg" | "image/jpeg" => TileFormat::Jpeg,
			"tiff" | "tif" | "image/tiff" => TileFormat::Tiff,
			"mixed" => TileFormat::Mixed,
			_ => bail!("unknown tile format '{value}'"),
		})
	}

	pub fn extension(&self) -> &'static str {
		match self {
			TileFormat::Png | TileFormat::Png8 => "png",
			TileFormat::Jpeg => "jpeg",
			TileFormat::Tiff => "tiff",
			TileFormat::Mixed => "mixed",
		}
	}

	/// Content type of entries in this format. For `Mixed` this is only a
	/// default; the stored entry decides between PNG and JPEG.
	pub fn content_type(&self) -> &'static str {
		match self {
			TileFormat::Png | TileFormat::Png8 | TileFormat::Mixed => "image/png",
			TileFormat::Jpeg => "image/jpeg",
			TileFormat::Tiff => "image/tiff",
		}
	}

	/// True when the format can carry an alpha channel.
	pub fn supports_transparency(&self) -> bool {
		!matches!(self, TileFormat::Jpeg)
	}
}

impl fmt::Display for TileFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			TileFormat::Png => "png",
			TileFormat::Png8 => "png8",
			TileFormat::Jpeg => "jpeg",
			TileFormat::Tiff => "tiff",
			TileFormat::Mixed => "mixed",
		};
		write!(f, "{name}")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case("png", TileFormat::Png)]
	#[case("image/png", TileFormat::Png)]
	#[case("PNG8", TileFormat::Png8)]
	#[case("jpg", TileFormat::Jpeg)]
	#[case("image/jpeg", TileFormat::Jpeg)]
	#[case("tif", TileFormat::Tiff)]
	#[case("mixed", TileFormat::Mixed)]
	fn parses_known_formats(#[case] input: &str, #[case] expected: TileFormat) {
		assert_eq!(TileFormat::from_str(input).unwrap(), expected);
	}

	#[test]
	fn rejects_unknown_format() {
		assert!(TileFormat::from_str("gif").is_err());
	}

	#[test]
	fn jpeg_has_no_alpha() {
		assert!(!TileFormat::Jpeg.supports_transparency());
		assert!(TileFormat::Png8.supports_transparency());
	}
}
