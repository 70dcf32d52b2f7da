//! GeoTIFF encoding via the `tiff` crate.
//!
//! The georeference is written as ModelPixelScale (33550), ModelTiepoint
//! (33922) and a minimal GeoKeyDirectory (34735) carrying the EPSG code.
//! JPEG-in-TIFF is not available in the encoder; LZW and Deflate are.

use crate::GeoImage;
use anyhow::{Context, Result, bail};
use std::io::Cursor;
use tiff::{
	encoder::{TiffEncoder, colortype, compression},
	tags::Tag,
};

const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TiffCompression {
	#[default]
	Uncompressed,
	Lzw,
	Deflate,
}

impl TiffCompression {
	pub fn from_str(value: &str) -> Result<TiffCompression> {
		Ok(match value.trim().to_ascii_lowercase().as_str() {
			"none" | "raw" => TiffCompression::Uncompressed,
			"lzw" => TiffCompression::Lzw,
			"deflate" => TiffCompression::Deflate,
			_ => bail!("unknown tiff compression '{value}'"),
		})
	}
}

/// GeoKeyDirectory: version 1.1.0, model type + raster type + CS code.
fn geo_keys(image: &GeoImage) -> Vec<u16> {
	let epsg = image.srs().epsg().unwrap_or(0) as u16;
	let geographic = image.srs().is_geographic();
	let mut keys = vec![1, 1, 0, 3];
	// GTModelTypeGeoKey: 1 = projected, 2 = geographic
	keys.extend_from_slice(&[1024, 0, 1, if geographic { 2 } else { 1 }]);
	// GTRasterTypeGeoKey: 1 = PixelIsArea
	keys.extend_from_slice(&[1025, 0, 1, 1]);
	if geographic {
		keys.extend_from_slice(&[2048, 0, 1, epsg]);
	} else {
		keys.extend_from_slice(&[3072, 0, 1, epsg]);
	}
	keys
}

pub fn encode(image: &GeoImage, compression: TiffCompression) -> Result<Vec<u8>> {
	let (w, h) = image.size();
	let bbox = image.bbox();
	let pixel_scale = [bbox.width() / f64::from(w), bbox.height() / f64::from(h), 0.0];
	// raster origin (0, 0) is the north-west corner
	let tiepoint = [0.0, 0.0, 0.0, bbox.x_min, bbox.y_max, 0.0];
	let keys = geo_keys(image);

	let mut cursor = Cursor::new(Vec::new());
	{
		let mut encoder = TiffEncoder::new(&mut cursor).context("creating TIFF encoder")?;

		macro_rules! write_tiff {
			($compression:expr) => {{
				let mut out = encoder
					.new_image_with_compression::<colortype::RGBA8, _>(w, h, $compression)
					.context("creating TIFF image")?;
				out
					.encoder()
					.write_tag(Tag::Unknown(TAG_MODEL_PIXEL_SCALE), &pixel_scale[..])?;
				out
					.encoder()
					.write_tag(Tag::Unknown(TAG_MODEL_TIEPOINT), &tiepoint[..])?;
				out
					.encoder()
					.write_tag(Tag::Unknown(TAG_GEO_KEY_DIRECTORY), &keys[..])?;
				out.write_data(image.as_rgba().as_raw()).context("writing TIFF data")?;
			}};
		}

		match compression {
			TiffCompression::Uncompressed => write_tiff!(compression::Uncompressed),
			TiffCompression::Lzw => write_tiff!(compression::Lzw),
			TiffCompression::Deflate => write_tiff!(compression::Deflate::default()),
		}
	}
	Ok(cursor.into_inner())
}
