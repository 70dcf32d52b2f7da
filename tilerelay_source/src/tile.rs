//! Tile source: fetches single tiles from URL templates.
//!
//! Template variables: `%(x)s`, `%(y)s`, `%(z)s`, `%(quadkey)s`,
//! `%(tms_path)s`. Tile sources answer exactly one aligned tile per request;
//! the tile manager falls back to per-tile requests for them
//! (`supports_meta_tiles` is false).

use crate::{ErrorHandler, HttpClient, MapQuery, ResRange, Source};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::trace;
use regex::Regex;
use tilerelay_core::{Coverage, Srs, SourceError, SourceErrorKind, TileCoord, TileFormat, TileGrid};
use tilerelay_image::{GeoImage, decode_image};

#[derive(Debug)]
pub struct TileSource {
	template: String,
	grid: TileGrid,
	client: HttpClient,
	coverage: Option<Coverage>,
	res_range: Option<ResRange>,
	on_error: ErrorHandler,
	var_pattern: Regex,
}

impl TileSource {
	pub fn new(template: impl Into<String>, grid: TileGrid, client: HttpClient) -> TileSource {
		TileSource {
			template: template.into(),
			grid,
			client,
			coverage: None,
			res_range: None,
			on_error: ErrorHandler::default(),
			var_pattern: Regex::new(r"%\((x|y|z|quadkey|tms_path)\)s").unwrap(),
		}
	}

	pub fn with_coverage(mut self, coverage: Coverage) -> TileSource {
		self.coverage = Some(coverage);
		self
	}

	pub fn with_res_range(mut self, range: ResRange) -> TileSource {
		self.res_range = Some(range);
		self
	}

	pub fn with_error_handler(mut self, handler: ErrorHandler) -> TileSource {
		self.on_error = handler;
		self
	}

	pub fn tile_url(&self, coord: &TileCoord) -> Result<String> {
		let quadkey = if self.template.contains("%(quadkey)s") {
			self.grid.quadkey(coord)?
		} else {
			String::new()
		};
		let mut err = None;
		let url = self
			.var_pattern
			.replace_all(&self.template, |caps: &regex::Captures| match &caps[1] {
				"x" => coord.x.to_string(),
				"y" => coord.y.to_string(),
				"z" => coord.z.to_string(),
				"quadkey" => quadkey.clone(),
				"tms_path" => format!("{}/{}/{}", coord.z, coord.x, coord.y),
				other => {
					err = Some(other.to_string());
					String::new()
				}
			})
			.to_string();
		match err {
			Some(var) => anyhow::bail!("unknown template variable '{var}'"),
			None => Ok(url),
		}
	}

	/// The single grid tile matching `query`, or an error when the request is
	/// not aligned to this source's grid.
	fn matching_coord(&self, query: &MapQuery) -> Result<TileCoord> {
		let misaligned =
			|msg: &str| SourceError::new(SourceErrorKind::UnsupportedFormat, format!("{msg} (tile source)"));
		if !query.srs.is_same(self.grid.srs()) {
			return Err(SourceError::new(SourceErrorKind::UnsupportedSrs, query.srs.code().to_string()).into());
		}
		let z = self.grid.level_for_res(query.resolution());
		let range = self
			.grid
			.tiles_for_bbox(&query.bbox, z)?
			.with_context(|| format!("query {:?} outside tile grid", query.bbox))?;
		if range.len() != 1 {
			return Err(misaligned(&format!("request spans {} tiles", range.len())).into());
		}
		let coord = TileCoord::new(z, range.x0, range.y0);
		let tile_bbox = self.grid.tile_bbox(&coord)?;
		let tolerance = self.grid.resolution(z)? / 10.0;
		let aligned = (tile_bbox.x_min - query.bbox.x_min).abs() < tolerance
			&& (tile_bbox.y_min - query.bbox.y_min).abs() < tolerance
			&& (tile_bbox.x_max - query.bbox.x_max).abs() < tolerance
			&& (tile_bbox.y_max - query.bbox.y_max).abs() < tolerance;
		if !aligned {
			return Err(misaligned("request not aligned to the tile grid").into());
		}
		Ok(coord)
	}
}

#[async_trait]
impl Source for TileSource {
	async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
		let coord = self.matching_coord(query)?;
		let url = self.tile_url(&coord)?;
		trace!("fetching tile {coord:?} from {url}");

		let response = self.client.get(&url).await?;
		if !response.is_success() {
			if let Some(substitute) = self.on_error.substitute(response.status, query)? {
				return Ok(substitute);
			}
			return Err(SourceError::http(response.status, "tile request failed").with_url(url).into());
		}
		decode_image(&response.body, query.bbox, query.srs.clone())
	}

	fn supported_srs(&self) -> Option<&[Srs]> {
		Some(std::slice::from_ref(self.grid.srs()))
	}

	fn coverage(&self) -> Option<&Coverage> {
		self.coverage.as_ref()
	}

	fn res_range(&self) -> Option<&ResRange> {
		self.res_range.as_ref()
	}

	fn supports_meta_tiles(&self) -> bool {
		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::HttpClientOptions;

	fn source(template: &str) -> TileSource {
		TileSource::new(
			template,
			TileGrid::global_webmercator(),
			HttpClient::new(HttpClientOptions::default()).unwrap(),
		)
	}

	#[test]
	fn substitutes_xyz() {
		let source = source("https://tiles.example.org/%(z)s/%(x)s/%(y)s.png");
		assert_eq!(
			source.tile_url(&TileCoord::new(5, 9, 14)).unwrap(),
			"https://tiles.example.org/5/9/14.png"
		);
	}

	#[test]
	fn substitutes_quadkey_and_tms_path() {
		let source1 = source("https://t.example.org/img?q=%(quadkey)s");
		assert_eq!(
			source1.tile_url(&TileCoord::new(3, 3, 5)).unwrap(),
			"https://t.example.org/img?q=213"
		);

		let source2 = source("https://t.example.org/%(tms_path)s.png");
		assert_eq!(
			source2.tile_url(&TileCoord::new(3, 3, 5)).unwrap(),
			"https://t.example.org/3/3/5.png"
		);
	}

	#[test]
	fn aligned_query_resolves_to_tile() {
		let source = source("https://t.example.org/%(z)s/%(x)s/%(y)s.png");
		let grid = TileGrid::global_webmercator();
		let coord = TileCoord::new(4, 3, 7);
		let query = MapQuery {
			bbox: grid.tile_bbox(&coord).unwrap(),
			srs: grid.srs().clone(),
			size: grid.tile_size(),
			format: TileFormat::Png,
			transparent: true,
		};
		assert_eq!(source.matching_coord(&query).unwrap(), coord);
	}

	#[test]
	fn meta_sized_query_is_rejected() {
		let source = source("https://t.example.org/%(z)s/%(x)s/%(y)s.png");
		let grid = TileGrid::global_webmercator();
		let range = grid
			.tiles_for_bbox(grid.bbox(), 2)
			.unwrap()
			.unwrap();
		let query = MapQuery {
			bbox: grid.tiles_bbox(&range).unwrap(),
			srs: grid.srs().clone(),
			size: (1024, 1024),
			format: TileFormat::Png,
			transparent: true,
		};
		let err = source.matching_coord(&query).unwrap_err();
		let source_err = err.downcast_ref::<SourceError>().unwrap();
		assert_eq!(source_err.kind, SourceErrorKind::UnsupportedFormat);
	}

	#[test]
	fn tile_sources_do_not_render_meta_tiles() {
		assert!(!source("x").supports_meta_tiles());
	}
}
