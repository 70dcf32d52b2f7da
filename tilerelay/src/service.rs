//! The operations exposed to the protocol frontends (WMS/WMTS/TMS/KML
//! dispatch lives outside this crate and calls these).

use crate::{Layer, ServedTile};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tilerelay_core::{ConfigError, MapBBox, Srs, TileCoord, TileFormat};
use tilerelay_image::{EncodingOptions, encode_image};
use tilerelay_source::{FeatureInfo, InfoQuery, LegendQuery, MapQuery};

pub struct TileService {
	layers: HashMap<String, Arc<Layer>>,
	encoding: EncodingOptions,
}

impl TileService {
	pub fn new(layers: Vec<Arc<Layer>>) -> TileService {
		TileService {
			layers: layers.into_iter().map(|l| (l.name().to_string(), l)).collect(),
			encoding: EncodingOptions::default(),
		}
	}

	pub fn with_encoding(mut self, encoding: EncodingOptions) -> TileService {
		self.encoding = encoding;
		self
	}

	pub fn layer(&self, name: &str) -> Result<&Arc<Layer>> {
		self
			.layers
			.get(name)
			.with_context(|| ConfigError(format!("unknown layer '{name}'")))
	}

	pub fn layer_names(&self) -> Vec<&str> {
		let mut names: Vec<&str> = self.layers.keys().map(String::as_str).collect();
		names.sort_unstable();
		names
	}

	/// Serves one tile of a cached layer grid (WMTS/TMS/KML superoverlays).
	pub async fn get_tile(&self, layer: &str, grid: &str, z: u8, x: u32, y: u32) -> Result<ServedTile> {
		let layer = self.layer(layer)?;
		let manager = layer
			.manager_for_grid(grid)
			.with_context(|| ConfigError(format!("layer '{}' has no cache on grid '{grid}'", layer.name())))?;
		manager.get_tile(TileCoord::new(z, x, y)).await
	}

	/// Renders an arbitrary map image (WMS GetMap).
	pub async fn get_map(
		&self,
		layer: &str,
		bbox: MapBBox,
		srs: Srs,
		size: (u32, u32),
		format: TileFormat,
	) -> Result<(Vec<u8>, String)> {
		let query = MapQuery {
			bbox,
			srs,
			size,
			format,
			transparent: format.supports_transparency(),
		};
		let image = self.layer(layer)?.get_map(&query).await?;
		let (bytes, content_type) = encode_image(&image, format, &self.encoding)?;
		Ok((bytes, content_type.to_string()))
	}

	/// WMS GetFeatureInfo at pixel `pos` of a map request.
	pub async fn get_feature_info(
		&self,
		layer: &str,
		bbox: MapBBox,
		srs: Srs,
		size: (u32, u32),
		pos: (u32, u32),
		info_format: &str,
	) -> Result<Option<FeatureInfo>> {
		let query = InfoQuery {
			bbox,
			srs,
			size,
			pos,
			info_format: info_format.to_string(),
		};
		self.layer(layer)?.get_feature_info(&query).await
	}

	/// WMS GetLegendGraphic; `None` when no source provides a legend.
	pub async fn get_legend(
		&self,
		layer: &str,
		scale: Option<f64>,
		format: TileFormat,
	) -> Result<Option<(Vec<u8>, String)>> {
		let query = LegendQuery { scale, format };
		let Some(image) = self.layer(layer)?.get_legend(&query).await? else {
			return Ok(None);
		};
		let (bytes, content_type) = encode_image(&image, format, &self.encoding)?;
		Ok(Some((bytes, content_type.to_string())))
	}
}
