//! Map sources: polymorphic producers of imagery.
//!
//! Every source implements [`Source`] and declares what it supports (SRS,
//! formats, resolution range, coverage) so the tile manager can route and
//! clip requests before any network traffic happens. Concrete variants: WMS
//! ([`wms`]), tile URL templates ([`tile`]), ArcGIS REST ([`arcgis`]), a
//! coordinate-drawing debug source ([`debug`]) and channel-composing band
//! merges ([`band`]). The cache-as-source variant lives with the tile
//! manager, which it recurses into.

pub mod arcgis;
pub mod band;
pub mod debug;
pub mod http;
pub mod tile;
pub mod wms;

pub use http::{HttpClient, HttpClientOptions};

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::fmt::Debug;
use tilerelay_core::{Coverage, MapBBox, Srs, TileFormat};
use tilerelay_image::GeoImage;

/// A map image request in a single SRS.
#[derive(Debug, Clone)]
pub struct MapQuery {
	pub bbox: MapBBox,
	pub srs: Srs,
	pub size: (u32, u32),
	pub format: TileFormat,
	pub transparent: bool,
}

impl MapQuery {
	/// Resolution of the request in SRS units per pixel.
	pub fn resolution(&self) -> f64 {
		self.bbox.resolution(self.size)
	}
}

/// A feature-info request: a map query plus the queried pixel.
#[derive(Debug, Clone)]
pub struct InfoQuery {
	pub bbox: MapBBox,
	pub srs: Srs,
	pub size: (u32, u32),
	/// Pixel position of the query, origin top-left.
	pub pos: (u32, u32),
	pub info_format: String,
}

#[derive(Debug, Clone)]
pub struct LegendQuery {
	pub scale: Option<f64>,
	pub format: TileFormat,
}

/// Raw feature-info payload; format depends on the upstream service.
#[derive(Debug, Clone)]
pub struct FeatureInfo {
	pub content_type: String,
	pub body: Vec<u8>,
}

impl FeatureInfo {
	/// Concatenates documents of the same content type, as layers with
	/// several queryable entries produce.
	pub fn concat(mut docs: Vec<FeatureInfo>) -> Option<FeatureInfo> {
		let first = docs.first()?.content_type.clone();
		let mut body = Vec::new();
		for doc in &mut docs {
			body.append(&mut doc.body);
			body.push(b'\n');
		}
		Some(FeatureInfo {
			content_type: first,
			body,
		})
	}
}

/// Resolution band a source is valid for: `min_res` is the coarsest, `max_res`
/// the finest resolution served (`min_res >= res > max_res`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ResRange {
	pub min_res: Option<f64>,
	pub max_res: Option<f64>,
}

impl ResRange {
	pub fn contains(&self, res: f64) -> bool {
		self.min_res.is_none_or(|min| res <= min) && self.max_res.is_none_or(|max| res > max)
	}
}

/// What to do when an upstream answers with an error status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
	/// Substitute a uniformly colored image.
	Blank([u8; 4]),
	/// Substitute a fully transparent image.
	Transparent,
	/// Propagate the error.
	Raise,
}

/// Maps HTTP status codes to [`ErrorAction`]s; `other` catches the rest.
#[derive(Debug, Clone, Default)]
pub struct ErrorHandler {
	rules: Vec<(u16, ErrorAction)>,
	other: Option<ErrorAction>,
}

impl ErrorHandler {
	pub fn new() -> ErrorHandler {
		ErrorHandler::default()
	}

	pub fn on_status(mut self, status: u16, action: ErrorAction) -> ErrorHandler {
		self.rules.push((status, action));
		self
	}

	pub fn on_other(mut self, action: ErrorAction) -> ErrorHandler {
		self.other = Some(action);
		self
	}

	pub fn action_for(&self, status: u16) -> Option<ErrorAction> {
		self
			.rules
			.iter()
			.find(|(code, _)| *code == status)
			.map(|(_, action)| *action)
			.or(self.other)
	}

	/// Applies the configured action: a substitute image, or `None` to raise.
	pub fn substitute(&self, status: u16, query: &MapQuery) -> Result<Option<GeoImage>> {
		let image = match self.action_for(status) {
			Some(ErrorAction::Blank(color)) => Some(GeoImage::blank(query.size, color, query.bbox, query.srs.clone())?),
			Some(ErrorAction::Transparent) => {
				Some(GeoImage::blank(query.size, [0, 0, 0, 0], query.bbox, query.srs.clone())?)
			}
			Some(ErrorAction::Raise) | None => None,
		};
		Ok(image)
	}
}

/// A producer of map imagery.
#[async_trait]
pub trait Source: Debug + Send + Sync {
	async fn get_map(&self, query: &MapQuery) -> Result<GeoImage>;

	async fn get_feature_info(&self, _query: &InfoQuery) -> Result<FeatureInfo> {
		bail!("this source does not support feature info requests");
	}

	async fn get_legend(&self, _query: &LegendQuery) -> Result<GeoImage> {
		bail!("this source does not support legend requests");
	}

	/// SRS the source can be queried in; `None` means any.
	fn supported_srs(&self) -> Option<&[Srs]> {
		None
	}

	fn supports_srs(&self, srs: &Srs) -> bool {
		match self.supported_srs() {
			None => true,
			Some(list) => list.iter().any(|s| s.is_same(srs)),
		}
	}

	/// Formats the source can deliver; `None` means any.
	fn supported_formats(&self) -> Option<&[TileFormat]> {
		None
	}

	fn coverage(&self) -> Option<&Coverage> {
		None
	}

	fn res_range(&self) -> Option<&ResRange> {
		None
	}

	/// Not queried during live requests, only while seeding.
	fn seed_only(&self) -> bool {
		false
	}

	/// Whether the source can render arbitrary (meta-tile sized) bboxes.
	/// Tile-based sources can only answer single aligned tiles.
	fn supports_meta_tiles(&self) -> bool {
		true
	}
}
