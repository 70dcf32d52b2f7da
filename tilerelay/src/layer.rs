//! Layers: the user-facing composition of sources and caches.
//!
//! A layer is an ordered list of entries, each a direct source or a set of
//! cached grid variants, optionally restricted by coverage and SRS. Requests
//! drop entries whose coverage misses the bbox and alpha-composite the rest
//! bottom to top. Feature-info requests walk the same list and concatenate
//! results; legends stack vertically.

use crate::TileManager;
use anyhow::{Context, Result};
use log::{debug, warn};
use std::sync::Arc;
use tilerelay_core::{Coverage, MapBBox, Srs};
use tilerelay_image::{GeoImage, apply_coverage_mask, apply_opacity, composite_over, paste, reproject};
use tilerelay_source::{FeatureInfo, InfoQuery, LegendQuery, MapQuery, Source};

/// What to do when one of a layer's sources fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceErrorPolicy {
	/// Abort the whole request.
	#[default]
	Raise,
	/// Substitute transparency and log a warning.
	Notify,
	/// Substitute transparency silently.
	Ignore,
}

/// One renderable entry of a layer.
#[derive(Debug, Clone)]
pub enum LayerSource {
	Direct(Arc<dyn Source>),
	/// Grid variants of the same cached content; the best-matching grid
	/// answers (same SRS preferred, then declaration order).
	Cache(Vec<TileManager>),
}

#[derive(Debug, Clone)]
pub struct LayerEntry {
	pub source: LayerSource,
	pub coverage: Option<Coverage>,
	/// Only use this entry for requests in one of these SRS.
	pub srs_restriction: Option<Vec<Srs>>,
	pub opacity: Option<f64>,
}

impl LayerEntry {
	pub fn direct(source: Arc<dyn Source>) -> LayerEntry {
		LayerEntry {
			source: LayerSource::Direct(source),
			coverage: None,
			srs_restriction: None,
			opacity: None,
		}
	}

	pub fn cached(managers: Vec<TileManager>) -> LayerEntry {
		LayerEntry {
			source: LayerSource::Cache(managers),
			coverage: None,
			srs_restriction: None,
			opacity: None,
		}
	}

	pub fn with_coverage(mut self, coverage: Coverage) -> LayerEntry {
		self.coverage = Some(coverage);
		self
	}

	pub fn with_srs_restriction(mut self, srs: Vec<Srs>) -> LayerEntry {
		self.srs_restriction = Some(srs);
		self
	}

	pub fn with_opacity(mut self, opacity: f64) -> LayerEntry {
		self.opacity = Some(opacity);
		self
	}

	fn applies(&self, bbox: &MapBBox, srs: &Srs) -> bool {
		if let Some(restriction) = &self.srs_restriction {
			if !restriction.iter().any(|s| s.is_same(srs)) {
				return false;
			}
		}
		match &self.coverage {
			Some(coverage) => coverage.intersects(bbox, srs).unwrap_or(false),
			None => true,
		}
	}

	/// The manager answering `srs` best: same-SRS grid first, then the first
	/// declared (preferred) one.
	fn best_manager<'a>(managers: &'a [TileManager], srs: &Srs) -> Option<&'a TileManager> {
		managers
			.iter()
			.find(|m| m.grid().srs().is_same(srs))
			.or_else(|| managers.first())
	}
}

#[derive(Debug, Clone)]
pub struct Layer {
	name: String,
	title: Option<String>,
	entries: Vec<LayerEntry>,
	on_source_errors: SourceErrorPolicy,
}

impl Layer {
	pub fn new(name: &str, entries: Vec<LayerEntry>) -> Layer {
		Layer {
			name: name.to_string(),
			title: None,
			entries,
			on_source_errors: SourceErrorPolicy::default(),
		}
	}

	pub fn with_title(mut self, title: &str) -> Layer {
		self.title = Some(title.to_string());
		self
	}

	pub fn with_error_policy(mut self, policy: SourceErrorPolicy) -> Layer {
		self.on_source_errors = policy;
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn title(&self) -> Option<&str> {
		self.title.as_deref()
	}

	/// The cached entry manager serving `grid_name`, for tile protocols.
	pub fn manager_for_grid(&self, grid_name: &str) -> Option<&TileManager> {
		self.entries.iter().find_map(|entry| match &entry.source {
			LayerSource::Cache(managers) => managers.iter().find(|m| m.grid().name() == grid_name),
			LayerSource::Direct(_) => None,
		})
	}

	async fn render_entry(&self, entry: &LayerEntry, query: &MapQuery) -> Result<GeoImage> {
		let mut image = match &entry.source {
			LayerSource::Direct(source) => {
				if source.supports_srs(&query.srs) {
					source.get_map(query).await?
				} else {
					let target = source
						.supported_srs()
						.and_then(|list| list.first())
						.context("source declares no supported SRS")?
						.clone();
					let bbox = query.srs.transform_bbox(&target, &query.bbox, 8)?;
					let sub_query = MapQuery {
						bbox,
						srs: target,
						size: query.size,
						format: query.format,
						transparent: query.transparent,
					};
					let warped = source.get_map(&sub_query).await?;
					reproject(&warped, &query.bbox, &query.srs, query.size, Default::default())?
				}
			}
			LayerSource::Cache(managers) => {
				let manager = LayerEntry::best_manager(managers, &query.srs).context("cache entry without grids")?;
				manager.get_map(query).await?
			}
		};

		if let Some(coverage) = &entry.coverage {
			if !coverage.contains(&query.bbox, &query.srs)? {
				let local = coverage.transformed(&query.srs)?;
				if let Some(mask) = local.mask(&query.bbox, query.size)? {
					apply_coverage_mask(&mut image, &mask)?;
				}
			}
		}
		if let Some(opacity) = entry.opacity {
			apply_opacity(&mut image, opacity);
		}
		Ok(image)
	}

	/// Renders the layer: applicable entries composed bottom to top.
	pub async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
		let mut canvas: Option<GeoImage> = None;
		for entry in &self.entries {
			if !entry.applies(&query.bbox, &query.srs) {
				debug!("layer '{}': entry skipped by coverage/srs", self.name);
				continue;
			}
			match self.render_entry(entry, query).await {
				Ok(image) => match &mut canvas {
					None => canvas = Some(image),
					Some(canvas) => composite_over(canvas, &image)?,
				},
				Err(err) => match self.on_source_errors {
					SourceErrorPolicy::Raise => return Err(err),
					SourceErrorPolicy::Notify => warn!("layer '{}': source failed: {err:#}", self.name),
					SourceErrorPolicy::Ignore => debug!("layer '{}': source failed: {err:#}", self.name),
				},
			}
		}
		match canvas {
			Some(canvas) => Ok(canvas),
			// nothing applied: empty image of the requested size
			None => {
				let color = if query.transparent { [0, 0, 0, 0] } else { [255, 255, 255, 255] };
				GeoImage::blank(query.size, color, query.bbox, query.srs.clone())
			}
		}
	}

	fn info_sources(&self) -> Vec<Arc<dyn Source>> {
		let mut sources = Vec::new();
		for entry in &self.entries {
			match &entry.source {
				LayerSource::Direct(source) => sources.push(source.clone()),
				LayerSource::Cache(managers) => {
					if let Some(manager) = managers.first() {
						sources.extend(manager.sources().iter().cloned());
					}
				}
			}
		}
		sources
	}

	/// Queries every entry in order, concatenating the results.
	pub async fn get_feature_info(&self, query: &InfoQuery) -> Result<Option<FeatureInfo>> {
		let mut docs = Vec::new();
		for source in self.info_sources() {
			match source.get_feature_info(query).await {
				Ok(info) => docs.push(info),
				// sources without feature info support are simply skipped
				Err(err) => debug!("layer '{}': no feature info: {err:#}", self.name),
			}
		}
		Ok(FeatureInfo::concat(docs))
	}

	/// Stacks the legend images of all sources vertically.
	pub async fn get_legend(&self, query: &LegendQuery) -> Result<Option<GeoImage>> {
		let mut legends: Vec<GeoImage> = Vec::new();
		for source in self.info_sources() {
			match source.get_legend(query).await {
				Ok(image) => legends.push(image),
				Err(err) => debug!("layer '{}': no legend: {err:#}", self.name),
			}
		}
		if legends.is_empty() {
			return Ok(None);
		}
		let width = legends.iter().map(|l| l.size().0).max().unwrap_or(1);
		let height: u32 = legends.iter().map(|l| l.size().1).sum();
		let mut canvas = GeoImage::blank(
			(width.max(1), height.max(1)),
			[255, 255, 255, 255],
			MapBBox::new(0.0, 0.0, 1.0, 1.0)?,
			Srs::from_epsg(3857)?,
		)?;
		let mut y = 0i64;
		for legend in &legends {
			paste(&mut canvas, legend, 0, y);
			y += i64::from(legend.size().1);
		}
		Ok(Some(canvas))
	}
}
