//! Cache-as-source: a tile manager exposed through the [`Source`] interface,
//! so one cache can feed another.
//!
//! Requests pass through the full meta-tile and locking machinery of the
//! wrapped manager, which guards every level of a cascade against thundering
//! herds. The manager is a pure function of `(request, context)`, so
//! recursion needs no extra state.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tilerelay_core::Coverage;
use tilerelay_image::GeoImage;
use tilerelay_source::{FeatureInfo, InfoQuery, LegendQuery, MapQuery, ResRange, Source};

use crate::TileManager;

#[derive(Debug)]
pub struct CachedSource {
	manager: TileManager,
	coverage: Option<Coverage>,
	res_range: Option<ResRange>,
}

impl CachedSource {
	pub fn new(manager: TileManager) -> CachedSource {
		CachedSource {
			manager,
			coverage: None,
			res_range: None,
		}
	}

	pub fn with_coverage(mut self, coverage: Coverage) -> CachedSource {
		self.coverage = Some(coverage);
		self
	}

	pub fn with_res_range(mut self, range: ResRange) -> CachedSource {
		self.res_range = Some(range);
		self
	}

	pub fn manager(&self) -> &TileManager {
		&self.manager
	}
}

#[async_trait]
impl Source for CachedSource {
	async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
		self.manager.get_map(query).await
	}

	async fn get_feature_info(&self, query: &InfoQuery) -> Result<FeatureInfo> {
		for source in self.manager.sources() {
			if let Ok(info) = source.get_feature_info(query).await {
				return Ok(info);
			}
		}
		anyhow::bail!("no source of cache '{}' supports feature info", self.manager.name());
	}

	async fn get_legend(&self, query: &LegendQuery) -> Result<GeoImage> {
		for source in self.manager.sources() {
			if let Ok(image) = source.get_legend(query).await {
				return Ok(image);
			}
		}
		anyhow::bail!("no source of cache '{}' supports legends", self.manager.name());
	}

	fn coverage(&self) -> Option<&Coverage> {
		self.coverage.as_ref()
	}

	fn res_range(&self) -> Option<&ResRange> {
		self.res_range.as_ref()
	}
}

/// Convenience: a cache source boxed for a manager's source list.
pub fn cache_as_source(manager: TileManager) -> Arc<dyn Source> {
	Arc::new(CachedSource::new(manager))
}
