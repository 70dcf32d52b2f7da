//! Band-merge source: synthesizes an image by picking channels from several
//! sub-sources (e.g. false-color composites from single-band coverages).

use crate::{MapQuery, Source};
use anyhow::{Result, ensure};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use tilerelay_core::Coverage;
use tilerelay_image::{BandPick, GeoImage, merge_bands};

#[derive(Debug)]
pub struct BandMergeSource {
	sources: Vec<Arc<dyn Source>>,
	picks: Vec<BandPick>,
	coverage: Option<Coverage>,
}

impl BandMergeSource {
	pub fn new(sources: Vec<Arc<dyn Source>>, picks: Vec<BandPick>) -> Result<BandMergeSource> {
		ensure!(!sources.is_empty(), "band merge needs at least one source");
		for pick in &picks {
			ensure!(
				pick.source < sources.len(),
				"band pick references source {} of {}",
				pick.source,
				sources.len()
			);
		}
		Ok(BandMergeSource {
			sources,
			picks,
			coverage: None,
		})
	}

	pub fn with_coverage(mut self, coverage: Coverage) -> BandMergeSource {
		self.coverage = Some(coverage);
		self
	}
}

#[async_trait]
impl Source for BandMergeSource {
	async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
		let images = try_join_all(self.sources.iter().map(|source| source.get_map(query))).await?;
		merge_bands(&images, &self.picks)
	}

	fn coverage(&self) -> Option<&Coverage> {
		self.coverage.as_ref()
	}

	fn supports_meta_tiles(&self) -> bool {
		self.sources.iter().all(|s| s.supports_meta_tiles())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tilerelay_core::{MapBBox, Srs, TileFormat};

	#[derive(Debug)]
	struct SolidSource([u8; 4]);

	#[async_trait]
	impl Source for SolidSource {
		async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
			GeoImage::blank(query.size, self.0, query.bbox, query.srs.clone())
		}
	}

	#[tokio::test]
	async fn merges_channels_from_sub_sources() {
		let source = BandMergeSource::new(
			vec![
				Arc::new(SolidSource([200, 1, 2, 255])),
				Arc::new(SolidSource([3, 150, 4, 255])),
			],
			vec![
				BandPick { source: 0, source_band: 0, target_band: 0 },
				BandPick { source: 1, source_band: 1, target_band: 1 },
			],
		)
		.unwrap();

		let query = MapQuery {
			bbox: MapBBox::new(0.0, 0.0, 10.0, 10.0).unwrap(),
			srs: Srs::from_epsg(3857).unwrap(),
			size: (4, 4),
			format: TileFormat::Png,
			transparent: true,
		};
		let image = source.get_map(&query).await.unwrap();
		assert_eq!(image.single_color(), Some([200, 150, 0, 255]));
	}

	#[test]
	fn rejects_out_of_range_pick() {
		let err = BandMergeSource::new(
			vec![Arc::new(SolidSource([0, 0, 0, 255])) as Arc<dyn Source>],
			vec![BandPick { source: 1, source_band: 0, target_band: 0 }],
		);
		assert!(err.is_err());
	}
}
