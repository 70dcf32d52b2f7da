//! Debug source: renders the request bbox and resolution onto transparent
//! tiles. Useful to see which requests a layer actually produces.

use crate::{MapQuery, Source};
use anyhow::Result;
use async_trait::async_trait;
use tilerelay_image::{GeoImage, draw_label};

#[derive(Debug, Default)]
pub struct DebugSource;

impl DebugSource {
	pub fn new() -> DebugSource {
		DebugSource
	}
}

#[async_trait]
impl Source for DebugSource {
	async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
		let mut image = GeoImage::blank(query.size, [0, 0, 0, 0], query.bbox, query.srs.clone())?;
		let res = query.resolution();
		let lines = vec![
			format!("{}", query.srs.code()),
			format!("{:.0} {:.0}", query.bbox.x_min, query.bbox.y_min),
			format!("RES {res:.2}"),
		];
		draw_label(&mut image, &lines, [200, 30, 30, 255]);
		Ok(image)
	}
}
