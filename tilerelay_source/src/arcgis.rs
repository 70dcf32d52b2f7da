//! ArcGIS REST source: MapServer `export` / ImageServer `exportImage`
//! endpoints.

use crate::{ErrorHandler, HttpClient, MapQuery, ResRange, Source};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use tilerelay_core::{Coverage, Srs, SourceError, TileFormat};
use tilerelay_image::{GeoImage, decode_image};

#[derive(Debug)]
pub struct ArcGisSource {
	/// Service URL ending in `/export` or `/exportImage`.
	url: String,
	client: HttpClient,
	supported_srs: Option<Vec<Srs>>,
	coverage: Option<Coverage>,
	res_range: Option<ResRange>,
	on_error: ErrorHandler,
}

impl ArcGisSource {
	pub fn new(url: impl Into<String>, client: HttpClient) -> ArcGisSource {
		ArcGisSource {
			url: url.into(),
			client,
			supported_srs: None,
			coverage: None,
			res_range: None,
			on_error: ErrorHandler::default(),
		}
	}

	pub fn with_supported_srs(mut self, srs: Vec<Srs>) -> ArcGisSource {
		self.supported_srs = Some(srs);
		self
	}

	pub fn with_coverage(mut self, coverage: Coverage) -> ArcGisSource {
		self.coverage = Some(coverage);
		self
	}

	pub fn with_res_range(mut self, range: ResRange) -> ArcGisSource {
		self.res_range = Some(range);
		self
	}

	pub fn with_error_handler(mut self, handler: ErrorHandler) -> ArcGisSource {
		self.on_error = handler;
		self
	}

	pub fn export_url(&self, query: &MapQuery) -> Result<Url> {
		let mut url = Url::parse(&self.url).with_context(|| format!("invalid ArcGIS URL '{}'", self.url))?;
		let srs_id = query.srs.epsg().map_or_else(|| query.srs.code().to_string(), |e| e.to_string());
		let format = match query.format {
			TileFormat::Jpeg => "jpg",
			_ => "png",
		};
		url
			.query_pairs_mut()
			.append_pair("f", "image")
			.append_pair(
				"bbox",
				&format!(
					"{},{},{},{}",
					query.bbox.x_min, query.bbox.y_min, query.bbox.x_max, query.bbox.y_max
				),
			)
			.append_pair("bboxSR", &srs_id)
			.append_pair("imageSR", &srs_id)
			.append_pair("size", &format!("{},{}", query.size.0, query.size.1))
			.append_pair("format", format)
			.append_pair("transparent", if query.transparent { "true" } else { "false" });
		Ok(url)
	}
}

#[async_trait]
impl Source for ArcGisSource {
	async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
		let url = self.export_url(query)?;
		let response = self.client.get(url.as_str()).await?;
		// ArcGIS reports errors as JSON, frequently with status 200
		if !response.is_success() || response.content_type.contains("json") {
			if let Some(substitute) = self.on_error.substitute(response.status, query)? {
				return Ok(substitute);
			}
			let message: String = String::from_utf8_lossy(&response.body).chars().take(400).collect();
			return Err(SourceError::http(response.status, message).with_url(url.as_str()).into());
		}
		decode_image(&response.body, query.bbox, query.srs.clone())
	}

	fn supported_srs(&self) -> Option<&[Srs]> {
		self.supported_srs.as_deref()
	}

	fn coverage(&self) -> Option<&Coverage> {
		self.coverage.as_ref()
	}

	fn res_range(&self) -> Option<&ResRange> {
		self.res_range.as_ref()
	}
}
