//! WMS source: GetMap, GetFeatureInfo and GetLegendGraphic against
//! WMS 1.1.1 / 1.3.0 servers.
//!
//! The 1.3.0 axis-order rule is applied here and only here: systems whose
//! wire order is northing/easting (EPSG:4326, unlike `CRS:84`) get their
//! bbox flipped; 1.3.0 also renames the feature-info pixel parameters to
//! `I`/`J`.

use crate::{ErrorHandler, FeatureInfo, HttpClient, InfoQuery, LegendQuery, MapQuery, ResRange, Source};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::Url;
use tilerelay_core::{Coverage, Srs, SourceError, SourceErrorKind, TileFormat};
use tilerelay_image::{GeoImage, decode_image};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WmsVersion {
	V1_1_1,
	#[default]
	V1_3_0,
}

impl WmsVersion {
	fn as_str(self) -> &'static str {
		match self {
			WmsVersion::V1_1_1 => "1.1.1",
			WmsVersion::V1_3_0 => "1.3.0",
		}
	}

	fn srs_param(self) -> &'static str {
		match self {
			WmsVersion::V1_1_1 => "SRS",
			WmsVersion::V1_3_0 => "CRS",
		}
	}
}

#[derive(Debug, Clone)]
pub struct WmsRequestOptions {
	/// GetMap endpoint; existing query parameters are preserved.
	pub url: String,
	pub layers: Vec<String>,
	pub styles: Option<String>,
	pub version: WmsVersion,
	pub transparent: bool,
	/// SLD document URL (`SLD=`) or inline body (`SLD_BODY=`).
	pub sld: Option<String>,
	pub sld_body: Option<String>,
	/// Extra query parameters appended verbatim.
	pub params: Vec<(String, String)>,
}

impl WmsRequestOptions {
	pub fn new(url: impl Into<String>, layers: Vec<String>) -> WmsRequestOptions {
		WmsRequestOptions {
			url: url.into(),
			layers,
			styles: None,
			version: WmsVersion::default(),
			transparent: true,
			sld: None,
			sld_body: None,
			params: Vec::new(),
		}
	}
}

#[derive(Debug)]
pub struct WmsSource {
	request: WmsRequestOptions,
	client: HttpClient,
	supported_srs: Option<Vec<Srs>>,
	supported_formats: Option<Vec<TileFormat>>,
	coverage: Option<Coverage>,
	res_range: Option<ResRange>,
	on_error: ErrorHandler,
	seed_only: bool,
	/// Strip the request URL from propagated errors.
	hide_exception_url: bool,
}

impl WmsSource {
	pub fn new(request: WmsRequestOptions, client: HttpClient) -> WmsSource {
		WmsSource {
			request,
			client,
			supported_srs: None,
			supported_formats: None,
			coverage: None,
			res_range: None,
			on_error: ErrorHandler::default(),
			seed_only: false,
			hide_exception_url: false,
		}
	}

	pub fn with_supported_srs(mut self, srs: Vec<Srs>) -> WmsSource {
		self.supported_srs = Some(srs);
		self
	}

	pub fn with_supported_formats(mut self, formats: Vec<TileFormat>) -> WmsSource {
		self.supported_formats = Some(formats);
		self
	}

	pub fn with_coverage(mut self, coverage: Coverage) -> WmsSource {
		self.coverage = Some(coverage);
		self
	}

	pub fn with_res_range(mut self, range: ResRange) -> WmsSource {
		self.res_range = Some(range);
		self
	}

	pub fn with_error_handler(mut self, handler: ErrorHandler) -> WmsSource {
		self.on_error = handler;
		self
	}

	pub fn seed_only(mut self, seed_only: bool) -> WmsSource {
		self.seed_only = seed_only;
		self
	}

	pub fn hide_exception_url(mut self, hide: bool) -> WmsSource {
		self.hide_exception_url = hide;
		self
	}

	fn bbox_param(&self, query_bbox: &tilerelay_core::MapBBox, srs: &Srs) -> String {
		let b = query_bbox;
		if self.request.version == WmsVersion::V1_3_0 && srs.axis_order_inverted() {
			format!("{},{},{},{}", b.y_min, b.x_min, b.y_max, b.x_max)
		} else {
			format!("{},{},{},{}", b.x_min, b.y_min, b.x_max, b.y_max)
		}
	}

	fn base_url(&self, request_name: &str) -> Result<Url> {
		let mut url = Url::parse(&self.request.url).with_context(|| format!("invalid WMS URL '{}'", self.request.url))?;
		url
			.query_pairs_mut()
			.append_pair("SERVICE", "WMS")
			.append_pair("VERSION", self.request.version.as_str())
			.append_pair("REQUEST", request_name);
		for (name, value) in &self.request.params {
			url.query_pairs_mut().append_pair(name, value);
		}
		Ok(url)
	}

	pub fn get_map_url(&self, query: &MapQuery) -> Result<Url> {
		let mut url = self.base_url("GetMap")?;
		{
			let mut pairs = url.query_pairs_mut();
			pairs
				.append_pair("LAYERS", &self.request.layers.join(","))
				.append_pair("STYLES", self.request.styles.as_deref().unwrap_or(""))
				.append_pair("FORMAT", query.format.content_type())
				.append_pair(
					"TRANSPARENT",
					if self.request.transparent && query.transparent { "TRUE" } else { "FALSE" },
				)
				.append_pair("WIDTH", &query.size.0.to_string())
				.append_pair("HEIGHT", &query.size.1.to_string())
				.append_pair(self.request.version.srs_param(), query.srs.code())
				.append_pair("BBOX", &self.bbox_param(&query.bbox, &query.srs));
			if let Some(sld) = &self.request.sld {
				pairs.append_pair("SLD", sld);
			}
			if let Some(sld_body) = &self.request.sld_body {
				pairs.append_pair("SLD_BODY", sld_body);
			}
		}
		Ok(url)
	}

	fn source_error(&self, mut err: SourceError, url: &Url) -> anyhow::Error {
		if !self.hide_exception_url {
			err = err.with_url(url.as_str());
		}
		err.into()
	}

	fn check_query(&self, query: &MapQuery) -> Result<()> {
		if !self.supports_srs(&query.srs) {
			return Err(SourceError::new(SourceErrorKind::UnsupportedSrs, query.srs.code().to_string()).into());
		}
		if let Some(formats) = &self.supported_formats {
			if !formats.contains(&query.format) {
				return Err(SourceError::new(SourceErrorKind::UnsupportedFormat, query.format.to_string()).into());
			}
		}
		Ok(())
	}
}

#[async_trait]
impl Source for WmsSource {
	async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
		self.check_query(query)?;
		let url = self.get_map_url(query)?;
		let response = self.client.get(url.as_str()).await?;

		// service exceptions come back as XML, often with status 200
		if !response.is_success() || response.is_xml() {
			let status = response.status;
			debug!("wms error {status} from {}", url.host_str().unwrap_or("?"));
			if let Some(substitute) = self.on_error.substitute(status, query)? {
				return Ok(substitute);
			}
			let message = if response.is_xml() {
				String::from_utf8_lossy(&response.body).chars().take(400).collect()
			} else {
				format!("unexpected response ({} bytes)", response.body.len())
			};
			return Err(self.source_error(SourceError::http(status, message), &url));
		}

		decode_image(&response.body, query.bbox, query.srs.clone())
			.map_err(|e| self.source_error(SourceError::new(SourceErrorKind::Http, e.to_string()), &url))
	}

	async fn get_feature_info(&self, query: &InfoQuery) -> Result<FeatureInfo> {
		let mut url = self.base_url("GetFeatureInfo")?;
		{
			let mut pairs = url.query_pairs_mut();
			let layers = self.request.layers.join(",");
			pairs
				.append_pair("LAYERS", &layers)
				.append_pair("QUERY_LAYERS", &layers)
				.append_pair("STYLES", "")
				.append_pair("INFO_FORMAT", &query.info_format)
				.append_pair("WIDTH", &query.size.0.to_string())
				.append_pair("HEIGHT", &query.size.1.to_string())
				.append_pair(self.request.version.srs_param(), query.srs.code());
			let bbox = if self.request.version == WmsVersion::V1_3_0 && query.srs.axis_order_inverted() {
				format!("{},{},{},{}", query.bbox.y_min, query.bbox.x_min, query.bbox.y_max, query.bbox.x_max)
			} else {
				format!("{},{},{},{}", query.bbox.x_min, query.bbox.y_min, query.bbox.x_max, query.bbox.y_max)
			};
			pairs.append_pair("BBOX", &bbox);
			match self.request.version {
				WmsVersion::V1_1_1 => {
					pairs
						.append_pair("X", &query.pos.0.to_string())
						.append_pair("Y", &query.pos.1.to_string());
				}
				WmsVersion::V1_3_0 => {
					pairs
						.append_pair("I", &query.pos.0.to_string())
						.append_pair("J", &query.pos.1.to_string());
				}
			}
		}

		let response = self.client.get(url.as_str()).await?;
		if !response.is_success() {
			return Err(self.source_error(SourceError::http(response.status, "feature info failed"), &url));
		}
		Ok(FeatureInfo {
			content_type: response.content_type,
			body: response.body,
		})
	}

	async fn get_legend(&self, query: &LegendQuery) -> Result<GeoImage> {
		let mut url = self.base_url("GetLegendGraphic")?;
		{
			let mut pairs = url.query_pairs_mut();
			pairs
				.append_pair("LAYER", self.request.layers.first().map_or("", |l| l.as_str()))
				.append_pair("FORMAT", query.format.content_type());
			if let Some(scale) = query.scale {
				pairs.append_pair("SCALE", &scale.to_string());
			}
		}
		let response = self.client.get(url.as_str()).await?;
		if !response.is_success() || response.is_xml() {
			return Err(self.source_error(SourceError::http(response.status, "legend request failed"), &url));
		}
		// legends have no georeference; use a unit bbox
		decode_image(
			&response.body,
			tilerelay_core::MapBBox::new(0.0, 0.0, 1.0, 1.0)?,
			Srs::from_epsg(3857)?,
		)
	}

	fn supported_srs(&self) -> Option<&[Srs]> {
		self.supported_srs.as_deref()
	}

	fn supported_formats(&self) -> Option<&[TileFormat]> {
		self.supported_formats.as_deref()
	}

	fn coverage(&self) -> Option<&Coverage> {
		self.coverage.as_ref()
	}

	fn res_range(&self) -> Option<&ResRange> {
		self.res_range.as_ref()
	}

	fn seed_only(&self) -> bool {
		self.seed_only
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::HttpClientOptions;
	use std::collections::HashMap;
	use tilerelay_core::MapBBox;

	fn query(srs: &str) -> MapQuery {
		MapQuery {
			bbox: MapBBox::new(4.0, 46.0, 16.0, 56.0).unwrap(),
			srs: Srs::from_code(srs).unwrap(),
			size: (800, 600),
			format: TileFormat::Png,
			transparent: true,
		}
	}

	fn source(version: WmsVersion) -> WmsSource {
		let mut request = WmsRequestOptions::new("http://example.org/service?map=foo", vec!["roads".to_string()]);
		request.version = version;
		WmsSource::new(request, HttpClient::new(HttpClientOptions::default()).unwrap())
	}

	fn params(url: &Url) -> HashMap<String, String> {
		url.query_pairs().map(|(k, v)| (k.to_string(), v.to_string())).collect()
	}

	#[test]
	fn get_map_url_1_1_1() {
		let url = source(WmsVersion::V1_1_1).get_map_url(&query("EPSG:4326")).unwrap();
		let p = params(&url);
		assert_eq!(p["VERSION"], "1.1.1");
		assert_eq!(p["SRS"], "EPSG:4326");
		assert_eq!(p["BBOX"], "4,46,16,56");
		assert_eq!(p["WIDTH"], "800");
		assert_eq!(p["HEIGHT"], "600");
		assert_eq!(p["TRANSPARENT"], "TRUE");
		// pre-existing query params survive
		assert_eq!(p["map"], "foo");
	}

	#[test]
	fn get_map_url_1_3_0_flips_geographic_axis() {
		let url = source(WmsVersion::V1_3_0).get_map_url(&query("EPSG:4326")).unwrap();
		let p = params(&url);
		assert_eq!(p["VERSION"], "1.3.0");
		assert_eq!(p["CRS"], "EPSG:4326");
		assert_eq!(p["BBOX"], "46,4,56,16");
	}

	#[test]
	fn get_map_url_1_3_0_mercator_keeps_axis() {
		let url = source(WmsVersion::V1_3_0).get_map_url(&query("EPSG:3857")).unwrap();
		let p = params(&url);
		assert_eq!(p["BBOX"], "4,46,16,56");
	}

	#[test]
	fn unsupported_srs_is_rejected_without_request() {
		let source = source(WmsVersion::V1_3_0).with_supported_srs(vec![Srs::from_epsg(3857).unwrap()]);
		assert!(!source.supports_srs(&Srs::from_epsg(4326).unwrap()));
	}
}
