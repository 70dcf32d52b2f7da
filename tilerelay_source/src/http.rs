//! Shared HTTP client for upstream requests.
//!
//! One [`HttpClient`] per source: TLS below 1.2 is refused, timeouts apply
//! per request, custom headers / basic auth / client certificates are baked
//! into the underlying `reqwest` client, and a per-hostname semaphore bounds
//! parallel requests against each upstream server (keyed by host, not URL).

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::trace;
use reqwest::Url;
use std::{fmt, sync::Arc, time::Duration};
use tilerelay_core::{SourceError, SourceErrorKind};
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct HttpClientOptions {
	pub timeout: Duration,
	pub headers: Vec<(String, String)>,
	pub basic_auth: Option<(String, String)>,
	/// PEM-encoded client certificate and key for mutual TLS.
	pub client_cert: Option<(Vec<u8>, Vec<u8>)>,
	/// Parallel requests per upstream hostname.
	pub concurrent_requests: usize,
}

impl Default for HttpClientOptions {
	fn default() -> HttpClientOptions {
		HttpClientOptions {
			timeout: Duration::from_secs(60),
			headers: Vec::new(),
			basic_auth: None,
			client_cert: None,
			concurrent_requests: 4,
		}
	}
}

/// A fully read upstream response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
	pub status: u16,
	pub content_type: String,
	pub body: Vec<u8>,
}

impl HttpResponse {
	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}

	/// WMS servers often report errors as XML with status 200.
	pub fn is_xml(&self) -> bool {
		self.content_type.contains("xml")
	}
}

pub struct HttpClient {
	client: reqwest::Client,
	limit: usize,
	semaphores: DashMap<String, Arc<Semaphore>>,
}

impl fmt::Debug for HttpClient {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("HttpClient").field("limit", &self.limit).finish()
	}
}

impl HttpClient {
	pub fn new(options: HttpClientOptions) -> Result<HttpClient> {
		let mut headers = reqwest::header::HeaderMap::new();
		for (name, value) in &options.headers {
			headers.insert(
				reqwest::header::HeaderName::from_bytes(name.as_bytes()).context("invalid header name")?,
				value.parse().context("invalid header value")?,
			);
		}
		if let Some((user, password)) = &options.basic_auth {
			let token = base64(format!("{user}:{password}").as_bytes());
			headers.insert(
				reqwest::header::AUTHORIZATION,
				format!("Basic {token}").parse().context("invalid auth header")?,
			);
		}

		let mut builder = reqwest::Client::builder()
			.timeout(options.timeout)
			.default_headers(headers)
			.min_tls_version(reqwest::tls::Version::TLS_1_2)
			.cookie_store(true)
			.user_agent(concat!("tilerelay/", env!("CARGO_PKG_VERSION")));
		if let Some((cert, key)) = &options.client_cert {
			let identity = reqwest::Identity::from_pkcs8_pem(cert, key).context("loading client certificate")?;
			builder = builder.identity(identity);
		}

		Ok(HttpClient {
			client: builder.build().context("building HTTP client")?,
			limit: options.concurrent_requests.max(1),
			semaphores: DashMap::new(),
		})
	}

	fn semaphore_for(&self, url: &Url) -> Arc<Semaphore> {
		let host = url.host_str().unwrap_or("").to_string();
		self
			.semaphores
			.entry(host)
			.or_insert_with(|| Arc::new(Semaphore::new(self.limit)))
			.clone()
	}

	/// Issues a GET, bounded by the per-host semaphore, and reads the whole
	/// body. Timeouts and connection failures map to retryable
	/// [`SourceError`]s; error statuses are returned for the caller's
	/// `on_error` policy.
	pub async fn get(&self, url: &str) -> Result<HttpResponse> {
		let parsed = Url::parse(url).with_context(|| format!("invalid source URL '{url}'"))?;
		let semaphore = self.semaphore_for(&parsed);
		let _permit = semaphore.acquire().await.context("request semaphore closed")?;

		trace!("GET {url}");
		let response = self.client.get(parsed).send().await.map_err(|err| {
			if err.is_timeout() {
				SourceError::new(SourceErrorKind::Timeout, err.to_string())
			} else {
				SourceError::new(SourceErrorKind::Http, err.to_string())
			}
		})?;

		let status = response.status().as_u16();
		let content_type = response
			.headers()
			.get(reqwest::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("")
			.to_string();
		let body = response
			.bytes()
			.await
			.map_err(|err| SourceError::new(SourceErrorKind::Http, format!("reading response body: {err}")))?
			.to_vec();

		Ok(HttpResponse {
			status,
			content_type,
			body,
		})
	}
}

const BASE64_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Standard base64 without padding dependencies; only used for the
/// Authorization header.
fn base64(input: &[u8]) -> String {
	let mut out = String::with_capacity(input.len().div_ceil(3) * 4);
	for chunk in input.chunks(3) {
		let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
		let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
		out.push(BASE64_CHARS[(n >> 18) as usize & 63] as char);
		out.push(BASE64_CHARS[(n >> 12) as usize & 63] as char);
		out.push(if chunk.len() > 1 {
			BASE64_CHARS[(n >> 6) as usize & 63] as char
		} else {
			'='
		});
		out.push(if chunk.len() > 2 {
			BASE64_CHARS[n as usize & 63] as char
		} else {
			'='
		});
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn base64_matches_rfc() {
		assert_eq!(base64(b""), "");
		assert_eq!(base64(b"f"), "Zg==");
		assert_eq!(base64(b"fo"), "Zm8=");
		assert_eq!(base64(b"foo"), "Zm9v");
		assert_eq!(base64(b"user:pass"), "dXNlcjpwYXNz");
	}

	#[test]
	fn xml_detection() {
		let response = HttpResponse {
			status: 200,
			content_type: "application/vnd.ogc.se_xml".to_string(),
			body: vec![],
		};
		assert!(response.is_xml());
		assert!(response.is_success());
	}

	#[tokio::test]
	async fn invalid_url_is_rejected() {
		let client = HttpClient::new(HttpClientOptions::default()).unwrap();
		assert!(client.get("not a url").await.is_err());
	}

	#[tokio::test]
	async fn connection_errors_are_retryable_source_errors() {
		let client = HttpClient::new(HttpClientOptions {
			timeout: Duration::from_millis(300),
			..HttpClientOptions::default()
		})
		.unwrap();
		// nothing listens on this port
		let err = client.get("http://127.0.0.1:59321/wms").await.unwrap_err();
		let source_err = err.downcast_ref::<SourceError>().expect("SourceError");
		assert!(source_err.is_retryable());
	}
}
