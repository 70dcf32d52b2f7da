//! CouchDB tile cache: one document per tile with the image bytes as the
//! `tile` attachment, talked to over plain HTTP.

use crate::{BackendCapabilities, CacheBackend, CacheTile, TileBody, sniff_content_type};
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, trace};
use reqwest::StatusCode;
use std::fmt::{self, Debug};
use tilerelay_core::{CacheError, TileCoord};

const STORE_ATTEMPTS: usize = 5;

pub struct CouchDbCache {
	client: reqwest::Client,
	/// Database URL, e.g. `http://127.0.0.1:5984/osm_webmercator`.
	db_url: String,
}

impl Debug for CouchDbCache {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "CouchDbCache({})", self.db_url)
	}
}

fn http_err(context: &str, err: impl fmt::Display) -> anyhow::Error {
	CacheError::io(format!("{context}: {err}")).into()
}

impl CouchDbCache {
	pub fn new(client: reqwest::Client, db_url: impl Into<String>) -> CouchDbCache {
		CouchDbCache {
			client,
			db_url: db_url.into().trim_end_matches('/').to_string(),
		}
	}

	fn doc_url(&self, coord: &TileCoord) -> String {
		format!("{}/{}-{}-{}", self.db_url, coord.z, coord.x, coord.y)
	}

	/// Revision of an existing document, if any.
	async fn current_rev(&self, doc_url: &str) -> Result<Option<String>> {
		let response = self
			.client
			.head(doc_url)
			.send()
			.await
			.map_err(|e| http_err("HEAD document", e))?;
		if response.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}
		let rev = response
			.headers()
			.get("etag")
			.and_then(|v| v.to_str().ok())
			.map(|v| v.trim_matches('"').to_string());
		Ok(rev)
	}

	async fn create_database(&self) -> Result<()> {
		debug!("creating couchdb database {}", self.db_url);
		let response = self
			.client
			.put(&self.db_url)
			.send()
			.await
			.map_err(|e| http_err("creating database", e))?;
		// 412: created by another worker in the meantime
		if !response.status().is_success() && response.status() != StatusCode::PRECONDITION_FAILED {
			return Err(CacheError::io(format!("creating database: HTTP {}", response.status())).into());
		}
		Ok(())
	}
}

#[async_trait]
impl CacheBackend for CouchDbCache {
	async fn load(&self, coord: &TileCoord, _with_metadata: bool) -> Result<Option<CacheTile>> {
		let url = format!("{}/tile", self.doc_url(coord));
		let response = self.client.get(&url).send().await.map_err(|e| http_err("GET tile", e))?;
		if response.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}
		if !response.status().is_success() {
			return Err(CacheError::io(format!("GET tile: HTTP {}", response.status())).into());
		}
		let bytes = response.bytes().await.map_err(|e| http_err("reading tile body", e))?;
		let body = if bytes.is_empty() {
			TileBody::Empty
		} else {
			TileBody::Data {
				content_type: sniff_content_type(&bytes).to_string(),
				bytes: bytes.to_vec(),
			}
		};
		Ok(Some(CacheTile {
			coord: *coord,
			body,
			mtime: None,
			single_color: None,
		}))
	}

	async fn store(&self, tile: &CacheTile) -> Result<()> {
		let doc_url = self.doc_url(&tile.coord);
		let (bytes, content_type): (&[u8], &str) = match &tile.body {
			TileBody::Data { bytes, content_type } => (bytes, content_type),
			TileBody::Empty => (&[], "application/octet-stream"),
		};
		// rev-aware overwrite: last writer wins, conflicts retried with the
		// fresh revision
		for attempt in 0..STORE_ATTEMPTS {
			let rev = self.current_rev(&doc_url).await?;
			let mut url = format!("{doc_url}/tile");
			if let Some(rev) = &rev {
				url.push_str(&format!("?rev={rev}"));
			}
			trace!("PUT {url} (attempt {attempt})");
			let response = self
				.client
				.put(&url)
				.header("content-type", content_type)
				.body(bytes.to_vec())
				.send()
				.await
				.map_err(|e| http_err("PUT tile", e))?;
			match response.status() {
				status if status.is_success() => return Ok(()),
				StatusCode::CONFLICT => continue,
				StatusCode::NOT_FOUND => self.create_database().await?,
				status => return Err(CacheError::io(format!("PUT tile: HTTP {status}")).into()),
			}
		}
		Err(CacheError::locked(format!("could not store {doc_url} after {STORE_ATTEMPTS} conflicts")).into())
	}

	async fn remove(&self, coord: &TileCoord) -> Result<()> {
		let doc_url = self.doc_url(coord);
		let Some(rev) = self.current_rev(&doc_url).await? else {
			return Ok(());
		};
		let response = self
			.client
			.delete(format!("{doc_url}?rev={rev}"))
			.send()
			.await
			.map_err(|e| http_err("DELETE tile", e))?;
		if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
			return Err(CacheError::io(format!("DELETE tile: HTTP {}", response.status())).into());
		}
		Ok(())
	}

	fn cache_layout(&self) -> &str {
		"couchdb"
	}

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities::default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn document_ids_are_flat() {
		let cache = CouchDbCache::new(reqwest::Client::new(), "http://127.0.0.1:5984/tiles/");
		assert_eq!(
			cache.doc_url(&TileCoord::new(5, 9, 14)),
			"http://127.0.0.1:5984/tiles/5-9-14"
		);
	}
}
