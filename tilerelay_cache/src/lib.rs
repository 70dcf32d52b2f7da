//! Tile cache backends and the tile locker.
//!
//! All backends implement the [`CacheBackend`] contract: atomic `store`,
//! read-your-write within a process, last-writer-wins across processes and no
//! torn tiles. Concrete stores: filesystem layouts ([`file`]), the SQLite
//! family ([`sqlite`]: MBTiles, one-file-per-level, GeoPackage), ArcGIS
//! compact bundles ([`compact`]), CouchDB over plain HTTP ([`couchdb`]) and a
//! process-local reference backend ([`memory`]).

pub mod compact;
pub mod couchdb;
pub mod file;
pub mod locker;
pub mod memory;
pub mod sqlite;

pub use locker::{LockGuard, TileLocker};

use anyhow::Result;
use async_trait::async_trait;
use std::{fmt::Debug, time::SystemTime};
use tilerelay_core::TileCoord;

/// Stored form of a tile.
///
/// `Empty` is a distinguished value: the area was computed and found fully
/// transparent. It is different from a missing entry, which means the tile
/// was never computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileBody {
	Data { bytes: Vec<u8>, content_type: String },
	Empty,
}

/// A tile as it travels between the manager and a cache backend.
#[derive(Debug, Clone)]
pub struct CacheTile {
	pub coord: TileCoord,
	pub body: TileBody,
	pub mtime: Option<SystemTime>,
	/// Set by the manager when every pixel has this RGBA value; backends with
	/// `supports_link_identical` may deduplicate the payload.
	pub single_color: Option<[u8; 4]>,
}

impl CacheTile {
	pub fn new(coord: TileCoord, bytes: Vec<u8>, content_type: impl Into<String>) -> CacheTile {
		CacheTile {
			coord,
			body: TileBody::Data {
				bytes,
				content_type: content_type.into(),
			},
			mtime: None,
			single_color: None,
		}
	}

	pub fn new_empty(coord: TileCoord) -> CacheTile {
		CacheTile {
			coord,
			body: TileBody::Empty,
			mtime: None,
			single_color: None,
		}
	}

	pub fn with_single_color(mut self, color: [u8; 4]) -> CacheTile {
		self.single_color = Some(color);
		self
	}

	pub fn is_empty_marker(&self) -> bool {
		matches!(self.body, TileBody::Empty)
	}

	pub fn size(&self) -> usize {
		match &self.body {
			TileBody::Data { bytes, .. } => bytes.len(),
			TileBody::Empty => 0,
		}
	}
}

/// Optional backend features the manager can take advantage of.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendCapabilities {
	/// Identical single-color tiles can share one stored payload.
	pub supports_link_identical: bool,
	/// `load_many` is cheaper than a loop of `load` calls.
	pub bulk_loads: bool,
}

/// The uniform store contract.
///
/// Invariants every implementation upholds:
/// * `store` is atomic: readers observe either the previous entry or the full
///   new one, never a torn tile.
/// * `load` after a successful `store` in the same process returns the stored
///   bytes until `remove` or a newer `store` supersedes them.
/// * Concurrent `store` of the same coordinate is allowed; the last writer
///   wins.
#[async_trait]
pub trait CacheBackend: Debug + Send + Sync {
	/// Reads a tile. `with_metadata` requests `mtime` where the backend has
	/// to pay extra for it. Returns `None` for a missing entry.
	async fn load(&self, coord: &TileCoord, with_metadata: bool) -> Result<Option<CacheTile>>;

	async fn store(&self, tile: &CacheTile) -> Result<()>;

	/// Removing a missing tile is not an error.
	async fn remove(&self, coord: &TileCoord) -> Result<()>;

	async fn is_cached(&self, coord: &TileCoord) -> Result<bool> {
		Ok(self.load(coord, false).await?.is_some())
	}

	/// Bulk read; the default loops over [`CacheBackend::load`].
	async fn load_many(&self, coords: &[TileCoord], with_metadata: bool) -> Result<Vec<Option<CacheTile>>> {
		let mut result = Vec::with_capacity(coords.len());
		for coord in coords {
			result.push(self.load(coord, with_metadata).await?);
		}
		Ok(result)
	}

	/// Path template / id schema identifying how entries are laid out.
	fn cache_layout(&self) -> &str;

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities::default()
	}
}

/// Sniffs the content type of stored tile bytes. Backends without a
/// content-type column use this on load (relevant for the `mixed` format).
pub fn sniff_content_type(bytes: &[u8]) -> &'static str {
	if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
		"image/png"
	} else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
		"image/jpeg"
	} else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
		"image/tiff"
	} else {
		"application/octet-stream"
	}
}
