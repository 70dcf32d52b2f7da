//! Process-local in-memory cache.
//!
//! Reference implementation of the backend contract; also the backend the
//! test suite runs the tile manager against.

use crate::{BackendCapabilities, CacheBackend, CacheTile};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::SystemTime;
use tilerelay_core::TileCoord;

#[derive(Debug, Default)]
pub struct MemoryCache {
	tiles: DashMap<TileCoord, CacheTile>,
}

impl MemoryCache {
	pub fn new() -> MemoryCache {
		MemoryCache::default()
	}

	pub fn len(&self) -> usize {
		self.tiles.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tiles.is_empty()
	}

	/// Overrides the stored mtime; used by tests to age entries.
	pub fn set_mtime(&self, coord: &TileCoord, mtime: SystemTime) {
		if let Some(mut tile) = self.tiles.get_mut(coord) {
			tile.mtime = Some(mtime);
		}
	}
}

#[async_trait]
impl CacheBackend for MemoryCache {
	async fn load(&self, coord: &TileCoord, _with_metadata: bool) -> Result<Option<CacheTile>> {
		Ok(self.tiles.get(coord).map(|t| t.clone()))
	}

	async fn store(&self, tile: &CacheTile) -> Result<()> {
		let mut stored = tile.clone();
		stored.mtime = Some(SystemTime::now());
		self.tiles.insert(tile.coord, stored);
		Ok(())
	}

	async fn remove(&self, coord: &TileCoord) -> Result<()> {
		self.tiles.remove(coord);
		Ok(())
	}

	async fn is_cached(&self, coord: &TileCoord) -> Result<bool> {
		Ok(self.tiles.contains_key(coord))
	}

	fn cache_layout(&self) -> &str {
		"memory"
	}

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities {
			supports_link_identical: false,
			bulk_loads: true,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::TileBody;

	#[tokio::test]
	async fn contract_basics() {
		let cache = MemoryCache::new();
		let coord = TileCoord::new(1, 0, 0);

		assert!(cache.load(&coord, false).await.unwrap().is_none());
		cache
			.store(&CacheTile::new(coord, vec![1, 2, 3], "image/png"))
			.await
			.unwrap();
		assert!(cache.is_cached(&coord).await.unwrap());

		let tile = cache.load(&coord, true).await.unwrap().unwrap();
		assert!(tile.mtime.is_some());
		match tile.body {
			TileBody::Data { bytes, .. } => assert_eq!(bytes, vec![1, 2, 3]),
			TileBody::Empty => panic!("expected data"),
		}

		cache.remove(&coord).await.unwrap();
		assert!(!cache.is_cached(&coord).await.unwrap());
	}

	#[tokio::test]
	async fn load_many_defaults_to_loop() {
		let cache = MemoryCache::new();
		let a = TileCoord::new(2, 0, 0);
		let b = TileCoord::new(2, 1, 0);
		cache.store(&CacheTile::new(a, vec![1], "image/png")).await.unwrap();

		let result = cache.load_many(&[a, b], false).await.unwrap();
		assert!(result[0].is_some());
		assert!(result[1].is_none());
	}
}
