//! Normalized configuration values.
//!
//! The proxy consumes configuration as already-parsed, validated values; file
//! formats and schema validation live outside the core. Everything here is
//! immutable after startup and shared by reference.

use crate::{ConfigError, TileFormat};
use anyhow::{Result, bail, ensure};
use std::{path::PathBuf, time::Duration};

/// Backend kind of a tile cache, as named in the `caches` configuration
/// section. Recognizing a name does not imply the backend is shipped;
/// construction fails with a [`ConfigError`] for unsupported kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendType {
	File,
	MBTiles,
	/// One SQLite file per level.
	Sqlite,
	Geopackage,
	S3,
	AzureBlob,
	CouchDb,
	Redis,
	/// Deprecated upstream; still recognized.
	Riak,
	ArcgisCompact,
	CompactV2,
	/// Process-local store, used by tests and as a reference backend.
	Memory,
}

impl CacheBackendType {
	pub fn from_str(value: &str) -> Result<CacheBackendType> {
		Ok(match value.trim().to_ascii_lowercase().as_str() {
			"file" => CacheBackendType::File,
			"mbtiles" => CacheBackendType::MBTiles,
			"sqlite" => CacheBackendType::Sqlite,
			"geopackage" => CacheBackendType::Geopackage,
			"s3" => CacheBackendType::S3,
			"azureblob" => CacheBackendType::AzureBlob,
			"couchdb" => CacheBackendType::CouchDb,
			"redis" => CacheBackendType::Redis,
			"riak" => CacheBackendType::Riak,
			"arcgis-compact" => CacheBackendType::ArcgisCompact,
			"compact-v2" => CacheBackendType::CompactV2,
			"memory" => CacheBackendType::Memory,
			_ => bail!(ConfigError(format!("unknown cache type '{value}'"))),
		})
	}
}

/// Path schema of a file cache (see the cache crate for the concrete
/// templates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectoryLayout {
	/// `zz/xxx/xxx/xxx/yyy/yyy/yyy.format` (TileCache compatible).
	#[default]
	TileCache,
	/// `z/x/y.format`.
	Tms,
	/// `zz/xxxx/xxxx/yyyy/yyyy.format` (reduced nesting).
	Mp,
	/// `Lzz/Rrrrrrrrr/Ccccccccc.format` (ArcGIS exploded, hex).
	Arcgis,
	/// One file per quadkey.
	Quadkey,
}

impl DirectoryLayout {
	pub fn from_str(value: &str) -> Result<DirectoryLayout> {
		Ok(match value.trim().to_ascii_lowercase().as_str() {
			"tc" => DirectoryLayout::TileCache,
			"tms" => DirectoryLayout::Tms,
			"mp" => DirectoryLayout::Mp,
			"arcgis" => DirectoryLayout::Arcgis,
			"quadkey" => DirectoryLayout::Quadkey,
			_ => bail!(ConfigError(format!("unknown directory layout '{value}'"))),
		})
	}
}

/// Per-cache options consumed by the tile manager.
#[derive(Debug, Clone)]
pub struct CacheOptions {
	pub format: TileFormat,
	/// Format used for upstream requests when it differs from the stored one.
	pub request_format: Option<TileFormat>,
	pub meta_size: (u32, u32),
	pub meta_buffer: u32,
	/// Shrink the meta request to the bounding rectangle of the actually
	/// missing tiles instead of the full meta-tile.
	pub minimize_meta_requests: bool,
	/// Seed whole meta-tiles even when single tiles are requested.
	pub bulk_meta_tiles: bool,
	pub link_single_color_images: bool,
	/// Levels at or above this bypass the cache entirely.
	pub use_direct_from_level: Option<u8>,
	/// Resolutions finer than this bypass the cache entirely.
	pub use_direct_from_res: Option<f64>,
	/// Allow serving from up to N levels coarser when a tile is missing.
	pub upscale_tiles: Option<u8>,
	/// Allow assembling from up to N levels finer when a tile is missing.
	pub downscale_tiles: Option<u8>,
	pub disable_storage: bool,
	/// Entries older than this are refreshed when touched.
	pub refresh_before: Option<Duration>,
	/// Serve stale entries immediately and refresh in the background.
	pub refresh_while_serving: bool,
	pub concurrent_tile_creators: usize,
	pub lock_timeout: Duration,
	/// Cross-process lock files live here; `None` keeps locking in-process.
	/// May point outside the cache directory (read-only cache mounts).
	pub tile_lock_dir: Option<PathBuf>,
}

impl Default for CacheOptions {
	fn default() -> CacheOptions {
		CacheOptions {
			format: TileFormat::Png,
			request_format: None,
			meta_size: (4, 4),
			meta_buffer: 80,
			minimize_meta_requests: false,
			bulk_meta_tiles: false,
			link_single_color_images: false,
			use_direct_from_level: None,
			use_direct_from_res: None,
			upscale_tiles: None,
			downscale_tiles: None,
			disable_storage: false,
			refresh_before: None,
			refresh_while_serving: false,
			concurrent_tile_creators: 2,
			lock_timeout: Duration::from_secs(60),
			tile_lock_dir: None,
		}
	}
}

impl CacheOptions {
	pub fn validate(&self) -> Result<()> {
		ensure!(
			self.meta_size.0 > 0 && self.meta_size.1 > 0,
			ConfigError("meta_size must be positive".to_string())
		);
		ensure!(
			self.concurrent_tile_creators > 0,
			ConfigError("concurrent_tile_creators must be positive".to_string())
		);
		if let (Some(up), Some(down)) = (self.upscale_tiles, self.downscale_tiles) {
			if up > 0 && down > 0 {
				bail!(ConfigError(
					"upscale_tiles and downscale_tiles are mutually exclusive".to_string()
				));
			}
		}
		Ok(())
	}

	/// Format sent upstream; falls back to the stored format.
	pub fn upstream_format(&self) -> TileFormat {
		self.request_format.unwrap_or(self.format)
	}
}

/// Process-wide tuning, computed once at startup.
#[derive(Debug, Clone)]
pub struct GlobalsConfig {
	/// Serve from a cached level stretched up to this factor before switching
	/// to the next level.
	pub stretch_factor: f64,
	/// Shrink the coarsest level up to this factor before returning blank.
	pub max_shrink_factor: f64,
	/// Parallel source requests composing one image.
	pub concurrent_layer_renderer: usize,
	/// Per-source parallel requests, keyed by hostname.
	pub concurrent_requests: usize,
	pub client_timeout: Duration,
}

impl Default for GlobalsConfig {
	fn default() -> GlobalsConfig {
		GlobalsConfig {
			stretch_factor: 1.15,
			max_shrink_factor: 4.0,
			concurrent_layer_renderer: 1,
			concurrent_requests: 4,
			client_timeout: Duration::from_secs(60),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backend_type_names() {
		assert_eq!(CacheBackendType::from_str("file").unwrap(), CacheBackendType::File);
		assert_eq!(
			CacheBackendType::from_str("arcgis-compact").unwrap(),
			CacheBackendType::ArcgisCompact
		);
		assert_eq!(CacheBackendType::from_str("riak").unwrap(), CacheBackendType::Riak);
		let err = CacheBackendType::from_str("carbonite").unwrap_err();
		assert!(err.downcast_ref::<ConfigError>().is_some());
	}

	#[test]
	fn layout_names() {
		assert_eq!(DirectoryLayout::from_str("tc").unwrap(), DirectoryLayout::TileCache);
		assert_eq!(DirectoryLayout::from_str("quadkey").unwrap(), DirectoryLayout::Quadkey);
		assert!(DirectoryLayout::from_str("zxy").is_err());
	}

	#[test]
	fn cache_options_validation() {
		let mut opts = CacheOptions::default();
		opts.validate().unwrap();

		opts.meta_size = (0, 4);
		assert!(opts.validate().is_err());

		opts.meta_size = (4, 4);
		opts.upscale_tiles = Some(2);
		opts.downscale_tiles = Some(1);
		assert!(opts.validate().is_err());
	}

	#[test]
	fn upstream_format_falls_back() {
		let mut opts = CacheOptions::default();
		assert_eq!(opts.upstream_format(), TileFormat::Png);
		opts.request_format = Some(TileFormat::Tiff);
		assert_eq!(opts.upstream_format(), TileFormat::Tiff);
	}
}
