//! SQLite-backed tile caches: MBTiles, one-database-per-level and GeoPackage.
//!
//! All three share one store core; they differ in file layout, table schema
//! and row orientation (MBTiles counts rows from the south, GeoPackage from
//! the north). Connections come from r2d2 pools initialized with WAL and a
//! busy timeout, so concurrent readers and writers ride out `database is
//! locked` within the configured window.

use crate::{BackendCapabilities, CacheBackend, CacheTile, TileBody, sniff_content_type};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::trace;
use parking_lot::Mutex;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::{
	SqliteConnectionManager,
	rusqlite::{self, OptionalExtension, params},
};
use std::{
	collections::HashMap,
	fmt::{self, Debug},
	path::PathBuf,
	time::{Duration, SystemTime, UNIX_EPOCH},
};
use tilerelay_core::{CacheError, GridOrigin, TileCoord, TileFormat, TileGrid};

/// Which schema the store speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteSchema {
	MBTiles,
	/// One `<level>.mbtile` file per zoom level, with per-tile timestamps.
	PerLevel,
	Geopackage { table_name: String },
}

#[derive(Debug, Clone)]
pub struct SqliteCacheOptions {
	/// Database file, or the cache directory for [`SqliteSchema::PerLevel`].
	pub path: PathBuf,
	/// SQLite busy timeout.
	pub timeout: Duration,
	pub wal: bool,
	pub format: TileFormat,
}

impl SqliteCacheOptions {
	pub fn new(path: impl Into<PathBuf>, format: TileFormat) -> SqliteCacheOptions {
		SqliteCacheOptions {
			path: path.into(),
			timeout: Duration::from_secs(30),
			wal: true,
			format,
		}
	}
}

pub struct SqliteCache {
	options: SqliteCacheOptions,
	schema: SqliteSchema,
	grid: TileGrid,
	pools: Mutex<HashMap<u8, Pool<SqliteConnectionManager>>>,
}

impl Debug for SqliteCache {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SqliteCache")
			.field("path", &self.options.path)
			.field("schema", &self.schema)
			.finish()
	}
}

fn io_err(context: &str, err: impl fmt::Display) -> anyhow::Error {
	CacheError::io(format!("{context}: {err}")).into()
}

fn locked_or_io(context: &str, err: rusqlite::Error) -> anyhow::Error {
	if let rusqlite::Error::SqliteFailure(code, _) = &err {
		if code.code == rusqlite::ErrorCode::DatabaseBusy || code.code == rusqlite::ErrorCode::DatabaseLocked {
			return CacheError::locked(format!("{context}: {err}")).into();
		}
	}
	io_err(context, err)
}

impl SqliteCache {
	pub fn new(options: SqliteCacheOptions, schema: SqliteSchema, grid: TileGrid) -> SqliteCache {
		SqliteCache {
			options,
			schema,
			grid,
			pools: Mutex::new(HashMap::new()),
		}
	}

	pub fn new_mbtiles(options: SqliteCacheOptions, grid: TileGrid) -> SqliteCache {
		SqliteCache::new(options, SqliteSchema::MBTiles, grid)
	}

	pub fn new_per_level(options: SqliteCacheOptions, grid: TileGrid) -> SqliteCache {
		SqliteCache::new(options, SqliteSchema::PerLevel, grid)
	}

	pub fn new_geopackage(options: SqliteCacheOptions, table_name: &str, grid: TileGrid) -> SqliteCache {
		SqliteCache::new(
			options,
			SqliteSchema::Geopackage {
				table_name: table_name.to_string(),
			},
			grid,
		)
	}

	fn db_path(&self, level: u8) -> PathBuf {
		match self.schema {
			SqliteSchema::PerLevel => self.options.path.join(format!("{level}.mbtile")),
			_ => self.options.path.clone(),
		}
	}

	fn pool_key(&self, level: u8) -> u8 {
		match self.schema {
			SqliteSchema::PerLevel => level,
			_ => 0,
		}
	}

	fn tiles_table(&self) -> &str {
		match &self.schema {
			SqliteSchema::Geopackage { table_name } => table_name,
			_ => "tiles",
		}
	}

	/// Row index as stored in the database. MBTiles rows count from the
	/// south, GeoPackage rows from the north; the per-level schema stores
	/// grid rows verbatim.
	fn db_row(&self, coord: &TileCoord) -> Result<u32> {
		let (_, gh) = self.grid.grid_size(coord.z)?;
		let flip = match self.schema {
			SqliteSchema::MBTiles => self.grid.origin() == GridOrigin::NorthWest,
			SqliteSchema::Geopackage { .. } => self.grid.origin() == GridOrigin::SouthWest,
			SqliteSchema::PerLevel => false,
		};
		Ok(if flip { gh - 1 - coord.y } else { coord.y })
	}

	fn init_schema(&self, conn: &rusqlite::Connection) -> rusqlite::Result<()> {
		match &self.schema {
			SqliteSchema::MBTiles => {
				conn.execute_batch(
					"CREATE TABLE IF NOT EXISTS metadata (name TEXT, value TEXT);
					CREATE TABLE IF NOT EXISTS tiles (
						zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB);
					CREATE UNIQUE INDEX IF NOT EXISTS tile_index
						ON tiles (zoom_level, tile_column, tile_row);",
				)?;
				let format = self.options.format.extension();
				conn.execute(
					"INSERT INTO metadata (name, value)
						SELECT 'format', ?1 WHERE NOT EXISTS (SELECT 1 FROM metadata WHERE name = 'format')",
					params![format],
				)?;
			}
			SqliteSchema::PerLevel => {
				conn.execute_batch(
					"CREATE TABLE IF NOT EXISTS tiles (
						x INTEGER NOT NULL, y INTEGER NOT NULL,
						data BLOB, last_modified REAL,
						PRIMARY KEY (x, y));",
				)?;
			}
			SqliteSchema::Geopackage { table_name } => {
				conn.execute_batch(&format!(
					"CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
						srs_name TEXT NOT NULL, srs_id INTEGER PRIMARY KEY,
						organization TEXT NOT NULL, organization_coordsys_id INTEGER NOT NULL,
						definition TEXT NOT NULL, description TEXT);
					CREATE TABLE IF NOT EXISTS gpkg_contents (
						table_name TEXT PRIMARY KEY, data_type TEXT NOT NULL,
						identifier TEXT UNIQUE, description TEXT DEFAULT '',
						last_change DATETIME, min_x DOUBLE, min_y DOUBLE,
						max_x DOUBLE, max_y DOUBLE, srs_id INTEGER);
					CREATE TABLE IF NOT EXISTS gpkg_tile_matrix_set (
						table_name TEXT PRIMARY KEY, srs_id INTEGER NOT NULL,
						min_x DOUBLE NOT NULL, min_y DOUBLE NOT NULL,
						max_x DOUBLE NOT NULL, max_y DOUBLE NOT NULL);
					CREATE TABLE IF NOT EXISTS gpkg_tile_matrix (
						table_name TEXT NOT NULL, zoom_level INTEGER NOT NULL,
						matrix_width INTEGER NOT NULL, matrix_height INTEGER NOT NULL,
						tile_width INTEGER NOT NULL, tile_height INTEGER NOT NULL,
						pixel_x_size DOUBLE NOT NULL, pixel_y_size DOUBLE NOT NULL,
						CONSTRAINT pk_ttm PRIMARY KEY (table_name, zoom_level));
					CREATE TABLE IF NOT EXISTS \"{table_name}\" (
						id INTEGER PRIMARY KEY AUTOINCREMENT,
						zoom_level INTEGER NOT NULL, tile_column INTEGER NOT NULL,
						tile_row INTEGER NOT NULL, tile_data BLOB NOT NULL,
						UNIQUE (zoom_level, tile_column, tile_row));"
				))?;

				let bbox = self.grid.bbox();
				let srs_id = self.grid.srs().epsg().unwrap_or(0);
				conn.execute(
					"INSERT OR IGNORE INTO gpkg_spatial_ref_sys
						(srs_name, srs_id, organization, organization_coordsys_id, definition)
						VALUES (?1, ?2, 'EPSG', ?2, 'undefined')",
					params![self.grid.srs().code(), srs_id],
				)?;
				conn.execute(
					"INSERT OR IGNORE INTO gpkg_contents
						(table_name, data_type, identifier, last_change, min_x, min_y, max_x, max_y, srs_id)
						VALUES (?1, 'tiles', ?1, datetime('now'), ?2, ?3, ?4, ?5, ?6)",
					params![table_name, bbox.x_min, bbox.y_min, bbox.x_max, bbox.y_max, srs_id],
				)?;
				conn.execute(
					"INSERT OR IGNORE INTO gpkg_tile_matrix_set
						(table_name, srs_id, min_x, min_y, max_x, max_y)
						VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
					params![table_name, srs_id, bbox.x_min, bbox.y_min, bbox.x_max, bbox.y_max],
				)?;
				let (tile_w, tile_h) = self.grid.tile_size();
				for z in 0..self.grid.num_levels() {
					let (gw, gh) = self.grid.grid_size(z).map_err(|_| rusqlite::Error::InvalidQuery)?;
					let res = self.grid.resolution(z).map_err(|_| rusqlite::Error::InvalidQuery)?;
					conn.execute(
						"INSERT OR IGNORE INTO gpkg_tile_matrix
							(table_name, zoom_level, matrix_width, matrix_height,
							tile_width, tile_height, pixel_x_size, pixel_y_size)
							VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
						params![table_name, z, gw, gh, tile_w, tile_h, res],
					)?;
				}
			}
		}
		Ok(())
	}

	fn connection(&self, level: u8) -> Result<PooledConnection<SqliteConnectionManager>> {
		let key = self.pool_key(level);
		let pool = {
			let mut pools = self.pools.lock();
			if let Some(pool) = pools.get(&key) {
				pool.clone()
			} else {
				let path = self.db_path(level);
				if let Some(parent) = path.parent() {
					std::fs::create_dir_all(parent).map_err(|e| io_err("creating cache directory", e))?;
				}
				trace!("opening sqlite cache {path:?}");
				let timeout = self.options.timeout;
				let wal = self.options.wal;
				let manager = SqliteConnectionManager::file(&path).with_init(move |conn| {
					conn.busy_timeout(timeout)?;
					if wal {
						conn.pragma_update(None, "journal_mode", "WAL")?;
					}
					Ok(())
				});
				let pool = Pool::builder()
					.max_size(4)
					.build(manager)
					.map_err(|e| io_err("opening sqlite pool", e))?;
				{
					let conn = pool.get().map_err(|e| io_err("sqlite pool", e))?;
					self
						.init_schema(&conn)
						.map_err(|e| locked_or_io("creating schema", e))?;
				}
				pools.insert(key, pool.clone());
				pool
			}
		};
		pool.get().map_err(|e| io_err("sqlite pool", e))
	}

	fn load_row(&self, coord: &TileCoord, with_metadata: bool) -> Result<Option<CacheTile>> {
		let conn = self.connection(coord.z)?;
		let row = self.db_row(coord)?;
		let result: Option<(Vec<u8>, Option<f64>)> = match &self.schema {
			SqliteSchema::PerLevel => conn
				.query_row(
					"SELECT data, last_modified FROM tiles WHERE x = ?1 AND y = ?2",
					params![coord.x, row],
					|r| Ok((r.get(0)?, r.get(1)?)),
				)
				.optional()
				.map_err(|e| locked_or_io("loading tile", e))?,
			_ => conn
				.query_row(
					&format!(
						"SELECT tile_data FROM \"{}\" WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
						self.tiles_table()
					),
					params![coord.z, coord.x, row],
					|r| Ok((r.get(0)?, None)),
				)
				.optional()
				.map_err(|e| locked_or_io("loading tile", e))?,
		};
		Ok(result.map(|(bytes, mtime)| {
			let mtime = if with_metadata {
				mtime.map(|secs| UNIX_EPOCH + Duration::from_secs_f64(secs))
			} else {
				None
			};
			let body = if bytes.is_empty() {
				TileBody::Empty
			} else {
				TileBody::Data {
					content_type: sniff_content_type(&bytes).to_string(),
					bytes,
				}
			};
			CacheTile {
				coord: *coord,
				body,
				mtime,
				single_color: None,
			}
		}))
	}
}

#[async_trait]
impl CacheBackend for SqliteCache {
	async fn load(&self, coord: &TileCoord, with_metadata: bool) -> Result<Option<CacheTile>> {
		self.load_row(coord, with_metadata)
	}

	async fn store(&self, tile: &CacheTile) -> Result<()> {
		let coord = &tile.coord;
		let conn = self.connection(coord.z)?;
		let row = self.db_row(coord)?;
		let bytes: &[u8] = match &tile.body {
			TileBody::Data { bytes, .. } => bytes,
			TileBody::Empty => &[],
		};
		match &self.schema {
			SqliteSchema::PerLevel => {
				let now = SystemTime::now()
					.duration_since(UNIX_EPOCH)
					.context("system clock before epoch")?
					.as_secs_f64();
				conn
					.execute(
						"INSERT OR REPLACE INTO tiles (x, y, data, last_modified) VALUES (?1, ?2, ?3, ?4)",
						params![coord.x, row, bytes, now],
					)
					.map_err(|e| locked_or_io("storing tile", e))?;
			}
			_ => {
				conn
					.execute(
						&format!(
							"INSERT OR REPLACE INTO \"{}\" (zoom_level, tile_column, tile_row, tile_data)
							VALUES (?1, ?2, ?3, ?4)",
							self.tiles_table()
						),
						params![coord.z, coord.x, row, bytes],
					)
					.map_err(|e| locked_or_io("storing tile", e))?;
			}
		}
		Ok(())
	}

	async fn remove(&self, coord: &TileCoord) -> Result<()> {
		let conn = self.connection(coord.z)?;
		let row = self.db_row(coord)?;
		match &self.schema {
			SqliteSchema::PerLevel => conn
				.execute("DELETE FROM tiles WHERE x = ?1 AND y = ?2", params![coord.x, row])
				.map_err(|e| locked_or_io("removing tile", e))?,
			_ => conn
				.execute(
					&format!(
						"DELETE FROM \"{}\" WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
						self.tiles_table()
					),
					params![coord.z, coord.x, row],
				)
				.map_err(|e| locked_or_io("removing tile", e))?,
		};
		Ok(())
	}

	async fn load_many(&self, coords: &[TileCoord], with_metadata: bool) -> Result<Vec<Option<CacheTile>>> {
		let mut result = Vec::with_capacity(coords.len());
		for coord in coords {
			result.push(self.load_row(coord, with_metadata)?);
		}
		Ok(result)
	}

	fn cache_layout(&self) -> &str {
		match self.schema {
			SqliteSchema::MBTiles => "mbtiles",
			SqliteSchema::PerLevel => "sqlite",
			SqliteSchema::Geopackage { .. } => "geopackage",
		}
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
	use tempfile::TempDir;
	use tilerelay_core::TileGrid;

	fn png_bytes() -> Vec<u8> {
		vec![0x89, b'P', b'N', b'G', 1, 2, 3, 4]
	}

	async fn round_trip(cache: &SqliteCache) {
		let coord = TileCoord::new(5, 9, 14);
		assert!(cache.load(&coord, false).await.unwrap().is_none());

		cache
			.store(&CacheTile::new(coord, png_bytes(), "image/png"))
			.await
			.unwrap();
		let tile = cache.load(&coord, true).await.unwrap().unwrap();
		match &tile.body {
			TileBody::Data { bytes, content_type } => {
				assert_eq!(bytes, &png_bytes());
				assert_eq!(content_type, "image/png");
			}
			TileBody::Empty => panic!("expected data"),
		}

		cache.remove(&coord).await.unwrap();
		assert!(cache.load(&coord, false).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn mbtiles_round_trip() {
		let dir = TempDir::new().unwrap();
		let options = SqliteCacheOptions::new(dir.path().join("cache.mbtiles"), TileFormat::Png);
		let cache = SqliteCache::new_mbtiles(options, TileGrid::global_webmercator());
		round_trip(&cache).await;
	}

	#[tokio::test]
	async fn per_level_round_trip_with_mtime() {
		let dir = TempDir::new().unwrap();
		let options = SqliteCacheOptions::new(dir.path(), TileFormat::Png);
		let cache = SqliteCache::new_per_level(options, TileGrid::global_webmercator());

		let coord = TileCoord::new(7, 3, 4);
		cache
			.store(&CacheTile::new(coord, png_bytes(), "image/png"))
			.await
			.unwrap();
		let tile = cache.load(&coord, true).await.unwrap().unwrap();
		let age = SystemTime::now().duration_since(tile.mtime.unwrap()).unwrap();
		assert!(age < Duration::from_secs(10));

		// separate database file per level
		assert!(dir.path().join("7.mbtile").exists());
	}

	#[tokio::test]
	async fn geopackage_round_trip() {
		let dir = TempDir::new().unwrap();
		let options = SqliteCacheOptions::new(dir.path().join("cache.gpkg"), TileFormat::Png);
		let cache = SqliteCache::new_geopackage(options, "osm_tiles", TileGrid::global_webmercator());
		round_trip(&cache).await;
	}

	#[tokio::test]
	async fn mbtiles_rows_are_tms_oriented() {
		let dir = TempDir::new().unwrap();
		let options = SqliteCacheOptions::new(dir.path().join("cache.mbtiles"), TileFormat::Png);
		// webmercator grid has a north-west origin, so rows must be flipped
		let cache = SqliteCache::new_mbtiles(options, TileGrid::global_webmercator());

		let coord = TileCoord::new(2, 1, 0);
		cache
			.store(&CacheTile::new(coord, png_bytes(), "image/png"))
			.await
			.unwrap();

		let conn = cache.connection(2).unwrap();
		let row: u32 = conn
			.query_row("SELECT tile_row FROM tiles WHERE zoom_level = 2", [], |r| r.get(0))
			.unwrap();
		assert_eq!(row, 3);
	}

	#[tokio::test]
	async fn last_writer_wins() {
		let dir = TempDir::new().unwrap();
		let options = SqliteCacheOptions::new(dir.path().join("cache.mbtiles"), TileFormat::Png);
		let cache = SqliteCache::new_mbtiles(options, TileGrid::global_webmercator());

		let coord = TileCoord::new(3, 1, 1);
		cache
			.store(&CacheTile::new(coord, vec![0x89, b'P', b'N', b'G', 1], "image/png"))
			.await
			.unwrap();
		cache
			.store(&CacheTile::new(coord, vec![0x89, b'P', b'N', b'G', 2], "image/png"))
			.await
			.unwrap();
		let tile = cache.load(&coord, false).await.unwrap().unwrap();
		match tile.body {
			TileBody::Data { bytes, .. } => assert_eq!(bytes[4], 2),
			TileBody::Empty => panic!("expected data"),
		}
	}

	#[tokio::test]
	async fn empty_marker_round_trip() {
		let dir = TempDir::new().unwrap();
		let options = SqliteCacheOptions::new(dir.path(), TileFormat::Png);
		let cache = SqliteCache::new_per_level(options, TileGrid::global_webmercator());
		let coord = TileCoord::new(4, 2, 2);
		cache.store(&CacheTile::new_empty(coord)).await.unwrap();
		assert!(cache.load(&coord, false).await.unwrap().unwrap().is_empty_marker());
	}
}
