//! The tile manager: turns stateless map/tile requests into a deterministic,
//! deduplicated sequence of cache reads, upstream fetches and cache writes.
//!
//! A manager owns one grid, one cache backend and an ordered list of sources.
//! Misses are grouped into meta-tiles and computed once under a
//! per-fingerprint lock (the `build` submodule); everything else in this
//! module is the request-side algebra: level selection, tile enumeration,
//! mosaic assembly and the direct-path bypass.
//!
//! Managers are cheap to clone (all state behind an `Arc`) and reentrant, so
//! a cache can feed another cache through
//! [`CachedSource`](crate::CachedSource) with the full machinery applied at
//! every level of the cascade.

mod build;

use crate::SourceErrorPolicy;
use anyhow::{Context, Result, ensure};
use log::warn;
use std::{
	fmt::{self, Debug},
	sync::Arc,
	time::SystemTime,
};
use tilerelay_cache::{CacheBackend, CacheTile, TileBody, TileLocker};
use tilerelay_core::{CacheError, CacheOptions, GlobalsConfig, MapBBox, TileCoord, TileFormat, TileGrid, TileRange};
use tilerelay_image::{EncodingOptions, GeoImage, Resampling, decode_image, draw_watermark, encode_image, reproject};
use tilerelay_source::{MapQuery, Source};
use tokio::sync::Semaphore;

/// Live requests retry a failed source this many times; seeding is patient.
const LIVE_RETRIES: usize = 2;
const SEED_RETRIES: usize = 100;

/// An encoded tile ready for the wire.
#[derive(Debug, Clone)]
pub struct ServedTile {
	pub bytes: Vec<u8>,
	pub content_type: String,
	pub mtime: Option<SystemTime>,
}

pub(crate) struct ManagerInner {
	pub name: String,
	pub grid: TileGrid,
	pub cache: Arc<dyn CacheBackend>,
	pub sources: Vec<Arc<dyn Source>>,
	pub locker: Arc<TileLocker>,
	pub options: CacheOptions,
	pub globals: GlobalsConfig,
	pub encoding: EncodingOptions,
	pub resampling: Resampling,
	pub on_source_errors: SourceErrorPolicy,
	pub watermark: Option<(String, f64)>,
	/// Bounds concurrently built meta-tiles (`concurrent_tile_creators`).
	pub creators: Semaphore,
}

/// See the module docs. Clones share all state.
#[derive(Clone)]
pub struct TileManager {
	pub(crate) inner: Arc<ManagerInner>,
	/// Seeding mode: query `seed_only` sources and retry patiently.
	pub(crate) seeding: bool,
}

impl Debug for TileManager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TileManager")
			.field("name", &self.inner.name)
			.field("grid", &self.inner.grid.name())
			.finish()
	}
}

pub struct TileManagerBuilder {
	name: String,
	grid: TileGrid,
	cache: Arc<dyn CacheBackend>,
	sources: Vec<Arc<dyn Source>>,
	locker: Option<Arc<TileLocker>>,
	options: CacheOptions,
	globals: GlobalsConfig,
	encoding: EncodingOptions,
	resampling: Resampling,
	on_source_errors: SourceErrorPolicy,
	watermark: Option<(String, f64)>,
}

impl TileManagerBuilder {
	pub fn new(name: &str, grid: TileGrid, cache: Arc<dyn CacheBackend>) -> TileManagerBuilder {
		TileManagerBuilder {
			name: name.to_string(),
			grid,
			cache,
			sources: Vec::new(),
			locker: None,
			options: CacheOptions::default(),
			globals: GlobalsConfig::default(),
			encoding: EncodingOptions::default(),
			resampling: Resampling::default(),
			on_source_errors: SourceErrorPolicy::Raise,
			watermark: None,
		}
	}

	pub fn source(mut self, source: Arc<dyn Source>) -> Self {
		self.sources.push(source);
		self
	}

	pub fn locker(mut self, locker: Arc<TileLocker>) -> Self {
		self.locker = Some(locker);
		self
	}

	pub fn options(mut self, options: CacheOptions) -> Self {
		self.options = options;
		self
	}

	pub fn globals(mut self, globals: GlobalsConfig) -> Self {
		self.globals = globals;
		self
	}

	pub fn encoding(mut self, encoding: EncodingOptions) -> Self {
		self.encoding = encoding;
		self
	}

	pub fn resampling(mut self, resampling: Resampling) -> Self {
		self.resampling = resampling;
		self
	}

	pub fn on_source_errors(mut self, policy: SourceErrorPolicy) -> Self {
		self.on_source_errors = policy;
		self
	}

	pub fn watermark(mut self, text: &str, opacity: f64) -> Self {
		self.watermark = Some((text.to_string(), opacity));
		self
	}

	pub fn build(self) -> Result<TileManager> {
		self.options.validate()?;
		ensure!(!self.sources.is_empty(), "tile manager '{}' needs a source", self.name);
		let locker = self.locker.unwrap_or_else(|| {
			let mut locker = TileLocker::new(self.options.lock_timeout);
			if let Some(dir) = &self.options.tile_lock_dir {
				locker = locker.with_lock_dir(dir);
			}
			Arc::new(locker)
		});
		let creators = Semaphore::new(self.options.concurrent_tile_creators);
		Ok(TileManager {
			inner: Arc::new(ManagerInner {
				name: self.name,
				grid: self.grid,
				cache: self.cache,
				sources: self.sources,
				locker,
				options: self.options,
				globals: self.globals,
				encoding: self.encoding,
				resampling: self.resampling,
				on_source_errors: self.on_source_errors,
				watermark: self.watermark,
				creators,
			}),
			seeding: false,
		})
	}
}

impl TileManager {
	pub fn builder(name: &str, grid: TileGrid, cache: Arc<dyn CacheBackend>) -> TileManagerBuilder {
		TileManagerBuilder::new(name, grid, cache)
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn grid(&self) -> &TileGrid {
		&self.inner.grid
	}

	pub fn cache(&self) -> &Arc<dyn CacheBackend> {
		&self.inner.cache
	}

	pub fn options(&self) -> &CacheOptions {
		&self.inner.options
	}

	pub fn sources(&self) -> &[Arc<dyn Source>] {
		&self.inner.sources
	}

	/// A clone in seeding mode: `seed_only` sources participate and failures
	/// are retried up to 100 times.
	pub fn for_seeding(&self) -> TileManager {
		TileManager {
			inner: self.inner.clone(),
			seeding: true,
		}
	}

	pub(crate) fn max_retries(&self) -> usize {
		if self.seeding { SEED_RETRIES } else { LIVE_RETRIES }
	}

	/// Lock and cache key of a meta-tile.
	pub fn meta_fingerprint(&self, z: u8, mx: u32, my: u32) -> String {
		format!("{}/{}/{}/{}/{}", self.inner.name, self.inner.grid.name(), z, mx, my)
	}

	/// Cache read with the read-error policy applied: I/O errors count as
	/// misses (and are logged), they never fail a request.
	pub(crate) async fn load_or_miss(&self, coord: &TileCoord, with_metadata: bool) -> Option<CacheTile> {
		match self.inner.cache.load(coord, with_metadata).await {
			Ok(tile) => tile,
			Err(err) => {
				warn!("cache read for {coord:?} failed, treating as miss: {err:#}");
				None
			}
		}
	}

	pub(crate) async fn load_many_or_miss(&self, coords: &[TileCoord], with_metadata: bool) -> Vec<Option<CacheTile>> {
		match self.inner.cache.load_many(coords, with_metadata).await {
			Ok(tiles) => tiles,
			Err(err) => {
				warn!("bulk cache read failed, treating {} tiles as misses: {err:#}", coords.len());
				vec![None; coords.len()]
			}
		}
	}

	/// True when the entry should be refreshed per `refresh_before`.
	pub(crate) fn is_stale(&self, tile: &CacheTile) -> bool {
		let Some(max_age) = self.inner.options.refresh_before else {
			return false;
		};
		match tile.mtime {
			Some(mtime) => SystemTime::now().duration_since(mtime).is_ok_and(|age| age > max_age),
			None => false,
		}
	}

	pub async fn is_cached(&self, coord: &TileCoord) -> Result<bool> {
		self.inner.cache.is_cached(coord).await
	}

	pub async fn remove_tile(&self, coord: &TileCoord) -> Result<()> {
		self.inner.cache.remove(coord).await
	}

	/// Serves a single tile, computing its meta-tile on a miss.
	///
	/// A stale hit is served immediately when `refresh_while_serving` is on;
	/// the refresh then runs in the background under the same lock key.
	pub async fn get_tile(&self, coord: TileCoord) -> Result<ServedTile> {
		ensure!(
			self.inner.grid.contains_coord(&coord),
			"tile {coord:?} outside grid '{}'",
			self.inner.grid.name()
		);

		let want_meta = self.inner.options.refresh_before.is_some();
		let mut computed = std::collections::HashMap::new();
		if let Some(tile) = self.load_or_miss(&coord, want_meta).await {
			if self.is_stale(&tile) {
				if self.inner.options.refresh_while_serving {
					let manager = self.clone();
					tokio::spawn(async move {
						if let Err(err) = manager.ensure_tiles(&[coord], true).await {
							warn!("background refresh of {coord:?} failed: {err:#}");
						}
					});
					return self.serve(tile);
				}
				computed = self.ensure_tiles(&[coord], true).await?;
			} else {
				return self.serve(tile);
			}
		} else {
			computed = self.ensure_tiles(&[coord], false).await?;
		}

		// prefer the tile computed by this request: it is valid even when the
		// cache write failed or storage is disabled
		if let Some(tile) = computed.remove(&coord) {
			return self.serve(tile);
		}
		if let Some(tile) = self.load_or_miss(&coord, false).await {
			return self.serve(tile);
		}
		// sources skipped the area (coverage/res range): rebuild from other
		// cached levels when allowed, blank otherwise
		if let Some(image) = self.fill_from_other_levels(&coord).await? {
			let tile = self.encode_and_store(&coord, &image).await?;
			return self.serve(tile);
		}
		self.blank_tile(coord)
	}

	fn serve(&self, tile: CacheTile) -> Result<ServedTile> {
		match tile.body {
			TileBody::Data { bytes, content_type } => Ok(ServedTile {
				bytes,
				content_type,
				mtime: tile.mtime,
			}),
			TileBody::Empty => self.blank_tile(tile.coord),
		}
	}

	/// Encoded fully transparent (or white, for alpha-free formats) tile.
	fn blank_tile(&self, coord: TileCoord) -> Result<ServedTile> {
		let grid = &self.inner.grid;
		let bbox = grid.tile_bbox(&coord)?;
		let color = if self.inner.options.format.supports_transparency() {
			[0, 0, 0, 0]
		} else {
			[255, 255, 255, 255]
		};
		let image = GeoImage::blank(grid.tile_size(), color, bbox, grid.srs().clone())?;
		let (bytes, content_type) = encode_image(&image, self.inner.options.format, &self.inner.encoding)?;
		Ok(ServedTile {
			bytes,
			content_type: content_type.to_string(),
			mtime: None,
		})
	}

	/// Renders an arbitrary bbox/SRS/size request from the cache, computing
	/// missing tiles first. The heart of `get_map` service requests.
	pub async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
		let grid = &self.inner.grid;
		let grid_bbox = query
			.srs
			.transform_bbox(grid.srs(), &query.bbox, 16)
			.context("transforming request into the cache grid")?;
		let grid_res = grid_bbox.resolution(query.size);

		// coarser than the whole pyramid allows: blank instead of a huge shrink
		if grid_res > grid.resolution(0)? * self.inner.globals.max_shrink_factor {
			return self.blank_map(query);
		}

		let z = grid.level_for_res(grid_res);

		// direct path: levels/resolutions the cache is not responsible for
		let direct = self.inner.options.use_direct_from_level.is_some_and(|l| z >= l)
			|| self.inner.options.use_direct_from_res.is_some_and(|r| grid_res < r);
		if direct {
			return match self.render_sources(query).await? {
				Some(image) => self.finish(image, query),
				None => self.blank_map(query),
			};
		}

		let Some(range) = grid.tiles_for_bbox(&grid_bbox, z)? else {
			return self.blank_map(query);
		};

		let computed = self.ensure_range(&range, false).await?;
		let mosaic = self.assemble(&range, &computed).await?;
		let out = reproject(&mosaic, &query.bbox, &query.srs, query.size, self.inner.resampling)?;
		self.finish(out, query)
	}

	fn blank_map(&self, query: &MapQuery) -> Result<GeoImage> {
		let color = if query.transparent { [0, 0, 0, 0] } else { [255, 255, 255, 255] };
		GeoImage::blank(query.size, color, query.bbox, query.srs.clone())
	}

	fn finish(&self, mut image: GeoImage, _query: &MapQuery) -> Result<GeoImage> {
		if let Some((text, opacity)) = &self.inner.watermark {
			draw_watermark(&mut image, text, *opacity);
		}
		Ok(image)
	}

	/// Composes the tiles of `range` into one image in grid SRS, preferring
	/// tiles computed by this request over cache reads. Missing areas are
	/// filled from other cached levels when `upscale_tiles`/`downscale_tiles`
	/// allows, and stay transparent otherwise.
	pub(crate) async fn assemble(
		&self,
		range: &TileRange,
		computed: &std::collections::HashMap<TileCoord, CacheTile>,
	) -> Result<GeoImage> {
		let grid = &self.inner.grid;
		let (tile_w, tile_h) = grid.tile_size();
		let bbox = grid.tiles_bbox(range)?;
		let cols = range.x1 - range.x0 + 1;
		let rows = range.y1 - range.y0 + 1;
		let mut canvas = GeoImage::blank((cols * tile_w, rows * tile_h), [0, 0, 0, 0], bbox, grid.srs().clone())?;

		let coords: Vec<TileCoord> = range.iter().collect();
		let tiles = self.load_many_or_miss(&coords, false).await;
		for (coord, tile) in coords.iter().zip(tiles) {
			let tile = computed.get(coord).cloned().or(tile);
			let image = match tile {
				Some(CacheTile {
					body: TileBody::Data { bytes, .. },
					..
				}) => Some(decode_image(&bytes, grid.tile_bbox(coord)?, grid.srs().clone())?),
				Some(_) => None, // empty marker: transparent
				None => self.fill_from_other_levels(coord).await?,
			};
			let Some(image) = image else { continue };

			let col = coord.x - range.x0;
			let row = match grid.origin() {
				tilerelay_core::GridOrigin::NorthWest => coord.y - range.y0,
				tilerelay_core::GridOrigin::SouthWest => range.y1 - coord.y,
			};
			tilerelay_image::paste(&mut canvas, &image, i64::from(col * tile_w), i64::from(row * tile_h));
		}
		Ok(canvas)
	}

	/// Writes one tile, applying the write-error policy: failures are logged
	/// and the computed image is still served.
	pub(crate) async fn store_tile(&self, tile: &CacheTile) {
		if self.inner.options.disable_storage {
			return;
		}
		if let Err(err) = self.inner.cache.store(tile).await {
			if err.downcast_ref::<CacheError>().is_some() {
				warn!("cache write for {:?} failed, serving anyway: {err:#}", tile.coord);
			} else {
				warn!("cache write for {:?} failed: {err:#}", tile.coord);
			}
		}
	}

	pub(crate) fn upstream_query(&self, bbox: MapBBox, size: (u32, u32)) -> MapQuery {
		let format = self.inner.options.upstream_format();
		MapQuery {
			bbox,
			srs: self.inner.grid.srs().clone(),
			size,
			format: if format == TileFormat::Mixed { TileFormat::Png } else { format },
			transparent: self.inner.options.format.supports_transparency(),
		}
	}
}
