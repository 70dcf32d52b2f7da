//! Miss resolution: meta-tile grouping, locking, source fan-out, splitting
//! and storing.
//!
//! Entry point is [`TileManager::ensure_tiles`]. Misses are grouped into
//! deterministic meta-tiles, each built under its fingerprint lock with a
//! double-check after acquisition, so racing workers and processes compute
//! every meta-tile at most once.

use super::TileManager;
use crate::SourceErrorPolicy;
use anyhow::{Context, Result};
use futures::future::{join_all, try_join_all};
use log::{debug, trace, warn};
use std::{
	collections::{BTreeMap, HashMap},
	sync::Arc,
	time::Duration,
};
use tilerelay_cache::{CacheTile, TileBody};
use tilerelay_core::{MetaTile, SourceError, TileCoord, TileRange};
use tilerelay_image::{GeoImage, Resampling, apply_coverage_mask, composite_over, decode_image, encode_image, extract};
use tilerelay_source::{MapQuery, Source};
use tokio::sync::Semaphore;

const MAX_BACKOFF: Duration = Duration::from_secs(5);

impl TileManager {
	/// Makes every tile of `range` present in the cache (or verified
	/// uncoverable). Used by map assembly and by the seeder. Returns the
	/// tiles computed during this call, so results survive failed or
	/// disabled storage for the lifetime of the request.
	pub async fn ensure_range(&self, range: &TileRange, refresh: bool) -> Result<HashMap<TileCoord, CacheTile>> {
		let coords: Vec<TileCoord> = range.iter().collect();
		self.ensure_tiles(&coords, refresh).await
	}

	/// Resolves misses among `coords`. With `refresh`, entries stale per
	/// `refresh_before` are rebuilt as well.
	pub async fn ensure_tiles(&self, coords: &[TileCoord], refresh: bool) -> Result<HashMap<TileCoord, CacheTile>> {
		let with_metadata = refresh && self.inner.options.refresh_before.is_some();
		let current = self.load_many_or_miss(coords, with_metadata).await;
		let missing: Vec<TileCoord> = coords
			.iter()
			.zip(&current)
			.filter(|(_, tile)| match tile {
				None => true,
				Some(tile) => refresh && self.is_stale(tile),
			})
			.map(|(coord, _)| *coord)
			.collect();
		if missing.is_empty() {
			return Ok(HashMap::new());
		}

		let meta_size = self.effective_meta_size();
		let mut metas: BTreeMap<(u8, u32, u32), (MetaTile, Vec<TileCoord>)> = BTreeMap::new();
		for coord in &missing {
			let meta = self.inner.grid.meta_tile(coord, meta_size);
			metas
				.entry((meta.z, meta.mx, meta.my))
				.or_insert_with(|| (meta, Vec::new()))
				.1
				.push(*coord);
		}
		trace!(
			"{}: {} misses in {} meta-tiles",
			self.inner.name,
			missing.len(),
			metas.len()
		);

		let built = try_join_all(
			metas
				.into_values()
				.map(|(meta, wanted)| self.build_meta(meta, wanted, meta_size, refresh)),
		)
		.await?;
		Ok(built
			.into_iter()
			.flatten()
			.map(|tile| (tile.coord, tile))
			.collect())
	}

	/// Meta-tiles are only worthwhile when every source can render arbitrary
	/// bboxes; tile-based sources fall back to per-tile requests, grouped
	/// under one lock only with `bulk_meta_tiles`.
	fn effective_meta_size(&self) -> (u32, u32) {
		if self.sources_render_meta() || self.inner.options.bulk_meta_tiles {
			self.inner.options.meta_size
		} else {
			(1, 1)
		}
	}

	fn sources_render_meta(&self) -> bool {
		self.inner.sources.iter().all(|s| s.supports_meta_tiles())
	}

	/// Computes one meta-tile: lock, double-check, fetch, split, store.
	/// Returns the tiles this call computed (empty when another worker was
	/// faster; the cache has them then). With `minimize_meta_requests`, only
	/// the `wanted` tiles count; the fetch shrinks to their bounding
	/// rectangle instead of the full meta-tile.
	async fn build_meta(
		&self,
		meta: MetaTile,
		wanted: Vec<TileCoord>,
		meta_size: (u32, u32),
		refresh: bool,
	) -> Result<Vec<CacheTile>> {
		let _creator = self
			.inner
			.creators
			.acquire()
			.await
			.context("tile creator semaphore closed")?;
		let key = self.meta_fingerprint(meta.z, meta.mx, meta.my);
		let _lock = self.inner.locker.lock(&key).await?;

		let grid = &self.inner.grid;
		let range = grid.meta_tile_range(&meta, meta_size)?;
		let minimize = self.inner.options.minimize_meta_requests;
		let coords: Vec<TileCoord> = if minimize { wanted } else { range.iter().collect() };

		// another worker may have built this meta while we waited on the lock
		let with_metadata = refresh && self.inner.options.refresh_before.is_some();
		let current = self.load_many_or_miss(&coords, with_metadata).await;
		let missing: Vec<TileCoord> = coords
			.iter()
			.zip(&current)
			.filter(|(_, tile)| match tile {
				None => true,
				Some(tile) => refresh && self.is_stale(tile),
			})
			.map(|(coord, _)| *coord)
			.collect();
		if missing.is_empty() {
			trace!("{key}: filled by another worker");
			return Ok(Vec::new());
		}

		let fetch_range = if minimize { bounding_range(&missing) } else { range };

		let mut built = Vec::new();
		if self.sources_render_meta() {
			let (bbox, size_px) = grid.buffered_bbox(&fetch_range, self.inner.options.meta_buffer)?;
			debug!("{key}: rendering {size_px:?} px for {} tiles", fetch_range.len());
			let query = self.upstream_query(bbox, size_px);
			if let Some(image) = self.render_sources(&query).await? {
				built = self.split_and_store(&image, &fetch_range).await?;
			}
		} else {
			for coord in &missing {
				let query = self.upstream_query(grid.tile_bbox(coord)?, grid.tile_size());
				if let Some(image) = self.render_sources(&query).await? {
					built.push(self.encode_and_store(coord, &image).await?);
				}
			}
		}
		Ok(built)
	}

	/// Fans out to all applicable sources, merges bottom-to-top.
	///
	/// Returns `None` when no source covers the request at all (nothing to
	/// store); a request covered by sources that all failed under a
	/// non-raising error policy yields a transparent image instead.
	pub(crate) async fn render_sources(&self, query: &MapQuery) -> Result<Option<GeoImage>> {
		let res = query.resolution();
		let mut picked: Vec<Arc<dyn Source>> = Vec::new();
		for source in &self.inner.sources {
			if source.seed_only() && !self.seeding {
				continue;
			}
			if source.res_range().is_some_and(|range| !range.contains(res)) {
				continue;
			}
			if let Some(coverage) = source.coverage() {
				if !coverage.intersects(&query.bbox, &query.srs).unwrap_or(false) {
					continue;
				}
			}
			picked.push(source.clone());
		}
		if picked.is_empty() {
			return Ok(None);
		}

		let semaphore = Arc::new(Semaphore::new(self.inner.globals.concurrent_layer_renderer));
		let results = join_all(picked.iter().map(|source| {
			let semaphore = semaphore.clone();
			async move {
				let _permit = semaphore.acquire().await.context("renderer semaphore closed")?;
				let mut image = self.fetch_with_retry(source, query).await?;
				self.clip_to_coverage(source, query, &mut image)?;
				Ok::<GeoImage, anyhow::Error>(image)
			}
		}))
		.await;

		let mut canvas: Option<GeoImage> = None;
		for result in results {
			match result {
				Ok(image) => match &mut canvas {
					None => canvas = Some(image),
					Some(canvas) => composite_over(canvas, &image)?,
				},
				Err(err) => match self.inner.on_source_errors {
					SourceErrorPolicy::Raise => return Err(err),
					SourceErrorPolicy::Notify => warn!("source failed, substituting transparency: {err:#}"),
					SourceErrorPolicy::Ignore => debug!("source failed, substituting transparency: {err:#}"),
				},
			}
		}
		match canvas {
			Some(canvas) => Ok(Some(canvas)),
			// every source failed, policy says keep going
			None => Ok(Some(self.transparent(query)?)),
		}
	}

	fn transparent(&self, query: &MapQuery) -> Result<GeoImage> {
		GeoImage::blank(query.size, [0, 0, 0, 0], query.bbox, query.srs.clone())
	}

	/// Pixels outside the source coverage become transparent, so a partially
	/// covering source never paints into its neighbor's area.
	fn clip_to_coverage(&self, source: &Arc<dyn Source>, query: &MapQuery, image: &mut GeoImage) -> Result<()> {
		let Some(coverage) = source.coverage() else {
			return Ok(());
		};
		if coverage.contains(&query.bbox, &query.srs)? {
			return Ok(());
		}
		let local = coverage.transformed(&query.srs)?;
		if let Some(mask) = local.mask(&query.bbox, query.size)? {
			apply_coverage_mask(image, &mask)?;
		}
		Ok(())
	}

	/// One source call with SRS negotiation and bounded retries. 4xx
	/// responses are never retried; connection errors and 5xx are, twice for
	/// live requests and patiently while seeding.
	async fn fetch_with_retry(&self, source: &Arc<dyn Source>, query: &MapQuery) -> Result<GeoImage> {
		let retries = self.max_retries();
		let mut attempt = 0usize;
		loop {
			match self.fetch_once(source, query).await {
				Ok(image) => return Ok(image),
				Err(err) => {
					let retryable = err.downcast_ref::<SourceError>().is_some_and(|e| e.is_retryable());
					if !retryable || attempt >= retries {
						return Err(err);
					}
					let backoff = (Duration::from_millis(100) * 2u32.pow(attempt.min(6) as u32)).min(MAX_BACKOFF);
					debug!("retrying source after {backoff:?} (attempt {attempt}): {err:#}");
					tokio::time::sleep(backoff).await;
					attempt += 1;
				}
			}
		}
	}

	async fn fetch_once(&self, source: &Arc<dyn Source>, query: &MapQuery) -> Result<GeoImage> {
		if source.supports_srs(&query.srs) {
			return source.get_map(query).await;
		}
		// negotiate: query in the source's first supported SRS, warp back
		let target = source
			.supported_srs()
			.and_then(|list| list.first())
			.context("source declares no supported SRS")?
			.clone();
		let bbox = query.srs.transform_bbox(&target, &query.bbox, 8)?;
		let sub_query = MapQuery {
			bbox,
			srs: target,
			size: query.size,
			format: query.format,
			transparent: query.transparent,
		};
		let image = source.get_map(&sub_query).await?;
		tilerelay_image::reproject(&image, &query.bbox, &query.srs, query.size, self.inner.resampling)
	}

	/// Splits a rendered (meta) image back into tiles at grid alignment and
	/// stores each one.
	async fn split_and_store(&self, image: &GeoImage, range: &TileRange) -> Result<Vec<CacheTile>> {
		let grid = &self.inner.grid;
		let mut built = Vec::with_capacity(range.len() as usize);
		for coord in range.iter() {
			let tile_bbox = grid.tile_bbox(&coord)?;
			let tile_image = extract(image, &tile_bbox, grid.tile_size(), Resampling::Nearest)?;
			built.push(self.encode_and_store(&coord, &tile_image).await?);
		}
		Ok(built)
	}

	/// Encodes one computed tile, writes it (best effort, see `store_tile`)
	/// and returns it for the request that produced it.
	pub(crate) async fn encode_and_store(&self, coord: &TileCoord, image: &GeoImage) -> Result<CacheTile> {
		// fully transparent areas become a distinguished empty marker instead
		// of an encoded payload
		let tile = if image.is_transparent() && self.inner.options.link_single_color_images {
			CacheTile::new_empty(*coord)
		} else {
			let (bytes, content_type) = encode_image(image, self.inner.options.format, &self.inner.encoding)?;
			let mut tile = CacheTile::new(*coord, bytes, content_type);
			if self.inner.cache.capabilities().supports_link_identical {
				if let Some(color) = image.single_color() {
					tile = tile.with_single_color(color);
				}
			}
			tile
		};
		self.store_tile(&tile).await;
		Ok(tile)
	}

	/// Rebuilds a missing tile from cached neighbors on other levels, when
	/// `upscale_tiles`/`downscale_tiles` allows. Only cached data is used; no
	/// source requests happen here.
	pub(crate) async fn fill_from_other_levels(&self, coord: &TileCoord) -> Result<Option<GeoImage>> {
		let grid = &self.inner.grid;
		let tile_bbox = grid.tile_bbox(coord)?;

		if let Some(levels) = self.inner.options.upscale_tiles {
			for dz in 1..=levels {
				let Some(z) = coord.z.checked_sub(dz) else { break };
				if let Some(image) = self.compose_cached_bbox(&tile_bbox, z).await? {
					let scaled = extract(&image, &tile_bbox, grid.tile_size(), self.inner.resampling)?;
					return Ok(Some(scaled));
				}
			}
		}
		if let Some(levels) = self.inner.options.downscale_tiles {
			for dz in 1..=levels {
				let z = coord.z + dz;
				if z >= grid.num_levels() {
					break;
				}
				if let Some(image) = self.compose_cached_bbox(&tile_bbox, z).await? {
					let scaled = extract(&image, &tile_bbox, grid.tile_size(), self.inner.resampling)?;
					return Ok(Some(scaled));
				}
			}
		}
		Ok(None)
	}

	/// Mosaic of the cached tiles covering `bbox` at level `z`, or `None`
	/// unless every needed tile is present.
	async fn compose_cached_bbox(&self, bbox: &tilerelay_core::MapBBox, z: u8) -> Result<Option<GeoImage>> {
		let grid = &self.inner.grid;
		let Some(range) = grid.tiles_for_bbox(bbox, z)? else {
			return Ok(None);
		};
		let coords: Vec<TileCoord> = range.iter().collect();
		let tiles = self.load_many_or_miss(&coords, false).await;
		if tiles.iter().any(|t| t.is_none()) {
			return Ok(None);
		}

		let (tile_w, tile_h) = grid.tile_size();
		let cols = range.x1 - range.x0 + 1;
		let rows = range.y1 - range.y0 + 1;
		let mut canvas = GeoImage::blank(
			(cols * tile_w, rows * tile_h),
			[0, 0, 0, 0],
			grid.tiles_bbox(&range)?,
			grid.srs().clone(),
		)?;
		for (coord, tile) in coords.iter().zip(tiles) {
			let Some(tile) = tile else { continue };
			let TileBody::Data { bytes, .. } = tile.body else {
				continue; // empty marker: stays transparent
			};
			let image = decode_image(&bytes, grid.tile_bbox(coord)?, grid.srs().clone())?;
			let col = coord.x - range.x0;
			let row = match grid.origin() {
				tilerelay_core::GridOrigin::NorthWest => coord.y - range.y0,
				tilerelay_core::GridOrigin::SouthWest => range.y1 - coord.y,
			};
			tilerelay_image::paste(&mut canvas, &image, i64::from(col * tile_w), i64::from(row * tile_h));
		}
		Ok(Some(canvas))
	}
}

/// Smallest rectangle of tiles containing all of `coords` (all on one level).
fn bounding_range(coords: &[TileCoord]) -> TileRange {
	let mut range = TileRange::single(coords[0]);
	for coord in &coords[1..] {
		range.x0 = range.x0.min(coord.x);
		range.y0 = range.y0.min(coord.y);
		range.x1 = range.x1.max(coord.x);
		range.y1 = range.y1.max(coord.y);
	}
	range
}
