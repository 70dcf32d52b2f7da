//! End-to-end scenarios for the tile-request fulfillment pipeline, run
//! against the in-memory cache backend and a recording mock source.

use anyhow::Result;
use async_trait::async_trait;
use std::{
	sync::{
		Arc, Mutex,
		atomic::{AtomicU8, AtomicUsize, Ordering},
	},
	time::{Duration, SystemTime},
};
use tilerelay::{Layer, LayerEntry, SourceErrorPolicy, TileManager, TileService};
use tilerelay_cache::{CacheBackend, TileBody, memory::MemoryCache};
use tilerelay_core::{CacheOptions, GridBuilder, MapBBox, Srs, SourceError, TileCoord, TileFormat, TileGrid};
use tilerelay_image::{GeoImage, decode_image};
use tilerelay_source::{MapQuery, Source};

/// A source that renders a solid color and records every query.
#[derive(Debug)]
struct MockSource {
	color: Arc<AtomicU8>,
	calls: Arc<AtomicUsize>,
	queries: Arc<Mutex<Vec<MapQuery>>>,
	supported_srs: Option<Vec<Srs>>,
	fail_status: Option<u16>,
	alpha: u8,
}

impl MockSource {
	fn new(color: u8) -> MockSource {
		MockSource {
			color: Arc::new(AtomicU8::new(color)),
			calls: Arc::new(AtomicUsize::new(0)),
			queries: Arc::new(Mutex::new(Vec::new())),
			supported_srs: None,
			fail_status: None,
			alpha: 255,
		}
	}

	fn with_srs(mut self, srs: Srs) -> MockSource {
		self.supported_srs = Some(vec![srs]);
		self
	}

	fn failing(mut self, status: u16) -> MockSource {
		self.fail_status = Some(status);
		self
	}

	fn with_alpha(mut self, alpha: u8) -> MockSource {
		self.alpha = alpha;
		self
	}

	fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	fn queries(&self) -> Vec<MapQuery> {
		self.queries.lock().unwrap().clone()
	}
}

#[async_trait]
impl Source for MockSource {
	async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		self.queries.lock().unwrap().push(query.clone());
		if let Some(status) = self.fail_status {
			return Err(SourceError::http(status, "mock failure").into());
		}
		let c = self.color.load(Ordering::SeqCst);
		GeoImage::blank(query.size, [c, c, c, self.alpha], query.bbox, query.srs.clone())
	}

	fn supported_srs(&self) -> Option<&[Srs]> {
		self.supported_srs.as_deref()
	}
}

struct Harness {
	manager: TileManager,
	cache: Arc<MemoryCache>,
	source: Arc<MockSource>,
}

fn harness(options: CacheOptions) -> Harness {
	harness_with(TileGrid::global_webmercator(), MockSource::new(120), options)
}

fn harness_with(grid: TileGrid, source: MockSource, options: CacheOptions) -> Harness {
	let _ = env_logger::builder().is_test(true).try_init();
	let cache = Arc::new(MemoryCache::new());
	let source = Arc::new(source);
	let manager = TileManager::builder("osm", grid, cache.clone())
		.source(source.clone())
		.options(options)
		.build()
		.unwrap();
	Harness { manager, cache, source }
}

fn webmercator() -> Srs {
	Srs::from_epsg(3857).unwrap()
}

// Scenario 1: a single cold tile triggers one upstream request; a second
// request for the same tile is answered without upstream traffic.
#[tokio::test]
async fn cold_tile_hits_source_once() {
	let h = harness(CacheOptions::default());

	let tile = h.manager.get_tile(TileCoord::new(0, 0, 0)).await.unwrap();
	assert_eq!(tile.content_type, "image/png");
	assert_eq!(h.source.calls(), 1);
	let image = decode_image(&tile.bytes, *h.manager.grid().bbox(), webmercator()).unwrap();
	assert_eq!(image.size(), (256, 256));
	assert_eq!(image.single_color(), Some([120, 120, 120, 255]));

	let again = h.manager.get_tile(TileCoord::new(0, 0, 0)).await.unwrap();
	assert_eq!(again.bytes, tile.bytes, "cache must return the stored bytes");
	assert_eq!(h.source.calls(), 1, "second request must not reach the source");
}

// Scenario 2: concurrent requests for the 16 tiles of one meta-tile coalesce
// into a single buffered upstream request; all 16 tiles are stored.
#[tokio::test]
async fn meta_tile_coalesces_concurrent_misses() {
	let h = harness(CacheOptions::default());

	let mut tasks = Vec::new();
	for y in 0..4u32 {
		for x in 0..4u32 {
			let manager = h.manager.clone();
			tasks.push(tokio::spawn(async move { manager.get_tile(TileCoord::new(5, x, y)).await }));
		}
	}
	for task in tasks {
		task.await.unwrap().unwrap();
	}

	assert_eq!(h.source.calls(), 1, "all 16 misses must share one source request");
	assert_eq!(h.cache.len(), 16);

	// the single request covered the meta bbox plus the 80 px buffer,
	// clipped at the grid corner
	let queries = h.source.queries();
	let query = &queries[0];
	assert_eq!(query.size, (1024 + 80, 1024 + 80));
	assert!(query.srs.is_same(&webmercator()));
}

// Scenario 3: UTM cache over a web-mercator-only source, queried in
// geographic coordinates. The source sees only EPSG:3857 requests and the
// response is resampled to the requested size.
#[tokio::test]
async fn reprojection_pipeline() {
	let grid = GridBuilder::new(
		"utm32",
		Srs::from_epsg(25832).unwrap(),
		MapBBox::new(0.0, 4_800_000.0, 1_200_000.0, 6_400_000.0).unwrap(),
	)
	.num_levels(12)
	.build()
	.unwrap();
	let h = harness_with(grid, MockSource::new(90).with_srs(webmercator()), CacheOptions::default());

	let query = MapQuery {
		bbox: MapBBox::new(4.0, 46.0, 16.0, 56.0).unwrap(),
		srs: Srs::from_epsg(4326).unwrap(),
		size: (800, 600),
		format: TileFormat::Png,
		transparent: true,
	};
	let image = h.manager.get_map(&query).await.unwrap();

	assert_eq!(image.size(), (800, 600));
	assert!(h.source.calls() >= 1);
	for seen in h.source.queries() {
		assert!(
			seen.srs.is_same(&webmercator()),
			"source must only be queried in EPSG:3857, saw {:?}",
			seen.srs
		);
	}
	// the center of the request lies inside the grid and source coverage
	let center = image.as_rgba().get_pixel(400, 300).0;
	assert_eq!(center, [90, 90, 90, 255]);
}

// Scenario 4: mixed format stores PNG for tiles with alpha and JPEG for
// opaque ones; the cache read returns the matching content type.
#[tokio::test]
async fn mixed_format_picks_content_type() {
	let mut options = CacheOptions::default();
	options.format = TileFormat::Mixed;

	let opaque = harness_with(TileGrid::global_webmercator(), MockSource::new(10), options.clone());
	let tile = opaque.manager.get_tile(TileCoord::new(2, 1, 1)).await.unwrap();
	assert_eq!(tile.content_type, "image/jpeg");

	let translucent = harness_with(
		TileGrid::global_webmercator(),
		MockSource::new(10).with_alpha(200),
		options,
	);
	let tile = translucent.manager.get_tile(TileCoord::new(2, 1, 1)).await.unwrap();
	assert_eq!(tile.content_type, "image/png");
}

// Scenario 5: with on_source_errors=raise, one failing source aborts the
// request and nothing is stored.
#[tokio::test]
async fn source_error_raises_and_stores_nothing() {
	let cache = Arc::new(MemoryCache::new());
	let good = Arc::new(MockSource::new(50));
	let bad = Arc::new(MockSource::new(0).failing(404));
	let manager = TileManager::builder("osm", TileGrid::global_webmercator(), cache.clone())
		.source(good.clone())
		.source(bad.clone())
		.on_source_errors(SourceErrorPolicy::Raise)
		.build()
		.unwrap();

	let err = manager.get_tile(TileCoord::new(3, 1, 1)).await.unwrap_err();
	let source_err = err.downcast_ref::<SourceError>().expect("SourceError");
	assert_eq!(source_err.status, Some(404));
	assert_eq!(cache.len(), 0, "no tile may be stored after a raised source error");
}

// With on_source_errors=ignore, the failing source contributes transparency
// and the surviving source still renders.
#[tokio::test]
async fn source_error_ignored_substitutes_transparency() {
	let cache = Arc::new(MemoryCache::new());
	let good = Arc::new(MockSource::new(50));
	let bad = Arc::new(MockSource::new(0).failing(404));
	let manager = TileManager::builder("osm", TileGrid::global_webmercator(), cache.clone())
		.source(good.clone())
		.source(bad.clone())
		.on_source_errors(SourceErrorPolicy::Ignore)
		.build()
		.unwrap();

	let tile = manager.get_tile(TileCoord::new(3, 1, 1)).await.unwrap();
	let image = decode_image(
		&tile.bytes,
		manager.grid().tile_bbox(&TileCoord::new(3, 1, 1)).unwrap(),
		webmercator(),
	)
	.unwrap();
	assert_eq!(image.single_color(), Some([50, 50, 50, 255]));
}

// Scenario 6: a stale tile is served immediately while a background refresh
// replaces it; the next request returns fresh bytes.
#[tokio::test]
async fn refresh_while_serving() {
	let mut options = CacheOptions::default();
	options.refresh_before = Some(Duration::from_secs(60));
	options.refresh_while_serving = true;
	let h = harness(options);

	let coord = TileCoord::new(4, 2, 2);
	let first = h.manager.get_tile(coord).await.unwrap();
	assert_eq!(h.source.calls(), 1);

	// age every tile of the meta and change what the source would render
	for c in h.manager.grid().meta_tile_range(&h.manager.grid().meta_tile(&coord, (4, 4)), (4, 4)).unwrap().iter() {
		h.cache.set_mtime(&c, SystemTime::now() - Duration::from_secs(3600));
	}
	h.source.color.store(200, Ordering::SeqCst);

	// stale hit: served immediately from the cache
	let stale = h.manager.get_tile(coord).await.unwrap();
	assert_eq!(stale.bytes, first.bytes, "stale tile must be served as-is");

	// the background refresh lands shortly after
	let deadline = SystemTime::now() + Duration::from_secs(10);
	loop {
		tokio::time::sleep(Duration::from_millis(25)).await;
		let tile = h.cache.load(&coord, false).await.unwrap().unwrap();
		if let TileBody::Data { bytes, .. } = &tile.body {
			if bytes != &first.bytes {
				break;
			}
		}
		assert!(SystemTime::now() < deadline, "background refresh never happened");
	}

	let fresh = h.manager.get_tile(coord).await.unwrap();
	let image = decode_image(&fresh.bytes, h.manager.grid().tile_bbox(&coord).unwrap(), webmercator()).unwrap();
	assert_eq!(image.single_color(), Some([200, 200, 200, 255]));
}

// use_direct_from_level bypasses cache storage entirely.
#[tokio::test]
async fn direct_path_skips_cache() {
	let mut options = CacheOptions::default();
	options.use_direct_from_level = Some(3);
	let h = harness(options);

	let grid = h.manager.grid().clone();
	let bbox = grid.tile_bbox(&TileCoord::new(5, 10, 10)).unwrap();
	let query = MapQuery {
		bbox,
		srs: webmercator(),
		size: (256, 256),
		format: TileFormat::Png,
		transparent: true,
	};
	let image = h.manager.get_map(&query).await.unwrap();
	assert_eq!(image.single_color(), Some([120, 120, 120, 255]));
	assert_eq!(h.source.calls(), 1);
	assert_eq!(h.cache.len(), 0, "direct path must not write to the cache");
}

// disable_storage renders but never writes; the computed tile is still
// served from the request's own result set.
#[tokio::test]
async fn disable_storage_serves_without_writing() {
	let mut options = CacheOptions::default();
	options.disable_storage = true;
	let h = harness(options);

	let coord = TileCoord::new(3, 2, 2);
	let tile = h.manager.get_tile(coord).await.unwrap();
	let image = decode_image(&tile.bytes, h.manager.grid().tile_bbox(&coord).unwrap(), webmercator()).unwrap();
	assert_eq!(image.single_color(), Some([120, 120, 120, 255]));
	assert_eq!(h.cache.len(), 0);

	// every request renders again
	h.manager.get_tile(coord).await.unwrap();
	assert_eq!(h.source.calls(), 2);
}

// minimize_meta_requests shrinks the upstream request to the bounding
// rectangle of the actually missing tiles.
#[tokio::test]
async fn minimized_meta_requests_fetch_only_missing() {
	let mut options = CacheOptions::default();
	options.minimize_meta_requests = true;
	options.meta_buffer = 0;
	let h = harness(options);

	h.manager.get_tile(TileCoord::new(5, 0, 0)).await.unwrap();
	assert_eq!(h.cache.len(), 1, "only the missing tile is fetched and stored");

	h.manager.get_tile(TileCoord::new(5, 3, 3)).await.unwrap();
	assert_eq!(h.source.calls(), 2);
	for query in h.source.queries() {
		assert_eq!(query.size, (256, 256));
	}
	assert_eq!(h.cache.len(), 2);
}

// With upscale_tiles, a level no source can serve is rebuilt from coarser
// cached tiles instead of coming back blank.
#[tokio::test]
async fn upscale_fills_from_coarser_level() {
	#[derive(Debug)]
	struct ResLimited(Arc<MockSource>, tilerelay_source::ResRange);
	#[async_trait]
	impl Source for ResLimited {
		async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
			self.0.get_map(query).await
		}
		fn res_range(&self) -> Option<&tilerelay_source::ResRange> {
			Some(&self.1)
		}
	}

	let grid = TileGrid::global_webmercator();
	let cache = Arc::new(MemoryCache::new());
	let source = Arc::new(MockSource::new(60));
	let range = tilerelay_source::ResRange {
		min_res: None,
		// nothing finer than level 3
		max_res: Some(grid.resolution(4).unwrap()),
	};
	let mut options = CacheOptions::default();
	options.upscale_tiles = Some(1);
	let manager = TileManager::builder("osm", grid.clone(), cache.clone())
		.source(Arc::new(ResLimited(source.clone(), range)))
		.options(options)
		.build()
		.unwrap();

	// fill level 3 (the source can serve it)
	manager.get_tile(TileCoord::new(3, 1, 1)).await.unwrap();
	let calls_after_seed = source.calls();
	assert!(calls_after_seed >= 1);

	// level 4 cannot be rendered; it is upscaled from the level 3 tile
	let tile = manager.get_tile(TileCoord::new(4, 2, 2)).await.unwrap();
	assert_eq!(source.calls(), calls_after_seed, "no source call for the upscaled tile");
	let image = decode_image(
		&tile.bytes,
		grid.tile_bbox(&TileCoord::new(4, 2, 2)).unwrap(),
		webmercator(),
	)
	.unwrap();
	assert_eq!(image.single_color(), Some([60, 60, 60, 255]));
}

// A request entirely outside every source coverage yields a blank image and
// stores nothing.
#[tokio::test]
async fn out_of_coverage_is_blank() {
	let cache = Arc::new(MemoryCache::new());
	let source = Arc::new(MockSource::new(70));
	let coverage = tilerelay_core::Coverage::from_bbox(
		MapBBox::new(10_000_000.0, 10_000_000.0, 11_000_000.0, 11_000_000.0).unwrap(),
		webmercator(),
	);

	// wrap the mock to attach a coverage
	#[derive(Debug)]
	struct Covered(Arc<MockSource>, tilerelay_core::Coverage);
	#[async_trait]
	impl Source for Covered {
		async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
			self.0.get_map(query).await
		}
		fn coverage(&self) -> Option<&tilerelay_core::Coverage> {
			Some(&self.1)
		}
	}

	let manager = TileManager::builder("osm", TileGrid::global_webmercator(), cache.clone())
		.source(Arc::new(Covered(source.clone(), coverage)))
		.build()
		.unwrap();

	// tile at the opposite corner of the world
	let tile = manager.get_tile(TileCoord::new(5, 1, 30)).await.unwrap();
	let image = decode_image(
		&tile.bytes,
		manager.grid().tile_bbox(&TileCoord::new(5, 1, 30)).unwrap(),
		webmercator(),
	)
	.unwrap();
	assert!(image.is_transparent());
	assert_eq!(source.calls(), 0);
	assert_eq!(cache.len(), 0);
}

// The service facade wires layers, grids and encoding together.
#[tokio::test]
async fn service_round_trip() {
	let h = harness(CacheOptions::default());
	let layer = Layer::new("osm", vec![LayerEntry::cached(vec![h.manager.clone()])]);
	let service = TileService::new(vec![Arc::new(layer)]);

	let tile = service.get_tile("osm", "GLOBAL_WEBMERCATOR", 1, 0, 1).await.unwrap();
	assert_eq!(tile.content_type, "image/png");

	let (bytes, content_type) = service
		.get_map(
			"osm",
			MapBBox::new(-10_000.0, -10_000.0, 10_000.0, 10_000.0).unwrap(),
			webmercator(),
			(300, 300),
			TileFormat::Png,
		)
		.await
		.unwrap();
	assert_eq!(content_type, "image/png");
	let image = decode_image(
		&bytes,
		MapBBox::new(-10_000.0, -10_000.0, 10_000.0, 10_000.0).unwrap(),
		webmercator(),
	)
	.unwrap();
	assert_eq!(image.size(), (300, 300));

	assert!(service.get_tile("nope", "GLOBAL_WEBMERCATOR", 0, 0, 0).await.is_err());
	assert!(service.get_tile("osm", "no-such-grid", 0, 0, 0).await.is_err());
}
