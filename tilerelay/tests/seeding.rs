//! Seeding and cleanup driver tests against the in-memory backend.

use anyhow::Result;
use async_trait::async_trait;
use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::{Duration, SystemTime},
};
use tempfile::TempDir;
use tilerelay::TileManager;
use tilerelay::seed::{CleanupTask, NoProgress, ProgressFile, SeedTask, cleanup, seed};
use tilerelay_cache::{CacheBackend, memory::MemoryCache};
use tilerelay_core::{Coverage, MapBBox, Srs, TileCoord, TileGrid};
use tilerelay_image::GeoImage;
use tilerelay_source::{MapQuery, Source};

#[derive(Debug, Default)]
struct CountingSource {
	calls: AtomicUsize,
	seed_only: bool,
}

#[async_trait]
impl Source for CountingSource {
	async fn get_map(&self, query: &MapQuery) -> Result<GeoImage> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		GeoImage::blank(query.size, [80, 90, 100, 255], query.bbox, query.srs.clone())
	}

	fn seed_only(&self) -> bool {
		self.seed_only
	}
}

fn manager(cache: Arc<MemoryCache>, source: Arc<CountingSource>) -> TileManager {
	TileManager::builder("base", TileGrid::global_webmercator(), cache)
		.source(source)
		.build()
		.unwrap()
}

#[tokio::test]
async fn seeds_levels_within_coverage() {
	let cache = Arc::new(MemoryCache::new());
	let source = Arc::new(CountingSource::default());
	let manager = manager(cache.clone(), source.clone());

	// a small area around the origin
	let coverage = Coverage::from_bbox(
		MapBBox::new(-100_000.0, -100_000.0, 100_000.0, 100_000.0).unwrap(),
		Srs::from_epsg(3857).unwrap(),
	);
	let task = SeedTask {
		manager: manager.clone(),
		levels: (0, 4),
		coverage: Some(coverage),
	};
	let stats = seed(&task, None, &NoProgress).await.unwrap();

	assert!(stats.metas_built >= 5, "one meta per level at least: {stats:?}");
	// level 0 root tile is cached
	assert!(cache.load(&TileCoord::new(0, 0, 0), false).await.unwrap().is_some());
	// the seeded area at level 4 is around the grid center (tiles 7/8)
	assert!(cache.load(&TileCoord::new(4, 7, 7), false).await.unwrap().is_some());
	// far away tiles were never touched
	assert!(cache.load(&TileCoord::new(4, 0, 0), false).await.unwrap().is_none());
}

#[tokio::test]
async fn empty_coverage_is_a_noop() {
	let cache = Arc::new(MemoryCache::new());
	let source = Arc::new(CountingSource::default());
	let manager = manager(cache.clone(), source.clone());

	let task = SeedTask {
		manager,
		levels: (0, 3),
		coverage: Some(Coverage::empty(Srs::from_epsg(3857).unwrap())),
	};
	let stats = seed(&task, None, &NoProgress).await.unwrap();
	assert_eq!(stats.metas_built, 0);
	assert_eq!(source.calls.load(Ordering::SeqCst), 0);
	assert!(cache.is_empty());
}

#[tokio::test]
async fn seed_only_sources_participate_in_seeding() {
	let cache = Arc::new(MemoryCache::new());
	let source = Arc::new(CountingSource {
		calls: AtomicUsize::new(0),
		seed_only: true,
	});
	let manager = manager(cache.clone(), source.clone());

	// a live request ignores the seed-only source: blank, nothing stored
	manager.get_tile(TileCoord::new(0, 0, 0)).await.unwrap();
	assert_eq!(source.calls.load(Ordering::SeqCst), 0);

	let task = SeedTask {
		manager,
		levels: (0, 0),
		coverage: None,
	};
	seed(&task, None, &NoProgress).await.unwrap();
	assert_eq!(source.calls.load(Ordering::SeqCst), 1);
	assert!(cache.load(&TileCoord::new(0, 0, 0), false).await.unwrap().is_some());
}

#[tokio::test]
async fn seeding_records_and_resumes_progress() {
	let dir = TempDir::new().unwrap();
	let progress_path = dir.path().join("seed.progress");

	let cache = Arc::new(MemoryCache::new());
	let source = Arc::new(CountingSource::default());
	let manager = manager(cache.clone(), source.clone());
	let task = SeedTask {
		manager: manager.clone(),
		levels: (0, 3),
		coverage: None,
	};

	let progress = ProgressFile::open(&progress_path).unwrap();
	let stats = seed(&task, Some(&progress), &NoProgress).await.unwrap();
	assert!(stats.metas_built > 0);
	// finished tasks are cleared, so a re-run starts from scratch
	let calls_after_first = source.calls.load(Ordering::SeqCst);

	// already cached: the second run builds nothing new
	let progress = ProgressFile::open(&progress_path).unwrap();
	seed(&task, Some(&progress), &NoProgress).await.unwrap();
	assert_eq!(source.calls.load(Ordering::SeqCst), calls_after_first);
}

#[tokio::test]
async fn cleanup_removes_only_old_tiles() {
	let cache = Arc::new(MemoryCache::new());
	let source = Arc::new(CountingSource::default());
	let manager = manager(cache.clone(), source.clone());

	let task = SeedTask {
		manager: manager.clone(),
		levels: (2, 2),
		coverage: None,
	};
	seed(&task, None, &NoProgress).await.unwrap();
	let seeded = cache.len();
	assert_eq!(seeded, 16);

	// age half of level 2
	for x in 0..4u32 {
		for y in 0..2u32 {
			cache.set_mtime(&TileCoord::new(2, x, y), SystemTime::now() - Duration::from_secs(7200));
		}
	}

	let stats = cleanup(&CleanupTask {
		manager: manager.clone(),
		levels: (2, 2),
		coverage: None,
		remove_before: SystemTime::now() - Duration::from_secs(3600),
	})
	.await
	.unwrap();

	assert_eq!(stats.tiles_checked, 16);
	assert_eq!(stats.tiles_removed, 8);
	assert_eq!(cache.len(), 8);
	assert!(cache.load(&TileCoord::new(2, 0, 0), false).await.unwrap().is_none());
	assert!(cache.load(&TileCoord::new(2, 0, 3), false).await.unwrap().is_some());
}
