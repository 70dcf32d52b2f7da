//! Seeding and cleanup driver.
//!
//! Seeding walks the pyramid level by level and pushes whole meta-tiles
//! through the same tile-manager operations a live request would use, so
//! locking, retries and storage behave identically. Progress is tracked per
//! meta-row and persisted to a JSON file with atomic replace, which makes an
//! interrupted run resumable. Cleanup walks cached tiles and removes entries
//! older than a cut-off.

use crate::TileManager;
use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{
	collections::HashMap,
	fs,
	path::PathBuf,
	sync::Mutex,
	time::SystemTime,
};
use tilerelay_core::{Coverage, MetaTile};

/// One seeding job: levels of one cache, optionally restricted by coverage.
pub struct SeedTask {
	pub manager: TileManager,
	/// Inclusive level range.
	pub levels: (u8, u8),
	pub coverage: Option<Coverage>,
}

/// One cleanup job: drop entries older than `remove_before`.
pub struct CleanupTask {
	pub manager: TileManager,
	pub levels: (u8, u8),
	pub coverage: Option<Coverage>,
	pub remove_before: SystemTime,
}

/// Receives progress callbacks; implement for progress bars or logs.
pub trait ProgressSink: Send + Sync {
	fn meta_done(&self, _level: u8, _done: u64, _total: u64) {}
	fn level_done(&self, _level: u8) {}
}

/// Discards all progress reports.
pub struct NoProgress;

impl ProgressSink for NoProgress {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProgressState {
	/// task id → level → completed meta rows
	tasks: HashMap<String, HashMap<u8, u32>>,
}

/// Persistent seeding progress enabling `--continue`.
#[derive(Debug)]
pub struct ProgressFile {
	path: PathBuf,
	state: Mutex<ProgressState>,
}

impl ProgressFile {
	/// Opens an existing progress file or starts fresh.
	pub fn open(path: impl Into<PathBuf>) -> Result<ProgressFile> {
		let path = path.into();
		let state = match fs::read(&path) {
			Ok(bytes) => serde_json::from_slice(&bytes).context("parsing seed progress file")?,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => ProgressState::default(),
			Err(err) => return Err(err).context("reading seed progress file"),
		};
		Ok(ProgressFile {
			path,
			state: Mutex::new(state),
		})
	}

	fn rows_done(&self, task: &str, level: u8) -> u32 {
		let state = self.state.lock().unwrap();
		state.tasks.get(task).and_then(|levels| levels.get(&level)).copied().unwrap_or(0)
	}

	fn set_rows_done(&self, task: &str, level: u8, rows: u32) -> Result<()> {
		let serialized = {
			let mut state = self.state.lock().unwrap();
			state.tasks.entry(task.to_string()).or_default().insert(level, rows);
			serde_json::to_vec_pretty(&*state)?
		};
		// atomic replace so an interrupted run never truncates the file
		let tmp = self.path.with_extension("tmp");
		fs::write(&tmp, serialized).context("writing seed progress")?;
		fs::rename(&tmp, &self.path).context("publishing seed progress")?;
		Ok(())
	}

	fn clear_task(&self, task: &str) -> Result<()> {
		let serialized = {
			let mut state = self.state.lock().unwrap();
			state.tasks.remove(task);
			serde_json::to_vec_pretty(&*state)?
		};
		let tmp = self.path.with_extension("tmp");
		fs::write(&tmp, serialized).context("writing seed progress")?;
		fs::rename(&tmp, &self.path).context("publishing seed progress")?;
		Ok(())
	}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedStats {
	pub metas_built: u64,
	pub metas_skipped: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
	pub tiles_checked: u64,
	pub tiles_removed: u64,
}

fn task_id(manager: &TileManager) -> String {
	format!("{}@{}", manager.name(), manager.grid().name())
}

/// Runs a seeding task. With a progress file, completed meta-rows are skipped
/// on resume and recorded as they finish.
pub async fn seed(task: &SeedTask, progress: Option<&ProgressFile>, sink: &dyn ProgressSink) -> Result<SeedStats> {
	let manager = task.manager.for_seeding();
	let grid = manager.grid().clone();
	let mut stats = SeedStats::default();

	// empty coverage: a no-op, not an error
	let coverage = match &task.coverage {
		Some(coverage) => {
			if coverage.is_empty() {
				info!("seed {}: empty coverage, nothing to do", task_id(&manager));
				return Ok(stats);
			}
			Some(coverage.transformed(grid.srs())?)
		}
		None => None,
	};

	let id = task_id(&manager);
	let (meta_w, meta_h) = manager.options().meta_size;
	let (level_min, level_max) = task.levels;

	for z in level_min..=level_max.min(grid.num_levels() - 1) {
		let seed_bbox = match &coverage {
			Some(coverage) => *coverage.bbox(),
			None => *grid.bbox(),
		};
		let Some(range) = grid.tiles_for_bbox(&seed_bbox, z)? else {
			continue;
		};

		let meta_y0 = range.y0 / meta_h;
		let meta_y1 = range.y1 / meta_h;
		let meta_x0 = range.x0 / meta_w;
		let meta_x1 = range.x1 / meta_w;
		let total_rows = u64::from(meta_y1 - meta_y0 + 1);
		let total = total_rows * u64::from(meta_x1 - meta_x0 + 1);

		let resume_rows = progress.map_or(0, |p| p.rows_done(&id, z));
		if resume_rows > 0 {
			info!("seed {id}: resuming level {z} at meta row {resume_rows}/{total_rows}");
		}

		let mut done = u64::from(resume_rows) * u64::from(meta_x1 - meta_x0 + 1);
		for (row_index, my) in (meta_y0..=meta_y1).enumerate() {
			if (row_index as u32) < resume_rows {
				continue;
			}
			for mx in meta_x0..=meta_x1 {
				let meta = MetaTile { z, mx, my };
				let meta_range = grid.meta_tile_range(&meta, (meta_w, meta_h))?;
				let meta_bbox = grid.tiles_bbox(&meta_range)?;
				if let Some(coverage) = &coverage {
					if !coverage.intersects(&meta_bbox, grid.srs())? {
						stats.metas_skipped += 1;
						done += 1;
						continue;
					}
				}
				debug!("seed {id}: building {meta:?}");
				manager.ensure_range(&meta_range, true).await?;
				stats.metas_built += 1;
				done += 1;
				sink.meta_done(z, done, total);
			}
			if let Some(progress) = progress {
				progress.set_rows_done(&id, z, row_index as u32 + 1)?;
			}
		}
		sink.level_done(z);
	}

	// a finished task starts from scratch next time
	if let Some(progress) = progress {
		progress.clear_task(&id)?;
	}
	Ok(stats)
}

/// Removes cached entries older than the task cut-off. Backends without
/// per-tile timestamps keep their entries (nothing to compare against).
pub async fn cleanup(task: &CleanupTask) -> Result<CleanupStats> {
	let manager = &task.manager;
	let grid = manager.grid().clone();
	let mut stats = CleanupStats::default();

	let coverage = match &task.coverage {
		Some(coverage) => {
			if coverage.is_empty() {
				return Ok(stats);
			}
			Some(coverage.transformed(grid.srs())?)
		}
		None => None,
	};

	let (level_min, level_max) = task.levels;
	for z in level_min..=level_max.min(grid.num_levels() - 1) {
		let bbox = match &coverage {
			Some(coverage) => *coverage.bbox(),
			None => *grid.bbox(),
		};
		let Some(range) = grid.tiles_for_bbox(&bbox, z)? else {
			continue;
		};
		for coord in range.iter() {
			if let Some(coverage) = &coverage {
				let tile_bbox = grid.tile_bbox(&coord)?;
				if !coverage.intersects(&tile_bbox, grid.srs())? {
					continue;
				}
			}
			stats.tiles_checked += 1;
			if let Some(tile) = manager.cache().load(&coord, true).await? {
				let expired = tile.mtime.is_some_and(|mtime| mtime < task.remove_before);
				if expired {
					manager.remove_tile(&coord).await?;
					stats.tiles_removed += 1;
				}
			}
		}
	}
	Ok(stats)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn progress_file_round_trip() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("seed.progress");

		let progress = ProgressFile::open(&path).unwrap();
		assert_eq!(progress.rows_done("osm@g", 3), 0);
		progress.set_rows_done("osm@g", 3, 7).unwrap();
		progress.set_rows_done("osm@g", 4, 1).unwrap();

		// a fresh handle sees the persisted state
		let reopened = ProgressFile::open(&path).unwrap();
		assert_eq!(reopened.rows_done("osm@g", 3), 7);
		assert_eq!(reopened.rows_done("osm@g", 4), 1);
		assert_eq!(reopened.rows_done("other@g", 3), 0);

		reopened.clear_task("osm@g").unwrap();
		let after_clear = ProgressFile::open(&path).unwrap();
		assert_eq!(after_clear.rows_done("osm@g", 3), 0);
	}

	#[test]
	fn progress_file_survives_partial_write() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("seed.progress");
		let progress = ProgressFile::open(&path).unwrap();
		progress.set_rows_done("t", 1, 2).unwrap();
		// no temp file left behind
		assert!(!path.with_extension("tmp").exists());
		assert!(path.exists());
	}
}
