//! Filesystem tile cache.
//!
//! Supports the classic directory layouts (`tc`, `tms`, `mp`, `arcgis`,
//! `quadkey`). Writes are atomic (temp file + rename in the target
//! directory). File and directory permissions are applied when the cache
//! creates them. On unix, single-color tiles can be hard-linked to one shared
//! payload per color.

use crate::{BackendCapabilities, CacheBackend, CacheTile, TileBody, sniff_content_type};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{trace, warn};
use std::{
	fs,
	io::ErrorKind,
	path::{Path, PathBuf},
};
use tilerelay_core::{CacheError, DirectoryLayout, TileCoord, TileFormat, TileGrid};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct FileCacheOptions {
	pub directory: PathBuf,
	pub layout: DirectoryLayout,
	pub format: TileFormat,
	pub file_permissions: Option<u32>,
	pub directory_permissions: Option<u32>,
	pub link_single_color_images: bool,
}

impl FileCacheOptions {
	pub fn new(directory: impl Into<PathBuf>, format: TileFormat) -> FileCacheOptions {
		FileCacheOptions {
			directory: directory.into(),
			layout: DirectoryLayout::default(),
			format,
			file_permissions: None,
			directory_permissions: None,
			link_single_color_images: false,
		}
	}
}

#[derive(Debug)]
pub struct FileCache {
	options: FileCacheOptions,
	grid: TileGrid,
	layout_name: &'static str,
}

/// Splits a zero-padded decimal representation of `value` into `groups`
/// path segments of `digits` digits each.
fn split_number(value: u32, groups: usize, digits: usize) -> Vec<String> {
	let padded = format!("{:0width$}", value, width = groups * digits);
	(0..groups)
		.map(|i| padded[i * digits..(i + 1) * digits].to_string())
		.collect()
}

impl FileCache {
	pub fn new(options: FileCacheOptions, grid: TileGrid) -> FileCache {
		let layout_name = match options.layout {
			DirectoryLayout::TileCache => "tc",
			DirectoryLayout::Tms => "tms",
			DirectoryLayout::Mp => "mp",
			DirectoryLayout::Arcgis => "arcgis",
			DirectoryLayout::Quadkey => "quadkey",
		};
		FileCache {
			options,
			grid,
			layout_name,
		}
	}

	pub fn tile_path(&self, coord: &TileCoord) -> Result<PathBuf> {
		let ext = self.options.format.extension();
		let mut path = self.options.directory.clone();
		match self.options.layout {
			DirectoryLayout::TileCache => {
				path.push(format!("{:02}", coord.z));
				for part in split_number(coord.x, 3, 3) {
					path.push(part);
				}
				let y_parts = split_number(coord.y, 3, 3);
				path.push(&y_parts[0]);
				path.push(&y_parts[1]);
				path.push(format!("{}.{ext}", y_parts[2]));
			}
			DirectoryLayout::Tms => {
				path.push(coord.z.to_string());
				path.push(coord.x.to_string());
				path.push(format!("{}.{ext}", coord.y));
			}
			DirectoryLayout::Mp => {
				path.push(format!("{:02}", coord.z));
				for part in split_number(coord.x, 2, 4) {
					path.push(part);
				}
				let y_parts = split_number(coord.y, 2, 4);
				path.push(&y_parts[0]);
				path.push(format!("{}.{ext}", y_parts[1]));
			}
			DirectoryLayout::Arcgis => {
				path.push(format!("L{:02}", coord.z));
				path.push(format!("R{:08x}", coord.y));
				path.push(format!("C{:08x}.{ext}", coord.x));
			}
			DirectoryLayout::Quadkey => {
				let key = self.grid.quadkey(coord)?;
				if key.is_empty() {
					path.push(format!("root.{ext}"));
				} else {
					path.push(format!("{key}.{ext}"));
				}
			}
		}
		Ok(path)
	}

	#[cfg(unix)]
	fn set_mode(path: &Path, mode: u32) {
		use std::os::unix::fs::PermissionsExt;
		if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
			warn!("cannot set permissions on {path:?}: {err}");
		}
	}

	#[cfg(not(unix))]
	fn set_mode(_path: &Path, _mode: u32) {}

	/// Creates the directory chain below the cache root, applying
	/// `directory_permissions` to every directory this call creates.
	fn create_dirs(&self, dir: &Path) -> Result<()> {
		if dir.exists() {
			return Ok(());
		}
		if let Some(parent) = dir.parent() {
			if parent.starts_with(&self.options.directory) {
				self.create_dirs(parent)?;
			}
		}
		match fs::create_dir(dir) {
			Ok(()) => {
				if let Some(mode) = self.options.directory_permissions {
					Self::set_mode(dir, mode);
				}
				Ok(())
			}
			// another worker created it first
			Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
			Err(err) => Err(CacheError::io(format!("creating {dir:?}: {err}")).into()),
		}
	}

	/// Atomic publish: write to a temp name in the target directory, apply
	/// permissions, then rename over the final name.
	fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
		let parent = path.parent().context("tile path has no parent")?;
		self.create_dirs(parent)?;
		let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
		fs::write(&tmp, bytes).map_err(|e| CacheError::io(format!("writing {tmp:?}: {e}")))?;
		if let Some(mode) = self.options.file_permissions {
			Self::set_mode(&tmp, mode);
		}
		fs::rename(&tmp, path).map_err(|e| {
			let _ = fs::remove_file(&tmp);
			CacheError::io(format!("renaming {tmp:?} to {path:?}: {e}"))
		})?;
		Ok(())
	}

	/// Path of the shared payload for one color.
	fn single_color_path(&self, color: [u8; 4]) -> PathBuf {
		self.options.directory.join("single_colors").join(format!(
			"{:02x}{:02x}{:02x}{:02x}.{}",
			color[0],
			color[1],
			color[2],
			color[3],
			self.options.format.extension()
		))
	}

	#[cfg(unix)]
	fn link_single_color(&self, path: &Path, color: [u8; 4], bytes: &[u8]) -> Result<()> {
		let shared = self.single_color_path(color);
		if !shared.exists() {
			self.write_atomic(&shared, bytes)?;
		}
		match fs::remove_file(path) {
			Ok(()) => {}
			Err(err) if err.kind() == ErrorKind::NotFound => {}
			Err(err) => return Err(CacheError::io(format!("replacing {path:?}: {err}")).into()),
		}
		self.create_dirs(path.parent().context("tile path has no parent")?)?;
		match fs::hard_link(&shared, path) {
			Ok(()) => Ok(()),
			Err(err) => {
				// cross-device or racy removal: fall back to a plain write
				trace!("hard link {shared:?} -> {path:?} failed ({err}), writing copy");
				self.write_atomic(path, bytes)
			}
		}
	}

	#[cfg(not(unix))]
	fn link_single_color(&self, path: &Path, _color: [u8; 4], bytes: &[u8]) -> Result<()> {
		self.write_atomic(path, bytes)
	}
}

#[async_trait]
impl CacheBackend for FileCache {
	async fn load(&self, coord: &TileCoord, with_metadata: bool) -> Result<Option<CacheTile>> {
		let path = self.tile_path(coord)?;
		let bytes = match fs::read(&path) {
			Ok(bytes) => bytes,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(CacheError::io(format!("reading {path:?}: {err}")).into()),
		};
		let mtime = if with_metadata {
			fs::metadata(&path).and_then(|m| m.modified()).ok()
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
		Ok(Some(CacheTile {
			coord: *coord,
			body,
			mtime,
			single_color: None,
		}))
	}

	async fn store(&self, tile: &CacheTile) -> Result<()> {
		let path = self.tile_path(&tile.coord)?;
		trace!("store {:?} -> {path:?}", tile.coord);
		match &tile.body {
			TileBody::Empty => self.write_atomic(&path, &[]),
			TileBody::Data { bytes, .. } => match tile.single_color {
				Some(color) if self.options.link_single_color_images => self.link_single_color(&path, color, bytes),
				_ => self.write_atomic(&path, bytes),
			},
		}
	}

	async fn remove(&self, coord: &TileCoord) -> Result<()> {
		let path = self.tile_path(coord)?;
		match fs::remove_file(&path) {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
			Err(err) => Err(CacheError::io(format!("removing {path:?}: {err}")).into()),
		}
	}

	async fn is_cached(&self, coord: &TileCoord) -> Result<bool> {
		Ok(self.tile_path(coord)?.exists())
	}

	fn cache_layout(&self) -> &str {
		self.layout_name
	}

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities {
			supports_link_identical: cfg!(unix) && self.options.link_single_color_images,
			bulk_loads: false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn cache(dir: &Path, layout: DirectoryLayout) -> FileCache {
		let mut options = FileCacheOptions::new(dir, TileFormat::Png);
		options.layout = layout;
		FileCache::new(options, TileGrid::global_webmercator())
	}

	#[test]
	fn layout_paths() {
		let grid = TileGrid::global_webmercator();
		let coord = TileCoord::new(5, 1, 2);
		let cases = [
			(DirectoryLayout::TileCache, "05/000/000/001/000/000/002.png"),
			(DirectoryLayout::Tms, "5/1/2.png"),
			(DirectoryLayout::Mp, "05/0000/0001/0000/0002.png"),
			(DirectoryLayout::Arcgis, "L05/R00000002/C00000001.png"),
			(DirectoryLayout::Quadkey, "00021.png"),
		];
		for (layout, expected) in cases {
			let mut options = FileCacheOptions::new("/cache", TileFormat::Png);
			options.layout = layout;
			let cache = FileCache::new(options, grid.clone());
			assert_eq!(
				cache.tile_path(&coord).unwrap(),
				PathBuf::from("/cache").join(expected),
				"{layout:?}"
			);
		}
	}

	#[test]
	fn big_coordinates_split_cleanly() {
		let mut options = FileCacheOptions::new("/cache", TileFormat::Png);
		options.layout = DirectoryLayout::TileCache;
		let cache = FileCache::new(options, TileGrid::global_webmercator());
		let path = cache.tile_path(&TileCoord::new(19, 123_456_789, 42)).unwrap();
		assert_eq!(path, PathBuf::from("/cache/19/123/456/789/000/000/042.png"));
	}

	#[tokio::test]
	async fn store_load_remove_round_trip() {
		let dir = TempDir::new().unwrap();
		let cache = cache(dir.path(), DirectoryLayout::Tms);
		let coord = TileCoord::new(3, 1, 2);

		assert!(cache.load(&coord, false).await.unwrap().is_none());
		assert!(!cache.is_cached(&coord).await.unwrap());

		let png = [0x89, b'P', b'N', b'G', 1, 2, 3];
		cache.store(&CacheTile::new(coord, png.to_vec(), "image/png")).await.unwrap();

		let tile = cache.load(&coord, true).await.unwrap().unwrap();
		match &tile.body {
			TileBody::Data { bytes, content_type } => {
				assert_eq!(bytes, &png);
				assert_eq!(content_type, "image/png");
			}
			TileBody::Empty => panic!("expected data"),
		}
		assert!(tile.mtime.is_some());

		cache.remove(&coord).await.unwrap();
		assert!(cache.load(&coord, false).await.unwrap().is_none());
		// removing twice is fine
		cache.remove(&coord).await.unwrap();
	}

	#[tokio::test]
	async fn empty_marker_round_trip() {
		let dir = TempDir::new().unwrap();
		let cache = cache(dir.path(), DirectoryLayout::Tms);
		let coord = TileCoord::new(2, 0, 0);
		cache.store(&CacheTile::new_empty(coord)).await.unwrap();
		let tile = cache.load(&coord, false).await.unwrap().unwrap();
		assert!(tile.is_empty_marker());
	}

	#[tokio::test]
	async fn store_overwrites_atomically() {
		let dir = TempDir::new().unwrap();
		let cache = cache(dir.path(), DirectoryLayout::Tms);
		let coord = TileCoord::new(1, 0, 0);
		cache.store(&CacheTile::new(coord, vec![1; 100], "image/png")).await.unwrap();
		cache.store(&CacheTile::new(coord, vec![2; 50], "image/png")).await.unwrap();
		let tile = cache.load(&coord, false).await.unwrap().unwrap();
		assert_eq!(tile.size(), 50);
		// no temp files left behind
		let leftovers: Vec<_> = walkdir(dir.path())
			.into_iter()
			.filter(|p| p.file_name().is_some_and(|n| n.to_string_lossy().contains(".tmp")))
			.collect();
		assert!(leftovers.is_empty(), "{leftovers:?}");
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn single_color_tiles_share_inode() {
		use std::os::unix::fs::MetadataExt;

		let dir = TempDir::new().unwrap();
		let mut options = FileCacheOptions::new(dir.path(), TileFormat::Png);
		options.layout = DirectoryLayout::Tms;
		options.link_single_color_images = true;
		let cache = FileCache::new(options, TileGrid::global_webmercator());

		let bytes = vec![0x89, b'P', b'N', b'G', 9];
		for coord in [TileCoord::new(4, 0, 0), TileCoord::new(4, 1, 0)] {
			let tile = CacheTile::new(coord, bytes.clone(), "image/png").with_single_color([0, 0, 255, 255]);
			cache.store(&tile).await.unwrap();
		}
		let a = fs::metadata(cache.tile_path(&TileCoord::new(4, 0, 0)).unwrap()).unwrap();
		let b = fs::metadata(cache.tile_path(&TileCoord::new(4, 1, 0)).unwrap()).unwrap();
		assert_eq!(a.ino(), b.ino());
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn permissions_are_applied() {
		use std::os::unix::fs::MetadataExt;

		let dir = TempDir::new().unwrap();
		let mut options = FileCacheOptions::new(dir.path(), TileFormat::Png);
		options.layout = DirectoryLayout::Tms;
		options.file_permissions = Some(0o640);
		options.directory_permissions = Some(0o750);
		let cache = FileCache::new(options, TileGrid::global_webmercator());

		let coord = TileCoord::new(3, 1, 2);
		cache.store(&CacheTile::new(coord, vec![1], "image/png")).await.unwrap();

		let file_mode = fs::metadata(cache.tile_path(&coord).unwrap()).unwrap().mode() & 0o777;
		assert_eq!(file_mode, 0o640);
		let dir_mode = fs::metadata(dir.path().join("3")).unwrap().mode() & 0o777;
		assert_eq!(dir_mode, 0o750);
	}

	fn walkdir(dir: &Path) -> Vec<PathBuf> {
		let mut out = Vec::new();
		if let Ok(entries) = fs::read_dir(dir) {
			for entry in entries.flatten() {
				let path = entry.path();
				if path.is_dir() {
					out.extend(walkdir(&path));
				} else {
					out.push(path);
				}
			}
		}
		out
	}
}
