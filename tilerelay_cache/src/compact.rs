//! ArcGIS compact cache bundles (v1 and v2).
//!
//! Tiles are grouped into bundles of 128×128 tiles. Version 1 keeps a
//! separate `.bundlx` index file of 5-byte offsets next to the `.bundle`
//! data file; version 2 embeds an index of packed offset/size words in the
//! bundle itself. Stores append to the bundle and flip the index entry last,
//! so readers never observe a torn tile; [`CompactCache::defrag`] rewrites
//! bundles whose dead space exceeds a threshold.
//!
//! Index entries are column-major within a bundle
//! (`idx = col_in_bundle * 128 + row_in_bundle`).

use crate::{BackendCapabilities, CacheBackend, CacheTile, TileBody, sniff_content_type};
use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dashmap::DashMap;
use log::{debug, trace};
use std::{
	fs::{self, File, OpenOptions},
	io::{ErrorKind, Read, Seek, SeekFrom, Write},
	path::{Path, PathBuf},
	sync::Arc,
};
use tilerelay_core::{CacheError, TileCoord};
use uuid::Uuid;

/// Tiles per bundle edge.
const BUNDLE_SPAN: u32 = 128;
const TILES_PER_BUNDLE: usize = (BUNDLE_SPAN * BUNDLE_SPAN) as usize;

const V1_BUNDLE_HEADER: u64 = 60;
const V1_INDEX_HEADER: u64 = 16;
const V1_INDEX_FOOTER: usize = 16;

const V2_HEADER: u64 = 64;
const V2_INDEX_BYTES: u64 = (TILES_PER_BUNDLE * 8) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactVersion {
	V1,
	V2,
}

#[derive(Debug)]
pub struct CompactCache {
	directory: PathBuf,
	version: CompactVersion,
	// serializes writers per bundle file within this process
	bundle_locks: DashMap<PathBuf, Arc<parking_lot::Mutex<()>>>,
}

struct BundleAddress {
	bundle: PathBuf,
	index: PathBuf,
	slot: usize,
}

impl CompactCache {
	pub fn new(directory: impl Into<PathBuf>, version: CompactVersion) -> CompactCache {
		CompactCache {
			directory: directory.into(),
			version,
			bundle_locks: DashMap::new(),
		}
	}

	fn address(&self, coord: &TileCoord) -> BundleAddress {
		let row_start = coord.y / BUNDLE_SPAN * BUNDLE_SPAN;
		let col_start = coord.x / BUNDLE_SPAN * BUNDLE_SPAN;
		let dir = self.directory.join("_alllayers").join(format!("L{:02}", coord.z));
		let base = format!("R{row_start:04x}C{col_start:04x}");
		let slot = ((coord.x - col_start) * BUNDLE_SPAN + (coord.y - row_start)) as usize;
		BundleAddress {
			bundle: dir.join(format!("{base}.bundle")),
			index: dir.join(format!("{base}.bundlx")),
			slot,
		}
	}

	fn lock_for(&self, path: &Path) -> Arc<parking_lot::Mutex<()>> {
		self
			.bundle_locks
			.entry(path.to_path_buf())
			.or_insert_with(|| Arc::new(parking_lot::Mutex::new(())))
			.clone()
	}

	fn create_v1_files(address: &BundleAddress) -> Result<()> {
		fs::create_dir_all(address.bundle.parent().context("bundle path has no parent")?)
			.map_err(|e| CacheError::io(format!("creating bundle directory: {e}")))?;
		// fresh bundle: header + one shared zero-size slot at offset 60
		let mut bundle = Vec::with_capacity(V1_BUNDLE_HEADER as usize + 4);
		bundle.resize(V1_BUNDLE_HEADER as usize, 0);
		bundle.extend_from_slice(&[0, 0, 0, 0]);
		fs::write(&address.bundle, bundle).map_err(|e| CacheError::io(format!("creating bundle: {e}")))?;

		// fresh index: every slot points at the shared zero-size slot
		let mut index = Vec::with_capacity(V1_INDEX_HEADER as usize + TILES_PER_BUNDLE * 5 + V1_INDEX_FOOTER);
		index.resize(V1_INDEX_HEADER as usize, 0);
		for _ in 0..TILES_PER_BUNDLE {
			index.extend_from_slice(&V1_BUNDLE_HEADER.to_le_bytes()[0..5]);
		}
		index.resize(index.len() + V1_INDEX_FOOTER, 0);
		fs::write(&address.index, index).map_err(|e| CacheError::io(format!("creating bundlx: {e}")))?;
		Ok(())
	}

	fn create_v2_file(address: &BundleAddress) -> Result<()> {
		fs::create_dir_all(address.bundle.parent().context("bundle path has no parent")?)
			.map_err(|e| CacheError::io(format!("creating bundle directory: {e}")))?;
		let mut bundle = vec![0u8; (V2_HEADER + V2_INDEX_BYTES) as usize];
		// version word
		bundle[0..4].copy_from_slice(&3u32.to_le_bytes());
		fs::write(&address.bundle, bundle).map_err(|e| CacheError::io(format!("creating bundle: {e}")))?;
		Ok(())
	}

	fn read_v1_offset(index: &mut File, slot: usize) -> Result<u64> {
		index.seek(SeekFrom::Start(V1_INDEX_HEADER + slot as u64 * 5))?;
		let mut raw = [0u8; 8];
		index.read_exact(&mut raw[0..5])?;
		Ok(u64::from_le_bytes(raw))
	}

	fn load_v1(&self, address: &BundleAddress) -> Result<Option<Vec<u8>>> {
		let mut index = match File::open(&address.index) {
			Ok(file) => file,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(CacheError::io(format!("opening bundlx: {err}")).into()),
		};
		let offset = Self::read_v1_offset(&mut index, address.slot)?;
		let mut bundle = File::open(&address.bundle).map_err(|e| CacheError::io(format!("opening bundle: {e}")))?;
		bundle.seek(SeekFrom::Start(offset))?;
		let size = bundle.read_u32::<LittleEndian>()? as usize;
		if size == 0 {
			return Ok(None);
		}
		let mut bytes = vec![0u8; size];
		bundle
			.read_exact(&mut bytes)
			.map_err(|e| CacheError::corrupt(format!("short tile in {:?}: {e}", address.bundle)))?;
		Ok(Some(bytes))
	}

	fn load_v2(&self, address: &BundleAddress) -> Result<Option<Vec<u8>>> {
		let mut bundle = match File::open(&address.bundle) {
			Ok(file) => file,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(CacheError::io(format!("opening bundle: {err}")).into()),
		};
		bundle.seek(SeekFrom::Start(V2_HEADER + address.slot as u64 * 8))?;
		let word = bundle.read_u64::<LittleEndian>()?;
		let offset = word & 0xff_ffff_ffff;
		let size = (word >> 40) as usize;
		if size == 0 {
			return Ok(None);
		}
		bundle.seek(SeekFrom::Start(offset))?;
		let mut bytes = vec![0u8; size];
		bundle
			.read_exact(&mut bytes)
			.map_err(|e| CacheError::corrupt(format!("short tile in {:?}: {e}", address.bundle)))?;
		Ok(Some(bytes))
	}

	fn store_v1(&self, address: &BundleAddress, bytes: &[u8]) -> Result<()> {
		if !address.bundle.exists() || !address.index.exists() {
			Self::create_v1_files(address)?;
		}
		let mut bundle = OpenOptions::new()
			.read(true)
			.write(true)
			.open(&address.bundle)
			.map_err(|e| CacheError::io(format!("opening bundle: {e}")))?;
		let offset = bundle.seek(SeekFrom::End(0))?;
		bundle.write_u32::<LittleEndian>(bytes.len() as u32)?;
		bundle.write_all(bytes)?;
		bundle.sync_data().ok();

		// publish by flipping the index entry last
		let mut index = OpenOptions::new()
			.read(true)
			.write(true)
			.open(&address.index)
			.map_err(|e| CacheError::io(format!("opening bundlx: {e}")))?;
		index.seek(SeekFrom::Start(V1_INDEX_HEADER + address.slot as u64 * 5))?;
		index.write_all(&offset.to_le_bytes()[0..5])?;
		Ok(())
	}

	fn store_v2(&self, address: &BundleAddress, bytes: &[u8]) -> Result<()> {
		ensure!(
			bytes.len() < (1 << 24),
			CacheError::io(format!("tile of {} bytes exceeds bundle slot", bytes.len()))
		);
		if !address.bundle.exists() {
			Self::create_v2_file(address)?;
		}
		let mut bundle = OpenOptions::new()
			.read(true)
			.write(true)
			.open(&address.bundle)
			.map_err(|e| CacheError::io(format!("opening bundle: {e}")))?;
		let offset = bundle.seek(SeekFrom::End(0))?;
		// 4-byte size prefix kept for parity with v1 and for defrag scans
		bundle.write_u32::<LittleEndian>(bytes.len() as u32)?;
		bundle.write_all(bytes)?;
		bundle.sync_data().ok();

		let word = (offset + 4) | ((bytes.len() as u64) << 40);
		bundle.seek(SeekFrom::Start(V2_HEADER + address.slot as u64 * 8))?;
		bundle.write_u64::<LittleEndian>(word)?;
		Ok(())
	}

	fn clear_slot(&self, address: &BundleAddress) -> Result<()> {
		match self.version {
			CompactVersion::V1 => {
				let mut index = match OpenOptions::new().read(true).write(true).open(&address.index) {
					Ok(file) => file,
					Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
					Err(err) => return Err(CacheError::io(format!("opening bundlx: {err}")).into()),
				};
				index.seek(SeekFrom::Start(V1_INDEX_HEADER + address.slot as u64 * 5))?;
				index.write_all(&V1_BUNDLE_HEADER.to_le_bytes()[0..5])?;
			}
			CompactVersion::V2 => {
				let mut bundle = match OpenOptions::new().read(true).write(true).open(&address.bundle) {
					Ok(file) => file,
					Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
					Err(err) => return Err(CacheError::io(format!("opening bundle: {err}")).into()),
				};
				bundle.seek(SeekFrom::Start(V2_HEADER + address.slot as u64 * 8))?;
				bundle.write_u64::<LittleEndian>(0)?;
			}
		}
		Ok(())
	}

	fn bundle_files(&self) -> Result<Vec<(PathBuf, Option<PathBuf>)>> {
		let mut bundles = Vec::new();
		let layers = self.directory.join("_alllayers");
		let levels = match fs::read_dir(&layers) {
			Ok(dir) => dir,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(bundles),
			Err(err) => return Err(CacheError::io(format!("reading {layers:?}: {err}")).into()),
		};
		for level in levels.flatten() {
			for entry in fs::read_dir(level.path())
				.map_err(|e| CacheError::io(format!("reading level directory: {e}")))?
				.flatten()
			{
				let path = entry.path();
				if path.extension().is_some_and(|e| e == "bundle") {
					let index = path.with_extension("bundlx");
					bundles.push((path, index.exists().then_some(index)));
				}
			}
		}
		Ok(bundles)
	}

	/// Reads all live slots of a bundle: `(slot, bytes)`.
	fn live_tiles(&self, bundle_path: &Path, index_path: Option<&Path>) -> Result<Vec<(usize, Vec<u8>)>> {
		let mut live = Vec::new();
		match self.version {
			CompactVersion::V1 => {
				let index_path = index_path.context("v1 bundle without bundlx")?;
				let mut index = File::open(index_path)?;
				let mut bundle = File::open(bundle_path)?;
				for slot in 0..TILES_PER_BUNDLE {
					let offset = Self::read_v1_offset(&mut index, slot)?;
					bundle.seek(SeekFrom::Start(offset))?;
					let size = bundle.read_u32::<LittleEndian>()? as usize;
					if size == 0 {
						continue;
					}
					let mut bytes = vec![0u8; size];
					bundle.read_exact(&mut bytes)?;
					live.push((slot, bytes));
				}
			}
			CompactVersion::V2 => {
				let mut bundle = File::open(bundle_path)?;
				let mut index = vec![0u8; V2_INDEX_BYTES as usize];
				bundle.seek(SeekFrom::Start(V2_HEADER))?;
				bundle.read_exact(&mut index)?;
				for slot in 0..TILES_PER_BUNDLE {
					let word = u64::from_le_bytes(index[slot * 8..slot * 8 + 8].try_into().unwrap());
					let offset = word & 0xff_ffff_ffff;
					let size = (word >> 40) as usize;
					if size == 0 {
						continue;
					}
					bundle.seek(SeekFrom::Start(offset))?;
					let mut bytes = vec![0u8; size];
					bundle.read_exact(&mut bytes)?;
					live.push((slot, bytes));
				}
			}
		}
		Ok(live)
	}

	/// Rewrites bundles where more than `threshold` (0.0..=1.0) of the
	/// payload bytes are holes left by overwrites and removals. Header and
	/// index bytes do not count; they exist in any bundle.
	pub fn defrag(&self, threshold: f64) -> Result<usize> {
		let mut rewritten = 0;
		for (bundle_path, index_path) in self.bundle_files()? {
			let guard = self.lock_for(&bundle_path);
			let _locked = guard.lock();

			let file_size = fs::metadata(&bundle_path)?.len();
			let live = self.live_tiles(&bundle_path, index_path.as_deref())?;
			let live_bytes: u64 = live.iter().map(|(_, b)| b.len() as u64 + 4).sum();
			let base = match self.version {
				CompactVersion::V1 => V1_BUNDLE_HEADER + 4,
				CompactVersion::V2 => V2_HEADER + V2_INDEX_BYTES,
			};
			let dead = file_size.saturating_sub(base + live_bytes);
			let payload = dead + live_bytes;
			if payload == 0 || (dead as f64) / (payload as f64) <= threshold {
				continue;
			}
			debug!("defrag {bundle_path:?}: {dead} of {payload} payload bytes dead");

			// rebuild into temp files, then swap
			let tmp_dir = bundle_path.parent().context("bundle path has no parent")?;
			let tmp_token = Uuid::new_v4();
			let address = BundleAddress {
				bundle: tmp_dir.join(format!(".{tmp_token}.bundle")),
				index: tmp_dir.join(format!(".{tmp_token}.bundlx")),
				slot: 0,
			};
			match self.version {
				CompactVersion::V1 => Self::create_v1_files(&address)?,
				CompactVersion::V2 => Self::create_v2_file(&address)?,
			}
			for (slot, bytes) in live {
				let slot_address = BundleAddress {
					bundle: address.bundle.clone(),
					index: address.index.clone(),
					slot,
				};
				match self.version {
					CompactVersion::V1 => self.store_v1(&slot_address, &bytes)?,
					CompactVersion::V2 => self.store_v2(&slot_address, &bytes)?,
				}
			}
			fs::rename(&address.bundle, &bundle_path)?;
			if let Some(index_path) = &index_path {
				fs::rename(&address.index, index_path)?;
			} else {
				let _ = fs::remove_file(&address.index);
			}
			rewritten += 1;
		}
		Ok(rewritten)
	}
}

#[async_trait]
impl CacheBackend for CompactCache {
	async fn load(&self, coord: &TileCoord, with_metadata: bool) -> Result<Option<CacheTile>> {
		let address = self.address(coord);
		let bytes = match self.version {
			CompactVersion::V1 => self.load_v1(&address)?,
			CompactVersion::V2 => self.load_v2(&address)?,
		};
		Ok(bytes.map(|bytes| {
			let mtime = if with_metadata {
				fs::metadata(&address.bundle).and_then(|m| m.modified()).ok()
			} else {
				None
			};
			// single zero byte: the empty-tile marker written by store()
			let body = if bytes == [0u8] {
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

	async fn store(&self, tile: &CacheTile) -> Result<()> {
		let address = self.address(&tile.coord);
		trace!("store {:?} -> {:?} slot {}", tile.coord, address.bundle, address.slot);
		let guard = self.lock_for(&address.bundle);
		let _locked = guard.lock();
		let bytes: &[u8] = match &tile.body {
			TileBody::Data { bytes, .. } => bytes,
			// a zero-size entry means "missing", so an empty marker stores one
			// marker byte that load() cannot confuse with image data
			TileBody::Empty => &[0u8],
		};
		match self.version {
			CompactVersion::V1 => self.store_v1(&address, bytes),
			CompactVersion::V2 => self.store_v2(&address, bytes),
		}
	}

	async fn remove(&self, coord: &TileCoord) -> Result<()> {
		let address = self.address(coord);
		let guard = self.lock_for(&address.bundle);
		let _locked = guard.lock();
		self.clear_slot(&address)
	}

	fn cache_layout(&self) -> &str {
		match self.version {
			CompactVersion::V1 => "arcgis-compact",
			CompactVersion::V2 => "compact-v2",
		}
	}

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities::default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;
	use tempfile::TempDir;

	fn png(seed: u8) -> Vec<u8> {
		let mut bytes = vec![0x89, b'P', b'N', b'G'];
		bytes.extend(std::iter::repeat_n(seed, 64));
		bytes
	}

	#[rstest]
	#[case(CompactVersion::V1)]
	#[case(CompactVersion::V2)]
	#[tokio::test]
	async fn round_trip(#[case] version: CompactVersion) {
		let dir = TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), version);
		let coord = TileCoord::new(4, 130, 200);

		assert!(cache.load(&coord, false).await.unwrap().is_none());
		cache.store(&CacheTile::new(coord, png(7), "image/png")).await.unwrap();

		let tile = cache.load(&coord, true).await.unwrap().unwrap();
		match &tile.body {
			TileBody::Data { bytes, .. } => assert_eq!(bytes, &png(7)),
			TileBody::Empty => panic!("expected data"),
		}

		// neighbor in the same bundle stays missing
		assert!(cache.load(&TileCoord::new(4, 131, 200), false).await.unwrap().is_none());

		cache.remove(&coord).await.unwrap();
		assert!(cache.load(&coord, false).await.unwrap().is_none());
	}

	#[rstest]
	#[case(CompactVersion::V1)]
	#[case(CompactVersion::V2)]
	#[tokio::test]
	async fn overwrite_returns_latest(#[case] version: CompactVersion) {
		let dir = TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), version);
		let coord = TileCoord::new(3, 1, 2);
		cache.store(&CacheTile::new(coord, png(1), "image/png")).await.unwrap();
		cache.store(&CacheTile::new(coord, png(2), "image/png")).await.unwrap();
		let tile = cache.load(&coord, false).await.unwrap().unwrap();
		match &tile.body {
			TileBody::Data { bytes, .. } => assert_eq!(bytes, &png(2)),
			TileBody::Empty => panic!("expected data"),
		}
	}

	#[test]
	fn bundle_file_names() {
		let cache = CompactCache::new("/cache", CompactVersion::V1);
		let address = cache.address(&TileCoord::new(7, 300, 129));
		assert_eq!(
			address.bundle,
			PathBuf::from("/cache/_alllayers/L07/R0080C0100.bundle")
		);
		// column-major slot: (300-256)*128 + (129-128)
		assert_eq!(address.slot, 44 * 128 + 1);
	}

	#[rstest]
	#[case(CompactVersion::V1)]
	#[case(CompactVersion::V2)]
	#[tokio::test]
	async fn defrag_reclaims_overwrites(#[case] version: CompactVersion) {
		let dir = TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), version);
		let coord = TileCoord::new(5, 10, 10);
		// write the same slot many times to pile up dead space
		for i in 0..20 {
			cache.store(&CacheTile::new(coord, png(i), "image/png")).await.unwrap();
		}
		let keeper = TileCoord::new(5, 11, 10);
		cache.store(&CacheTile::new(keeper, png(99), "image/png")).await.unwrap();

		let bundle = cache.address(&coord).bundle;
		let before = fs::metadata(&bundle).unwrap().len();
		let rewritten = cache.defrag(0.1).unwrap();
		assert_eq!(rewritten, 1);
		let after = fs::metadata(&bundle).unwrap().len();
		assert!(after < before, "{after} >= {before}");

		// both tiles survive the rewrite
		for (c, seed) in [(coord, 19), (keeper, 99)] {
			let tile = cache.load(&c, false).await.unwrap().unwrap();
			match &tile.body {
				TileBody::Data { bytes, .. } => assert_eq!(bytes, &png(seed)),
				TileBody::Empty => panic!("expected data"),
			}
		}
	}

	#[tokio::test]
	async fn defrag_skips_tight_bundles() {
		let dir = TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), CompactVersion::V2);
		let coord = TileCoord::new(2, 0, 0);
		cache.store(&CacheTile::new(coord, png(1), "image/png")).await.unwrap();
		assert_eq!(cache.defrag(0.5).unwrap(), 0);
	}
}
