//! Per-fingerprint mutual exclusion.
//!
//! Two scopes compose: an in-process table of async mutexes guarantees one
//! task per fingerprint inside this worker, and an optional lock directory
//! extends the exclusion across processes via lock files (create-new plus
//! polling). Acquisition is bounded by a timeout; on expiry the caller gets a
//! [`LockTimeout`] and must abort instead of serving half-computed tiles.
//! Guards release both scopes on every exit path.

use anyhow::Result;
use dashmap::DashMap;
use log::{trace, warn};
use std::{
	fs,
	io::ErrorKind,
	path::PathBuf,
	sync::Arc,
	time::{Duration, Instant, SystemTime},
};
use tilerelay_core::LockTimeout;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Entries above this size trigger an opportunistic sweep of unused mutexes.
const TABLE_SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug)]
pub struct TileLocker {
	timeout: Duration,
	poll_interval: Duration,
	lock_dir: Option<PathBuf>,
	table: DashMap<String, Arc<Mutex<()>>>,
}

/// Holds a fingerprint lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
	_in_process: OwnedMutexGuard<()>,
	lock_file: Option<PathBuf>,
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		if let Some(path) = &self.lock_file {
			if let Err(err) = fs::remove_file(path) {
				if err.kind() != ErrorKind::NotFound {
					warn!("cannot remove lock file {path:?}: {err}");
				}
			}
		}
	}
}

/// Lock file name for a fingerprint: non-path-safe bytes percent-encoded.
fn lock_file_name(key: &str) -> String {
	let mut name: String = key
		.bytes()
		.map(|b| {
			if (b as char).is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-' {
				(b as char).to_string()
			} else {
				format!("%{b:02x}")
			}
		})
		.collect();
	name.push_str(".lck");
	name
}

impl TileLocker {
	pub fn new(timeout: Duration) -> TileLocker {
		TileLocker {
			timeout,
			poll_interval: Duration::from_millis(50),
			lock_dir: None,
			table: DashMap::new(),
		}
	}

	/// Extends the locker across processes via lock files under `dir`.
	pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> TileLocker {
		self.lock_dir = Some(dir.into());
		self
	}

	/// Acquires the lock for `key`, blocking up to the configured timeout.
	pub async fn lock(&self, key: &str) -> Result<LockGuard> {
		let started = Instant::now();
		let mutex = {
			if self.table.len() > TABLE_SWEEP_THRESHOLD {
				// drop mutexes nobody holds or waits on
				self.table.retain(|_, m| Arc::strong_count(m) > 1);
			}
			self.table.entry(key.to_string()).or_default().clone()
		};

		let in_process = tokio::time::timeout(self.timeout, mutex.lock_owned())
			.await
			.map_err(|_| LockTimeout(key.to_string()))?;
		trace!("acquired in-process lock '{key}'");

		let lock_file = match &self.lock_dir {
			None => None,
			Some(dir) => {
				let remaining = self.timeout.saturating_sub(started.elapsed());
				// in_process guard drops on error, releasing the first scope
				Some(self.lock_cross_process(dir, key, remaining).await?)
			}
		};

		Ok(LockGuard {
			_in_process: in_process,
			lock_file,
		})
	}

	async fn lock_cross_process(&self, dir: &PathBuf, key: &str, remaining: Duration) -> Result<PathBuf> {
		fs::create_dir_all(dir).ok();
		let path = dir.join(lock_file_name(key));
		let deadline = Instant::now() + remaining;
		loop {
			match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
				Ok(_) => {
					trace!("acquired lock file {path:?}");
					return Ok(path);
				}
				Err(err) if err.kind() == ErrorKind::AlreadyExists => {
					self.break_stale_lock(&path);
					if Instant::now() >= deadline {
						return Err(LockTimeout(key.to_string()).into());
					}
					tokio::time::sleep(self.poll_interval.min(deadline - Instant::now())).await;
				}
				Err(err) => {
					warn!("cannot create lock file {path:?}: {err}");
					return Err(LockTimeout(key.to_string()).into());
				}
			}
		}
	}

	/// Removes a lock file left behind by a crashed worker. A file older than
	/// twice the lock timeout cannot belong to a live computation.
	fn break_stale_lock(&self, path: &std::path::Path) {
		let Ok(meta) = fs::metadata(path) else { return };
		let Ok(mtime) = meta.modified() else { return };
		let age = SystemTime::now().duration_since(mtime).unwrap_or_default();
		if age > self.timeout * 2 {
			warn!("breaking stale lock file {path:?} (age {age:?})");
			let _ = fs::remove_file(path);
		}
	}
}
