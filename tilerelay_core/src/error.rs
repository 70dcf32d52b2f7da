//! Typed error values shared across the workspace.
//!
//! All fallible functions return `anyhow::Result`; the enums here are the typed
//! payloads carried inside `anyhow::Error` wherever a caller's policy depends on
//! the error kind (e.g. the tile manager swallows `CacheError` reads but not
//! lock timeouts). Use `err.downcast_ref::<CacheError>()` to inspect them.

use std::fmt;

/// Invalid or unsupported configuration detected while building grids, caches,
/// sources or layers from normalized configuration values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "configuration error: {}", self.0)
	}
}

impl std::error::Error for ConfigError {}

/// Classification of a failed upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
	/// The request did not complete within the client timeout.
	Timeout,
	/// The upstream answered with an error status or a service exception.
	Http,
	/// The source does not support the requested spatial reference.
	UnsupportedSrs,
	/// The source does not support the requested image format.
	UnsupportedFormat,
}

/// A source failed to produce an image.
///
/// `status` carries the HTTP status when the failure came off the wire. `url`
/// may be withheld (`hide_exception_url`) so it never leaks into responses.
#[derive(Debug, Clone)]
pub struct SourceError {
	pub kind: SourceErrorKind,
	pub status: Option<u16>,
	pub url: Option<String>,
	pub message: String,
}

impl SourceError {
	pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> SourceError {
		SourceError {
			kind,
			status: None,
			url: None,
			message: message.into(),
		}
	}

	pub fn http(status: u16, message: impl Into<String>) -> SourceError {
		SourceError {
			kind: SourceErrorKind::Http,
			status: Some(status),
			url: None,
			message: message.into(),
		}
	}

	pub fn with_url(mut self, url: impl Into<String>) -> SourceError {
		self.url = Some(url.into());
		self
	}

	/// Connection errors and server errors are retried; client errors are not.
	pub fn is_retryable(&self) -> bool {
		match self.kind {
			SourceErrorKind::Timeout => true,
			SourceErrorKind::Http => self.status.is_none_or(|s| s >= 500),
			SourceErrorKind::UnsupportedSrs | SourceErrorKind::UnsupportedFormat => false,
		}
	}
}

impl fmt::Display for SourceError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.kind {
			SourceErrorKind::Timeout => write!(f, "source timeout: {}", self.message)?,
			SourceErrorKind::Http => match self.status {
				Some(status) => write!(f, "source HTTP {status}: {}", self.message)?,
				None => write!(f, "source request failed: {}", self.message)?,
			},
			SourceErrorKind::UnsupportedSrs => write!(f, "unsupported SRS: {}", self.message)?,
			SourceErrorKind::UnsupportedFormat => write!(f, "unsupported format: {}", self.message)?,
		}
		if let Some(url) = &self.url {
			write!(f, " ({url})")?;
		}
		Ok(())
	}
}

impl std::error::Error for SourceError {}

/// Classification of cache backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheErrorKind {
	/// The backing store could not be read or written.
	Io,
	/// The store is held by another writer and did not free up in time.
	Locked,
	/// The stored entry exists but cannot be decoded.
	Corrupt,
}

/// A cache backend failed.
///
/// Read failures are treated as cache misses by the tile manager; write
/// failures are logged and the computed tile is still served.
#[derive(Debug, Clone)]
pub struct CacheError {
	pub kind: CacheErrorKind,
	pub message: String,
}

impl CacheError {
	pub fn io(message: impl Into<String>) -> CacheError {
		CacheError {
			kind: CacheErrorKind::Io,
			message: message.into(),
		}
	}

	pub fn locked(message: impl Into<String>) -> CacheError {
		CacheError {
			kind: CacheErrorKind::Locked,
			message: message.into(),
		}
	}

	pub fn corrupt(message: impl Into<String>) -> CacheError {
		CacheError {
			kind: CacheErrorKind::Corrupt,
			message: message.into(),
		}
	}
}

impl fmt::Display for CacheError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.kind {
			CacheErrorKind::Io => write!(f, "cache I/O error: {}", self.message),
			CacheErrorKind::Locked => write!(f, "cache locked: {}", self.message),
			CacheErrorKind::Corrupt => write!(f, "corrupt cache entry: {}", self.message),
		}
	}
}

impl std::error::Error for CacheError {}

/// A per-fingerprint lock could not be acquired within the configured timeout.
///
/// The caller must abort instead of serving a half-computed tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTimeout(pub String);

impl fmt::Display for LockTimeout {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "timeout while waiting for lock '{}'", self.0)
	}
}

impl std::error::Error for LockTimeout {}

/// Invalid coverage geometry or coverage combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageError(pub String);

impl fmt::Display for CoverageError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "coverage error: {}", self.0)
	}
}

impl std::error::Error for CoverageError {}

/// Image decode or encode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageError(pub String);

impl fmt::Display for ImageError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "image error: {}", self.0)
	}
}

impl std::error::Error for ImageError {}
