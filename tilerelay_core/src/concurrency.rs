//! Default concurrency bounds derived from the machine.
//!
//! The tile pipeline has three independent knobs: meta-tiles being built
//! (CPU + upstream bound), source requests composing one image (I/O bound)
//! and per-host request limits (courtesy toward upstream servers). The
//! defaults here feed [`crate::GlobalsConfig`] and the per-cache options when
//! the configuration does not pin them.

/// Derived default limits for the three concurrency knobs.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimits {
	/// Meta-tiles built simultaneously per cache.
	pub tile_creators: usize,
	/// Parallel source requests composing one image.
	pub layer_renderers: usize,
	/// Parallel requests against one upstream host.
	pub source_requests: usize,
}

impl ConcurrencyLimits {
	pub fn new(tile_creators: usize, layer_renderers: usize, source_requests: usize) -> ConcurrencyLimits {
		ConcurrencyLimits {
			tile_creators: tile_creators.max(1),
			layer_renderers: layer_renderers.max(1),
			source_requests: source_requests.max(1),
		}
	}

	pub fn cpu_count() -> usize {
		num_cpus::get()
	}
}

impl Default for ConcurrencyLimits {
	fn default() -> ConcurrencyLimits {
		let cpus = Self::cpu_count();
		ConcurrencyLimits {
			// building a meta-tile decodes, composes and re-encodes images
			tile_creators: cpus.max(1),
			// source calls mostly wait on the network
			layer_renderers: (cpus * 2).max(1),
			source_requests: 4,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn limits_are_never_zero() {
		let limits = ConcurrencyLimits::new(0, 0, 0);
		assert_eq!(limits.tile_creators, 1);
		assert_eq!(limits.layer_renderers, 1);
		assert_eq!(limits.source_requests, 1);
	}

	#[test]
	fn defaults_scale_with_cpus() {
		let limits = ConcurrencyLimits::default();
		assert!(limits.layer_renderers >= limits.tile_creators);
	}
}
