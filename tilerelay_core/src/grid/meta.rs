//! Meta-tile addressing.
//!
//! A meta-tile is an axis-aligned block of `m_x × m_y` adjacent tiles at one
//! level, rendered in a single upstream request and split afterwards. The
//! block is grown by `meta_buffer` pixels on every side so labels are not
//! clipped at tile edges; the buffer never crosses the grid bbox.

use super::{TileCoord, TileGrid, TileRange};
use crate::MapBBox;
use anyhow::Result;
use std::fmt::{self, Debug};

/// Identity of a meta-tile: `(z, meta_x, meta_y)` with
/// `meta_x = x / m_x`, `meta_y = y / m_y`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetaTile {
	pub z: u8,
	pub mx: u32,
	pub my: u32,
}

impl Debug for MetaTile {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "meta {}/{}/{}", self.z, self.mx, self.my)
	}
}

impl TileGrid {
	/// Meta-tile containing `coord` for the given `meta_size`.
	pub fn meta_tile(&self, coord: &TileCoord, meta_size: (u32, u32)) -> MetaTile {
		MetaTile {
			z: coord.z,
			mx: coord.x / meta_size.0,
			my: coord.y / meta_size.1,
		}
	}

	/// Tiles belonging to a meta-tile, clamped to the grid edge.
	pub fn meta_tile_range(&self, meta: &MetaTile, meta_size: (u32, u32)) -> Result<TileRange> {
		let (gw, gh) = self.grid_size(meta.z)?;
		let x0 = meta.mx * meta_size.0;
		let y0 = meta.my * meta_size.1;
		Ok(TileRange {
			z: meta.z,
			x0,
			y0,
			x1: (x0 + meta_size.0 - 1).min(gw - 1),
			y1: (y0 + meta_size.1 - 1).min(gh - 1),
		})
	}

	/// Bbox and pixel size of the upstream request for `range`, grown by
	/// `buffer_px` pixels and clipped so the buffer does not leave the grid
	/// bbox (partial edge tiles may themselves overhang; only the buffer is
	/// clipped).
	pub fn buffered_bbox(&self, range: &TileRange, buffer_px: u32) -> Result<(MapBBox, (u32, u32))> {
		let res = self.resolution(range.z)?;
		let inner = self.tiles_bbox(range)?;
		let mut limit = *self.bbox();
		limit.extend(&inner);
		let bbox = inner.buffered(f64::from(buffer_px) * res).clipped_to(&limit);
		let w = (bbox.width() / res).round().max(1.0) as u32;
		let h = (bbox.height() / res).round().max(1.0) as u32;
		Ok((bbox, (w, h)))
	}
}
