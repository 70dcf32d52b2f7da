//! Quantized tile pyramids.
//!
//! A [`TileGrid`] maps between map coordinates (bbox in SRS units) and tile
//! addresses `(z, x, y)` over an ordered, strictly decreasing resolution
//! ladder. Grids are immutable after construction; build them with
//! [`GridBuilder`] or use one of the global presets.
//!
//! Tile addressing is column/row from the grid origin: `x` grows eastward,
//! `y` grows away from the origin edge (southward for `nw`, northward for
//! `sw`). Tiles at the far edges may extend beyond the grid bbox when the
//! bbox is not an exact multiple of the tile size; enumeration never yields
//! tiles outside the grid.

mod meta;

pub use meta::MetaTile;

use crate::{MapBBox, Srs};
use anyhow::{Result, bail, ensure};
use std::fmt::{self, Debug};

/// Relative epsilon (in tile units) used when snapping fractional tile
/// indices, so bboxes that align exactly with tile edges do not pick up the
/// neighboring row or column.
const EDGE_EPS: f64 = 1e-9;

/// Address of a single tile within a grid.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
	pub z: u8,
	pub x: u32,
	pub y: u32,
}

impl TileCoord {
	pub fn new(z: u8, x: u32, y: u32) -> TileCoord {
		TileCoord { z, x, y }
	}
}

impl Debug for TileCoord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}/{}", self.z, self.x, self.y)
	}
}

/// Inclusive rectangular range of tiles at one level.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
	pub z: u8,
	pub x0: u32,
	pub y0: u32,
	pub x1: u32,
	pub y1: u32,
}

impl TileRange {
	pub fn single(coord: TileCoord) -> TileRange {
		TileRange {
			z: coord.z,
			x0: coord.x,
			y0: coord.y,
			x1: coord.x,
			y1: coord.y,
		}
	}

	pub fn len(&self) -> u64 {
		u64::from(self.x1 - self.x0 + 1) * u64::from(self.y1 - self.y0 + 1)
	}

	pub fn is_empty(&self) -> bool {
		false
	}

	pub fn contains(&self, coord: &TileCoord) -> bool {
		coord.z == self.z && coord.x >= self.x0 && coord.x <= self.x1 && coord.y >= self.y0 && coord.y <= self.y1
	}

	/// Iterates row-major (y outer, x inner).
	pub fn iter(&self) -> impl Iterator<Item = TileCoord> + use<> {
		let copy = *self;
		(copy.y0..=copy.y1).flat_map(move |y| (copy.x0..=copy.x1).map(move |x| TileCoord::new(copy.z, x, y)))
	}
}

impl Debug for TileRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"TileRange(z{}: {},{} - {},{})",
			self.z, self.x0, self.y0, self.x1, self.y1
		)
	}
}

/// Which corner of the grid bbox tile `(0, 0)` is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GridOrigin {
	/// Tile row 0 is the northernmost row (WMTS, quadkey services).
	NorthWest,
	/// Tile row 0 is the southernmost row (TMS).
	#[default]
	SouthWest,
}

/// How the resolution ladder is derived.
#[derive(Debug, Clone, PartialEq)]
pub enum ResFactor {
	/// Each level is `factor` times finer than the previous one.
	Factor(f64),
	/// Intermediate levels at `sqrt(2)` steps; every second level halves.
	Sqrt2,
	/// Explicit, strictly decreasing list of resolutions.
	List(Vec<f64>),
}

/// An immutable, named tile pyramid.
#[derive(Clone)]
pub struct TileGrid {
	name: String,
	srs: Srs,
	bbox: MapBBox,
	tile_size: (u32, u32),
	origin: GridOrigin,
	resolutions: Vec<f64>,
	stretch_factor: f64,
}

impl TileGrid {
	pub fn builder(name: &str, srs: Srs, bbox: MapBBox) -> GridBuilder {
		GridBuilder::new(name, srs, bbox)
	}

	/// EPSG:4326 covering the whole world, 1.40625°/px at level 0.
	pub fn global_geodetic() -> TileGrid {
		GridBuilder::new(
			"GLOBAL_GEODETIC",
			Srs::from_epsg(4326).unwrap(),
			MapBBox::new(-180.0, -90.0, 180.0, 90.0).unwrap(),
		)
		.build()
		.unwrap()
	}

	/// EPSG:3857 covering the mercator square, origin north-west.
	pub fn global_webmercator() -> TileGrid {
		const EXTENT: f64 = 20_037_508.342789244;
		GridBuilder::new(
			"GLOBAL_WEBMERCATOR",
			Srs::from_epsg(3857).unwrap(),
			MapBBox::new(-EXTENT, -EXTENT, EXTENT, EXTENT).unwrap(),
		)
		.origin(GridOrigin::NorthWest)
		.build()
		.unwrap()
	}

	/// Like [`TileGrid::global_webmercator`] but TMS-style south-west origin.
	pub fn global_mercator() -> TileGrid {
		const EXTENT: f64 = 20_037_508.342789244;
		GridBuilder::new(
			"GLOBAL_MERCATOR",
			Srs::from_epsg(900913).unwrap(),
			MapBBox::new(-EXTENT, -EXTENT, EXTENT, EXTENT).unwrap(),
		)
		.build()
		.unwrap()
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn srs(&self) -> &Srs {
		&self.srs
	}

	pub fn bbox(&self) -> &MapBBox {
		&self.bbox
	}

	pub fn tile_size(&self) -> (u32, u32) {
		self.tile_size
	}

	pub fn origin(&self) -> GridOrigin {
		self.origin
	}

	pub fn num_levels(&self) -> u8 {
		self.resolutions.len() as u8
	}

	pub fn resolutions(&self) -> &[f64] {
		&self.resolutions
	}

	pub fn resolution(&self, z: u8) -> Result<f64> {
		self
			.resolutions
			.get(z as usize)
			.copied()
			.ok_or_else(|| anyhow::anyhow!("grid '{}' has no level {z}", self.name))
	}

	/// Picks the level serving pixel resolution `res`.
	///
	/// Level `k` serves `res` when `r[k]·stretch >= res >= r[k+1]/stretch`;
	/// overlapping windows resolve toward the finer level. Resolutions finer
	/// than the ladder end map to the finest level.
	pub fn level_for_res(&self, res: f64) -> u8 {
		let n = self.resolutions.len();
		for k in (0..n).rev() {
			let upper = self.resolutions[k] * self.stretch_factor;
			let lower = if k + 1 < n {
				self.resolutions[k + 1] / self.stretch_factor
			} else {
				0.0
			};
			if res <= upper && res >= lower {
				return k as u8;
			}
		}
		// coarser than the whole ladder
		0
	}

	/// Grid dimensions in tiles at level `z`.
	pub fn grid_size(&self, z: u8) -> Result<(u32, u32)> {
		let res = self.resolution(z)?;
		let w = (self.bbox.width() / (res * f64::from(self.tile_size.0)) - EDGE_EPS).ceil();
		let h = (self.bbox.height() / (res * f64::from(self.tile_size.1)) - EDGE_EPS).ceil();
		Ok((w.max(1.0) as u32, h.max(1.0) as u32))
	}

	pub fn contains_coord(&self, coord: &TileCoord) -> bool {
		match self.grid_size(coord.z) {
			Ok((w, h)) => coord.x < w && coord.y < h,
			Err(_) => false,
		}
	}

	/// Bbox of a single tile in SRS units.
	///
	/// Tiles in the last row/column may extend past the grid bbox when the
	/// extent is not an exact multiple of the tile size.
	pub fn tile_bbox(&self, coord: &TileCoord) -> Result<MapBBox> {
		let res = self.resolution(coord.z)?;
		let tw = res * f64::from(self.tile_size.0);
		let th = res * f64::from(self.tile_size.1);
		let x_min = self.bbox.x_min + f64::from(coord.x) * tw;
		let (y_min, y_max) = match self.origin {
			GridOrigin::SouthWest => {
				let y_min = self.bbox.y_min + f64::from(coord.y) * th;
				(y_min, y_min + th)
			}
			GridOrigin::NorthWest => {
				let y_max = self.bbox.y_max - f64::from(coord.y) * th;
				(y_max - th, y_max)
			}
		};
		MapBBox::new(x_min, y_min, x_min + tw, y_max)
	}

	/// All tiles at level `z` whose bbox intersects `bbox`.
	///
	/// Areas outside the grid bbox are ignored; `None` means no tile of the
	/// grid intersects the request.
	pub fn tiles_for_bbox(&self, bbox: &MapBBox, z: u8) -> Result<Option<TileRange>> {
		let res = self.resolution(z)?;
		let (gw, gh) = self.grid_size(z)?;
		let tw = res * f64::from(self.tile_size.0);
		let th = res * f64::from(self.tile_size.1);

		let fx0 = (bbox.x_min - self.bbox.x_min) / tw;
		let fx1 = (bbox.x_max - self.bbox.x_min) / tw;
		let (fy0, fy1) = match self.origin {
			GridOrigin::SouthWest => ((bbox.y_min - self.bbox.y_min) / th, (bbox.y_max - self.bbox.y_min) / th),
			GridOrigin::NorthWest => ((self.bbox.y_max - bbox.y_max) / th, (self.bbox.y_max - bbox.y_min) / th),
		};

		let snap = |f0: f64, f1: f64, count: u32| -> Option<(u32, u32)> {
			let i0 = (f0 + EDGE_EPS).floor();
			let mut i1 = (f1 - EDGE_EPS).ceil() - 1.0;
			if i1 < i0 {
				i1 = i0; // degenerate bbox still hits the tile it lies in
			}
			if i1 < 0.0 || i0 >= f64::from(count) {
				return None;
			}
			Some((i0.max(0.0) as u32, (i1 as u32).min(count - 1)))
		};

		let Some((x0, x1)) = snap(fx0, fx1, gw) else {
			return Ok(None);
		};
		let Some((y0, y1)) = snap(fy0, fy1, gh) else {
			return Ok(None);
		};
		Ok(Some(TileRange { z, x0, y0, x1, y1 }))
	}

	/// Union of the tile bboxes of `range`.
	pub fn tiles_bbox(&self, range: &TileRange) -> Result<MapBBox> {
		let mut bbox = self.tile_bbox(&TileCoord::new(range.z, range.x0, range.y0))?;
		let far = self.tile_bbox(&TileCoord::new(range.z, range.x1, range.y1))?;
		bbox.extend(&far);
		Ok(bbox)
	}

	/// Quadkey of a tile, using north-west row addressing regardless of the
	/// grid origin. Only meaningful for power-of-two pyramids.
	pub fn quadkey(&self, coord: &TileCoord) -> Result<String> {
		let (_, gh) = self.grid_size(coord.z)?;
		let y = match self.origin {
			GridOrigin::NorthWest => coord.y,
			GridOrigin::SouthWest => gh - 1 - coord.y,
		};
		let mut key = String::with_capacity(coord.z as usize);
		for i in (1..=coord.z).rev() {
			let mask = 1u32 << (i - 1);
			let mut digit = 0u8;
			if coord.x & mask != 0 {
				digit += 1;
			}
			if y & mask != 0 {
				digit += 2;
			}
			key.push(char::from(b'0' + digit));
		}
		Ok(key)
	}

	pub fn stretch_factor(&self) -> f64 {
		self.stretch_factor
	}

	/// True when both grids share SRS, bbox, tile size and origin, and the
	/// coarser ladder is a prefix-compatible subset of the finer one.
	pub fn is_subset_of(&self, other: &TileGrid) -> bool {
		if !self.srs.is_same(other.srs()) || self.bbox != *other.bbox() || self.tile_size != other.tile_size {
			return false;
		}
		self
			.resolutions
			.iter()
			.all(|r| other.resolutions.iter().any(|o| (r - o).abs() < r * 1e-9))
	}
}

impl Debug for TileGrid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TileGrid")
			.field("name", &self.name)
			.field("srs", &self.srs)
			.field("bbox", &self.bbox)
			.field("levels", &self.resolutions.len())
			.finish()
	}
}

/// Builder for [`TileGrid`].
pub struct GridBuilder {
	name: String,
	srs: Srs,
	bbox: MapBBox,
	tile_size: (u32, u32),
	origin: GridOrigin,
	res_factor: ResFactor,
	num_levels: Option<u8>,
	min_res: Option<f64>,
	max_res: Option<f64>,
	align_with: Option<Vec<f64>>,
	stretch_factor: f64,
}

impl GridBuilder {
	pub fn new(name: &str, srs: Srs, bbox: MapBBox) -> GridBuilder {
		GridBuilder {
			name: name.to_string(),
			srs,
			bbox,
			tile_size: (256, 256),
			origin: GridOrigin::default(),
			res_factor: ResFactor::Factor(2.0),
			num_levels: None,
			min_res: None,
			max_res: None,
			align_with: None,
			stretch_factor: 1.15,
		}
	}

	pub fn tile_size(mut self, width: u32, height: u32) -> Self {
		self.tile_size = (width, height);
		self
	}

	pub fn origin(mut self, origin: GridOrigin) -> Self {
		self.origin = origin;
		self
	}

	pub fn res_factor(mut self, factor: ResFactor) -> Self {
		self.res_factor = factor;
		self
	}

	pub fn num_levels(mut self, levels: u8) -> Self {
		self.num_levels = Some(levels);
		self
	}

	/// Coarsest resolution (`r[0]`).
	pub fn min_res(mut self, res: f64) -> Self {
		self.min_res = Some(res);
		self
	}

	/// Finest resolution; ladder generation stops once passed.
	pub fn max_res(mut self, res: f64) -> Self {
		self.max_res = Some(res);
		self
	}

	pub fn stretch_factor(mut self, factor: f64) -> Self {
		self.stretch_factor = factor;
		self
	}

	/// Reuses the other grid's resolutions where the ladders overlap, so a
	/// cascaded cache can copy tiles without resampling.
	pub fn align_resolutions_with(mut self, other: &TileGrid) -> Self {
		self.align_with = Some(other.resolutions().to_vec());
		self
	}

	fn derive_resolutions(&self) -> Result<Vec<f64>> {
		if let ResFactor::List(list) = &self.res_factor {
			ensure!(!list.is_empty(), "resolution list must not be empty");
			for pair in list.windows(2) {
				ensure!(
					pair[0] > pair[1],
					"resolutions must be strictly decreasing ({} -> {})",
					pair[0],
					pair[1]
				);
			}
			return Ok(list.clone());
		}

		// min_res wins over the bbox-derived default; with num_levels also
		// given, the ladder length is fixed and max_res is ignored.
		let r0 = self.min_res.unwrap_or_else(|| {
			(self.bbox.width() / f64::from(self.tile_size.0)).max(self.bbox.height() / f64::from(self.tile_size.1))
		});
		ensure!(r0 > 0.0, "base resolution must be positive");

		if let Some(aligned) = &self.align_with {
			let levels = self.num_levels.unwrap_or(20) as usize;
			let res: Vec<f64> = aligned.iter().copied().filter(|r| *r <= r0 * (1.0 + 1e-9)).collect();
			ensure!(
				!res.is_empty(),
				"aligned grid has no resolution at or below {r0}"
			);
			return Ok(res.into_iter().take(levels).collect());
		}

		let factor = match self.res_factor {
			ResFactor::Factor(f) => {
				ensure!(f > 1.0, "res_factor must be > 1.0");
				f
			}
			ResFactor::Sqrt2 => std::f64::consts::SQRT_2,
			ResFactor::List(_) => unreachable!(),
		};

		let levels = self.num_levels.unwrap_or(20);
		ensure!(levels > 0, "grid needs at least one level");
		let mut res = Vec::with_capacity(levels as usize);
		let mut r = r0;
		for _ in 0..levels {
			if let Some(max_res) = self.max_res {
				if self.num_levels.is_none() && r < max_res {
					break;
				}
			}
			res.push(r);
			r /= factor;
		}
		ensure!(!res.is_empty(), "max_res excludes every level");
		Ok(res)
	}

	pub fn build(self) -> Result<TileGrid> {
		ensure!(!self.name.is_empty(), "grid name must not be empty");
		ensure!(
			self.tile_size.0 > 0 && self.tile_size.1 > 0,
			"tile size must be positive"
		);
		ensure!(self.stretch_factor >= 1.0, "stretch_factor must be >= 1.0");
		if self.bbox.is_degenerate() {
			bail!("grid '{}' bbox has no area", self.name);
		}
		let resolutions = self.derive_resolutions()?;
		Ok(TileGrid {
			name: self.name,
			srs: self.srs,
			bbox: self.bbox,
			tile_size: self.tile_size,
			origin: self.origin,
			resolutions,
			stretch_factor: self.stretch_factor,
		})
	}
}
