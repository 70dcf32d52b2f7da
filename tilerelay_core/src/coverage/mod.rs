//! Geometric coverages.
//!
//! A [`Coverage`] restricts where a source or cache is authoritative. Every
//! coverage has a bbox; polygon coverages additionally carry a multi-polygon
//! outline. Predicates (`contains`, `intersects`) and boolean combinations
//! delegate to the `geo` crate; rasterization for image clipping is done with
//! an even-odd scanline fill, so clipping that splits a polygon into a
//! multi-polygon needs no special casing.

mod parse;

use crate::{CoverageError, MapBBox, Srs};
use anyhow::{Context, Result};
use geo::{Area, BooleanOps, BoundingRect, Coord, Intersects, LineString, MapCoords, MultiPolygon, Polygon, Relate};

const AREA_EPS: f64 = 1e-12;

/// A geometric region in a specific SRS.
#[derive(Debug, Clone)]
pub struct Coverage {
	srs: Srs,
	bbox: MapBBox,
	geom: Option<MultiPolygon<f64>>,
}

fn bbox_polygon(bbox: &MapBBox) -> Polygon<f64> {
	Polygon::new(
		LineString::from(vec![
			(bbox.x_min, bbox.y_min),
			(bbox.x_max, bbox.y_min),
			(bbox.x_max, bbox.y_max),
			(bbox.x_min, bbox.y_max),
			(bbox.x_min, bbox.y_min),
		]),
		vec![],
	)
}

impl Coverage {
	pub fn from_bbox(bbox: MapBBox, srs: Srs) -> Coverage {
		Coverage {
			srs,
			bbox,
			geom: None,
		}
	}

	pub fn from_multi_polygon(geom: MultiPolygon<f64>, srs: Srs) -> Result<Coverage> {
		let bbox = match geom.bounding_rect() {
			Some(rect) => MapBBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)?,
			None => return Ok(Coverage::empty(srs)),
		};
		Ok(Coverage {
			srs,
			bbox,
			geom: Some(geom),
		})
	}

	pub fn from_polygon(polygon: Polygon<f64>, srs: Srs) -> Result<Coverage> {
		Coverage::from_multi_polygon(MultiPolygon::new(vec![polygon]), srs)
	}

	/// Parses a GeoJSON `Polygon`/`MultiPolygon` geometry, feature or feature
	/// collection.
	pub fn from_geojson(geojson: &str, srs: Srs) -> Result<Coverage> {
		let geom = parse::multi_polygon_from_geojson(geojson).context("parsing GeoJSON coverage")?;
		Coverage::from_multi_polygon(geom, srs)
	}

	/// Parses a WKT `POLYGON` or `MULTIPOLYGON`.
	pub fn from_wkt(wkt: &str, srs: Srs) -> Result<Coverage> {
		let geom = parse::multi_polygon_from_wkt(wkt).context("parsing WKT coverage")?;
		Coverage::from_multi_polygon(geom, srs)
	}

	/// A coverage that contains nothing. Seeding an empty coverage is a no-op.
	pub fn empty(srs: Srs) -> Coverage {
		Coverage {
			srs,
			bbox: MapBBox::from_corners(0.0, 0.0, 0.0, 0.0),
			geom: Some(MultiPolygon::new(vec![])),
		}
	}

	pub fn srs(&self) -> &Srs {
		&self.srs
	}

	pub fn bbox(&self) -> &MapBBox {
		&self.bbox
	}

	pub fn is_empty(&self) -> bool {
		match &self.geom {
			Some(geom) => geom.unsigned_area() < AREA_EPS,
			None => self.bbox.is_degenerate(),
		}
	}

	/// True when this coverage is a plain bbox without polygon outline.
	pub fn is_bbox_only(&self) -> bool {
		self.geom.is_none()
	}

	fn query_bbox(&self, bbox: &MapBBox, srs: &Srs) -> Result<MapBBox> {
		srs.transform_bbox(&self.srs, bbox, 8)
	}

	/// True when `bbox` (given in `srs`) lies entirely inside the coverage.
	pub fn contains(&self, bbox: &MapBBox, srs: &Srs) -> Result<bool> {
		if self.is_empty() {
			return Ok(false);
		}
		let bbox = self.query_bbox(bbox, srs)?;
		match &self.geom {
			None => Ok(self.bbox.contains(&bbox)),
			Some(geom) => {
				if !self.bbox.contains(&bbox) {
					return Ok(false);
				}
				Ok(geom.relate(&bbox_polygon(&bbox)).is_contains())
			}
		}
	}

	/// True when `bbox` (given in `srs`) overlaps the coverage.
	pub fn intersects(&self, bbox: &MapBBox, srs: &Srs) -> Result<bool> {
		if self.is_empty() {
			return Ok(false);
		}
		let bbox = self.query_bbox(bbox, srs)?;
		match &self.geom {
			None => Ok(self.bbox.intersects(&bbox)),
			Some(geom) => {
				if !self.bbox.intersects(&bbox) {
					return Ok(false);
				}
				Ok(geom.intersects(&bbox_polygon(&bbox)))
			}
		}
	}

	/// Transforms the coverage outline into `target`. Polygon vertices are
	/// mapped point-wise; the bbox is re-derived from the result.
	pub fn transformed(&self, target: &Srs) -> Result<Coverage> {
		if self.srs.is_same(target) {
			return Ok(self.clone());
		}
		match &self.geom {
			None => {
				let bbox = self.srs.transform_bbox(target, &self.bbox, 8)?;
				Ok(Coverage::from_bbox(bbox, target.clone()))
			}
			Some(geom) => {
				let mapped = geom.map_coords(|c: Coord<f64>| {
					let (x, y) = self.srs.transform_point(target, c.x, c.y);
					Coord { x, y }
				});
				Coverage::from_multi_polygon(mapped, target.clone())
			}
		}
	}

	fn as_multi_polygon(&self) -> MultiPolygon<f64> {
		match &self.geom {
			Some(geom) => geom.clone(),
			None => MultiPolygon::new(vec![bbox_polygon(&self.bbox)]),
		}
	}

	/// Union of two coverages. `other` is transformed into this SRS first.
	pub fn union(&self, other: &Coverage) -> Result<Coverage> {
		let other = other.transformed(&self.srs)?;
		let geom = self.as_multi_polygon().union(&other.as_multi_polygon());
		Coverage::from_multi_polygon(geom, self.srs.clone())
	}

	/// Intersection of two coverages.
	pub fn intersection(&self, other: &Coverage) -> Result<Coverage> {
		let other = other.transformed(&self.srs)?;
		let geom = self.as_multi_polygon().intersection(&other.as_multi_polygon());
		Coverage::from_multi_polygon(geom, self.srs.clone())
	}

	/// This coverage minus `other`.
	pub fn difference(&self, other: &Coverage) -> Result<Coverage> {
		let other = other.transformed(&self.srs)?;
		let geom = self.as_multi_polygon().difference(&other.as_multi_polygon());
		Coverage::from_multi_polygon(geom, self.srs.clone())
	}

	/// Rasterizes the coverage over `bbox` (in the coverage SRS, row 0 at
	/// `y_max`) into a `size.0 × size.1` mask of 0/255 bytes.
	///
	/// Returns `None` when the whole bbox is covered and no clipping is
	/// needed.
	pub fn mask(&self, bbox: &MapBBox, size: (u32, u32)) -> Result<Option<Vec<u8>>> {
		if self.contains(bbox, &self.srs)? {
			return Ok(None);
		}
		let (w, h) = (size.0 as usize, size.1 as usize);
		let mut mask = vec![0u8; w * h];
		if self.is_empty() || !self.intersects(bbox, &self.srs).unwrap_or(false) {
			return Ok(Some(mask));
		}

		let px_w = bbox.width() / size.0 as f64;
		let px_h = bbox.height() / size.1 as f64;

		match &self.geom {
			None => {
				// bbox-only: fill the overlapping pixel rectangle
				let overlap = self
					.bbox
					.intersection(bbox)
					.ok_or_else(|| CoverageError("intersects but no overlap".to_string()))?;
				let x0 = ((overlap.x_min - bbox.x_min) / px_w).floor().max(0.0) as usize;
				let x1 = (((overlap.x_max - bbox.x_min) / px_w).ceil() as usize).min(w);
				let y0 = ((bbox.y_max - overlap.y_max) / px_h).floor().max(0.0) as usize;
				let y1 = (((bbox.y_max - overlap.y_min) / px_h).ceil() as usize).min(h);
				for y in y0..y1 {
					mask[y * w + x0..y * w + x1].fill(255);
				}
			}
			Some(geom) => {
				// even-odd scanline fill over all rings; holes fall out naturally
				let mut edges: Vec<(f64, f64, f64, f64)> = Vec::new();
				for polygon in geom {
					for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
						for pair in ring.0.windows(2) {
							edges.push((pair[0].x, pair[0].y, pair[1].x, pair[1].y));
						}
					}
				}
				let mut crossings: Vec<f64> = Vec::new();
				for y in 0..h {
					let y_geo = bbox.y_max - (y as f64 + 0.5) * px_h;
					crossings.clear();
					for &(x0, y0, x1, y1) in &edges {
						if (y0 <= y_geo) != (y1 <= y_geo) {
							crossings.push(x0 + (y_geo - y0) / (y1 - y0) * (x1 - x0));
						}
					}
					crossings.sort_by(|a, b| a.partial_cmp(b).unwrap());
					for span in crossings.chunks_exact(2) {
						let x0 = ((span[0] - bbox.x_min) / px_w).round().max(0.0) as usize;
						let x1 = (((span[1] - bbox.x_min) / px_w).round() as usize).min(w);
						if x0 < x1 {
							mask[y * w + x0..y * w + x1].fill(255);
						}
					}
				}
			}
		}
		Ok(Some(mask))
	}
}
