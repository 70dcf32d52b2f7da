//! Spatial reference handling.
//!
//! [`Srs`] is an opaque, cheaply clonable handle around a projection. All
//! transforms pivot through geographic coordinates (lon/lat degrees), so any
//! two built-in systems can be converted without a pairwise matrix. The handle
//! is also the seam for an external geodesy engine: implement [`Projection`]
//! and register the code.
//!
//! Internal coordinate order is always x/y (easting/northing, lon/lat). Axis
//! order quirks of wire protocols (WMS 1.3.0 serves EPSG:4326 as lat/lon) are
//! exposed via [`Srs::axis_order_inverted`] and applied only when requests are
//! built or parsed.

mod mercator;
mod transverse;

use crate::MapBBox;
use anyhow::{Context, Result, bail};
use mercator::{Geographic, SphericalMercator};
use std::{
	fmt::{self, Debug},
	sync::Arc,
};
use transverse::TransverseMercator;

/// A map projection: forward (geographic → projected) and inverse transforms.
///
/// Longitudes are not wrapped at ±180°; callers that render across the
/// antimeridian rely on the unwrapped continuation of the projection.
pub trait Projection: Debug + Send + Sync {
	/// Projects lon/lat degrees into SRS units.
	fn from_geographic(&self, lon: f64, lat: f64) -> (f64, f64);
	/// Unprojects SRS units back to lon/lat degrees.
	fn to_geographic(&self, x: f64, y: f64) -> (f64, f64);
	/// True when SRS units are degrees.
	fn is_geographic(&self) -> bool {
		false
	}
}

/// Opaque spatial reference handle.
#[derive(Clone)]
pub struct Srs {
	code: Arc<str>,
	epsg: Option<u32>,
	axis_order_ne: bool,
	proj: Arc<dyn Projection>,
}

impl Srs {
	/// Resolves an SRS code such as `EPSG:3857`, `EPSG:4326` or `CRS:84`.
	pub fn from_code(code: &str) -> Result<Srs> {
		let canonical = code.trim().to_ascii_uppercase();
		if canonical == "CRS:84" {
			return Ok(Srs {
				code: Arc::from("CRS:84"),
				epsg: None,
				axis_order_ne: false,
				proj: Arc::new(Geographic),
			});
		}
		let epsg: u32 = canonical
			.strip_prefix("EPSG:")
			.with_context(|| format!("unknown SRS authority in '{code}'"))?
			.parse()
			.with_context(|| format!("invalid EPSG code in '{code}'"))?;
		Srs::from_epsg(epsg)
	}

	/// Resolves a numeric EPSG code.
	pub fn from_epsg(epsg: u32) -> Result<Srs> {
		let (proj, axis_order_ne): (Arc<dyn Projection>, bool) = match epsg {
			4326 => (Arc::new(Geographic), true),
			3857 | 900913 | 102100 | 102113 => (Arc::new(SphericalMercator), false),
			// ETRS89 / UTM zones 28N..38N
			25828..=25838 => (Arc::new(TransverseMercator::utm_etrs89((epsg - 25800) as u8)), false),
			// WGS 84 / UTM north and south zones
			32601..=32660 => (Arc::new(TransverseMercator::utm_wgs84((epsg - 32600) as u8, true)), false),
			32701..=32760 => (Arc::new(TransverseMercator::utm_wgs84((epsg - 32700) as u8, false)), false),
			_ => bail!("no built-in projection for EPSG:{epsg}"),
		};
		Ok(Srs {
			code: Arc::from(format!("EPSG:{epsg}")),
			epsg: Some(epsg),
			axis_order_ne,
			proj,
		})
	}

	/// Wraps a custom [`Projection`] under the given code.
	pub fn from_projection(code: &str, axis_order_ne: bool, proj: Arc<dyn Projection>) -> Srs {
		Srs {
			code: Arc::from(code),
			epsg: None,
			axis_order_ne,
			proj,
		}
	}

	pub fn code(&self) -> &str {
		&self.code
	}

	pub fn epsg(&self) -> Option<u32> {
		self.epsg
	}

	pub fn is_geographic(&self) -> bool {
		self.proj.is_geographic()
	}

	/// True when the *wire* axis order of this SRS is northing/easting
	/// (EPSG:4326 under WMS 1.3.0; `CRS:84` stays lon/lat).
	pub fn axis_order_inverted(&self) -> bool {
		self.axis_order_ne
	}

	/// Two handles describe the same system when their projections agree.
	/// EPSG:3857 and its legacy aliases compare equal.
	pub fn is_same(&self, other: &Srs) -> bool {
		if self.code == other.code {
			return true;
		}
		matches!(
			(self.epsg, other.epsg),
			(Some(3857 | 900913 | 102100 | 102113), Some(3857 | 900913 | 102100 | 102113))
		) || (self.is_geographic() && other.is_geographic())
	}

	/// Transforms a single point into `target` units.
	pub fn transform_point(&self, target: &Srs, x: f64, y: f64) -> (f64, f64) {
		if self.is_same(target) {
			return (x, y);
		}
		let (lon, lat) = self.proj.to_geographic(x, y);
		target.proj.from_geographic(lon, lat)
	}

	/// Transforms a bbox into `target` units.
	///
	/// The four edges are densified with `steps` intermediate points each, so
	/// curved edges (e.g. UTM ↔ geographic) keep their true extent.
	pub fn transform_bbox(&self, target: &Srs, bbox: &MapBBox, steps: u32) -> Result<MapBBox> {
		if self.is_same(target) {
			return Ok(*bbox);
		}
		let n = steps.max(1);
		let mut x_min = f64::INFINITY;
		let mut y_min = f64::INFINITY;
		let mut x_max = f64::NEG_INFINITY;
		let mut y_max = f64::NEG_INFINITY;
		let mut include = |x: f64, y: f64| {
			let (tx, ty) = self.transform_point(target, x, y);
			x_min = x_min.min(tx);
			y_min = y_min.min(ty);
			x_max = x_max.max(tx);
			y_max = y_max.max(ty);
		};
		for i in 0..=n {
			let t = f64::from(i) / f64::from(n);
			let x = bbox.x_min + t * bbox.width();
			let y = bbox.y_min + t * bbox.height();
			include(x, bbox.y_min);
			include(x, bbox.y_max);
			include(bbox.x_min, y);
			include(bbox.x_max, y);
		}
		MapBBox::new(x_min, y_min, x_max, y_max)
			.with_context(|| format!("transforming bbox {bbox:?} from {} to {}", self.code, target.code))
	}
}

impl Debug for Srs {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Srs({})", self.code)
	}
}

impl PartialEq for Srs {
	fn eq(&self, other: &Self) -> bool {
		self.is_same(other)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn close(a: f64, b: f64, eps: f64) -> bool {
		(a - b).abs() < eps
	}

	#[test]
	fn resolves_codes() {
		assert_eq!(Srs::from_code("EPSG:4326").unwrap().code(), "EPSG:4326");
		assert_eq!(Srs::from_code("epsg:3857").unwrap().code(), "EPSG:3857");
		assert_eq!(Srs::from_code("CRS:84").unwrap().code(), "CRS:84");
		assert!(Srs::from_code("EPSG:99999").is_err());
		assert!(Srs::from_code("ESRI:3857").is_err());
	}

	#[test]
	fn mercator_aliases_are_same() {
		let a = Srs::from_epsg(3857).unwrap();
		let b = Srs::from_epsg(900913).unwrap();
		assert!(a.is_same(&b));
		let c = Srs::from_code("CRS:84").unwrap();
		let d = Srs::from_epsg(4326).unwrap();
		assert!(c.is_same(&d));
	}

	#[test]
	fn axis_order() {
		assert!(Srs::from_epsg(4326).unwrap().axis_order_inverted());
		assert!(!Srs::from_code("CRS:84").unwrap().axis_order_inverted());
		assert!(!Srs::from_epsg(3857).unwrap().axis_order_inverted());
	}

	#[test]
	fn geographic_to_mercator_round_trip() {
		let geo = Srs::from_epsg(4326).unwrap();
		let merc = Srs::from_epsg(3857).unwrap();
		let (x, y) = geo.transform_point(&merc, 13.4, 52.5);
		assert!(close(x, 1_491_681.18, 1.0), "x was {x}");
		assert!(close(y, 6_891_041.72, 1.0), "y was {y}");
		let (lon, lat) = merc.transform_point(&geo, x, y);
		assert!(close(lon, 13.4, 1e-9));
		assert!(close(lat, 52.5, 1e-9));
	}

	#[test]
	fn utm_round_trip() {
		let geo = Srs::from_epsg(4326).unwrap();
		let utm = Srs::from_epsg(25832).unwrap();
		// Munich is near the central meridian of zone 32
		let (e, n) = geo.transform_point(&utm, 11.57, 48.14);
		assert!(close(e, 691_184.23, 1.0), "easting was {e}");
		assert!(close(n, 5_335_055.29, 1.0), "northing was {n}");
		let (lon, lat) = utm.transform_point(&geo, e, n);
		assert!(close(lon, 11.57, 1e-6));
		assert!(close(lat, 48.14, 1e-6));
	}

	#[test]
	fn bbox_transform_keeps_extent() {
		let geo = Srs::from_epsg(4326).unwrap();
		let merc = Srs::from_epsg(3857).unwrap();
		let bbox = MapBBox::new(-180.0, -85.05112877980659, 180.0, 85.05112877980659).unwrap();
		let out = geo.transform_bbox(&merc, &bbox, 16).unwrap();
		let extent = 20_037_508.342789244;
		assert!(close(out.x_min, -extent, 1.0));
		assert!(close(out.x_max, extent, 1.0));
		assert!(close(out.y_min, -extent, 1.0));
		assert!(close(out.y_max, extent, 1.0));
	}
}
