//! Geographic (plate carrée) and spherical mercator projections.

use super::Projection;
use std::f64::consts::PI;

pub(crate) const EARTH_RADIUS: f64 = 6_378_137.0; // meters
pub(crate) const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Identity projection: SRS units are lon/lat degrees.
#[derive(Debug)]
pub struct Geographic;

impl Projection for Geographic {
	fn from_geographic(&self, lon: f64, lat: f64) -> (f64, f64) {
		(lon, lat)
	}

	fn to_geographic(&self, x: f64, y: f64) -> (f64, f64) {
		(x, y)
	}

	fn is_geographic(&self) -> bool {
		true
	}
}

/// Spherical mercator (EPSG:3857 and aliases).
///
/// Latitudes are clamped to the mercator limit; longitudes are continued
/// beyond ±180° instead of wrapped.
#[derive(Debug)]
pub struct SphericalMercator;

impl Projection for SphericalMercator {
	fn from_geographic(&self, lon: f64, lat: f64) -> (f64, f64) {
		let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
		let x = lon.to_radians() * EARTH_RADIUS;
		let y = (PI / 4.0 + lat.to_radians() / 2.0).tan().ln() * EARTH_RADIUS;
		(x, y)
	}

	fn to_geographic(&self, x: f64, y: f64) -> (f64, f64) {
		let lon = (x / EARTH_RADIUS).to_degrees();
		let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
		(lon, lat)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn equator_prime_meridian_is_origin() {
		let (x, y) = SphericalMercator.from_geographic(0.0, 0.0);
		assert!(x.abs() < 1e-9);
		assert!(y.abs() < 1e-9);
	}

	#[test]
	fn world_edge() {
		let (x, y) = SphericalMercator.from_geographic(180.0, MAX_MERCATOR_LAT);
		let extent = 20_037_508.342789244;
		assert!((x - extent).abs() < 1e-6);
		assert!((y - extent).abs() < 1e-6);
	}

	#[test]
	fn latitude_is_clamped() {
		let (_, y_pole) = SphericalMercator.from_geographic(0.0, 90.0);
		let (_, y_max) = SphericalMercator.from_geographic(0.0, MAX_MERCATOR_LAT);
		assert_eq!(y_pole, y_max);
	}

	#[test]
	fn longitude_is_not_wrapped() {
		let (x_over, _) = SphericalMercator.from_geographic(190.0, 0.0);
		let (x_edge, _) = SphericalMercator.from_geographic(180.0, 0.0);
		assert!(x_over > x_edge);
	}
}
