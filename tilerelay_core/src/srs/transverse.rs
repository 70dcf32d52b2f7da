//! Ellipsoidal transverse mercator for the UTM zone family.
//!
//! Uses the series expansions from Snyder, "Map Projections: A Working
//! Manual" (eqs. 8-9..8-25). Accuracy is well below a centimeter inside a
//! zone, which is far finer than any tile resolution served here.

use super::Projection;

const K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

#[derive(Debug)]
pub struct TransverseMercator {
	a: f64,
	e2: f64,
	ep2: f64,
	e1: f64,
	lon0: f64,
	false_northing: f64,
}

impl TransverseMercator {
	fn new(a: f64, inv_flattening: f64, zone: u8, north: bool) -> TransverseMercator {
		let f = 1.0 / inv_flattening;
		let e2 = f * (2.0 - f);
		let sqrt_1_e2 = (1.0 - e2).sqrt();
		TransverseMercator {
			a,
			e2,
			ep2: e2 / (1.0 - e2),
			e1: (1.0 - sqrt_1_e2) / (1.0 + sqrt_1_e2),
			lon0: (f64::from(zone) * 6.0 - 183.0).to_radians(),
			false_northing: if north { 0.0 } else { FALSE_NORTHING_SOUTH },
		}
	}

	/// ETRS89 (GRS80 ellipsoid) UTM zone, northern hemisphere.
	pub fn utm_etrs89(zone: u8) -> TransverseMercator {
		TransverseMercator::new(6_378_137.0, 298.257222101, zone, true)
	}

	/// WGS 84 UTM zone.
	pub fn utm_wgs84(zone: u8, north: bool) -> TransverseMercator {
		TransverseMercator::new(6_378_137.0, 298.257223563, zone, north)
	}

	/// Meridional arc length from the equator to latitude `phi`.
	fn meridian_arc(&self, phi: f64) -> f64 {
		let e2 = self.e2;
		let e4 = e2 * e2;
		let e6 = e4 * e2;
		self.a
			* ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
				- (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
				+ (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
				- (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
	}
}

impl Projection for TransverseMercator {
	fn from_geographic(&self, lon: f64, lat: f64) -> (f64, f64) {
		let phi = lat.to_radians();
		let lam = lon.to_radians() - self.lon0;
		let sin_phi = phi.sin();
		let cos_phi = phi.cos();
		let tan_phi = phi.tan();

		let n = self.a / (1.0 - self.e2 * sin_phi * sin_phi).sqrt();
		let t = tan_phi * tan_phi;
		let c = self.ep2 * cos_phi * cos_phi;
		let a = cos_phi * lam;
		let m = self.meridian_arc(phi);

		let a2 = a * a;
		let a3 = a2 * a;
		let a4 = a3 * a;
		let a5 = a4 * a;
		let a6 = a5 * a;

		let x = FALSE_EASTING
			+ K0 * n
				* (a + (1.0 - t + c) * a3 / 6.0 + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * self.ep2) * a5 / 120.0);
		let y = self.false_northing
			+ K0 * (m
				+ n * tan_phi
					* (a2 / 2.0
						+ (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
						+ (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * self.ep2) * a6 / 720.0));
		(x, y)
	}

	fn to_geographic(&self, x: f64, y: f64) -> (f64, f64) {
		let e2 = self.e2;
		let e4 = e2 * e2;
		let e6 = e4 * e2;
		let e1 = self.e1;

		let m = (y - self.false_northing) / K0;
		let mu = m / (self.a * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));

		// footpoint latitude
		let phi1 = mu
			+ (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
			+ (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
			+ (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
			+ (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

		let sin_phi1 = phi1.sin();
		let cos_phi1 = phi1.cos();
		let tan_phi1 = phi1.tan();

		let c1 = self.ep2 * cos_phi1 * cos_phi1;
		let t1 = tan_phi1 * tan_phi1;
		let n1 = self.a / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
		let r1 = self.a * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
		let d = (x - FALSE_EASTING) / (n1 * K0);

		let d2 = d * d;
		let d3 = d2 * d;
		let d4 = d3 * d;
		let d5 = d4 * d;
		let d6 = d5 * d;

		let phi = phi1
			- (n1 * tan_phi1 / r1)
				* (d2 / 2.0
					- (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * self.ep2) * d4 / 24.0
					+ (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * self.ep2 - 3.0 * c1 * c1) * d6 / 720.0);
		let lam = self.lon0
			+ (d - (1.0 + 2.0 * t1 + c1) * d3 / 6.0
				+ (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * self.ep2 + 24.0 * t1 * t1) * d5 / 120.0)
				/ cos_phi1;

		(lam.to_degrees(), phi.to_degrees())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn central_meridian_maps_to_false_easting() {
		let utm = TransverseMercator::utm_etrs89(32);
		let (e, n) = utm.from_geographic(9.0, 0.0);
		assert!((e - FALSE_EASTING).abs() < 1e-6);
		assert!(n.abs() < 1e-6);
	}

	#[test]
	fn southern_hemisphere_offset() {
		let utm = TransverseMercator::utm_wgs84(33, false);
		let (_, n) = utm.from_geographic(15.0, -0.0001);
		assert!(n < FALSE_NORTHING_SOUTH);
		assert!(n > FALSE_NORTHING_SOUTH - 100.0);
	}

	#[test]
	fn round_trip_inside_zone() {
		let utm = TransverseMercator::utm_wgs84(32, true);
		for &(lon, lat) in &[(6.0, 45.0), (9.0, 55.0), (11.9, 48.1), (7.5, 60.0)] {
			let (e, n) = utm.from_geographic(lon, lat);
			let (lon2, lat2) = utm.to_geographic(e, n);
			assert!((lon - lon2).abs() < 1e-7, "lon {lon} -> {lon2}");
			assert!((lat - lat2).abs() < 1e-7, "lat {lat} -> {lat2}");
		}
	}
}
