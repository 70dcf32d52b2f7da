//! GeoJSON and WKT ingestion for polygon coverages.
//!
//! Only the surface needed for coverages is supported: `Polygon` and
//! `MultiPolygon` geometries, optionally wrapped in a `Feature` or a
//! `FeatureCollection` (whose polygonal features are merged).

use anyhow::{Context, Result, bail, ensure};
use geo::{Coord, LineString, MultiPolygon, Polygon};
use serde_json::Value;

fn ring_from_json(value: &Value) -> Result<LineString<f64>> {
	let points = value.as_array().context("ring must be an array")?;
	ensure!(points.len() >= 4, "ring needs at least 4 positions");
	let mut coords = Vec::with_capacity(points.len());
	for point in points {
		let pos = point.as_array().context("position must be an array")?;
		ensure!(pos.len() >= 2, "position needs x and y");
		coords.push(Coord {
			x: pos[0].as_f64().context("x must be a number")?,
			y: pos[1].as_f64().context("y must be a number")?,
		});
	}
	Ok(LineString(coords))
}

fn polygon_from_json(rings: &Value) -> Result<Polygon<f64>> {
	let rings = rings.as_array().context("polygon coordinates must be an array")?;
	ensure!(!rings.is_empty(), "polygon needs an exterior ring");
	let exterior = ring_from_json(&rings[0])?;
	let interiors = rings[1..].iter().map(ring_from_json).collect::<Result<Vec<_>>>()?;
	Ok(Polygon::new(exterior, interiors))
}

fn geometry_from_json(value: &Value) -> Result<Vec<Polygon<f64>>> {
	let geometry_type = value["type"].as_str().context("geometry has no type")?;
	match geometry_type {
		"Polygon" => Ok(vec![polygon_from_json(&value["coordinates"])?]),
		"MultiPolygon" => {
			let polygons = value["coordinates"]
				.as_array()
				.context("MultiPolygon coordinates must be an array")?;
			polygons.iter().map(polygon_from_json).collect()
		}
		"Feature" => geometry_from_json(&value["geometry"]),
		"FeatureCollection" => {
			let features = value["features"].as_array().context("missing features")?;
			let mut all = Vec::new();
			for feature in features {
				all.extend(geometry_from_json(feature)?);
			}
			Ok(all)
		}
		other => bail!("unsupported GeoJSON type '{other}' for a coverage"),
	}
}

pub fn multi_polygon_from_geojson(geojson: &str) -> Result<MultiPolygon<f64>> {
	let value: Value = serde_json::from_str(geojson).context("invalid JSON")?;
	Ok(MultiPolygon::new(geometry_from_json(&value)?))
}

// --- WKT ---

struct WktParser<'a> {
	input: &'a str,
	pos: usize,
}

impl<'a> WktParser<'a> {
	fn new(input: &'a str) -> WktParser<'a> {
		WktParser { input, pos: 0 }
	}

	fn skip_ws(&mut self) {
		while self.input[self.pos..].starts_with(|c: char| c.is_ascii_whitespace()) {
			self.pos += 1;
		}
	}

	fn expect(&mut self, token: char) -> Result<()> {
		self.skip_ws();
		ensure!(
			self.input[self.pos..].starts_with(token),
			"expected '{token}' at offset {} in WKT",
			self.pos
		);
		self.pos += token.len_utf8();
		Ok(())
	}

	fn peek(&mut self) -> Option<char> {
		self.skip_ws();
		self.input[self.pos..].chars().next()
	}

	fn number(&mut self) -> Result<f64> {
		self.skip_ws();
		let rest = &self.input[self.pos..];
		let len = rest
			.find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e' || c == 'E'))
			.unwrap_or(rest.len());
		ensure!(len > 0, "expected a number at offset {} in WKT", self.pos);
		let value = rest[..len].parse::<f64>().context("invalid number in WKT")?;
		self.pos += len;
		Ok(value)
	}

	fn ring(&mut self) -> Result<LineString<f64>> {
		self.expect('(')?;
		let mut coords = Vec::new();
		loop {
			let x = self.number()?;
			let y = self.number()?;
			coords.push(Coord { x, y });
			match self.peek() {
				Some(',') => self.expect(',')?,
				_ => break,
			}
		}
		self.expect(')')?;
		ensure!(coords.len() >= 4, "WKT ring needs at least 4 positions");
		Ok(LineString(coords))
	}

	fn polygon_body(&mut self) -> Result<Polygon<f64>> {
		self.expect('(')?;
		let exterior = self.ring()?;
		let mut interiors = Vec::new();
		while self.peek() == Some(',') {
			self.expect(',')?;
			interiors.push(self.ring()?);
		}
		self.expect(')')?;
		Ok(Polygon::new(exterior, interiors))
	}
}

pub fn multi_polygon_from_wkt(wkt: &str) -> Result<MultiPolygon<f64>> {
	let trimmed = wkt.trim_start();
	let upper = trimmed.to_ascii_uppercase();
	if let Some(rest_at) = upper.strip_prefix("MULTIPOLYGON") {
		let offset = trimmed.len() - rest_at.len();
		let mut parser = WktParser::new(&trimmed[offset..]);
		parser.expect('(')?;
		let mut polygons = vec![parser.polygon_body()?];
		while parser.peek() == Some(',') {
			parser.expect(',')?;
			polygons.push(parser.polygon_body()?);
		}
		parser.expect(')')?;
		Ok(MultiPolygon::new(polygons))
	} else if let Some(rest_at) = upper.strip_prefix("POLYGON") {
		let offset = trimmed.len() - rest_at.len();
		let mut parser = WktParser::new(&trimmed[offset..]);
		Ok(MultiPolygon::new(vec![parser.polygon_body()?]))
	} else {
		bail!("WKT coverage must be POLYGON or MULTIPOLYGON");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use geo::Area;

	#[test]
	fn parses_geojson_polygon() {
		let geojson = r#"{"type":"Polygon","coordinates":[[[0,0],[10,0],[10,10],[0,10],[0,0]]]}"#;
		let geom = multi_polygon_from_geojson(geojson).unwrap();
		assert_eq!(geom.0.len(), 1);
		assert!((geom.unsigned_area() - 100.0).abs() < 1e-9);
	}

	#[test]
	fn parses_geojson_feature_collection() {
		let geojson = r#"{
			"type": "FeatureCollection",
			"features": [
				{"type": "Feature", "properties": {}, "geometry":
					{"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}},
				{"type": "Feature", "properties": {}, "geometry":
					{"type": "MultiPolygon", "coordinates": [[[[2,0],[3,0],[3,1],[2,1],[2,0]]]]}}
			]
		}"#;
		let geom = multi_polygon_from_geojson(geojson).unwrap();
		assert_eq!(geom.0.len(), 2);
	}

	#[test]
	fn rejects_point_geojson() {
		let geojson = r#"{"type":"Point","coordinates":[0,0]}"#;
		assert!(multi_polygon_from_geojson(geojson).is_err());
	}

	#[test]
	fn parses_wkt_polygon_with_hole() {
		let wkt = "POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0), (4 4, 6 4, 6 6, 4 6, 4 4))";
		let geom = multi_polygon_from_wkt(wkt).unwrap();
		assert_eq!(geom.0.len(), 1);
		assert_eq!(geom.0[0].interiors().len(), 1);
		assert!((geom.unsigned_area() - 96.0).abs() < 1e-9);
	}

	#[test]
	fn parses_wkt_multipolygon() {
		let wkt = "MULTIPOLYGON (((0 0, 1 0, 1 1, 0 1, 0 0)), ((2 0, 3 0, 3 1, 2 1, 2 0)))";
		let geom = multi_polygon_from_wkt(wkt).unwrap();
		assert_eq!(geom.0.len(), 2);
	}

	#[test]
	fn parses_negative_and_scientific_numbers() {
		let wkt = "POLYGON ((-1.5 -2.5, 1e1 -2.5, 1e1 3.25, -1.5 3.25, -1.5 -2.5))";
		let geom = multi_polygon_from_wkt(wkt).unwrap();
		assert_eq!(geom.0[0].exterior().0.len(), 5);
	}

	#[test]
	fn rejects_linestring_wkt() {
		assert!(multi_polygon_from_wkt("LINESTRING (0 0, 1 1)").is_err());
	}
}
