use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The only zoom level the traffic-sign tile endpoint serves.
pub const FEATURE_ZOOM: u8 = 14;

/// A slippy-map tile index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl Tile {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Geographic envelope in degrees. No antimeridian handling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub fn contains_point(&self, lon: f64, lat: f64) -> bool {
        lon >= self.west && lon <= self.east && lat >= self.south && lat <= self.north
    }
}

/// Tile index containing a point. Fractional indices are truncated, not rounded.
pub fn lonlat_to_tile(lon: f64, lat: f64, z: u8) -> (i64, i64) {
    let n = 2_f64.powi(i32::from(z));
    let x = (lon + 180.0) / 360.0 * n;
    let lat_rad = lat.to_radians();
    let y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n;
    (x as i64, y as i64)
}

fn tile_corner(x: f64, y: f64, n: f64) -> (f64, f64) {
    let lon = x / n * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
    (lon, lat)
}

/// Geographic envelope of a tile: (x, y) is the north-west corner, (x+1, y+1) the south-east.
pub fn tile_to_bbox(tile: Tile) -> BBox {
    let n = 2_f64.powi(i32::from(tile.z));
    let (west, north) = tile_corner(f64::from(tile.x), f64::from(tile.y), n);
    let (east, south) = tile_corner(f64::from(tile.x) + 1.0, f64::from(tile.y) + 1.0, n);
    BBox {
        west,
        south,
        east,
        north,
    }
}

/// True only when the tile's envelope lies entirely inside `bbox`.
pub fn tile_in_bbox(tile: Tile, bbox: &BBox) -> bool {
    let t = tile_to_bbox(tile);
    t.west >= bbox.west && t.east <= bbox.east && t.south >= bbox.south && t.north <= bbox.north
}

/// All zoom-14 tiles covering `bbox`.
///
/// With `strict`, tiles that merely overlap the box edge are dropped, so a small
/// box can yield no tiles at all even when features sit inside it.
pub fn get_tiles_in_bbox(bbox: &BBox, strict: bool) -> Vec<Tile> {
    let z = FEATURE_ZOOM;
    let (x_a, y_a) = lonlat_to_tile(bbox.west, bbox.north, z);
    let (x_b, y_b) = lonlat_to_tile(bbox.east, bbox.south, z);

    let max_index = (1_i64 << z) - 1;
    let clamp = |v: i64| v.clamp(0, max_index) as u32;
    let (x_a, x_b, y_a, y_b) = (clamp(x_a), clamp(x_b), clamp(y_a), clamp(y_b));

    let mut tiles = Vec::new();
    for x in x_a.min(x_b)..=x_a.max(x_b) {
        for y in y_a.min(y_b)..=y_a.max(y_b) {
            let tile = Tile::new(z, x, y);
            if strict && !tile_in_bbox(tile, bbox) {
                continue;
            }
            tiles.push(tile);
        }
    }
    tiles
}
