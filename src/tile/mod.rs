//! Mapbox vector tile decoding.
//!
//! The same wire format carries two payloads: the traffic-sign feature tiles
//! (points, converted to lon/lat) and the per-detection segmentation geometry
//! (polygons in tile-local units, embedded as base64).

use std::collections::BTreeMap;
use std::f64::consts::PI;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use prost::Message;
use serde_json::{Map, Value, json};

use crate::error::DecodeError;
use crate::geo::Tile;
use crate::model::MapboxTile;

/// Layer holding the traffic-sign points in feature tiles.
pub const SIGN_LAYER: &str = "traffic_sign";
/// Layer the service returns in place of an empty feature tile.
pub const WATER_LAYER: &str = "water";
pub const DEFAULT_EXTENT: u32 = 4096;

#[derive(Clone, PartialEq, prost::Message)]
pub struct VectorTile {
    #[prost(message, repeated, tag = "3")]
    pub layers: Vec<VectorTileLayer>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VectorTileLayer {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub features: Vec<VectorTileFeature>,
    #[prost(string, repeated, tag = "3")]
    pub keys: Vec<String>,
    #[prost(message, repeated, tag = "4")]
    pub values: Vec<VectorTileValue>,
    #[prost(uint32, optional, tag = "5")]
    pub extent: Option<u32>,
    #[prost(uint32, required, tag = "15")]
    pub version: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VectorTileFeature {
    #[prost(uint64, optional, tag = "1")]
    pub id: Option<u64>,
    #[prost(uint32, repeated, tag = "2")]
    pub tags: Vec<u32>,
    #[prost(enumeration = "VectorTileGeomType", optional, tag = "3")]
    pub geometry_type: Option<i32>,
    #[prost(uint32, repeated, tag = "4")]
    pub geometry: Vec<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VectorTileValue {
    #[prost(string, optional, tag = "1")]
    pub string_value: Option<String>,
    #[prost(float, optional, tag = "2")]
    pub float_value: Option<f32>,
    #[prost(double, optional, tag = "3")]
    pub double_value: Option<f64>,
    #[prost(int64, optional, tag = "4")]
    pub int_value: Option<i64>,
    #[prost(uint64, optional, tag = "5")]
    pub uint_value: Option<u64>,
    #[prost(sint64, optional, tag = "6")]
    pub sint_value: Option<i64>,
    #[prost(bool, optional, tag = "7")]
    pub bool_value: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum VectorTileGeomType {
    Unknown = 0,
    Point = 1,
    LineString = 2,
    Polygon = 3,
}

/// Where the y axis starts.
///
/// Tiles are encoded with a top-left origin; detection geometry is consumed with
/// y pointing up, matching how the service documents segmentation polygons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    TopLeft,
    BottomLeft,
}

pub type Point = (f64, f64);

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Vec<Point>),
    LineString(Vec<Vec<Point>>),
    /// One polygon: exterior ring first, then its holes.
    Polygon(Vec<Vec<Point>>),
    /// Several exterior rings in one feature, each with its holes.
    MultiPolygon(Vec<Vec<Vec<Point>>>),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: Option<u64>,
    pub properties: Map<String, Value>,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub extent: u32,
    pub features: Vec<Feature>,
}

pub type Layers = BTreeMap<String, Layer>;

/// Decode a raw vector tile into layers keyed by name.
pub fn decode_layers(bytes: &[u8], origin: Origin) -> Result<Layers, DecodeError> {
    let tile = VectorTile::decode(bytes)?;
    let mut layers = Layers::new();
    for layer in tile.layers {
        let extent = layer.extent.unwrap_or(DEFAULT_EXTENT).max(1);
        let features = layer
            .features
            .iter()
            .map(|feature| Feature {
                id: feature.id,
                properties: decode_properties(&layer, feature),
                geometry: decode_geometry_commands(feature, extent, origin),
            })
            .collect();
        layers.insert(layer.name, Layer { extent, features });
    }
    Ok(layers)
}

/// Decode a detection's base64 geometry. Coordinates come back with a bottom-left origin.
pub fn decode_geometry(geom_b64: &str) -> Result<Layers, DecodeError> {
    let bytes = STANDARD.decode(geom_b64.trim())?;
    decode_layers(&bytes, Origin::BottomLeft)
}

/// The service answers empty feature tiles with a lone water layer.
pub fn is_empty_tile(layers: &Layers) -> bool {
    !layers.contains_key(SIGN_LAYER) && layers.contains_key(WATER_LAYER)
}

/// Convert the sign layer to GeoJSON and validate it into a [`MapboxTile`].
pub fn to_mapbox_tile(layers: &Layers, tile: Tile) -> Result<MapboxTile, serde_json::Error> {
    let mut features = Vec::new();
    if let Some(layer) = layers.get(SIGN_LAYER) {
        for feature in &layer.features {
            let Geometry::Point(points) = &feature.geometry else {
                continue;
            };
            let Some(&(x, y)) = points.first() else {
                continue;
            };
            let (lon, lat) = tile_point_to_lonlat(tile, x, y, layer.extent);
            let mut properties = feature.properties.clone();
            if let Some(id) = feature.id {
                properties.entry("id").or_insert_with(|| json!(id));
            }
            features.push(json!({
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [lon, lat] },
                "properties": properties,
            }));
        }
    }
    serde_json::from_value(json!({
        "type": "FeatureCollection",
        "features": features,
    }))
}

/// Tile-local (top-left origin) coordinates to lon/lat.
pub fn tile_point_to_lonlat(tile: Tile, x: f64, y: f64, extent: u32) -> (f64, f64) {
    let extent = f64::from(extent.max(1));
    let n = 2_f64.powi(i32::from(tile.z));
    let gx = f64::from(tile.x) + x / extent;
    let gy = f64::from(tile.y) + y / extent;
    let lon = gx / n * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * gy / n)).sinh().atan().to_degrees();
    (lon, lat)
}

fn decode_properties(
    layer: &VectorTileLayer,
    feature: &VectorTileFeature,
) -> Map<String, Value> {
    let mut properties = Map::new();
    for pair in feature.tags.chunks_exact(2) {
        let Some(key) = layer.keys.get(pair[0] as usize) else {
            continue;
        };
        let Some(value) = layer.values.get(pair[1] as usize) else {
            continue;
        };
        properties.insert(key.clone(), vector_tile_value_to_json(value));
    }
    properties
}

fn vector_tile_value_to_json(value: &VectorTileValue) -> Value {
    if let Some(v) = &value.string_value {
        return json!(v);
    }
    if let Some(v) = value.bool_value {
        return json!(v);
    }
    if let Some(v) = value.int_value {
        return json!(v);
    }
    if let Some(v) = value.uint_value {
        return json!(v);
    }
    if let Some(v) = value.sint_value {
        return json!(v);
    }
    if let Some(v) = value.double_value {
        return json!(v);
    }
    if let Some(v) = value.float_value {
        return json!(f64::from(v));
    }
    Value::Null
}

fn decode_geometry_commands(
    feature: &VectorTileFeature,
    extent: u32,
    origin: Origin,
) -> Geometry {
    let flip_path = |path: Vec<(i32, i32)>| -> Vec<Point> {
        path.into_iter()
            .map(|(x, y)| match origin {
                Origin::TopLeft => (f64::from(x), f64::from(y)),
                Origin::BottomLeft => (f64::from(x), f64::from(extent) - f64::from(y)),
            })
            .collect()
    };
    let paths = decode_mvt_paths(&feature.geometry);

    match feature.geometry_type.and_then(VectorTileGeomType::from_i32) {
        Some(VectorTileGeomType::Point) => {
            Geometry::Point(paths.into_iter().flat_map(flip_path).collect())
        }
        Some(VectorTileGeomType::LineString) => {
            Geometry::LineString(paths.into_iter().map(flip_path).collect())
        }
        Some(VectorTileGeomType::Polygon) => {
            let mut polygons: Vec<Vec<Vec<Point>>> = classify_rings(paths)
                .into_iter()
                .map(|rings| rings.into_iter().map(flip_path).collect())
                .collect();
            if polygons.len() == 1 {
                Geometry::Polygon(polygons.swap_remove(0))
            } else {
                Geometry::MultiPolygon(polygons)
            }
        }
        _ => Geometry::Unknown,
    }
}

/// Shoelace area in encoded (y down) tile coordinates.
fn ring_signed_area(ring: &[(i32, i32)]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut area = 0.0;
    for i in 0..ring.len() {
        let j = (i + 1) % ring.len();
        area += f64::from(ring[i].0) * f64::from(ring[j].1);
        area -= f64::from(ring[j].0) * f64::from(ring[i].1);
    }
    area / 2.0
}

/// Group polygon rings into polygons by winding.
///
/// The first non-degenerate ring's winding marks exteriors; rings wound the other way are
/// holes of the exterior before them. Zero-area rings are dropped unless the
/// feature has a single ring.
fn classify_rings(rings: Vec<Vec<(i32, i32)>>) -> Vec<Vec<Vec<(i32, i32)>>> {
    if rings.len() <= 1 {
        return vec![rings];
    }

    let mut polygons = Vec::new();
    let mut polygon: Vec<Vec<(i32, i32)>> = Vec::new();
    let mut exterior_positive = None;
    for ring in rings {
        let area = ring_signed_area(&ring);
        if area == 0.0 {
            continue;
        }
        let positive = area > 0.0;
        if *exterior_positive.get_or_insert(positive) == positive && !polygon.is_empty() {
            polygons.push(std::mem::take(&mut polygon));
        }
        polygon.push(ring);
    }
    if !polygon.is_empty() {
        polygons.push(polygon);
    }
    polygons
}

fn decode_mvt_paths(commands: &[u32]) -> Vec<Vec<(i32, i32)>> {
    let mut paths: Vec<Vec<(i32, i32)>> = Vec::new();
    let mut path: Vec<(i32, i32)> = Vec::new();
    let mut cursor = 0usize;
    let mut x = 0i32;
    let mut y = 0i32;

    while cursor < commands.len() {
        let command = commands[cursor];
        cursor += 1;
        let id = command & 0x7;
        let count = command >> 3;
        match id {
            1 | 2 => {
                for _ in 0..count {
                    if cursor + 1 >= commands.len() {
                        break;
                    }
                    x = x.wrapping_add(decode_zigzag_i32(commands[cursor]));
                    y = y.wrapping_add(decode_zigzag_i32(commands[cursor + 1]));
                    cursor += 2;
                    if id == 1 && !path.is_empty() {
                        paths.push(std::mem::take(&mut path));
                    }
                    path.push((x, y));
                }
            }
            7 => {
                if let Some(first) = path.first().copied() {
                    path.push(first);
                }
            }
            _ => break,
        }
    }
    if !path.is_empty() {
        paths.push(path);
    }
    paths
}

fn decode_zigzag_i32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}
