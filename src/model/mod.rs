use serde::{Deserialize, Serialize};

pub mod api;

fn point_type() -> String {
    "Point".to_string()
}

fn feature_type() -> String {
    "Feature".to_string()
}

fn collection_type() -> String {
    "FeatureCollection".to_string()
}

/// GeoJSON point: `[longitude, latitude]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointGeometry {
    #[serde(rename = "type", default = "point_type")]
    pub kind: String,
    pub coordinates: (f64, f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSignProperties {
    pub id: u64,
    pub value: String,
    #[serde(default)]
    pub first_seen_at: Option<i64>,
    #[serde(default)]
    pub last_seen_at: Option<i64>,
}

/// A traffic sign as mapped by the service. Identity is the feature id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSignFeature {
    pub geometry: PointGeometry,
    pub properties: TrafficSignProperties,
    #[serde(rename = "type", default = "feature_type")]
    pub kind: String,
}

impl TrafficSignFeature {
    pub fn new(id: u64, value: impl Into<String>, lon: f64, lat: f64) -> Self {
        Self {
            geometry: PointGeometry {
                kind: point_type(),
                coordinates: (lon, lat),
            },
            properties: TrafficSignProperties {
                id,
                value: value.into(),
                first_seen_at: None,
                last_seen_at: None,
            },
            kind: feature_type(),
        }
    }

    pub fn id(&self) -> u64 {
        self.properties.id
    }

    pub fn value(&self) -> &str {
        &self.properties.value
    }

    pub fn longitude(&self) -> f64 {
        self.geometry.coordinates.0
    }

    pub fn latitude(&self) -> f64 {
        self.geometry.coordinates.1
    }
}

/// Sign features of one tile, validated from GeoJSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapboxTile {
    #[serde(rename = "type", default = "collection_type")]
    pub kind: String,
    #[serde(default)]
    pub features: Vec<TrafficSignFeature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapillaryImageCreator {
    pub id: u64,
    pub username: Option<String>,
}

/// One detection box. A detection whose geometry holds several polygons is
/// stored once per polygon, all sharing `id` and `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapillaryImageDetection {
    pub id: u64,
    pub value: String,
    /// Base64 vector tile in the image's tile-local space.
    pub geometry: Option<String>,
    /// `[xmin, ymin, xmax, ymax]` in pixels.
    pub bbox: Option<[u32; 4]>,
    pub image_id: u64,
}

/// An image associated with one or more traffic signs.
///
/// `width`/`height` are only known once the image is downloaded; `image_bytes`
/// is dropped again as soon as the image is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapillaryImage {
    pub id: u64,
    pub url: String,
    pub camera_type: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub sequence: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub creator: Option<MapillaryImageCreator>,
    pub detections: Vec<MapillaryImageDetection>,
    /// Size reported by the metadata endpoint, for the original upload.
    #[serde(skip)]
    pub reported_size: Option<(u32, u32)>,
    #[serde(skip)]
    pub image_bytes: Option<Vec<u8>>,
}

impl MapillaryImage {
    pub fn new(id: u64, url: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            id,
            url: url.into(),
            camera_type: None,
            lat,
            lon,
            sequence: None,
            width: None,
            height: None,
            creator: None,
            detections: Vec::new(),
            reported_size: None,
            image_bytes: None,
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        }
    }

    pub fn release_bytes(&mut self) {
        self.image_bytes = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_feature_from_geojson() {
        let feature: TrafficSignFeature = serde_json::from_value(json!({
            "type": "Feature",
            "geometry": {"type": "Point", "coordinates": [-79.39, 43.65]},
            "properties": {
                "id": 492883,
                "value": "regulatory--stop--g1",
                "first_seen_at": 1500000000000_i64,
                "last_seen_at": 1600000000000_i64
            }
        }))
        .unwrap();
        assert_eq!(feature.id(), 492883);
        assert_eq!(feature.value(), "regulatory--stop--g1");
        assert_eq!(feature.longitude(), -79.39);
        assert_eq!(feature.latitude(), 43.65);
    }

    #[test]
    fn test_image_serialization_skips_runtime_fields() {
        let mut image = MapillaryImage::new(7, "http://img.test/7.jpg", 1.0, 2.0);
        image.image_bytes = Some(vec![1, 2, 3]);
        image.reported_size = Some((10, 20));
        image.detections.push(MapillaryImageDetection {
            id: 9,
            value: "x".to_string(),
            geometry: None,
            bbox: Some([1, 2, 3, 4]),
            image_id: 7,
        });
        let value = serde_json::to_value(&image).unwrap();
        assert!(value.get("image_bytes").is_none());
        assert!(value.get("reported_size").is_none());
        assert_eq!(value["detections"][0]["bbox"], json!([1, 2, 3, 4]));
        assert_eq!(value["detections"][0]["image_id"], json!(7));

        image.release_bytes();
        assert!(image.image_bytes.is_none());
    }
}
