use log::{debug, warn};

use crate::download::{ApiResult, MapillaryClient};
use crate::model::api::{DataList, DetectionRecord};
use crate::model::{MapillaryImage, MapillaryImageCreator, MapillaryImageDetection};
use crate::tile::{Geometry, Point, decode_geometry};

const DETECTION_FIELDS: &str = "id,value,geometry,image{id,creator}";

/// Raw detections of `image`. Also records the image creator, taken from the
/// first detection.
///
/// Any failure reads as "no detections".
pub fn get_detections_by_image(
    client: &MapillaryClient,
    image: &mut MapillaryImage,
) -> Vec<MapillaryImageDetection> {
    let url = client.detections_url(image.id);
    let value = match client.get_json(&url, &[("fields", DETECTION_FIELDS.to_string())]) {
        ApiResult::Ok(value) => value,
        status => {
            warn!("detections fetch failed for image {}: {:?}", image.id, status);
            return Vec::new();
        }
    };
    let records = match serde_json::from_value::<DataList<DetectionRecord>>(value) {
        Ok(list) => list.into_vec(),
        Err(err) => {
            warn!("invalid detections payload for image {}: {}", image.id, err);
            return Vec::new();
        }
    };

    if let Some(first) = records.first() {
        let creator = first.image.as_ref().and_then(|i| i.creator.as_ref());
        if let Some(creator) = creator {
            match creator.id {
                Some(id) => {
                    image.creator = Some(MapillaryImageCreator {
                        id,
                        username: creator.username.clone(),
                    })
                }
                None => debug!("image {} has a creator without id", image.id),
            }
        }
    }

    records
        .into_iter()
        .map(|record| MapillaryImageDetection {
            id: record.id,
            value: record.value,
            geometry: record.geometry,
            bbox: None,
            image_id: image.id,
        })
        .collect()
}

/// Tile-local ring (bottom-left origin, `extent` units) to image pixels (top-left origin).
pub fn project_coords(ring: &[Point], img_w: u32, img_h: u32, extent: u32) -> Vec<Point> {
    let extent = f64::from(extent.max(1));
    let sx = f64::from(img_w) / extent;
    let sy = f64::from(img_h) / extent;
    let h = f64::from(img_h);
    ring.iter().map(|&(x, y)| (x * sx, h - y * sy)).collect()
}

/// Round and clamp a box into `[0, w-1] x [0, h-1]`, keeping min <= max.
pub fn clamp_box(xmin: f64, ymin: f64, xmax: f64, ymax: f64, w: u32, h: u32) -> [u32; 4] {
    let clamp = |v: f64, size: u32| -> u32 {
        let max = i64::from(size.max(1)) - 1;
        (v.round() as i64).clamp(0, max) as u32
    };
    let (mut x1, mut y1) = (clamp(xmin, w), clamp(ymin, h));
    let (mut x2, mut y2) = (clamp(xmax, w), clamp(ymax, h));
    if x2 < x1 {
        std::mem::swap(&mut x1, &mut x2);
    }
    if y2 < y1 {
        std::mem::swap(&mut y1, &mut y2);
    }
    [x1, y1, x2, y2]
}

/// Pixel boxes for every polygon in the detection's geometry, one per exterior
/// ring. Holes do not add boxes.
///
/// Needs the image dimensions; missing or undecodable geometry gives no boxes.
pub fn resolve_detection_boxes(
    detection: &MapillaryImageDetection,
    image: &MapillaryImage,
) -> Vec<[u32; 4]> {
    let Some((width, height)) = image.dimensions() else {
        warn!("image {} has no dimensions, cannot place detection {}", image.id, detection.id);
        return Vec::new();
    };
    let Some(geometry) = detection.geometry.as_deref().filter(|g| !g.is_empty()) else {
        return Vec::new();
    };
    let layers = match decode_geometry(geometry) {
        Ok(layers) => layers,
        Err(err) => {
            warn!("detection {} on image {}: {}", detection.id, image.id, err);
            return Vec::new();
        }
    };

    let mut boxes = Vec::new();
    for layer in layers.values() {
        for feature in &layer.features {
            let polygons = match &feature.geometry {
                Geometry::Polygon(rings) => std::slice::from_ref(rings),
                Geometry::MultiPolygon(polygons) => polygons.as_slice(),
                _ => continue,
            };
            for rings in polygons {
                let Some(exterior) = rings.first().filter(|r| !r.is_empty()) else {
                    continue;
                };
                boxes.push(ring_box(exterior, width, height, layer.extent));
            }
        }
    }
    boxes
}

fn ring_box(ring: &[Point], width: u32, height: u32, extent: u32) -> [u32; 4] {
    let projected = project_coords(ring, width, height, extent);
    let (mut xmin, mut ymin) = (f64::INFINITY, f64::INFINITY);
    let (mut xmax, mut ymax) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for &(x, y) in &projected {
        xmin = xmin.min(x);
        xmax = xmax.max(x);
        ymin = ymin.min(y);
        ymax = ymax.max(y);
    }
    clamp_box(xmin, ymin, xmax, ymax, width, height)
}

/// Resolve `detections` against `image` and append one record per box to it.
/// Returns the number of boxes added.
pub fn attach_detection_boxes(
    image: &mut MapillaryImage,
    detections: &[MapillaryImageDetection],
) -> usize {
    let mut added = 0;
    for detection in detections {
        let boxes = resolve_detection_boxes(detection, image);
        for bbox in boxes {
            image.detections.push(MapillaryImageDetection {
                bbox: Some(bbox),
                ..detection.clone()
            });
            added += 1;
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeTransport, polygon_tile, test_config};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::json;
    use std::sync::Arc;

    fn detection(geometry: Option<String>) -> MapillaryImageDetection {
        MapillaryImageDetection {
            id: 55,
            value: "regulatory--stop--g1".to_string(),
            geometry,
            bbox: None,
            image_id: 1,
        }
    }

    fn sized_image(w: u32, h: u32) -> MapillaryImage {
        let mut image = MapillaryImage::new(1, "http://img.test/1", 0.0, 0.0);
        image.width = Some(w);
        image.height = Some(h);
        image
    }

    #[test]
    fn test_full_tile_ring_maps_to_full_image() {
        let ring = [(0.0, 0.0), (4096.0, 0.0), (4096.0, 4096.0), (0.0, 4096.0)];
        let projected = project_coords(&ring, 800, 600, 4096);
        assert_eq!(projected, vec![(0.0, 600.0), (800.0, 600.0), (800.0, 0.0), (0.0, 0.0)]);
        assert_eq!(clamp_box(0.0, 0.0, 800.0, 600.0, 800, 600), [0, 0, 799, 599]);
    }

    #[test]
    fn test_clamp_box_swaps_and_bounds() {
        assert_eq!(clamp_box(50.4, 20.6, 10.0, 5.0, 100, 100), [10, 5, 50, 21]);
        assert_eq!(clamp_box(-20.0, -1.0, 2000.0, 5000.0, 640, 480), [0, 0, 639, 479]);
        assert_eq!(clamp_box(1.0, 1.0, 2.0, 2.0, 0, 0), [0, 0, 0, 0]);
    }

    #[test]
    fn test_clamp_box_is_idempotent() {
        let values = [-100.0, -0.5, 0.0, 0.49, 3.5, 99.2, 639.6, 640.0, 10_000.0];
        let (w, h) = (640, 480);
        for &a in &values {
            for &b in &values {
                for &c in &values {
                    let once = clamp_box(a, b, c, a + b, w, h);
                    let twice = clamp_box(
                        f64::from(once[0]),
                        f64::from(once[1]),
                        f64::from(once[2]),
                        f64::from(once[3]),
                        w,
                        h,
                    );
                    assert_eq!(once, twice);
                    assert!(once[0] <= once[2] && once[2] <= w - 1);
                    assert!(once[1] <= once[3] && once[3] <= h - 1);
                }
            }
        }
    }

    #[test]
    fn test_resolve_full_tile_polygon() {
        // Top-left encoding of the bottom-left ring (0,0) (4096,0) (4096,4096) (0,4096).
        let ring = vec![(0, 4096), (4096, 4096), (4096, 0), (0, 0)];
        let b64 = STANDARD.encode(polygon_tile(4096, &[vec![ring]]));
        let boxes = resolve_detection_boxes(&detection(Some(b64)), &sized_image(800, 600));
        assert_eq!(boxes, vec![[0, 0, 799, 599]]);
    }

    #[test]
    fn test_resolve_multiple_polygons() {
        // Left quarter-tile square near the top, and a right one near the bottom.
        let upper_left = vec![(0, 0), (1024, 0), (1024, 1024), (0, 1024)];
        let lower_right = vec![(3072, 3072), (4096, 3072), (4096, 4096), (3072, 4096)];
        let b64 = STANDARD.encode(polygon_tile(4096, &[vec![upper_left], vec![lower_right]]));
        let mut image = sized_image(400, 400);
        let boxes = resolve_detection_boxes(&detection(Some(b64.clone())), &image);
        assert_eq!(boxes, vec![[0, 0, 100, 100], [300, 300, 399, 399]]);

        let added = attach_detection_boxes(&mut image, &[detection(Some(b64))]);
        assert_eq!(added, 2);
        assert!(image.detections.iter().all(|d| d.id == 55 && d.value == "regulatory--stop--g1"));
        assert_eq!(image.detections[1].bbox, Some([300, 300, 399, 399]));
    }

    #[test]
    fn test_multipolygon_feature_gives_one_box_per_exterior() {
        let upper_left = vec![(0, 0), (1024, 0), (1024, 1024), (0, 1024)];
        let lower_right = vec![(3072, 3072), (4096, 3072), (4096, 4096), (3072, 4096)];
        let hole = vec![(3200, 3200), (3200, 3300), (3300, 3300), (3300, 3200)];
        let b64 = STANDARD.encode(polygon_tile(4096, &[vec![upper_left, lower_right, hole]]));
        let boxes = resolve_detection_boxes(&detection(Some(b64)), &sized_image(400, 400));
        assert_eq!(boxes, vec![[0, 0, 100, 100], [300, 300, 399, 399]]);
    }

    #[test]
    fn test_unusable_geometry_gives_no_boxes() {
        let image = sized_image(800, 600);
        assert!(resolve_detection_boxes(&detection(None), &image).is_empty());
        assert!(resolve_detection_boxes(&detection(Some(String::new())), &image).is_empty());
        assert!(resolve_detection_boxes(&detection(Some("%%%".to_string())), &image).is_empty());

        let ring = vec![(0, 0), (10, 0), (10, 10)];
        let b64 = STANDARD.encode(polygon_tile(4096, &[vec![ring]]));
        let no_size = MapillaryImage::new(1, "u", 0.0, 0.0);
        assert!(resolve_detection_boxes(&detection(Some(b64)), &no_size).is_empty());
    }

    #[test]
    fn test_get_detections_attaches_creator() {
        let fake = Arc::new(FakeTransport::new());
        let client = MapillaryClient::with_transport(test_config(), fake.clone());
        fake.respond_json(
            "http://graph.test/1/detections",
            json!({"data": [
                {"id": "10", "value": "regulatory--stop--g1", "geometry": "abc",
                 "image": {"id": "1", "creator": {"id": "42", "username": "mapper"}}},
                {"id": "11", "value": "warning--curve-left--g1"}
            ]}),
        );
        let mut image = MapillaryImage::new(1, "http://img.test/1", 0.0, 0.0);
        let detections = get_detections_by_image(&client, &mut image);

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].geometry.as_deref(), Some("abc"));
        assert_eq!(detections[1].geometry, None);
        assert!(detections.iter().all(|d| d.image_id == 1 && d.bbox.is_none()));
        let creator = image.creator.unwrap();
        assert_eq!(creator.id, 42);
        assert_eq!(creator.username.as_deref(), Some("mapper"));
    }

    #[test]
    fn test_get_detections_failure_is_empty() {
        let fake = Arc::new(FakeTransport::new());
        let client = MapillaryClient::with_transport(test_config(), fake.clone());
        let mut image = MapillaryImage::new(2, "http://img.test/2", 0.0, 0.0);
        assert!(get_detections_by_image(&client, &mut image).is_empty());
        assert!(image.creator.is_none());

        fake.respond_json("http://graph.test/3/detections", json!({"data": []}));
        let mut image = MapillaryImage::new(3, "http://img.test/3", 0.0, 0.0);
        assert!(get_detections_by_image(&client, &mut image).is_empty());
    }
}
