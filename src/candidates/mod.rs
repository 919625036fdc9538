use std::collections::HashSet;

use log::{debug, info, warn};

use crate::config::Config;
use crate::download::{ApiResult, MapillaryClient};
use crate::model::api::{FeatureImages, ImageMeta};
use crate::model::{MapillaryImage, TrafficSignFeature};

const IMAGE_FIELDS: &str = "id,camera_type,is_pano,width,height,sequence,\
thumb_original_url,thumb_2048_url,thumb_1024_url,thumb_256_url";

/// Rejects panoramas, fisheye and spherical captures, and very wide frames.
pub fn is_perspective_like(meta: &ImageMeta, config: &Config) -> bool {
    let camera_type = meta.camera_type.as_deref().unwrap_or("").to_lowercase();
    if config.rejected_camera_types.contains(&camera_type) {
        return false;
    }

    if meta.is_pano == Some(true) {
        return false;
    }

    if let (Some(w), Some(h)) = (meta.width, meta.height) {
        if h > 0 && f64::from(w) / f64::from(h) >= config.pano_aspect_ratio {
            return false;
        }
    }

    true
}

fn fetch_feature_images(client: &MapillaryClient, feature_id: u64) -> Option<Vec<ImageMeta>> {
    let limit = client.config().max_images_per_feature;
    let fields = format!("id,object_value,images.limit({}){{{}}}", limit, IMAGE_FIELDS);
    let url = client.node_url(feature_id);

    let value = match client.get_json(&url, &[("fields", fields)]) {
        ApiResult::Ok(value) => value,
        status => {
            warn!("feature {} fetch failed: {:?}", feature_id, status);
            return None;
        }
    };
    match serde_json::from_value::<FeatureImages>(value) {
        Ok(info) => Some(info.images.map(|images| images.into_vec()).unwrap_or_default()),
        Err(err) => {
            warn!("feature {} returned an invalid payload: {}", feature_id, err);
            None
        }
    }
}

/// Perspective images showing any of `features`, each image listed once.
///
/// Images keep the order in which features and then the service list them.
/// A feature whose lookup fails is skipped.
pub fn get_candidate_images(
    client: &MapillaryClient,
    features: &[TrafficSignFeature],
) -> Vec<MapillaryImage> {
    let config = client.config();
    let mut candidates = Vec::new();
    let mut candidate_ids: HashSet<u64> = HashSet::new();

    for feature in features {
        let Some(images) = fetch_feature_images(client, feature.id()) else {
            if !config.request_delay.is_zero() {
                std::thread::sleep(config.request_delay);
            }
            continue;
        };

        for meta in images.iter().take(config.max_images_per_feature as usize) {
            if !is_perspective_like(meta, config) {
                debug!("skipping non-perspective image {}", meta.id);
                continue;
            }
            let Some(url) = meta.thumb_url() else {
                continue;
            };
            if !candidate_ids.insert(meta.id) {
                continue;
            }

            let mut image =
                MapillaryImage::new(meta.id, url, feature.latitude(), feature.longitude());
            image.camera_type = meta.camera_type.clone();
            image.sequence = meta.sequence.clone();
            image.reported_size = meta.width.zip(meta.height);
            candidates.push(image);
        }
    }

    info!(
        "Found {} unique candidate images for {} ids",
        candidates.len(),
        features.len()
    );
    candidates
}
