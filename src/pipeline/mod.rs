use std::collections::HashSet;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{error, info, warn};
use serde::Serialize;

use crate::candidates::get_candidate_images;
use crate::detections::{attach_detection_boxes, get_detections_by_image};
use crate::download::{ApiResult, MapillaryClient};
use crate::model::{MapillaryImage, TrafficSignFeature};

mod pool;

pub use pool::{WorkerPool, partition};

/// JSON sidecar written next to every saved image.
#[derive(Serialize)]
struct ImageRecord<'a> {
    #[serde(flatten)]
    image: &'a MapillaryImage,
    saved_at: String,
}

pub fn image_dir(output_dir: &Path, image_id: u64) -> PathBuf {
    output_dir.join(image_id.to_string())
}

pub fn image_path(output_dir: &Path, image_id: u64) -> PathBuf {
    image_dir(output_dir, image_id).join(format!("{}.jpg", image_id))
}

pub fn sidecar_path(output_dir: &Path, image_id: u64) -> PathBuf {
    image_dir(output_dir, image_id).join(format!("{}.json", image_id))
}

/// Ids of images already saved under `output_dir`. The sidecar is written last,
/// so its presence marks a finished image.
pub fn existing_image_ids(output_dir: &Path) -> Result<HashSet<u64>> {
    let mut ids = HashSet::new();
    if !output_dir.exists() {
        return Ok(ids);
    }
    let entries = fs::read_dir(output_dir)
        .with_context(|| format!("Failed to list {}", output_dir.display()))?;
    for entry in entries {
        let entry = entry.context("Failed to read output directory entry")?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) else {
            continue;
        };
        if sidecar_path(output_dir, id).is_file() {
            ids.insert(id);
        }
    }
    Ok(ids)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".part");
    let tmp_path = PathBuf::from(tmp_path);
    fs::write(&tmp_path, data)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

/// Download the image bytes and read its dimensions from the header.
pub fn download_image(client: &MapillaryClient, image: &mut MapillaryImage) -> Result<()> {
    let bytes = match client.download(&image.url) {
        ApiResult::Ok(bytes) if !bytes.is_empty() => bytes,
        ApiResult::Ok(_) => bail!("image {} downloaded empty", image.id),
        status => bail!("image {} download failed: {:?}", image.id, status),
    };
    let (width, height) = image::io::Reader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .context("Failed to sniff image format")?
        .into_dimensions()
        .with_context(|| format!("Failed to decode image {}", image.id))?;

    image.width = Some(width);
    image.height = Some(height);
    image.image_bytes = Some(bytes);
    info!("Image {} downloaded, size: {}x{}", image.id, width, height);
    Ok(())
}

/// Write `<id>/<id>.jpg` (unless `json_only`) and `<id>/<id>.json`.
pub fn save_image(image: &MapillaryImage, output_dir: &Path, json_only: bool) -> Result<()> {
    let dir = image_dir(output_dir, image.id);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    if !json_only {
        let Some(bytes) = &image.image_bytes else {
            bail!("image {} has no bytes to save", image.id);
        };
        write_atomic(&image_path(output_dir, image.id), bytes)?;
    }

    let record = ImageRecord {
        image,
        saved_at: chrono::Utc::now().to_rfc3339(),
    };
    let json = serde_json::to_vec_pretty(&record).context("Failed to serialize image record")?;
    write_atomic(&sidecar_path(output_dir, image.id), &json)
}

/// Resolve, download and persist one candidate. `Ok(false)` means skipped.
fn process_candidate(
    client: &MapillaryClient,
    mut image: MapillaryImage,
    output_dir: &Path,
    json_only: bool,
) -> Result<bool> {
    let detections = get_detections_by_image(client, &mut image);
    if detections.is_empty() {
        warn!("no detections found for {}", image.id);
        return Ok(false);
    }

    if json_only {
        let Some((width, height)) = image.reported_size else {
            warn!("image {} has no reported size, skipping in json-only mode", image.id);
            return Ok(false);
        };
        image.width = Some(width);
        image.height = Some(height);
    } else {
        info!("Downloading image {}", image.id);
        download_image(client, &mut image)?;
    }

    let boxes = attach_detection_boxes(&mut image, &detections);
    if boxes == 0 {
        info!("no usable detection geometry for image {}", image.id);
        image.release_bytes();
        return Ok(false);
    }

    let saved = save_image(&image, output_dir, json_only);
    image.release_bytes();
    saved?;
    info!("Saved image {} with {} boxes", image.id, boxes);
    Ok(true)
}

/// Resolve candidate images for `features` and save each with its detections
/// under `output_dir`. Returns how many images were saved by this call.
///
/// Images already on disk are skipped, so a rerun over the same features only
/// picks up what an earlier run missed. Failures stay local to one image.
pub fn save_images_with_detections_by_id(
    client: &MapillaryClient,
    pool: &WorkerPool,
    features: &[TrafficSignFeature],
    output_dir: &Path,
    json_only: bool,
) -> Result<usize> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let chunks = partition(features, pool.workers());
    let per_chunk = pool.map(chunks, |chunk| get_candidate_images(client, chunk));

    let mut seen = HashSet::new();
    let candidates: Vec<MapillaryImage> = per_chunk
        .into_iter()
        .flatten()
        .filter(|image| seen.insert(image.id))
        .collect();

    let existing = existing_image_ids(output_dir)?;
    let total = candidates.len();
    let remaining: Vec<MapillaryImage> = candidates
        .into_iter()
        .filter(|image| !existing.contains(&image.id))
        .collect();
    info!(
        "{} candidate images, {} already saved, {} to process",
        total,
        total - remaining.len(),
        remaining.len()
    );

    let attempted = remaining.len();
    let delay = client.config().request_delay;
    let results = pool.map(remaining, |image| {
        let id = image.id;
        let outcome = process_candidate(client, image, output_dir, json_only);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        match outcome {
            Ok(saved) => saved,
            Err(err) => {
                error!("image {} failed: {:#}", id, err);
                false
            }
        }
    });

    let saved = results.into_iter().filter(|saved| *saved).count();
    info!("Saved {} of {} attempted images", saved, attempted);
    Ok(saved)
}
