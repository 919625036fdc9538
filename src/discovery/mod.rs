use std::collections::HashSet;

use log::{debug, info, warn};

use crate::download::{ApiResult, MapillaryClient};
use crate::error::{ScrapeError, StatusOr};
use crate::geo::{BBox, FEATURE_ZOOM, Tile, get_tiles_in_bbox};
use crate::model::TrafficSignFeature;
use crate::tile::{Origin, decode_layers, is_empty_tile, to_mapbox_tile};

/// Traffic-sign features in one zoom-14 tile, optionally restricted to `classes`.
///
/// Network failures and empty payloads yield an empty list. A tile at any other
/// zoom is a caller error.
pub fn get_valid_ids_in_tile(
    client: &MapillaryClient,
    tile: Tile,
    classes: Option<&[String]>,
) -> StatusOr<Vec<TrafficSignFeature>> {
    if tile.z != FEATURE_ZOOM {
        return Err(ScrapeError::InvalidZoom {
            expected: FEATURE_ZOOM,
            got: tile.z,
        });
    }

    let data = match client.fetch_tile(tile) {
        ApiResult::Ok(data) if !data.is_empty() => data,
        ApiResult::Ok(_) => {
            debug!("empty payload for tile {}", tile);
            return Ok(Vec::new());
        }
        status => {
            debug!("tile {} returned {:?}", tile, status);
            return Ok(Vec::new());
        }
    };

    let layers = match decode_layers(&data, Origin::TopLeft) {
        Ok(layers) => layers,
        Err(err) => {
            warn!("undecodable tile {}: {}", tile, err);
            return Ok(Vec::new());
        }
    };
    if is_empty_tile(&layers) {
        info!("tile {} only holds a water layer, treating it as empty", tile);
        return Ok(Vec::new());
    }

    let mapbox_tile =
        to_mapbox_tile(&layers, tile).map_err(|source| ScrapeError::InvalidTile { tile, source })?;
    info!("found {} features for tile {}", mapbox_tile.features.len(), tile);

    Ok(match classes {
        Some(classes) if !classes.is_empty() => mapbox_tile
            .features
            .into_iter()
            .filter(|f| classes.iter().any(|c| c == f.value()))
            .collect(),
        _ => mapbox_tile.features,
    })
}

/// Features across every tile covering `bbox`, each id reported once.
///
/// A tile that fails validation is logged and skipped.
pub fn get_valid_ids_in_bbox(
    client: &MapillaryClient,
    bbox: &BBox,
    classes: Option<&[String]>,
    strict: bool,
) -> StatusOr<Vec<TrafficSignFeature>> {
    let tiles = get_tiles_in_bbox(bbox, strict);
    info!("querying {} tiles (strict={})", tiles.len(), strict);

    let mut seen_ids: HashSet<u64> = HashSet::new();
    let mut results = Vec::new();
    let delay = client.config().request_delay;

    for tile in tiles {
        let features = match get_valid_ids_in_tile(client, tile, classes) {
            Ok(features) => features,
            Err(err @ ScrapeError::InvalidTile { .. }) => {
                warn!("{}", err);
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        for feature in features {
            if seen_ids.insert(feature.id()) {
                results.push(feature);
            }
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    info!("found {} unique features", results.len());
    Ok(results)
}
