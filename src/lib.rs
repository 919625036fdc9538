//! Traffic-sign scraping pipeline for the Mapillary imagery service.
//!
//! Tiles are enumerated over a bounding box, queried for traffic-sign point
//! features, resolved to candidate images, and every image is saved next to a
//! JSON sidecar holding its detections as pixel-space bounding boxes.

pub mod cache;
pub mod candidates;
pub mod config;
pub mod detections;
pub mod discovery;
pub mod download;
pub mod error;
pub mod geo;
pub mod model;
pub mod pipeline;
pub mod tile;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use download::MapillaryClient;
pub use error::{DecodeError, ScrapeError};
pub use geo::{BBox, Tile};
pub use model::{MapillaryImage, MapillaryImageDetection, TrafficSignFeature};
