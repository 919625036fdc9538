use thiserror::Error;

use crate::geo::Tile;

/// Failure to turn an embedded geometry payload into vector tile layers.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid base64 geometry: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid vector tile: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("tile coordinates must be at zoom level {expected}, got {got}")]
    InvalidZoom { expected: u8, got: u8 },

    #[error("tile {tile} failed validation: {source}")]
    InvalidTile {
        tile: Tile,
        #[source]
        source: serde_json::Error,
    },

    #[error("MAPILLARY_TOKEN is not set (it starts with 'MLY|')")]
    MissingToken,
}

pub type StatusOr<T> = Result<T, ScrapeError>;
