use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ScrapeError;

pub const TOKEN_ENV: &str = "MAPILLARY_TOKEN";

const DEFAULT_GRAPH_URL: &str = "https://graph.mapillary.com";
const DEFAULT_TILES_URL: &str =
    "https://tiles.mapillary.com/maps/vtp/mly_map_feature_traffic_sign/2";

/// Runtime settings shared by every stage of the scrape.
#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,

    // API politeness / retries
    pub retry_tries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_jitter: Duration,
    pub request_delay: Duration,

    // Image selection
    pub max_images_per_feature: u32,
    pub pano_aspect_ratio: f64,
    pub rejected_camera_types: HashSet<String>,

    pub workers: usize,

    pub metadata_timeout: Duration,
    pub tile_timeout: Duration,
    pub download_timeout: Duration,

    pub graph_url: String,
    pub tiles_url: String,
    pub tile_cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            retry_tries: 6,
            retry_base_delay: Duration::from_secs(1),
            retry_max_jitter: Duration::from_millis(500),
            request_delay: Duration::from_millis(100),
            max_images_per_feature: 50,
            pano_aspect_ratio: 2.0,
            rejected_camera_types: ["spherical", "equirectangular", "fisheye"]
                .into_iter()
                .map(String::from)
                .collect(),
            workers: 8,
            metadata_timeout: Duration::from_secs(60),
            tile_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(120),
            graph_url: DEFAULT_GRAPH_URL.to_string(),
            tiles_url: DEFAULT_TILES_URL.to_string(),
            tile_cache_dir: None,
        }
    }
}

impl Config {
    /// Default settings with the access token read from `MAPILLARY_TOKEN`.
    pub fn from_env() -> Result<Self, ScrapeError> {
        let token = std::env::var(TOKEN_ENV).unwrap_or_default();
        Self::with_token(token)
    }

    pub fn with_token(token: impl Into<String>) -> Result<Self, ScrapeError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ScrapeError::MissingToken);
        }
        Ok(Self {
            token,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_token_is_rejected() {
        assert!(matches!(Config::with_token(""), Err(ScrapeError::MissingToken)));
        assert!(matches!(Config::with_token("  "), Err(ScrapeError::MissingToken)));
    }

    #[test]
    fn test_defaults() {
        let config = Config::with_token("MLY|123").unwrap();
        assert_eq!(config.token, "MLY|123");
        assert_eq!(config.retry_tries, 6);
        assert_eq!(config.max_images_per_feature, 50);
        assert!(config.rejected_camera_types.contains("fisheye"));
        assert!(config.metadata_timeout < config.download_timeout);
    }
}
