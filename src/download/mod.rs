use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use reqwest::blocking::Client;
use thiserror::Error;

use crate::cache::TileCache;
use crate::config::Config;
use crate::geo::Tile;

/// Raw answer from the transport: status code plus the full body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Other(String),
}

/// A single blocking GET. Implementations must be shareable across worker threads.
pub trait Transport: Send + Sync {
    fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

/// Transport backed by one pooled `reqwest` client.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        // The URL carries the access token; keep it out of logs.
        TransportError::Other(err.without_url().to_string())
    }
}

impl Transport for ReqwestTransport {
    fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .timeout(timeout)
            .send()
            .map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().map_err(transport_error)?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Successful response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Payload {
    fn into_json(self) -> ApiResult<serde_json::Value> {
        match self {
            Payload::Json(value) => ApiResult::Ok(value),
            Payload::Bytes(_) => ApiResult::Fail,
        }
    }

    fn into_bytes(self) -> ApiResult<Vec<u8>> {
        match self {
            Payload::Bytes(bytes) => ApiResult::Ok(bytes),
            Payload::Json(_) => ApiResult::Fail,
        }
    }
}

/// Outcome of a call after retries.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResult<T> {
    /// 2xx response.
    Ok(T),
    /// Non-retryable 4xx response; carries the status code.
    Hard(u16),
    /// Retries exhausted.
    Fail,
}

impl<T> ApiResult<T> {
    /// Chain a conversion of the payload that may itself fail.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> ApiResult<U>) -> ApiResult<U> {
        match self {
            ApiResult::Ok(value) => f(value),
            ApiResult::Hard(code) => ApiResult::Hard(code),
            ApiResult::Fail => ApiResult::Fail,
        }
    }
}

/// Client for the Mapillary graph and tile endpoints.
///
/// Every outbound request goes through [`MapillaryClient::call`], which appends the
/// access token and applies the retry policy.
pub struct MapillaryClient {
    config: Config,
    transport: Arc<dyn Transport>,
    tile_cache: Option<TileCache>,
}

impl MapillaryClient {
    /// Create a client over a real HTTP connection pool.
    pub fn new(config: Config) -> Result<Self> {
        let tile_cache = match &config.tile_cache_dir {
            Some(dir) => Some(TileCache::new(dir).context("Failed to create tile cache")?),
            None => None,
        };
        let mut client = Self::with_transport(config, Arc::new(ReqwestTransport::new()));
        client.tile_cache = tile_cache;
        Ok(client)
    }

    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            tile_cache: None,
        }
    }

    pub fn with_tile_cache(mut self, cache: TileCache) -> Self {
        self.tile_cache = Some(cache);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tile_url(&self, tile: Tile) -> String {
        format!("{}/{}/{}/{}", self.config.tiles_url, tile.z, tile.x, tile.y)
    }

    pub fn node_url(&self, id: u64) -> String {
        format!("{}/{}", self.config.graph_url, id)
    }

    pub fn detections_url(&self, image_id: u64) -> String {
        format!("{}/{}/detections", self.config.graph_url, image_id)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .retry_base_delay
            .saturating_mul(1u32 << attempt.min(16));
        let jitter = self.config.retry_max_jitter.mul_f64(fastrand::f64());
        base + jitter
    }

    fn backoff_sleep(&self, attempt: u32) {
        let delay = self.backoff_delay(attempt);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    /// GET with retry and backoff, using the metadata timeout.
    pub fn call(
        &self,
        url: &str,
        params: &[(&str, String)],
        raw_bytes: bool,
    ) -> ApiResult<Payload> {
        self.call_with_timeout(url, params, raw_bytes, self.config.metadata_timeout)
    }

    pub fn call_with_timeout(
        &self,
        url: &str,
        params: &[(&str, String)],
        raw_bytes: bool,
        timeout: Duration,
    ) -> ApiResult<Payload> {
        let mut query: Vec<(&str, String)> = params.to_vec();
        query.push(("access_token", self.config.token.clone()));

        let tries = self.config.retry_tries;
        for attempt in 0..tries {
            debug!("attempt {}/{} calling {}", attempt, tries, url);
            let response = match self.transport.get(url, &query, timeout) {
                Ok(response) => response,
                Err(TransportError::Timeout) => {
                    debug!("timeout calling {}", url);
                    self.backoff_sleep(attempt);
                    continue;
                }
                Err(err) => {
                    warn!("{} for {}", err, url);
                    self.backoff_sleep(attempt);
                    continue;
                }
            };

            let code = response.status;
            debug!("HTTP status code: {}", code);
            if code == 429 || (500..600).contains(&code) {
                self.backoff_sleep(attempt);
                continue;
            }

            if (400..500).contains(&code) {
                let body = String::from_utf8_lossy(&response.body);
                let body: String = body.chars().take(512).collect();
                warn!("[hard] {} {} params={:?} body={}", code, url, params, body);
                return ApiResult::Hard(code);
            }

            if !(200..300).contains(&code) {
                warn!("unexpected status {} for {}", code, url);
                self.backoff_sleep(attempt);
                continue;
            }

            if raw_bytes {
                return ApiResult::Ok(Payload::Bytes(response.body));
            }
            match serde_json::from_slice(&response.body) {
                Ok(value) => return ApiResult::Ok(Payload::Json(value)),
                Err(err) => {
                    warn!("invalid JSON from {}: {}", url, err);
                    self.backoff_sleep(attempt);
                    continue;
                }
            }
        }

        warn!("giving up on {} after {} attempts", url, tries);
        ApiResult::Fail
    }

    /// JSON body of a graph API call.
    pub fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> ApiResult<serde_json::Value> {
        self.call(url, params, false).and_then(Payload::into_json)
    }

    fn get_bytes(&self, url: &str, timeout: Duration) -> ApiResult<Vec<u8>> {
        self.call_with_timeout(url, &[], true, timeout)
            .and_then(Payload::into_bytes)
    }

    /// Raw vector tile bytes for `tile`, served from the tile cache when enabled.
    pub fn fetch_tile(&self, tile: Tile) -> ApiResult<Vec<u8>> {
        let url = self.tile_url(tile);
        if let Some(cache) = &self.tile_cache {
            if let Some(bytes) = cache.load(&self.config.tiles_url, tile) {
                debug!("using cached tile {}", tile);
                return ApiResult::Ok(bytes);
            }
        }

        let result = self.get_bytes(&url, self.config.tile_timeout);
        if let (Some(cache), ApiResult::Ok(bytes)) = (&self.tile_cache, &result) {
            if !bytes.is_empty() {
                if let Err(err) = cache.store(&self.config.tiles_url, tile, bytes) {
                    warn!("failed to cache tile {}: {:#}", tile, err);
                }
            }
        }
        result
    }

    /// Full image bytes, using the longer download timeout.
    pub fn download(&self, url: &str) -> ApiResult<Vec<u8>> {
        let result = self.get_bytes(url, self.config.download_timeout);
        if let ApiResult::Ok(bytes) = &result {
            info!("Downloaded {} bytes", bytes.len());
        }
        result
    }
}
