//! Scripted transport and fixtures shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use prost::Message;

use crate::config::Config;
use crate::download::{HttpResponse, Transport, TransportError};
use crate::tile::{
    SIGN_LAYER, VectorTile, VectorTileFeature, VectorTileGeomType, VectorTileLayer,
    VectorTileValue, WATER_LAYER,
};

pub(crate) fn test_config() -> Config {
    let mut config = Config::with_token("MLY|test").unwrap();
    config.retry_base_delay = Duration::ZERO;
    config.retry_max_jitter = Duration::ZERO;
    config.request_delay = Duration::ZERO;
    config.workers = 3;
    config.graph_url = "http://graph.test".to_string();
    config.tiles_url = "http://tiles.test".to_string();
    config
}

type Reply = Result<HttpResponse, TransportError>;

/// Replies are queued per URL; the last queued reply repeats forever.
/// Unknown URLs answer 404.
#[derive(Default)]
pub(crate) struct FakeTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, url: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn respond(&self, url: &str, status: u16, body: &[u8]) {
        self.push(
            url,
            Ok(HttpResponse {
                status,
                body: body.to_vec(),
            }),
        );
    }

    pub fn respond_json(&self, url: &str, body: serde_json::Value) {
        self.respond(url, 200, body.to_string().as_bytes());
    }

    /// Drop every queued reply for `url`.
    pub fn clear(&self, url: &str) {
        self.replies.lock().unwrap().remove(url);
    }

    pub fn fail(&self, url: &str, err: TransportError) {
        self.push(url, Err(err));
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(called, _)| called == url)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_query(&self, url: &str) -> Option<Vec<(String, String)>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(called, _)| called == url)
            .map(|(_, query)| query.clone())
    }
}

impl Transport for FakeTransport {
    fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        _timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        self.calls.lock().unwrap().push((
            url.to_string(),
            query
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        ));

        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Ok(HttpResponse {
                status: 404,
                body: Vec::new(),
            }),
        }
    }
}

fn command(id: u32, count: u32) -> u32 {
    (id & 0x7) | (count << 3)
}

fn zigzag(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}

/// Encode rings given in top-left tile coordinates as one polygon feature.
pub(crate) fn polygon_feature(rings: &[Vec<(i32, i32)>]) -> VectorTileFeature {
    let mut geometry = Vec::new();
    let (mut cx, mut cy) = (0, 0);
    for ring in rings {
        for (i, &(x, y)) in ring.iter().enumerate() {
            if i == 0 {
                geometry.push(command(1, 1));
            } else if i == 1 {
                geometry.push(command(2, ring.len() as u32 - 1));
            }
            geometry.push(zigzag(x - cx));
            geometry.push(zigzag(y - cy));
            cx = x;
            cy = y;
        }
        geometry.push(command(7, 1));
    }
    VectorTileFeature {
        id: None,
        tags: Vec::new(),
        geometry_type: Some(VectorTileGeomType::Polygon as i32),
        geometry,
    }
}

/// A detection geometry payload: one layer, one polygon feature per ring set.
pub(crate) fn polygon_tile(extent: u32, polygons: &[Vec<Vec<(i32, i32)>>]) -> Vec<u8> {
    encode_tile(vec![VectorTileLayer {
        name: "mpy-or".to_string(),
        features: polygons.iter().map(|rings| polygon_feature(rings)).collect(),
        extent: Some(extent),
        version: 2,
        ..Default::default()
    }])
}

/// Sign layer with `(id, value, x, y)` points.
pub(crate) fn sign_layer(points: &[(u64, &str, i32, i32)]) -> VectorTileLayer {
    let mut layer = VectorTileLayer {
        name: SIGN_LAYER.to_string(),
        keys: vec!["id".to_string(), "value".to_string()],
        extent: Some(4096),
        version: 2,
        ..Default::default()
    };
    for (i, &(id, value, x, y)) in points.iter().enumerate() {
        let i = i as u32;
        layer.values.push(VectorTileValue {
            uint_value: Some(id),
            ..Default::default()
        });
        layer.values.push(VectorTileValue {
            string_value: Some(value.to_string()),
            ..Default::default()
        });
        layer.features.push(VectorTileFeature {
            id: Some(id),
            tags: vec![0, 2 * i, 1, 2 * i + 1],
            geometry_type: Some(VectorTileGeomType::Point as i32),
            geometry: vec![command(1, 1), zigzag(x), zigzag(y)],
        });
    }
    layer
}

pub(crate) fn water_tile() -> Vec<u8> {
    encode_tile(vec![VectorTileLayer {
        name: WATER_LAYER.to_string(),
        extent: Some(4096),
        version: 2,
        ..Default::default()
    }])
}

pub(crate) fn encode_tile(layers: Vec<VectorTileLayer>) -> Vec<u8> {
    VectorTile { layers }.encode_to_vec()
}
