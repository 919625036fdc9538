//! Response records of the graph API, validated at the service boundary.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Ids arrive as JSON strings from the graph API and as numbers elsewhere.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Number(u64),
    Text(String),
}

impl IdRepr {
    fn into_u64<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            IdRepr::Number(n) => Ok(n),
            IdRepr::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid id {:?}", s))),
        }
    }
}

pub fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    IdRepr::deserialize(deserializer)?.into_u64()
}

pub fn de_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Option::<IdRepr>::deserialize(deserializer)? {
        Some(repr) => repr.into_u64().map(Some),
        None => Ok(None),
    }
}

/// Integers only; anything else reads as absent.
fn de_opt_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(serde_json::Value::as_u64)
        .and_then(|n| u32::try_from(n).ok()))
}

fn de_lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(String::new()),
        Some(serde_json::Value::String(s)) => Ok(s),
        Some(other) => Err(D::Error::custom(format!("expected string, got {}", other))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataList<T> {
    pub data: Option<Vec<T>>,
}

impl<T> DataList<T> {
    pub fn into_vec(self) -> Vec<T> {
        self.data.unwrap_or_default()
    }
}

/// `/{feature_id}?fields=id,object_value,images.limit(n){...}`
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureImages {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<u64>,
    #[serde(default)]
    pub object_value: Option<String>,
    #[serde(default)]
    pub images: Option<DataList<ImageMeta>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageMeta {
    #[serde(deserialize_with = "de_id")]
    pub id: u64,
    #[serde(default)]
    pub camera_type: Option<String>,
    #[serde(default)]
    pub is_pano: Option<bool>,
    #[serde(default, deserialize_with = "de_opt_u32")]
    pub width: Option<u32>,
    #[serde(default, deserialize_with = "de_opt_u32")]
    pub height: Option<u32>,
    #[serde(default)]
    pub sequence: Option<String>,
    #[serde(default)]
    pub thumb_original_url: Option<String>,
    #[serde(default)]
    pub thumb_2048_url: Option<String>,
    #[serde(default)]
    pub thumb_1024_url: Option<String>,
    #[serde(default)]
    pub thumb_256_url: Option<String>,
}

impl ImageMeta {
    /// Largest available thumbnail.
    pub fn thumb_url(&self) -> Option<&str> {
        [
            &self.thumb_original_url,
            &self.thumb_2048_url,
            &self.thumb_1024_url,
            &self.thumb_256_url,
        ]
        .into_iter()
        .filter_map(|url| url.as_deref())
        .find(|url| !url.is_empty())
    }
}

/// `/{image_id}/detections?fields=id,value,geometry,image{id,creator}`
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionRecord {
    #[serde(deserialize_with = "de_id")]
    pub id: u64,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub value: String,
    #[serde(default)]
    pub geometry: Option<String>,
    #[serde(default)]
    pub image: Option<DetectionImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionImage {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<u64>,
    #[serde(default)]
    pub creator: Option<CreatorRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatorRecord {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<u64>,
    #[serde(default)]
    pub username: Option<String>,
}
