//! Core data model and media policy for the Live Addis dataset.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use url::Url;

pub const CRATE_NAME: &str = "addis-core";

/// Host fragment a media URL must carry before it may be downloaded.
pub const DEFAULT_TRUSTED_HOST_FRAGMENT: &str = "fbcdn";
/// Site-relative mount point the asset directory is served under.
pub const DEFAULT_PUBLIC_MOUNT: &str = "/images/posts";
/// Media kind reported when the provider does not send `__typename`.
pub const DEFAULT_MEDIA_TYPE: &str = "Photo";
/// Field the platform sets on a post's first media item once the content was taken down.
pub const UNAVAILABLE_MARKER_FIELD: &str = "title_with_entities";

/// One post from the raw social-media scrape. Every field is optional and
/// values of the wrong JSON type are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPost {
    #[serde(default, deserialize_with = "lenient")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub likes: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub comments: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub shares: Option<u64>,
    #[serde(default, deserialize_with = "lenient_media")]
    pub media: Option<Vec<RawMediaItem>>,
}

impl RawPost {
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    pub fn has_media_field(&self) -> bool {
        self.media.is_some()
    }

    pub fn media_items(&self) -> &[RawMediaItem] {
        self.media.as_deref().unwrap_or_default()
    }

    /// True when the first media entry carries the takedown marker.
    pub fn is_content_unavailable(&self) -> bool {
        self.media_items()
            .first()
            .map(RawMediaItem::is_unavailable_marker)
            .unwrap_or(false)
    }
}

/// `{ "uri": ... }` wrapper used by the nested image shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    #[serde(default, deserialize_with = "lenient")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMediaItem {
    #[serde(default, deserialize_with = "lenient")]
    pub thumbnail: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub image: Option<ImageRef>,
    #[serde(default, deserialize_with = "lenient")]
    pub photo_image: Option<ImageRef>,
    #[serde(default, deserialize_with = "lenient")]
    pub fallback_image: Option<ImageRef>,
    #[serde(rename = "ocrText", default, deserialize_with = "lenient")]
    pub ocr_text: Option<String>,
    #[serde(rename = "__typename", default, deserialize_with = "lenient")]
    pub typename: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_with_entities: Option<JsonValue>,
}

impl RawMediaItem {
    pub fn resolve_url(&self) -> Option<&str> {
        resolve_media_url(self)
    }

    /// The marker counts only when its value is truthy: `null`, `false`,
    /// `0` and `""` leave the item usable.
    pub fn is_unavailable_marker(&self) -> bool {
        self.title_with_entities.as_ref().is_some_and(is_truthy)
    }
}

/// Pick the media location by fixed priority: `thumbnail`, `image.uri`,
/// `photo_image.uri`, `fallback_image.uri`. Empty strings fall through.
pub fn resolve_media_url(item: &RawMediaItem) -> Option<&str> {
    [
        item.thumbnail.as_deref(),
        nested_uri(&item.image),
        nested_uri(&item.photo_image),
        nested_uri(&item.fallback_image),
    ]
    .into_iter()
    .flatten()
    .find(|candidate| !candidate.is_empty())
}

fn nested_uri(image: &Option<ImageRef>) -> Option<&str> {
    image.as_ref().and_then(|i| i.uri.as_deref())
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

/// Only http(s) URLs whose host contains `fragment` may be fetched.
pub fn is_trusted_host(url: &str, fragment: &str) -> bool {
    let fragment = fragment.trim().to_ascii_lowercase();
    if fragment.is_empty() {
        return false;
    }
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    parsed
        .host_str()
        .map(|host| host.to_ascii_lowercase().contains(&fragment))
        .unwrap_or(false)
}

/// Output record consumed by the site; field order is part of the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedPost {
    pub id: u64,
    pub text: String,
    pub url: String,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub media: Vec<NormalizedMediaItem>,
}

impl NormalizedPost {
    /// First line of the post text, used as the headline.
    pub fn title(&self) -> &str {
        self.text.split('\n').next().unwrap_or_default()
    }

    /// Everything after the headline line.
    pub fn body(&self) -> String {
        self.text.split('\n').skip(1).collect::<Vec<_>>().join("\n")
    }

    pub fn text_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn engagement(&self) -> u64 {
        self.likes
            .saturating_add(self.comments)
            .saturating_add(self.shares)
    }

    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || !self.media.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMediaItem {
    pub local_path: String,
    pub ocr_text: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub original_id: String,
}

impl NormalizedMediaItem {
    pub fn from_raw(local_path: impl Into<String>, raw: &RawMediaItem) -> Self {
        Self {
            local_path: local_path.into(),
            ocr_text: raw.ocr_text.clone().unwrap_or_default(),
            media_type: raw
                .typename
                .clone()
                .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string()),
            original_id: raw.id.clone().unwrap_or_default(),
        }
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// Non-object entries become empty items so positions (and the first-item
// takedown check) are preserved.
fn lenient_media<'de, D>(deserializer: D) -> Result<Option<Vec<RawMediaItem>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Array(items)) => Some(
            items
                .into_iter()
                .map(|item| serde_json::from_value(item).unwrap_or_default())
                .collect(),
        ),
        _ => None,
    })
}
