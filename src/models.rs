use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const LOCAL_IMAGE_KEYS: [&str; 3] = ["event1", "event2", "event3"];

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RawEventRecord {
    pub name: String,
    pub date: String,
    pub time: RawTime,
    pub address: RawAddress,
    #[serde(
        default,
        alias = "location",
        deserialize_with = "lenient_geo",
        skip_serializing_if = "Option::is_none"
    )]
    pub geo: Option<GeoPoint>,
    #[serde(default, alias = "ai_overview", deserialize_with = "lenient_overview")]
    pub overview: String,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub link: Option<String>,
    #[serde(default, deserialize_with = "lenient_strings")]
    pub source_urls: Vec<String>,
    #[serde(
        default,
        deserialize_with = "lenient_strings",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tags: Vec<String>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub organizer: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub website_link: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub impact_statement: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_qa_pairs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub qa_pairs: Vec<QaPair>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub image_keyword: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RawTime {
    pub start: String,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub end: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RawAddress {
    pub venue: String,
    pub street: String,
    pub city: String,
    pub state: String,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub postal_code: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub country: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

// Models sometimes put a "City, State" string where coordinates belong.
fn lenient_geo<'de, D>(deserializer: D) -> Result<Option<GeoPoint>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| serde_json::from_value(value).ok()))
}

// Optional fields drop a bad value instead of rejecting the whole card.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

fn lenient_overview<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_text(deserializer)?.unwrap_or_default())
}

fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text),
                _ => None,
            })
            .collect(),
        Some(Value::String(text)) => vec![text],
        _ => Vec::new(),
    })
}

fn lenient_qa_pairs<'de, D>(deserializer: D) -> Result<Vec<QaPair>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

impl RawEventRecord {
    pub fn image_query(&self) -> Option<String> {
        self.image_keyword
            .iter()
            .chain(self.tags.iter())
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .map(str::to_string)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(into = "String", from = "String")]
pub enum ImageRef {
    Remote(String),
    Local(String),
}

impl ImageRef {
    pub fn key(&self) -> &str {
        match self {
            ImageRef::Remote(url) => url,
            ImageRef::Local(key) => key,
        }
    }

    pub fn from_key(key: &str) -> Self {
        if key.starts_with("https://") || key.starts_with("http://") {
            ImageRef::Remote(key.to_string())
        } else {
            ImageRef::Local(key.to_string())
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ImageRef::Remote(_))
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        match value {
            ImageRef::Remote(url) => url,
            ImageRef::Local(key) => key,
        }
    }
}

impl From<String> for ImageRef {
    fn from(value: String) -> Self {
        ImageRef::from_key(&value)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DiscoveredEvent {
    pub id: String,
    pub title: String,
    pub location: String,
    pub address: String,
    /// e.g. "Oct 23, 2025 • 7:30 PM"
    pub date: String,
    pub time: String,
    pub overview: String,
    pub image: ImageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact_statement: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qa_pairs: Vec<QaPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoPoint>,
}
