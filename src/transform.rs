use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{DiscoveredEvent, ImageRef, RawEventRecord, LOCAL_IMAGE_KEYS};
use crate::utils;

const DATE_SEPARATOR: &str = " • ";
const MAX_QA_PAIRS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdStrategy {
    #[default]
    Content,
    Generation,
}

#[derive(Debug, Clone, Default)]
pub struct EventTransformer {
    id_strategy: IdStrategy,
    display_tz: Option<Tz>,
}

impl EventTransformer {
    pub fn new(id_strategy: IdStrategy, display_tz: Option<Tz>) -> Self {
        Self {
            id_strategy,
            display_tz,
        }
    }

    pub fn transform(&self, record: RawEventRecord, image_url: Option<String>) -> DiscoveredEvent {
        let address = &record.address;
        let title = record.name.trim().to_string();
        let location = format!("{}, {}", address.city.trim(), address.state.trim());
        let full_address = compose_address(&record);
        let time = self
            .display_time(&record.time.start)
            .unwrap_or_else(|| record.time.start.trim().to_string());
        let date = display_date(&record.date, &time);
        let id = self.event_id(&title, &record.date, &location);

        let image = match image_url.filter(|url| !url.trim().is_empty()) {
            Some(url) => ImageRef::Remote(url),
            None => local_image(&title),
        };

        let mut qa_pairs = record.qa_pairs;
        qa_pairs.truncate(MAX_QA_PAIRS);

        DiscoveredEvent {
            id,
            title,
            location,
            address: full_address,
            date,
            time,
            overview: record.overview.trim().to_string(),
            image,
            starts_at: Some(record.time.start),
            ends_at: record.time.end,
            venue: Some(record.address.venue.trim().to_string()),
            link: record.link,
            source_urls: record.source_urls,
            tags: record.tags,
            organizer: record.organizer,
            website_link: record.website_link,
            impact_statement: record.impact_statement,
            qa_pairs,
            geo: record.geo,
        }
    }

    fn event_id(&self, title: &str, date: &str, location: &str) -> String {
        match self.id_strategy {
            IdStrategy::Content => {
                let mut hasher = Sha256::new();
                hasher.update(title.as_bytes());
                hasher.update(b"|");
                hasher.update(date.as_bytes());
                hasher.update(b"|");
                hasher.update(location.as_bytes());
                let digest = format!("{:x}", hasher.finalize());
                format!("event-{}", &digest[..16])
            }
            IdStrategy::Generation => {
                let combined = format!("{title}-{date}-{location}");
                format!(
                    "event-{}-{}",
                    rolling_hash(&combined).unsigned_abs(),
                    utils::now_ms()
                )
            }
        }
    }

    fn display_time(&self, start: &str) -> Option<String> {
        let parsed = DateTime::parse_from_rfc3339(start.trim()).ok()?;
        let formatted = match self.display_tz {
            Some(tz) => parsed.with_timezone(&tz).format("%-I:%M %p").to_string(),
            None => parsed.format("%-I:%M %p").to_string(),
        };
        Some(formatted)
    }
}

fn display_date(iso_date: &str, time: &str) -> String {
    match NaiveDate::parse_from_str(iso_date.trim(), "%Y-%m-%d") {
        Ok(date) => format!("{}{DATE_SEPARATOR}{time}", date.format("%b %-d, %Y")),
        Err(_) => format!("{}{DATE_SEPARATOR}{time}", iso_date.trim()),
    }
}

fn compose_address(record: &RawEventRecord) -> String {
    let address = &record.address;
    let mut composed = format!(
        "{}, {}, {}, {}",
        address.venue.trim(),
        address.street.trim(),
        address.city.trim(),
        address.state.trim()
    );
    if let Some(postal) = address
        .postal_code
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty())
    {
        composed.push(' ');
        composed.push_str(postal);
    }
    composed
}

fn local_image(seed: &str) -> ImageRef {
    let index = rolling_hash(seed).unsigned_abs() as usize % LOCAL_IMAGE_KEYS.len();
    ImageRef::Local(LOCAL_IMAGE_KEYS[index].to_string())
}

/// `h = h * 31 + c` over UTF-16 code units, wrapping at 32 bits.
pub fn rolling_hash(input: &str) -> i32 {
    input.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QaPair, RawAddress, RawTime};

    fn record() -> RawEventRecord {
        RawEventRecord {
            name: "  Town Hall on Transit ".to_string(),
            date: "2025-10-23".to_string(),
            time: RawTime {
                start: "2025-10-23T19:30:00-07:00".to_string(),
                end: Some("2025-10-23T21:00:00-07:00".to_string()),
            },
            address: RawAddress {
                venue: "Phoenix City Hall".to_string(),
                street: "200 W Washington St".to_string(),
                city: "Phoenix".to_string(),
                state: "Arizona".to_string(),
                postal_code: Some("85003".to_string()),
                country: Some("US".to_string()),
            },
            geo: None,
            overview: " Residents weigh in. ".to_string(),
            link: Some("https://phoenix.gov/events/1".to_string()),
            source_urls: vec!["https://phoenix.gov".to_string()],
            tags: vec!["transit".to_string()],
            organizer: Some("City of Phoenix".to_string()),
            website_link: None,
            impact_statement: None,
            qa_pairs: (0..5)
                .map(|i| QaPair {
                    question: format!("q{i}"),
                    answer: format!("a{i}"),
                })
                .collect(),
            image_keyword: Some("town hall".to_string()),
        }
    }

    #[test]
    fn builds_display_fields() {
        let event = EventTransformer::default().transform(record(), None);
        assert_eq!(event.title, "Town Hall on Transit");
        assert_eq!(event.location, "Phoenix, Arizona");
        assert_eq!(
            event.address,
            "Phoenix City Hall, 200 W Washington St, Phoenix, Arizona 85003"
        );
        assert_eq!(event.time, "7:30 PM");
        assert_eq!(event.date, "Oct 23, 2025 • 7:30 PM");
        assert_eq!(event.overview, "Residents weigh in.");
        assert_eq!(event.qa_pairs.len(), 3);
        assert_eq!(event.venue.as_deref(), Some("Phoenix City Hall"));
        assert_eq!(event.starts_at.as_deref(), Some("2025-10-23T19:30:00-07:00"));
    }

    #[test]
    fn omits_absent_postal_code() {
        let mut raw = record();
        raw.address.postal_code = None;
        let event = EventTransformer::default().transform(raw, None);
        assert_eq!(
            event.address,
            "Phoenix City Hall, 200 W Washington St, Phoenix, Arizona"
        );
    }

    #[test]
    fn converts_to_display_timezone() {
        let transformer = EventTransformer::new(IdStrategy::Content, Some(chrono_tz::America::New_York));
        let event = transformer.transform(record(), None);
        assert_eq!(event.time, "10:30 PM");
    }

    #[test]
    fn falls_back_to_raw_strings_on_bad_dates() {
        let mut raw = record();
        raw.date = "next Tuesday".to_string();
        raw.time.start = "evening".to_string();
        let event = EventTransformer::default().transform(raw, None);
        assert_eq!(event.time, "evening");
        assert_eq!(event.date, "next Tuesday • evening");
    }

    #[test]
    fn content_ids_are_stable() {
        let transformer = EventTransformer::default();
        let first = transformer.transform(record(), None);
        let second = transformer.transform(record(), None);
        assert_eq!(first.id, second.id);
        assert!(first.id.starts_with("event-"));

        let mut other = record();
        other.date = "2025-10-24".to_string();
        assert_ne!(transformer.transform(other, None).id, first.id);
    }

    #[test]
    fn generation_ids_carry_hash_and_timestamp() {
        let transformer = EventTransformer::new(IdStrategy::Generation, None);
        let event = transformer.transform(record(), None);
        let parts: Vec<_> = event.id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "event");
        assert!(parts[1].parse::<u32>().is_ok());
        assert!(parts[2].parse::<i64>().is_ok());
    }

    #[test]
    fn prefers_remote_image_then_local_pool() {
        let transformer = EventTransformer::default();
        let remote = transformer.transform(record(), Some("https://images.unsplash.com/p".to_string()));
        assert_eq!(remote.image, ImageRef::Remote("https://images.unsplash.com/p".to_string()));

        let local = transformer.transform(record(), Some("  ".to_string()));
        match local.image {
            ImageRef::Local(key) => assert!(LOCAL_IMAGE_KEYS.contains(&key.as_str())),
            other => panic!("expected local image, got {other:?}"),
        }
    }

    #[test]
    fn rolling_hash_matches_known_values() {
        assert_eq!(rolling_hash(""), 0);
        assert_eq!(rolling_hash("a"), 97);
        assert_eq!(rolling_hash("ab"), 97 * 31 + 98);
    }
}
