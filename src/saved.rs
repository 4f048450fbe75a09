use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::{SharedStore, StoreError};
use crate::models::{DiscoveredEvent, GeoPoint, ImageRef, QaPair};

pub const SAVED_EVENTS_KEY: &str = "ballot:saved_events";
pub const CURRENT_DATA_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SavedEvent {
    pub id: String,
    pub title: String,
    pub location: String,
    pub date: String,
    pub image_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
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
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
}

impl SavedEvent {
    pub fn image(&self) -> ImageRef {
        ImageRef::from_key(&self.image_key)
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

impl From<DiscoveredEvent> for SavedEvent {
    fn from(event: DiscoveredEvent) -> Self {
        Self {
            id: event.id,
            title: event.title,
            location: event.location,
            date: event.date,
            image_key: event.image.into(),
            address: non_empty(event.address),
            time: non_empty(event.time),
            overview: non_empty(event.overview),
            starts_at: event.starts_at,
            ends_at: event.ends_at,
            venue: event.venue,
            link: event.link,
            source_urls: event.source_urls,
            tags: event.tags,
            organizer: event.organizer,
            website_link: event.website_link,
            impact_statement: event.impact_statement,
            qa_pairs: event.qa_pairs,
            latitude: event.geo.map(|geo| geo.lat),
            longitude: event.geo.map(|geo| geo.lon),
            notification_id: None,
        }
    }
}

impl SavedEvent {
    pub fn geo(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StorageData {
    version: u32,
    #[serde(default)]
    events: Vec<SavedEvent>,
}

/// When to remind the user: one hour before the start, if that is still ahead.
pub fn reminder_time(event: &SavedEvent, now: DateTime<Utc>) -> Option<DateTime<FixedOffset>> {
    let start = DateTime::parse_from_rfc3339(event.starts_at.as_deref()?.trim()).ok()?;
    let remind_at = start - Duration::hours(1);
    if remind_at.with_timezone(&Utc) <= now {
        return None;
    }
    Some(remind_at)
}

pub struct SavedEventStore {
    store: SharedStore,
    events: Mutex<Vec<SavedEvent>>,
}

impl SavedEventStore {
    pub async fn load(store: SharedStore) -> Self {
        let events = match store.run(|s| s.get(SAVED_EVENTS_KEY)).await {
            Ok(Some(raw)) => match serde_json::from_str::<StorageData>(&raw) {
                Ok(data) => {
                    if data.version != CURRENT_DATA_VERSION {
                        info!(
                            from = data.version,
                            to = CURRENT_DATA_VERSION,
                            "saved events stored under another version, loading as-is"
                        );
                    }
                    data.events
                }
                Err(err) => {
                    warn!("saved events unreadable, starting empty: {err}");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("failed to load saved events: {err}");
                Vec::new()
            }
        };
        Self {
            store,
            events: Mutex::new(events),
        }
    }

    pub async fn list(&self) -> Vec<SavedEvent> {
        self.events.lock().await.clone()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.events.lock().await.iter().any(|e| e.id == id)
    }

    pub async fn get(&self, id: &str) -> Option<SavedEvent> {
        self.events.lock().await.iter().find(|e| e.id == id).cloned()
    }

    pub async fn add(&self, event: SavedEvent) -> Result<bool, StoreError> {
        let mut events = self.events.lock().await;
        if events.iter().any(|e| e.id == event.id) {
            return Ok(false);
        }
        let mut next = Vec::with_capacity(events.len() + 1);
        next.push(event);
        next.extend(events.iter().cloned());
        self.persist(&next).await?;
        *events = next;
        Ok(true)
    }

    /// Removes and returns the event so callers can cancel its reminder.
    pub async fn remove(&self, id: &str) -> Result<Option<SavedEvent>, StoreError> {
        let mut events = self.events.lock().await;
        let position = match events.iter().position(|e| e.id == id) {
            Some(position) => position,
            None => return Ok(None),
        };
        let mut next = events.clone();
        let removed = next.remove(position);
        self.persist(&next).await?;
        *events = next;
        Ok(Some(removed))
    }

    pub async fn set_notification(
        &self,
        id: &str,
        notification_id: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut events = self.events.lock().await;
        let position = match events.iter().position(|e| e.id == id) {
            Some(position) => position,
            None => return Ok(false),
        };
        let mut next = events.clone();
        next[position].notification_id = notification_id;
        self.persist(&next).await?;
        *events = next;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut events = self.events.lock().await;
        self.store.run(|s| s.remove(SAVED_EVENTS_KEY)).await?;
        events.clear();
        Ok(())
    }

    async fn persist(&self, events: &[SavedEvent]) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&StorageData {
            version: CURRENT_DATA_VERSION,
            events: events.to_vec(),
        })?;
        self.store
            .run(move |s| s.put(SAVED_EVENTS_KEY, &payload))
            .await
    }
}
