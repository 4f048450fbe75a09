use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{self, normalize_location, EventCache};
use crate::generation::fallback_events;
use crate::llm::CompletionError;
use crate::models::DiscoveredEvent;
use crate::parser::ParseError;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Location is required for event generation")]
    MissingLocation,
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("failed to parse events: {0}")]
    Parse(#[from] ParseError),
    #[error("Please wait {remaining_secs} seconds before searching again")]
    Cooldown { remaining_secs: u64 },
}

impl DiscoveryError {
    pub fn user_message(&self) -> String {
        match self {
            DiscoveryError::Parse(_) => "Could not read events from the search results".to_string(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn generate(&self, location: &str) -> Result<Vec<DiscoveredEvent>, DiscoveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmptyResultPolicy {
    #[default]
    ShowEmpty,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub cache_ttl: Duration,
    pub cooldown: Option<Duration>,
    pub empty_policy: EmptyResultPolicy,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            cache_ttl: cache::DEFAULT_TTL,
            cooldown: None,
            empty_policy: EmptyResultPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    CacheHit { age_ms: i64 },
    Fresh,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum DiscoveryState {
    #[default]
    Idle,
    Loading {
        location: String,
    },
    Succeeded {
        location: String,
        events: Vec<DiscoveredEvent>,
        source: ResultSource,
    },
    Failed {
        location: String,
        message: String,
        events: Vec<DiscoveredEvent>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Started {
        location: String,
    },
    Resolved {
        location: String,
        events: Vec<DiscoveredEvent>,
        source: ResultSource,
    },
    Errored {
        location: String,
        message: String,
        fallback: Vec<DiscoveredEvent>,
    },
    Cleared,
}

impl DiscoveryState {
    /// Pure transition function. Results for a location other than the
    /// current one are stale and leave the state untouched.
    pub fn apply(self, transition: Transition) -> Self {
        match transition {
            Transition::Started { location } => DiscoveryState::Loading { location },
            Transition::Cleared => DiscoveryState::Idle,
            Transition::Resolved {
                location,
                events,
                source,
            } => {
                if self.location() != Some(location.as_str()) {
                    debug!(location = %location, "ignoring stale result");
                    return self;
                }
                DiscoveryState::Succeeded {
                    location,
                    events,
                    source,
                }
            }
            Transition::Errored {
                location,
                message,
                fallback,
            } => {
                if self.location() != Some(location.as_str()) {
                    debug!(location = %location, "ignoring stale failure");
                    return self;
                }
                DiscoveryState::Failed {
                    location,
                    message,
                    events: fallback,
                }
            }
        }
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            DiscoveryState::Idle => None,
            DiscoveryState::Loading { location }
            | DiscoveryState::Succeeded { location, .. }
            | DiscoveryState::Failed { location, .. } => Some(location),
        }
    }

    pub fn events(&self) -> &[DiscoveredEvent] {
        match self {
            DiscoveryState::Succeeded { events, .. } | DiscoveryState::Failed { events, .. } => {
                events
            }
            _ => &[],
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, DiscoveryState::Loading { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            DiscoveryState::Failed { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BlankLocation,
    AlreadyLoading,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Skipped(SkipReason),
    CacheHit { count: usize, age_ms: i64 },
    Fresh { count: usize },
    Empty,
    Fallback { message: String },
}

type InFlight = Arc<Mutex<HashMap<String, usize>>>;

struct InFlightGuard {
    map: InFlight,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = map.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.key);
            }
        }
    }
}

pub struct DiscoveryOrchestrator {
    source: Arc<dyn EventSource>,
    cache: EventCache,
    settings: DiscoverySettings,
    state: Mutex<DiscoveryState>,
    in_flight: InFlight,
    last_fetch_started: Mutex<Option<Instant>>,
}

impl DiscoveryOrchestrator {
    pub fn new(source: Arc<dyn EventSource>, cache: EventCache, settings: DiscoverySettings) -> Self {
        Self {
            source,
            cache,
            settings,
            state: Mutex::new(DiscoveryState::Idle),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            last_fetch_started: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> DiscoveryState {
        self.lock_state().clone()
    }

    pub fn cache(&self) -> &EventCache {
        &self.cache
    }

    pub fn cache_age_display(&self) -> Option<String> {
        match &*self.lock_state() {
            DiscoveryState::Succeeded {
                source: ResultSource::CacheHit { age_ms },
                ..
            } => Some(cache::format_cache_age(*age_ms)),
            _ => None,
        }
    }

    pub fn clear(&self) {
        self.transition(Transition::Cleared);
    }

    pub async fn refresh(&self, location: &str) -> Result<FetchOutcome, DiscoveryError> {
        self.fetch(location, true).await
    }

    pub async fn fetch(&self, location: &str, force: bool) -> Result<FetchOutcome, DiscoveryError> {
        let location = location.trim();
        if location.is_empty() {
            debug!("no location provided, skipping fetch");
            return Ok(FetchOutcome::Skipped(SkipReason::BlankLocation));
        }

        let _guard = match self.begin(location, force)? {
            Some(guard) => guard,
            None => {
                info!(location, "already loading events for this location");
                return Ok(FetchOutcome::Skipped(SkipReason::AlreadyLoading));
            }
        };
        self.transition(Transition::Started {
            location: location.to_string(),
        });

        if force {
            self.cache.invalidate(location).await;
        } else if let Some(hit) = self.cache.get(location).await {
            if !hit.events.is_empty() {
                let count = hit.events.len();
                self.transition(Transition::Resolved {
                    location: location.to_string(),
                    events: hit.events,
                    source: ResultSource::CacheHit { age_ms: hit.age_ms },
                });
                return Ok(FetchOutcome::CacheHit {
                    count,
                    age_ms: hit.age_ms,
                });
            }
        }

        match self.source.generate(location).await {
            Ok(events) if events.is_empty() => Ok(self.resolve_empty(location)),
            Ok(events) => {
                let count = events.len();
                self.cache.put(location, &events).await;
                self.transition(Transition::Resolved {
                    location: location.to_string(),
                    events,
                    source: ResultSource::Fresh,
                });
                Ok(FetchOutcome::Fresh { count })
            }
            Err(err) => {
                let message = err.user_message();
                warn!(location, "failed to fetch events: {err}");
                self.transition(Transition::Errored {
                    location: location.to_string(),
                    message: message.clone(),
                    fallback: fallback_events(),
                });
                Ok(FetchOutcome::Fallback { message })
            }
        }
    }

    fn resolve_empty(&self, location: &str) -> FetchOutcome {
        match self.settings.empty_policy {
            EmptyResultPolicy::ShowEmpty => {
                info!(location, "no events found");
                self.transition(Transition::Resolved {
                    location: location.to_string(),
                    events: Vec::new(),
                    source: ResultSource::Fresh,
                });
                FetchOutcome::Empty
            }
            EmptyResultPolicy::Fallback => {
                warn!(location, "no events generated, using fallback");
                self.transition(Transition::Resolved {
                    location: location.to_string(),
                    events: fallback_events(),
                    source: ResultSource::Fallback,
                });
                FetchOutcome::Fallback {
                    message: "Using fallback events".to_string(),
                }
            }
        }
    }

    /// Registers an in-flight fetch. `Ok(None)` means a fetch for this
    /// location is already running and this one should be dropped.
    fn begin(&self, location: &str, force: bool) -> Result<Option<InFlightGuard>, DiscoveryError> {
        let key = normalize_location(location);
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !force && in_flight.contains_key(&key) {
            return Ok(None);
        }

        if let Some(cooldown) = self.settings.cooldown {
            let mut last = self
                .last_fetch_started
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            if let Some(started) = *last {
                let elapsed = now.duration_since(started);
                if elapsed < cooldown {
                    let remaining = cooldown - elapsed;
                    let remaining_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                    return Err(DiscoveryError::Cooldown { remaining_secs });
                }
            }
            *last = Some(now);
        }

        *in_flight.entry(key.clone()).or_insert(0) += 1;
        Ok(Some(InFlightGuard {
            map: Arc::clone(&self.in_flight),
            key,
        }))
    }

    fn transition(&self, transition: Transition) {
        let mut state = self.lock_state();
        let current = std::mem::take(&mut *state);
        *state = current.apply(transition);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DiscoveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
