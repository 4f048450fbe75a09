use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::discovery::{DiscoveryError, EventSource};
use crate::http::HttpTransport;
use crate::images::ImageLookupClient;
use crate::llm::{ChatMessage, CompletionClient, CompletionRequest};
use crate::models::{DiscoveredEvent, ImageRef};
use crate::parser;
use crate::transform::EventTransformer;

const MAX_LOCATION_CHARS: usize = 200;
const SEARCH_WINDOW_DAYS: u64 = 30;

pub const SYSTEM_PROMPT: &str = "You search the live web and return ONLY valid JSON that matches \
the provided JSON Schema. No markdown, no commentary. Cite sources for each card in source_urls. \
Prefer official and reputable sources. Do not invent data. If unsure, omit the field. Keep \
ai_overview under 60 words and factual.";

const EVENT_CARDS_SCHEMA: &str = r#"{
  "name": "EventCards",
  "schema": {
    "type": "object",
    "required": ["cards"],
    "properties": {
      "cards": {
        "type": "array",
        "maxItems": 10,
        "items": {
          "type": "object",
          "required": ["name", "date", "time", "address", "ai_overview", "link", "source_urls"],
          "properties": {
            "name": { "type": "string" },
            "date": { "type": "string", "description": "ISO 8601 date, e.g. 2025-10-23" },
            "time": {
              "type": "object",
              "required": ["start"],
              "properties": {
                "start": { "type": "string", "description": "ISO 8601 datetime with offset" },
                "end": { "type": "string" }
              }
            },
            "address": {
              "type": "object",
              "required": ["venue", "street", "city", "state"],
              "properties": {
                "venue": { "type": "string" },
                "street": { "type": "string" },
                "city": { "type": "string" },
                "state": { "type": "string" },
                "postal_code": { "type": "string" },
                "country": { "type": "string" }
              }
            },
            "location": {
              "type": "object",
              "properties": { "lat": { "type": "number" }, "lon": { "type": "number" } }
            },
            "ai_overview": { "type": "string", "description": "<= 60 words. Neutral, factual." },
            "link": { "type": "string" },
            "source_urls": { "type": "array", "items": { "type": "string" } },
            "tags": { "type": "array", "items": { "type": "string" } },
            "organizer": { "type": "string" },
            "website_link": { "type": "string" },
            "impact_statement": { "type": "string", "description": "One sentence on why attending matters." },
            "qa_pairs": {
              "type": "array",
              "maxItems": 3,
              "items": {
                "type": "object",
                "required": ["question", "answer"],
                "properties": { "question": { "type": "string" }, "answer": { "type": "string" } }
              }
            },
            "image_keyword": { "type": "string", "description": "One or two words for a stock photo search." }
          }
        }
      }
    }
  }
}"#;

/// Strips characters that could break out of the prompt template and caps the length.
pub fn sanitize_location(location: &str) -> String {
    location
        .chars()
        .filter(|c| !c.is_control())
        .filter(|c| !matches!(c, '"' | '\'' | '`' | '{' | '}' | '[' | ']' | '\\'))
        .take(MAX_LOCATION_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn build_user_prompt(location: &str, today: NaiveDate) -> String {
    let end = today
        .checked_add_days(Days::new(SEARCH_WINDOW_DAYS))
        .unwrap_or(today);
    format!(
        "JSON SCHEMA:\n{EVENT_CARDS_SCHEMA}\n\n\
Find political and civic events near the user and return JSON ONLY per the schema.\n\n\
Location:\n- City, State: {location}\n\n\
Time window:\n- Start: {start}\n- End: {end}\n\n\
Inclusion rules:\n\
- Include rallies, canvasses, town halls, school board or city meetings, voter registration drives.\n\
- Require concrete date, start time, venue, and address.\n\
- Prefer official orgs, Mobilize, Eventbrite, Meetup, universities, and city government sites.\n\
- Max 10 items.\n\n\
Output:\n\
- cards[] with name, date, time.start, time.end if known, address{{venue,street,city,state,postal_code,country}}, \
location{{lat,lon}} if present, ai_overview, link, source_urls[], and the optional enrichment fields when known.\n\
- Do not include any text outside the JSON.",
        start = today.format("%Y-%m-%d"),
        end = end.format("%Y-%m-%d"),
    )
}

pub struct EventPipeline {
    completion: CompletionClient,
    images: ImageLookupClient,
    transformer: EventTransformer,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl EventPipeline {
    pub fn new(
        completion: CompletionClient,
        images: ImageLookupClient,
        transformer: EventTransformer,
        model: impl Into<String>,
        temperature: f32,
        max_tokens: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            completion,
            images,
            transformer,
            model: model.into(),
            temperature,
            max_tokens,
            timeout,
        }
    }

    pub fn from_config(config: &AppConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let completion = CompletionClient::new(
            Arc::clone(&transport),
            config.completion_base_url.clone(),
            config.openrouter_api_key.clone(),
            config.retry_policy(),
        );
        let images = ImageLookupClient::new(
            transport,
            config.image_base_url.clone(),
            config.unsplash_access_key.clone(),
            config.image_timeout(),
        );
        let transformer = EventTransformer::new(config.id_strategy, config.display_tz());
        Self::new(
            completion,
            images,
            transformer,
            config.model.clone(),
            config.temperature,
            config.max_tokens,
            config.request_timeout(),
        )
    }

    fn request_for(&self, location: &str, today: NaiveDate) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(build_user_prompt(location, today)),
            ],
            temperature: self.temperature,
            max_tokens: Some(self.max_tokens),
            timeout: self.timeout,
        }
    }
}

#[async_trait]
impl EventSource for EventPipeline {
    async fn generate(&self, location: &str) -> Result<Vec<DiscoveredEvent>, DiscoveryError> {
        let location = sanitize_location(location);
        if location.is_empty() {
            return Err(DiscoveryError::MissingLocation);
        }
        info!(location = %location, model = %self.model, "generating events");

        let request = self.request_for(&location, Utc::now().date_naive());
        let completion = self.completion.complete(&request).await?;
        let records = parser::parse_events(&completion.text)?;
        debug!(count = records.len(), "records survived validation");

        let keywords: Vec<Option<String>> = records.iter().map(|r| r.image_query()).collect();
        let images = self.images.lookup_many(&keywords).await;

        let events: Vec<DiscoveredEvent> = records
            .into_iter()
            .zip(images)
            .map(|(record, image)| self.transformer.transform(record, image))
            .collect();
        info!(location = %location, count = events.len(), "generated events");
        Ok(events)
    }
}

fn fallback_event(
    index: usize,
    title: &str,
    location: &str,
    address: &str,
    date: &str,
    time: &str,
    overview: &str,
) -> DiscoveredEvent {
    DiscoveredEvent {
        id: format!("fallback-{index}"),
        title: title.to_string(),
        location: location.to_string(),
        address: address.to_string(),
        date: format!("{date} • {time}"),
        time: time.to_string(),
        overview: overview.to_string(),
        image: ImageRef::Local(format!("event{index}")),
        starts_at: None,
        ends_at: None,
        venue: None,
        link: None,
        source_urls: Vec::new(),
        tags: Vec::new(),
        organizer: None,
        website_link: None,
        impact_statement: None,
        qa_pairs: Vec::new(),
        geo: None,
    }
}

pub fn fallback_events() -> Vec<DiscoveredEvent> {
    vec![
        fallback_event(
            1,
            "Community Meeting - Discuss Development Plans",
            "Phoenix, Arizona",
            "200 W Washington St, Phoenix, AZ 85003",
            "Dec 12, 2024",
            "7:30 PM",
            "Join us for a community meeting to discuss upcoming development plans in downtown \
Phoenix. Local officials and residents will gather to review proposed projects and provide feedback.",
        ),
        fallback_event(
            2,
            "Town Hall - Education Reform Debate",
            "Austin, Texas",
            "301 W 2nd St, Austin, TX 78701",
            "Jan 8, 2025",
            "6:00 PM",
            "An open town hall forum to debate education reform proposals. School board members \
and community leaders will present plans and answer questions from parents and educators.",
        ),
        fallback_event(
            3,
            "Policy Forum - Climate Action Strategy",
            "Seattle, Washington",
            "600 4th Ave, Seattle, WA 98104",
            "Feb 2, 2025",
            "5:30 PM",
            "A policy forum on Seattle's climate action strategy for the next decade. Environmental \
experts and city planners will discuss sustainability initiatives and carbon reduction goals.",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::ScriptedTransport;
    use crate::images::{DEFAULT_IMAGE_BASE_URL, DEFAULT_IMAGE_TIMEOUT};
    use crate::llm::{CompletionError, RetryPolicy, DEFAULT_TIMEOUT};
    use crate::transform::IdStrategy;
    use serde_json::json;

    const PHOTO: &str = r#"{"urls":{"regular":"https://images.unsplash.com/rally"}}"#;

    fn completion_body(content: &str) -> String {
        json!({
            "id": "gen-1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
        })
        .to_string()
    }

    fn card(name: &str, keyword: Option<&str>) -> serde_json::Value {
        let mut card = json!({
            "name": name,
            "date": "2025-10-23",
            "time": { "start": "2025-10-23T19:30:00-07:00" },
            "address": {
                "venue": "Phoenix City Hall",
                "street": "200 W Washington St",
                "city": "Phoenix",
                "state": "Arizona",
                "postal_code": "85003"
            },
            "ai_overview": "Residents weigh in on the budget.",
            "link": "https://www.phoenix.gov/calendar",
            "source_urls": ["https://www.phoenix.gov/calendar"]
        });
        if let Some(keyword) = keyword {
            card["image_keyword"] = json!(keyword);
        }
        card
    }

    fn pipeline(
        completion: Arc<ScriptedTransport>,
        images: Arc<ScriptedTransport>,
        image_key: Option<&str>,
    ) -> EventPipeline {
        EventPipeline::new(
            CompletionClient::new(
                completion,
                "https://openrouter.test/api/v1",
                Some("sk-or-test".to_string()),
                RetryPolicy::default(),
            ),
            ImageLookupClient::new(
                images,
                DEFAULT_IMAGE_BASE_URL,
                image_key.map(str::to_string),
                DEFAULT_IMAGE_TIMEOUT,
            ),
            EventTransformer::new(IdStrategy::Content, None),
            "perplexity/sonar-pro",
            0.2,
            5000,
            DEFAULT_TIMEOUT,
        )
    }

    #[test]
    fn sanitizes_prompt_injection_characters() {
        assert_eq!(
            sanitize_location("Phoenix\", \"ignore\n{all}` [rules]\\ "),
            "Phoenix, ignoreall rules"
        );
        assert_eq!(sanitize_location(&"a".repeat(500)).len(), 200);
        assert_eq!(sanitize_location(" \u{7} \"' "), "");
    }

    #[test]
    fn user_prompt_carries_location_and_window() {
        let today = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
        let prompt = build_user_prompt("Phoenix, Arizona", today);
        assert!(prompt.contains("- City, State: Phoenix, Arizona"));
        assert!(prompt.contains("- Start: 2025-10-01"));
        assert!(prompt.contains("- End: 2025-10-31"));
        assert!(prompt.contains("\"name\": \"EventCards\""));
        assert!(prompt.contains("address{venue,street,city,state,postal_code,country}"));
    }

    #[tokio::test]
    async fn two_cards_become_two_events() {
        let content = json!({ "cards": [card("Budget Town Hall", None), card("Voter Drive", None)] })
            .to_string();
        let completion = Arc::new(ScriptedTransport::new().reply(200, &completion_body(&content)));
        let images = Arc::new(ScriptedTransport::new());
        let events = pipeline(completion.clone(), images.clone(), None)
            .generate("Phoenix, Arizona")
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_ne!(events[0].id, events[1].id);
        for event in &events {
            assert_eq!(event.location, "Phoenix, Arizona");
            assert_eq!(
                event.address,
                "Phoenix City Hall, 200 W Washington St, Phoenix, Arizona 85003"
            );
            assert!(!event.image.is_remote());
        }
        assert_eq!(images.request_count(), 0);

        let sent = completion.requests.lock().unwrap();
        let body = sent[0].body.as_ref().unwrap();
        assert_eq!(body["model"], "perplexity/sonar-pro");
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[tokio::test]
    async fn wrapped_output_is_unwrapped_and_images_attached() {
        let cards = json!([card("Canvass Kickoff", Some("canvassing"))]).to_string();
        let content = format!(
            "<think>searching mobilize...</think>\nHere you go:\n```json\n{cards}\n```\nLet me know!"
        );
        let completion = Arc::new(ScriptedTransport::new().reply(200, &completion_body(&content)));
        let images = Arc::new(ScriptedTransport::new().reply(200, PHOTO));
        let events = pipeline(completion, images, Some("unsplash-key"))
            .generate("Phoenix, Arizona")
            .await
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].image,
            ImageRef::Remote("https://images.unsplash.com/rally".to_string())
        );
    }

    #[tokio::test]
    async fn completion_failure_propagates() {
        let completion = Arc::new(ScriptedTransport::new().reply(401, "unauthorized"));
        let err = pipeline(completion, Arc::new(ScriptedTransport::new()), None)
            .generate("Austin")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Completion(CompletionError::Client { status: 401, .. })
        ));
    }

    #[tokio::test]
    async fn prose_only_output_is_a_parse_error() {
        let completion = Arc::new(
            ScriptedTransport::new()
                .reply(200, &completion_body("I could not find any events, sorry.")),
        );
        let err = pipeline(completion, Arc::new(ScriptedTransport::new()), None)
            .generate("Austin")
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Parse(_)));
    }

    #[tokio::test]
    async fn blank_location_is_rejected_before_any_request() {
        let completion = Arc::new(ScriptedTransport::new());
        let err = pipeline(completion.clone(), Arc::new(ScriptedTransport::new()), None)
            .generate(" \"\" ")
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::MissingLocation));
        assert_eq!(completion.request_count(), 0);
    }

    #[test]
    fn fallback_set_is_fixed() {
        let events = fallback_events();
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["fallback-1", "fallback-2", "fallback-3"]);
        assert_eq!(events[1].image, ImageRef::Local("event2".to_string()));
        assert_eq!(events[0].date, "Dec 12, 2024 • 7:30 PM");
    }
}
