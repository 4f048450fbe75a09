use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::http::{HttpRequest, HttpTransport};

pub const DEFAULT_IMAGE_BASE_URL: &str = "https://api.unsplash.com";
pub const DEFAULT_IMAGE_TIMEOUT: Duration = Duration::from_secs(5);
const MEMO_LIMIT: usize = 128;

#[derive(Debug, Deserialize)]
struct RandomPhoto {
    urls: PhotoUrls,
}

#[derive(Debug, Deserialize)]
struct PhotoUrls {
    regular: String,
}

pub struct ImageLookupClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    access_key: Option<String>,
    timeout: Duration,
    // process-lifetime memo, reset once it reaches MEMO_LIMIT
    cache: Mutex<HashMap<String, String>>,
}

impl ImageLookupClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: impl Into<String>,
        access_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            access_key: access_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, keyword: &str) -> Option<String> {
        let key = match &self.access_key {
            Some(key) => key,
            None => {
                debug!("no image access key configured, skipping lookup");
                return None;
            }
        };
        let keyword = keyword.trim().to_lowercase();
        if keyword.is_empty() {
            return None;
        }

        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&keyword)
            .cloned()
        {
            return Some(hit);
        }

        let url = self.photo_url(&keyword)?;
        let request = HttpRequest::get(url, self.timeout)
            .header("Authorization", format!("Client-ID {key}"))
            .header("Accept-Version", "v1");

        let reply = match self.transport.send(request).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(keyword = %keyword, "image lookup failed: {err}");
                return None;
            }
        };

        match reply.status {
            404 => {
                debug!(keyword = %keyword, "no images found");
                return None;
            }
            403 => {
                warn!("image lookup rate limited or key rejected");
                return None;
            }
            status if !reply.is_success() => {
                warn!(keyword = %keyword, status, "image lookup error");
                return None;
            }
            _ => {}
        }

        let photo: RandomPhoto = match serde_json::from_str(&reply.body) {
            Ok(photo) => photo,
            Err(err) => {
                warn!(keyword = %keyword, "image payload unreadable: {err}");
                return None;
            }
        };

        let mut memo = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if memo.len() >= MEMO_LIMIT {
            debug!(size = memo.len(), "image memo full, resetting");
            memo.clear();
        }
        memo.insert(keyword, photo.urls.regular.clone());
        Some(photo.urls.regular)
    }

    pub async fn lookup_many(&self, keywords: &[Option<String>]) -> Vec<Option<String>> {
        debug!(count = keywords.len(), "fetching images in parallel");
        join_all(keywords.iter().map(|keyword| async move {
            match keyword {
                Some(keyword) => self.lookup(keyword).await,
                None => None,
            }
        }))
        .await
    }

    fn photo_url(&self, keyword: &str) -> Option<String> {
        let base = self.base_url.trim_end_matches('/');
        Url::parse_with_params(
            &format!("{base}/photos/random"),
            [
                ("query", keyword),
                ("orientation", "landscape"),
                ("content_filter", "high"),
            ],
        )
        .map(String::from)
        .map_err(|err| warn!("bad image endpoint {base}: {err}"))
        .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::ScriptedTransport;
    use crate::http::TransportError;

    const PHOTO: &str = r#"{"id":"abc","urls":{"raw":"r","full":"f","regular":"https://images.unsplash.com/regular","small":"s","thumb":"t"}}"#;

    fn client(transport: Arc<ScriptedTransport>, key: Option<&str>) -> ImageLookupClient {
        ImageLookupClient::new(
            transport,
            DEFAULT_IMAGE_BASE_URL,
            key.map(str::to_string),
            DEFAULT_IMAGE_TIMEOUT,
        )
    }

    #[tokio::test]
    async fn returns_regular_url_and_memoizes() {
        let transport = Arc::new(ScriptedTransport::new().reply(200, PHOTO));
        let images = client(transport.clone(), Some("access"));

        assert_eq!(
            images.lookup("Town Hall ").await.as_deref(),
            Some("https://images.unsplash.com/regular")
        );
        assert_eq!(
            images.lookup("town hall").await.as_deref(),
            Some("https://images.unsplash.com/regular")
        );
        assert_eq!(transport.request_count(), 1);

        let sent = transport.requests.lock().unwrap();
        assert!(sent[0].url.starts_with("https://api.unsplash.com/photos/random?query=town+hall"));
        assert_eq!(sent[0].timeout, Duration::from_secs(5));
        assert!(sent[0]
            .headers
            .contains(&("Authorization".to_string(), "Client-ID access".to_string())));
    }

    #[tokio::test]
    async fn missing_key_or_keyword_skips_request() {
        let transport = Arc::new(ScriptedTransport::new());
        assert_eq!(client(transport.clone(), None).lookup("rally").await, None);
        assert_eq!(client(transport.clone(), Some("k")).lookup("   ").await, None);
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn failures_degrade_to_none() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(404, "")
                .reply(403, "")
                .fail(TransportError::Timeout)
                .reply(200, "not json"),
        );
        let images = client(transport, Some("k"));
        for keyword in ["a", "b", "c", "d"] {
            assert_eq!(images.lookup(keyword).await, None);
        }
    }

    #[tokio::test]
    async fn lookup_many_keeps_slots_aligned() {
        let transport = Arc::new(ScriptedTransport::new().reply(200, PHOTO).reply(500, ""));
        let images = client(transport, Some("k"));
        let results = images
            .lookup_many(&[Some("rally".to_string()), None, Some("canvass".to_string())])
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[1], None);
        // one of the two lookups got the photo, the other the 500
        assert_eq!(results.iter().flatten().count(), 1);
    }

    #[tokio::test]
    async fn memo_is_bounded() {
        let mut script = ScriptedTransport::new();
        for _ in 0..=MEMO_LIMIT + 1 {
            script = script.reply(200, PHOTO);
        }
        let transport = Arc::new(script);
        let images = client(transport.clone(), Some("k"));

        for n in 0..=MEMO_LIMIT {
            assert!(images.lookup(&format!("topic {n}")).await.is_some());
        }
        assert!(images.cache.lock().unwrap().len() <= MEMO_LIMIT);
        // first keyword was evicted by the reset
        assert!(images.lookup("topic 0").await.is_some());
        assert_eq!(transport.request_count(), MEMO_LIMIT + 2);
    }
}
