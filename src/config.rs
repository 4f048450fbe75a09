use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::discovery::{DiscoverySettings, EmptyResultPolicy};
use crate::llm::{self, RetryPolicy};
use crate::transform::IdStrategy;
use crate::{images, utils};

pub const ENV_OPENROUTER_KEY: &str = "OPENROUTER_API_KEY";
pub const ENV_UNSPLASH_KEY: &str = "UNSPLASH_ACCESS_KEY";
pub const ENV_MODEL: &str = "BALLOT_MODEL";
pub const ENV_COMPLETION_URL: &str = "BALLOT_COMPLETION_URL";
pub const ENV_DISPLAY_TZ: &str = "BALLOT_DISPLAY_TZ";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub openrouter_api_key: Option<String>,
    pub unsplash_access_key: Option<String>,
    pub completion_base_url: String,
    pub image_base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub image_timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub default_retry_after_secs: u64,
    pub cache_ttl_hours: u64,
    pub cooldown_secs: Option<u64>,
    pub empty_result_policy: EmptyResultPolicy,
    pub id_strategy: IdStrategy,
    pub display_timezone: Option<String>,
    pub default_location: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            openrouter_api_key: None,
            unsplash_access_key: None,
            completion_base_url: llm::DEFAULT_BASE_URL.to_string(),
            image_base_url: images::DEFAULT_IMAGE_BASE_URL.to_string(),
            model: llm::DEFAULT_MODEL.to_string(),
            temperature: llm::DEFAULT_TEMPERATURE,
            max_tokens: llm::DEFAULT_MAX_TOKENS,
            request_timeout_secs: llm::DEFAULT_TIMEOUT.as_secs(),
            image_timeout_secs: images::DEFAULT_IMAGE_TIMEOUT.as_secs(),
            max_attempts: retry.max_attempts,
            initial_backoff_ms: retry.initial_backoff.as_millis() as u64,
            default_retry_after_secs: retry.default_retry_after.as_secs(),
            cache_ttl_hours: 12,
            cooldown_secs: None,
            empty_result_policy: EmptyResultPolicy::default(),
            id_strategy: IdStrategy::default(),
            display_timezone: None,
            default_location: None,
        }
    }
}

impl AppConfig {
    /// Overlays process environment values. The result is never persisted.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(key) = get(ENV_OPENROUTER_KEY) {
            self.openrouter_api_key = Some(key);
        }
        if let Some(key) = get(ENV_UNSPLASH_KEY) {
            self.unsplash_access_key = Some(key);
        }
        if let Some(model) = get(ENV_MODEL) {
            self.model = model;
        }
        if let Some(url) = get(ENV_COMPLETION_URL) {
            self.completion_base_url = url;
        }
        if let Some(tz) = get(ENV_DISPLAY_TZ) {
            self.display_timezone = Some(tz);
        }
        self
    }

    pub fn display_tz(&self) -> Option<Tz> {
        let name = self.display_timezone.as_deref()?.trim();
        if name.is_empty() {
            return None;
        }
        match name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(err) => {
                warn!(timezone = name, "ignoring unknown display timezone: {err}");
                None
            }
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            default_retry_after: Duration::from_secs(self.default_retry_after_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }

    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            cache_ttl: Duration::from_secs(self.cache_ttl_hours.saturating_mul(60 * 60)),
            cooldown: self
                .cooldown_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            empty_policy: self.empty_result_policy,
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
    data: Mutex<AppConfig>,
}

impl ConfigStore {
    pub fn load_default() -> Self {
        Self::load(utils::config_path())
    }

    pub fn load(path: PathBuf) -> Self {
        let data = match read_config(&path) {
            Ok(config) => config,
            Err(err) => {
                warn!("failed to read config {:?}, using defaults: {err}", path);
                AppConfig::default()
            }
        };
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    pub fn read(&self) -> AppConfig {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn effective(&self) -> AppConfig {
        self.read().with_env_overrides()
    }

    pub fn update<F>(&self, transform: F) -> Result<AppConfig, ConfigError>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        transform(&mut next);
        write_config(&self.path, &next)?;
        *guard = next.clone();
        Ok(next)
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn write_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    utils::ensure_parent(path);
    let contents = serde_json::to_string_pretty(config)?;
    fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("ballot-config-test-{}-{name}", std::process::id()))
            .join("config.json")
    }

    #[test]
    fn defaults_match_pipeline_constants() {
        let config = AppConfig::default();
        assert_eq!(config.model, "perplexity/sonar-pro");
        assert_eq!(config.max_tokens, 5000);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        let settings = config.discovery_settings();
        assert_eq!(settings.cache_ttl, Duration::from_secs(12 * 3600));
        assert_eq!(settings.cooldown, None);
        assert_eq!(settings.empty_policy, EmptyResultPolicy::ShowEmpty);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"model":"other/model","cooldown_secs":120,"empty_result_policy":"fallback","id_strategy":"generation"}"#,
        )
        .unwrap();
        assert_eq!(config.model, "other/model");
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.id_strategy, IdStrategy::Generation);
        let settings = config.discovery_settings();
        assert_eq!(settings.cooldown, Some(Duration::from_secs(120)));
        assert_eq!(settings.empty_policy, EmptyResultPolicy::Fallback);
    }

    #[test]
    fn env_overrides_skip_blank_values() {
        let env: HashMap<&str, &str> = [
            (ENV_OPENROUTER_KEY, "sk-or-test"),
            (ENV_MODEL, "  "),
            (ENV_DISPLAY_TZ, "America/Phoenix"),
        ]
        .into_iter()
        .collect();
        let config = AppConfig::default()
            .with_overrides_from(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.openrouter_api_key.as_deref(), Some("sk-or-test"));
        assert_eq!(config.model, llm::DEFAULT_MODEL);
        assert_eq!(config.display_tz(), Some(chrono_tz::America::Phoenix));
    }

    #[test]
    fn huge_cache_ttl_saturates() {
        let config = AppConfig {
            cache_ttl_hours: u64::MAX / 2,
            ..AppConfig::default()
        };
        assert_eq!(config.discovery_settings().cache_ttl, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn unknown_timezone_is_ignored() {
        let config = AppConfig {
            display_timezone: Some("Mars/Olympus".to_string()),
            ..AppConfig::default()
        };
        assert_eq!(config.display_tz(), None);
    }

    #[test]
    fn update_writes_through_and_reloads() {
        let path = temp_path("roundtrip");
        let _ = fs::remove_file(&path);

        let store = ConfigStore::load(path.clone());
        assert_eq!(store.read(), AppConfig::default());
        store
            .update(|config| config.default_location = Some("Phoenix, Arizona".to_string()))
            .unwrap();

        let reloaded = ConfigStore::load(path.clone());
        assert_eq!(
            reloaded.read().default_location.as_deref(),
            Some("Phoenix, Arizona")
        );
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn corrupt_file_loads_defaults() {
        let path = temp_path("corrupt");
        utils::ensure_parent(&path);
        fs::write(&path, "{not json").unwrap();
        assert_eq!(ConfigStore::load(path.clone()).read(), AppConfig::default());
        let _ = fs::remove_file(&path);
    }
}
