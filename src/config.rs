use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_API_URL: &str = "https://emailverifier.reoon.com/api/v1/verify";
pub const DEFAULT_SEARCH_URL: &str = "https://html.duckduckgo.com/html/";
pub const DEFAULT_BROWSER_SEARCH_URL: &str = "https://www.google.com/search";

/// Which cheap check runs before the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum VerifierKind {
    /// Email verification HTTP API (needs `api_key`).
    Api,
    /// Plain HTTP search-results scrape.
    Search,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnricherConfig {
    pub workers: usize,
    pub max_candidates: usize,
    pub stop_on_first_valid: bool,

    /// Outbound requests allowed per `rate_window_ms`.
    pub max_requests: u32,
    pub rate_window_ms: u64,

    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,

    pub request_timeout_secs: u64,
    pub cancel_grace_secs: u64,

    pub verifier: Option<VerifierKind>,
    pub api_url: String,
    pub api_key: Option<String>,
    pub search_url: String,

    /// WebDriver endpoint; no browser stage without it.
    pub webdriver_url: Option<String>,
    pub browser_search_url: String,
    pub browser_sessions: usize,

    pub log_level: String,
    /// Job server listen port.
    pub port: u16,
    /// Finished jobs and their files are dropped after this long.
    pub job_ttl_secs: u64,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        EnricherConfig {
            workers: 4,
            max_candidates: 8,
            stop_on_first_valid: true,
            max_requests: 2,
            rate_window_ms: 1000,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8000,
            breaker_threshold: 5,
            breaker_cooldown_secs: 60,
            request_timeout_secs: 30,
            cancel_grace_secs: 10,
            verifier: None,
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            search_url: DEFAULT_SEARCH_URL.to_string(),
            webdriver_url: None,
            browser_search_url: DEFAULT_BROWSER_SEARCH_URL.to_string(),
            browser_sessions: 1,
            log_level: "info".to_string(),
            port: 8080,
            job_ttl_secs: 3600,
        }
    }
}

impl EnricherConfig {
    /// Defaults, then the JSON file if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => EnricherConfig::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("ENRICHER_API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = Some(key.trim().to_string());
            }
        }
        if let Ok(url) = std::env::var("ENRICHER_WEBDRIVER_URL") {
            if !url.trim().is_empty() {
                self.webdriver_url = Some(url.trim().to_string());
            }
        }
        if let Some(workers) = std::env::var("ENRICHER_WORKERS")
            .ok()
            .and_then(|w| w.parse().ok())
        {
            self.workers = workers;
        }
        if let Some(port) = std::env::var("ENRICHER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.port = port;
        }
    }

    /// The effective cheap stage: explicit choice, else the API when a key exists.
    pub fn verifier_kind(&self) -> VerifierKind {
        self.verifier.unwrap_or(if self.api_key.is_some() {
            VerifierKind::Api
        } else {
            VerifierKind::Search
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.max_candidates == 0 {
            return Err(ConfigError::Invalid("max_candidates must be at least 1".into()));
        }
        if self.max_requests == 0 || self.rate_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "rate limit needs max_requests > 0 and rate_window_ms > 0".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be at least 1".into()));
        }
        if self.breaker_threshold == 0 {
            return Err(ConfigError::Invalid("breaker_threshold must be at least 1".into()));
        }
        if self.verifier_kind() == VerifierKind::Api && self.api_key.is_none() {
            return Err(ConfigError::Invalid(
                "the api verifier needs an api_key (or ENRICHER_API_KEY)".into(),
            ));
        }
        check_url("api_url", &self.api_url)?;
        check_url("search_url", &self.search_url)?;
        check_url("browser_search_url", &self.browser_search_url)?;
        if let Some(webdriver) = &self.webdriver_url {
            check_url("webdriver_url", webdriver)?;
            if self.browser_sessions == 0 {
                return Err(ConfigError::Invalid(
                    "browser_sessions must be at least 1 when webdriver_url is set".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

fn check_url(field: &str, value: &str) -> Result<(), ConfigError> {
    Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid(format!("{} '{}' is not a valid URL: {}", field, value, e)))
}
