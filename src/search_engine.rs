use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::Client;
use std::time::Duration;

use crate::error::{ConfigError, StageError};
use crate::extractor::{Extractor, PageFinding};
use crate::model::VerdictStatus;
use crate::stages::{status_error, Finding, LookupStage, Probe};

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
];

pub fn random_user_agent() -> &'static str {
    let mut rng = rand::thread_rng();
    USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
}

/// `"address" site:linkedin.com`, URL-encoded onto `base`.
pub fn search_url(base: &str, address: &str) -> String {
    let query = format!("\"{}\" site:linkedin.com", address);
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}q={}", base, sep, urlencoding::encode(&query))
}

/// Plain-HTTP scrape of an HTML search-results page.
pub struct SearchEngine {
    client: Client,
    extractor: Extractor,
    base_url: String,
    target: String,
}

impl SearchEngine {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .cookie_store(true)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let target = url::Url::parse(base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| base_url.to_string());

        Ok(SearchEngine {
            client,
            extractor: Extractor::new(),
            base_url: base_url.to_string(),
            target,
        })
    }

    /// Turns a fetched results page into a probe outcome.
    pub fn interpret(&self, status: u16, html: &str, address: &str, page_url: &str) -> Result<Probe, StageError> {
        if !(200..300).contains(&status) {
            warn!("Search failed with status: {}", status);
            return Err(status_error(status));
        }
        match self.extractor.assess_search_page(html, address) {
            PageFinding::Blocked => {
                warn!("Search engine served a CAPTCHA for {}", address);
                Err(StageError::RateLimited { status: Some(status) })
            }
            PageFinding::Profile { url, title } => {
                info!("Found profile for {}: {}", address, url);
                let finding = Finding::new(VerdictStatus::Valid)
                    .confidence(85)
                    .url(url)
                    .http_status(status);
                Ok(Probe::Resolved(match title {
                    Some(t) => finding.note(format!("profile: {}", t)),
                    None => finding,
                }))
            }
            PageFinding::Mentioned => Ok(Probe::Resolved(
                Finding::new(VerdictStatus::Valid)
                    .confidence(70)
                    .url(page_url)
                    .http_status(status)
                    .note("address appears in search results"),
            )),
            PageFinding::Nothing => Ok(Probe::Inconclusive(Some("no search evidence".into()))),
        }
    }
}

#[async_trait]
impl LookupStage for SearchEngine {
    fn name(&self) -> &str {
        "http_search"
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn probe(&self, address: &str) -> Result<Probe, StageError> {
        let url = search_url(&self.base_url, address);
        debug!("Searching: {}", url);

        let resp = self
            .client
            .get(&url)
            .header(USER_AGENT, random_user_agent())
            .send()
            .await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        self.interpret(status, &text, address, &url)
    }
}
