//! The two-stage verification strategy: a cheap HTTP check, then an optional
//! browser-rendered check for whatever the cheap one could not settle.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::browser::BrowserPool;
use crate::error::StageError;
use crate::extractor::{Extractor, PageFinding};
use crate::model::VerdictStatus;
use crate::search_engine::search_url;

/// A settled answer from one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub status: VerdictStatus,
    pub confidence: Option<u8>,
    pub url: Option<String>,
    pub http_status: Option<u16>,
    pub note: Option<String>,
}

impl Finding {
    pub fn new(status: VerdictStatus) -> Self {
        Finding {
            status,
            confidence: None,
            url: None,
            http_status: None,
            note: None,
        }
    }

    pub fn confidence(mut self, confidence: u8) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Resolved(Finding),
    /// Not settled here; escalate to the next stage.
    Inconclusive(Option<String>),
}

#[async_trait]
pub trait LookupStage: Send + Sync {
    fn name(&self) -> &str;
    /// Circuit-breaker key, normally the remote host.
    fn target(&self) -> &str;
    async fn probe(&self, query: &str) -> Result<Probe, StageError>;
}

/// Cost-ordered pair of stages.
#[derive(Clone)]
pub struct LookupStrategy {
    pub light: Arc<dyn LookupStage>,
    pub heavy: Option<Arc<dyn LookupStage>>,
}

impl LookupStrategy {
    pub fn new(light: Arc<dyn LookupStage>) -> Self {
        LookupStrategy { light, heavy: None }
    }

    pub fn with_heavy(mut self, heavy: Arc<dyn LookupStage>) -> Self {
        self.heavy = Some(heavy);
        self
    }
}

/// Maps a non-success HTTP status onto the error taxonomy.
pub fn status_error(status: u16) -> StageError {
    match status {
        404 | 410 => StageError::NotFound { status: Some(status) },
        403 | 429 => StageError::RateLimited { status: Some(status) },
        _ => StageError::Transient(format!("HTTP {}", status)),
    }
}

/// Browser-rendered search for the address, through a pooled session.
pub struct BrowserStage {
    pool: Arc<BrowserPool>,
    extractor: Extractor,
    search_base: String,
    target: String,
}

impl BrowserStage {
    pub fn new(pool: Arc<BrowserPool>, search_base: &str) -> Self {
        let target = url::Url::parse(search_base)
            .ok()
            .and_then(|u| u.host_str().map(|h| format!("browser:{}", h)))
            .unwrap_or_else(|| "browser".to_string());
        BrowserStage {
            pool,
            extractor: Extractor::new(),
            search_base: search_base.to_string(),
            target,
        }
    }
}

#[async_trait]
impl LookupStage for BrowserStage {
    fn name(&self) -> &str {
        "browser_search"
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn probe(&self, query: &str) -> Result<Probe, StageError> {
        let url = format!("{}&num=10&hl=en", search_url(&self.search_base, query));
        let mut lease = self.pool.acquire().await?;

        let rendered = async {
            lease.session().navigate(&url).await?;
            lease.session().page_source().await
        }
        .await;

        let html = match rendered {
            Ok(html) => {
                self.pool.release(lease);
                html
            }
            Err(e) => {
                lease.discard();
                return Err(e);
            }
        };
        debug!("Rendered {} bytes for {}", html.len(), query);

        Ok(match self.extractor.assess_search_page(&html, query) {
            PageFinding::Blocked => return Err(StageError::RateLimited { status: None }),
            PageFinding::Profile { url, title } => {
                let title = title.or_else(|| self.extractor.first_heading(&html));
                let finding = Finding::new(VerdictStatus::Valid).confidence(90).url(url);
                Probe::Resolved(match title {
                    Some(t) => finding.note(format!("profile: {}", t)),
                    None => finding,
                })
            }
            PageFinding::Mentioned => Probe::Resolved(
                Finding::new(VerdictStatus::Valid)
                    .confidence(75)
                    .url(url)
                    .note("address appears in rendered results"),
            ),
            PageFinding::Nothing => Probe::Inconclusive(Some("no rendered search evidence".into())),
        })
    }
}
