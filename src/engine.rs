//! The lookup engine: verifies candidates through the stage strategy under a
//! shared rate limiter, retry policy, per-target circuit breaker and a
//! run-scoped dedup cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};

use crate::browser::{BrowserPool, WebDriverLauncher};
use crate::cache::LookupCache;
use crate::circuit::{Admission, CircuitBreaker, FailureKind};
use crate::config::{EnricherConfig, VerifierKind};
use crate::delay_manager::{Backoff, RateLimiter};
use crate::error::{ConfigError, StageError};
use crate::model::{Candidate, Evidence, Verdict, VerdictStatus};
use crate::search_engine::SearchEngine;
use crate::stages::{BrowserStage, Finding, LookupStage, LookupStrategy, Probe};
use crate::verifier_api::ApiVerifier;

/// Shared mutable state of one run. Built per run, never global.
pub struct LookupContext {
    pub limiter: RateLimiter,
    pub cache: LookupCache,
    pub breaker: CircuitBreaker,
    pub browser: Option<Arc<BrowserPool>>,
}

impl LookupContext {
    pub fn from_config(config: &EnricherConfig) -> Self {
        LookupContext {
            limiter: RateLimiter::new(config.max_requests, config.rate_window()),
            cache: LookupCache::new(),
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown()),
            browser: None,
        }
    }
}

enum StageOutcome {
    Settled(Verdict),
    Escalate(Option<String>),
}

pub struct LookupEngine {
    strategy: LookupStrategy,
    ctx: Arc<LookupContext>,
    max_attempts: u32,
    backoff: Backoff,
    batch_width: usize,
    probes: AtomicUsize,
}

impl LookupEngine {
    pub fn new(strategy: LookupStrategy, ctx: LookupContext, config: &EnricherConfig) -> Self {
        LookupEngine {
            strategy,
            ctx: Arc::new(ctx),
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::new(
                std::time::Duration::from_millis(config.backoff_base_ms),
                std::time::Duration::from_millis(config.backoff_max_ms),
            ),
            batch_width: config.workers.max(1),
            probes: AtomicUsize::new(0),
        }
    }

    /// Wires the real stages from configuration. Fails only on fatal config errors.
    pub fn from_config(config: &EnricherConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let timeout = config.request_timeout();

        let light: Arc<dyn LookupStage> = match config.verifier_kind() {
            VerifierKind::Api => {
                let key = config
                    .api_key
                    .as_deref()
                    .ok_or_else(|| ConfigError::Invalid("api verifier without api_key".into()))?;
                Arc::new(ApiVerifier::new(&config.api_url, key, timeout)?)
            }
            VerifierKind::Search => Arc::new(SearchEngine::new(&config.search_url, timeout)?),
        };
        let mut strategy = LookupStrategy::new(light);
        let mut ctx = LookupContext::from_config(config);

        if let Some(webdriver) = &config.webdriver_url {
            let launcher = WebDriverLauncher::new(webdriver, timeout)
                .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
            let pool = Arc::new(BrowserPool::new(Arc::new(launcher), config.browser_sessions));
            strategy = strategy.with_heavy(Arc::new(BrowserStage::new(pool.clone(), &config.browser_search_url)));
            ctx.browser = Some(pool);
        }

        info!(
            "Lookup engine ready: light stage '{}'{}",
            strategy.light.name(),
            strategy
                .heavy
                .as_ref()
                .map(|h| format!(", heavy stage '{}'", h.name()))
                .unwrap_or_default()
        );
        Ok(LookupEngine::new(strategy, ctx, config))
    }

    pub fn context(&self) -> &LookupContext {
        &self.ctx
    }

    /// Underlying stage calls made so far (cache hits excluded).
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Verifies one candidate; identical queries within the run share one check.
    pub async fn verify(&self, candidate: &Candidate) -> Verdict {
        let key = candidate.key();
        let (mut verdict, fresh) = self.ctx.cache.get_or_check(&key, || self.check(&key)).await;
        if !fresh {
            debug!("Cache hit for {}", key);
        }
        verdict.evidence.candidate = candidate.address.clone();
        verdict
    }

    /// Verifies candidates concurrently (at most `workers` at once), output in input order.
    pub async fn verify_batch(&self, candidates: &[Candidate]) -> Vec<Verdict> {
        stream::iter(candidates)
            .map(|c| self.verify(c))
            .buffered(self.batch_width)
            .collect()
            .await
    }

    /// Closes pooled browser sessions. Call at the end of every run.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.ctx.browser {
            pool.shutdown().await;
        }
    }

    async fn check(&self, query: &str) -> Verdict {
        let mut attempts = 0;
        let mut verdict = match self.run_stage(self.strategy.light.as_ref(), query, &mut attempts).await {
            StageOutcome::Settled(v) => v,
            StageOutcome::Escalate(light_note) => match &self.strategy.heavy {
                Some(heavy) => {
                    debug!("Escalating {} to {}", query, heavy.name());
                    match self.run_stage(heavy.as_ref(), query, &mut attempts).await {
                        StageOutcome::Settled(v) => v,
                        StageOutcome::Escalate(note) => unknown(query, heavy.name(), note.or(light_note)),
                    }
                }
                None => unknown(query, self.strategy.light.name(), light_note),
            },
        };
        verdict.attempts = attempts;
        verdict
    }

    async fn run_stage(&self, stage: &dyn LookupStage, query: &str, attempts: &mut u32) -> StageOutcome {
        let target = stage.target();
        let mut attempt = 0;
        loop {
            if let Admission::Rejected(kind) = self.ctx.breaker.admit(target) {
                let status = match kind {
                    FailureKind::RateLimited => VerdictStatus::RateLimited,
                    FailureKind::Other => VerdictStatus::Error,
                };
                return StageOutcome::Settled(
                    Verdict::new(status, query)
                        .with_note(format!("{} marked unhealthy, not checked", target))
                        .staged(stage.name()),
                );
            }

            attempt += 1;
            *attempts += 1;
            self.ctx.limiter.acquire().await;
            self.probes.fetch_add(1, Ordering::SeqCst);

            match stage.probe(query).await {
                Ok(Probe::Resolved(finding)) => {
                    self.ctx.breaker.record_success(target);
                    return StageOutcome::Settled(from_finding(query, stage.name(), finding));
                }
                Ok(Probe::Inconclusive(note)) => {
                    self.ctx.breaker.record_success(target);
                    return StageOutcome::Escalate(note);
                }
                Err(e @ StageError::NotFound { .. }) => {
                    self.ctx.breaker.record_success(target);
                    return StageOutcome::Settled(failure_verdict(query, stage.name(), VerdictStatus::Invalid, &e));
                }
                Err(e) => {
                    let kind = if e.is_rate_limit() {
                        FailureKind::RateLimited
                    } else {
                        FailureKind::Other
                    };
                    self.ctx.breaker.record_failure(target, kind);

                    if attempt >= self.max_attempts || !e.is_retryable() {
                        warn!("{} gave up on {} after {} attempt(s): {}", stage.name(), query, attempt, e);
                        let status = if e.is_rate_limit() {
                            VerdictStatus::RateLimited
                        } else {
                            VerdictStatus::Error
                        };
                        return StageOutcome::Settled(failure_verdict(query, stage.name(), status, &e));
                    }

                    let delay = self.backoff.delay(attempt);
                    debug!(
                        "{} attempt {}/{} for {} failed ({}), retrying in {:?}",
                        stage.name(),
                        attempt,
                        self.max_attempts,
                        query,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

trait Staged {
    fn staged(self, stage: &str) -> Self;
}

impl Staged for Verdict {
    fn staged(mut self, stage: &str) -> Self {
        self.evidence.stage = Some(stage.to_string());
        self
    }
}

fn from_finding(query: &str, stage: &str, finding: Finding) -> Verdict {
    Verdict {
        status: finding.status,
        confidence: finding.confidence,
        evidence: Evidence {
            candidate: query.to_string(),
            url: finding.url,
            http_status: finding.http_status,
            stage: Some(stage.to_string()),
            note: finding.note,
        },
        attempts: 0,
    }
}

fn failure_verdict(query: &str, stage: &str, status: VerdictStatus, error: &StageError) -> Verdict {
    let mut verdict = Verdict::new(status, query).with_note(error.to_string()).staged(stage);
    verdict.evidence.http_status = error.http_status();
    verdict
}

fn unknown(query: &str, stage: &str, note: Option<String>) -> Verdict {
    Verdict::new(VerdictStatus::Unknown, query)
        .with_note(note.unwrap_or_else(|| "inconclusive".to_string()))
        .staged(stage)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::model::CandidateSource;
    use std::time::Duration;

    fn cand(record: usize, ordinal: usize, address: &str) -> Candidate {
        Candidate {
            record,
            ordinal,
            address: address.to_string(),
            source: CandidateSource::Pattern("test"),
        }
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds_in_three_attempts() {
        let light = Arc::new(
            ScriptedStage::new("api", invalid()).script("asmith@acme.com", vec![transient(), transient(), valid()]),
        );
        let engine = engine_with(light.clone(), None, &fast_config());

        let verdict = engine.verify(&cand(0, 0, "asmith@acme.com")).await;
        assert_eq!(verdict.status, VerdictStatus::Valid);
        assert_eq!(verdict.attempts, 3);
        assert_eq!(light.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_yield_error_not_invalid() {
        let light = Arc::new(ScriptedStage::new("api", transient()));
        let engine = engine_with(light.clone(), None, &fast_config());
        let verdict = engine.verify(&cand(0, 0, "x@acme.com")).await;
        assert_eq!(verdict.status, VerdictStatus::Error);
        assert_eq!(verdict.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn browser_launch_failure_marks_the_candidate_error() {
        use crate::browser::fake::FakeBrowser;
        use crate::stages::BrowserStage;

        let config = fast_config();
        let browser = Arc::new(FakeBrowser {
            fail_launch: true,
            ..FakeBrowser::default()
        });
        let pool = Arc::new(BrowserPool::new(browser, 1));
        let light = Arc::new(ScriptedStage::new("search", inconclusive()));
        let strategy = LookupStrategy::new(light.clone())
            .with_heavy(Arc::new(BrowserStage::new(pool.clone(), "https://www.google.com/search")));
        let mut ctx = LookupContext::from_config(&config);
        ctx.browser = Some(pool);
        let engine = LookupEngine::new(strategy, ctx, &config);

        let verdict = engine.verify(&cand(0, 0, "x@acme.com")).await;
        assert_eq!(verdict.status, VerdictStatus::Error);
        assert_eq!(verdict.attempts, 1 + config.max_attempts);
        assert_eq!(verdict.evidence.stage.as_deref(), Some("browser_search"));
        assert_eq!(light.calls(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_rate_limits_yield_rate_limited() {
        let light = Arc::new(ScriptedStage::new("api", Err(StageError::RateLimited { status: Some(429) })));
        let engine = engine_with(light, None, &fast_config());
        let verdict = engine.verify(&cand(0, 0, "x@acme.com")).await;
        assert_eq!(verdict.status, VerdictStatus::RateLimited);
        assert_eq!(verdict.evidence.http_status, Some(429));
    }

    #[tokio::test]
    async fn not_found_is_terminal_invalid_without_retry() {
        let light = Arc::new(ScriptedStage::new("api", Err(StageError::NotFound { status: Some(404) })));
        let engine = engine_with(light.clone(), None, &fast_config());
        let verdict = engine.verify(&cand(0, 0, "x@acme.com")).await;
        assert_eq!(verdict.status, VerdictStatus::Invalid);
        assert_eq!(verdict.attempts, 1);
        assert_eq!(light.calls(), 1);
    }

    #[tokio::test]
    async fn inconclusive_light_escalates_to_heavy() {
        let light = Arc::new(ScriptedStage::new("api", inconclusive()));
        let heavy = Arc::new(ScriptedStage::new("browser", valid()));
        let engine = engine_with(light.clone(), Some(heavy.clone()), &fast_config());

        let verdict = engine.verify(&cand(0, 0, "x@acme.com")).await;
        assert_eq!(verdict.status, VerdictStatus::Valid);
        assert_eq!(verdict.evidence.stage.as_deref(), Some("browser"));
        assert_eq!(verdict.attempts, 2);
        assert_eq!(heavy.calls(), 1);
    }

    #[tokio::test]
    async fn settled_light_never_touches_heavy() {
        let light = Arc::new(ScriptedStage::new("api", invalid()));
        let heavy = Arc::new(ScriptedStage::new("browser", valid()));
        let engine = engine_with(light, Some(heavy.clone()), &fast_config());
        assert_eq!(engine.verify(&cand(0, 0, "x@acme.com")).await.status, VerdictStatus::Invalid);
        assert_eq!(heavy.calls(), 0);
    }

    #[tokio::test]
    async fn inconclusive_everywhere_is_unknown() {
        let light = Arc::new(ScriptedStage::new("api", inconclusive()));
        let engine = engine_with(light, None, &fast_config());
        assert_eq!(engine.verify(&cand(0, 0, "x@acme.com")).await.status, VerdictStatus::Unknown);
    }

    #[tokio::test]
    async fn duplicate_queries_across_records_are_checked_once() {
        let light = Arc::new(ScriptedStage::new("api", valid()).with_delay(Duration::from_millis(10)));
        let engine = engine_with(light.clone(), None, &fast_config());
        let batch = vec![
            cand(0, 0, "asmith@acme.com"),
            cand(1, 0, "ASmith@acme.com"),
            cand(2, 0, "other@acme.com"),
            cand(3, 0, "asmith@acme.com"),
        ];
        let verdicts = engine.verify_batch(&batch).await;
        assert_eq!(verdicts.len(), 4);
        assert_eq!(light.calls(), 2);
        assert_eq!(engine.probes(), 2);
        // each verdict cites its own candidate string, in input order
        assert_eq!(verdicts[1].evidence.candidate, "ASmith@acme.com");
        assert_eq!(verdicts[2].evidence.candidate, "other@acme.com");
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_further_candidates() {
        let config = EnricherConfig {
            breaker_threshold: 2,
            max_attempts: 1,
            ..fast_config()
        };
        let light = Arc::new(ScriptedStage::new("api", Err(StageError::RateLimited { status: Some(429) })));
        let engine = engine_with(light.clone(), None, &config);

        engine.verify(&cand(0, 0, "a@x.com")).await;
        engine.verify(&cand(0, 1, "b@x.com")).await;
        assert!(engine.context().breaker.is_open("api"));

        let verdict = engine.verify(&cand(0, 2, "c@x.com")).await;
        assert_eq!(verdict.status, VerdictStatus::RateLimited);
        assert_eq!(verdict.attempts, 0);
        assert_eq!(light.calls(), 2);
    }
}
