use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;

use crate::error::{ConfigError, StageError};
use crate::model::VerdictStatus;
use crate::stages::{status_error, Finding, LookupStage, Probe};

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: Option<String>,
    error: Option<String>,
    reason: Option<String>,
}

/// Email verification API in the `?email=&key=&mode=` style.
pub struct ApiVerifier {
    client: Client,
    endpoint: String,
    api_key: String,
    target: String,
}

impl ApiVerifier {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        let target = url::Url::parse(endpoint)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| endpoint.to_string());
        Ok(ApiVerifier {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            target,
        })
    }
}

/// Maps an API reply onto a probe outcome.
pub fn interpret_api_response(status: u16, body: &str) -> Result<Probe, StageError> {
    if !(200..300).contains(&status) {
        return Err(status_error(status));
    }
    let parsed: ApiResponse = serde_json::from_str(body)
        .map_err(|e| StageError::Transient(format!("undecodable API response: {}", e)))?;

    let Some(api_status) = parsed.status.map(|s| s.to_lowercase()) else {
        return match parsed.error {
            Some(error) => Err(StageError::Transient(format!("API error: {}", error))),
            None => Ok(Probe::Inconclusive(Some("API returned no status".into()))),
        };
    };

    let note = match &parsed.reason {
        Some(reason) => format!("api status: {} ({})", api_status, reason),
        None => format!("api status: {}", api_status),
    };
    let finding = |verdict: VerdictStatus, confidence: u8| {
        Finding::new(verdict)
            .confidence(confidence)
            .http_status(status)
            .note(note.clone())
    };

    Ok(match api_status.as_str() {
        "valid" | "safe" => Probe::Resolved(finding(VerdictStatus::Valid, 95)),
        "catch_all" | "catch-all" | "accept_all" | "role_account" => {
            Probe::Resolved(finding(VerdictStatus::Valid, 60))
        }
        // the mailbox exists but mail may not land
        "inbox_full" | "disposable" => Probe::Resolved(finding(VerdictStatus::Valid, 50)),
        "invalid" | "disabled" | "spamtrap" => Probe::Resolved(finding(VerdictStatus::Invalid, 90)),
        other => Probe::Inconclusive(Some(format!("api status: {}", other))),
    })
}

#[async_trait]
impl LookupStage for ApiVerifier {
    fn name(&self) -> &str {
        "verifier_api"
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn probe(&self, address: &str) -> Result<Probe, StageError> {
        debug!("Verifying {} via API", address);
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("email", address), ("key", self.api_key.as_str()), ("mode", "power")])
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        let outcome = interpret_api_response(status, &body);
        if let Err(e) = &outcome {
            warn!("API check for {} failed: {}", address, e);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(p: Result<Probe, StageError>) -> Finding {
        match p {
            Ok(Probe::Resolved(f)) => f,
            other => panic!("expected resolved, got {:?}", other),
        }
    }

    #[test]
    fn maps_deliverable_statuses_to_valid() {
        let f = resolved(interpret_api_response(200, r#"{"status":"valid"}"#));
        assert_eq!(f.status, VerdictStatus::Valid);
        assert_eq!(f.confidence, Some(95));

        let f = resolved(interpret_api_response(200, r#"{"status":"catch_all","reason":"accepts all"}"#));
        assert_eq!(f.status, VerdictStatus::Valid);
        assert_eq!(f.confidence, Some(60));
        assert_eq!(f.note.as_deref(), Some("api status: catch_all (accepts all)"));
    }

    #[test]
    fn existing_but_unreliable_mailboxes_are_low_confidence_hits() {
        for s in ["inbox_full", "disposable"] {
            let f = resolved(interpret_api_response(200, &format!(r#"{{"status":"{}"}}"#, s)));
            assert_eq!(f.status, VerdictStatus::Valid);
            assert_eq!(f.confidence, Some(50));
        }
    }

    #[test]
    fn maps_undeliverable_statuses_to_invalid() {
        for s in ["invalid", "disabled", "spamtrap"] {
            let f = resolved(interpret_api_response(200, &format!(r#"{{"status":"{}"}}"#, s)));
            assert_eq!(f.status, VerdictStatus::Invalid);
        }
    }

    #[test]
    fn unknown_escalates() {
        assert!(matches!(
            interpret_api_response(200, r#"{"status":"unknown"}"#),
            Ok(Probe::Inconclusive(_))
        ));
    }

    #[test]
    fn errors_follow_taxonomy() {
        assert!(matches!(
            interpret_api_response(200, r#"{"error":"Daily quota exceeded"}"#),
            Err(StageError::Transient(_))
        ));
        assert!(matches!(interpret_api_response(200, "<html>"), Err(StageError::Transient(_))));
        assert!(matches!(
            interpret_api_response(429, ""),
            Err(StageError::RateLimited { status: Some(429) })
        ));
        assert!(matches!(
            interpret_api_response(404, ""),
            Err(StageError::NotFound { status: Some(404) })
        ));
    }
}
