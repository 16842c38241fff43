use thiserror::Error;

/// A record that cannot produce candidates. The record is skipped, not the run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("record has no usable first and last name")]
    MissingName,
    #[error("record has no usable company domain")]
    MissingDomain,
    #[error("email hint '{0}' is not a usable address or local part")]
    InvalidHint(String),
}

/// Failure of a single stage check. Contained in the candidate's verdict.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("rate limited by target{}", status_suffix(.status))]
    RateLimited { status: Option<u16> },
    #[error("not found{}", status_suffix(.status))]
    NotFound { status: Option<u16> },
    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),
    #[error("browser session failed: {0}")]
    Browser(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl StageError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StageError::NotFound { .. })
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, StageError::RateLimited { .. })
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            StageError::RateLimited { status } | StageError::NotFound { status } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for StageError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(s) if s.as_u16() == 404 => StageError::NotFound {
                status: Some(404),
            },
            Some(s) if s.as_u16() == 429 || s.as_u16() == 403 => StageError::RateLimited {
                status: Some(s.as_u16()),
            },
            _ => StageError::Transient(e.to_string()),
        }
    }
}

/// Fatal configuration problems, reported before any record is processed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("input file {0} does not exist")]
    Missing(String),
    #[error("could not read input file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("could not open spreadsheet: {0}")]
    Spreadsheet(String),
    #[error("input has no columns for {0}")]
    MissingColumns(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_the_only_non_retryable_stage_error() {
        assert!(!StageError::NotFound { status: Some(404) }.is_retryable());
        assert!(StageError::Transient("timeout".into()).is_retryable());
        assert!(StageError::RateLimited { status: Some(429) }.is_retryable());
        assert!(StageError::BrowserLaunch("no chrome".into()).is_retryable());
    }

    #[test]
    fn stage_error_messages_carry_status() {
        let e = StageError::RateLimited { status: Some(429) };
        assert_eq!(e.to_string(), "rate limited by target (HTTP 429)");
        assert_eq!(e.http_status(), Some(429));
    }
}
