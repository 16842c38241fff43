use serde::Serialize;
use std::fmt;

/// One input row: a person at a company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub name: String,
    /// Raw company website or domain, cleaned by the resolver.
    pub domain: String,
    /// Full known address or just a local-part fragment.
    pub email_hint: Option<String>,
}

impl Record {
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Record {
            name: name.into(),
            domain: domain.into(),
            email_hint: None,
        }
    }

    pub fn with_email_hint(mut self, hint: impl Into<String>) -> Self {
        self.email_hint = Some(hint.into());
        self
    }
}

/// Where a candidate address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CandidateSource {
    Provided,
    Pattern(&'static str),
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateSource::Provided => write!(f, "provided"),
            CandidateSource::Pattern(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    /// Index of the owning record in input order.
    pub record: usize,
    /// Generation order within the record; lower wins ties.
    pub ordinal: usize,
    pub address: String,
    pub source: CandidateSource,
}

impl Candidate {
    /// Dedup key shared by identical queries across records.
    pub fn key(&self) -> String {
        normalize_query(&self.address)
    }
}

pub fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Valid,
    Invalid,
    Unknown,
    RateLimited,
    Error,
}

impl VerdictStatus {
    /// Aggregation precedence, higher wins.
    pub fn rank(self) -> u8 {
        match self {
            VerdictStatus::Valid => 4,
            VerdictStatus::Unknown => 3,
            VerdictStatus::RateLimited => 2,
            VerdictStatus::Invalid => 1,
            VerdictStatus::Error => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerdictStatus::Valid => "valid",
            VerdictStatus::Invalid => "invalid",
            VerdictStatus::Unknown => "unknown",
            VerdictStatus::RateLimited => "rate_limited",
            VerdictStatus::Error => "error",
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Evidence {
    pub candidate: String,
    pub url: Option<String>,
    pub http_status: Option<u16>,
    pub stage: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub confidence: Option<u8>,
    pub evidence: Evidence,
    pub attempts: u32,
}

impl Verdict {
    pub fn new(status: VerdictStatus, candidate: &str) -> Self {
        Verdict {
            status,
            confidence: None,
            evidence: Evidence {
                candidate: candidate.to_string(),
                ..Evidence::default()
            },
            attempts: 0,
        }
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = Some(confidence.min(100));
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.evidence.note = Some(note.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.evidence.url = Some(url.into());
        self
    }
}

/// Final per-record output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRow {
    pub index: usize,
    pub record: Record,
    pub verdict: Option<Verdict>,
    /// Set when the record was malformed and never verified.
    pub skipped: Option<String>,
    pub candidates_tried: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Valid,
    Invalid,
    Unknown,
    RateLimited,
    Error,
    Skipped,
}

impl RowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RowStatus::Valid => "valid",
            RowStatus::Invalid => "invalid",
            RowStatus::Unknown => "unknown",
            RowStatus::RateLimited => "rate_limited",
            RowStatus::Error => "error",
            RowStatus::Skipped => "skipped",
        }
    }
}

impl ResultRow {
    pub fn skipped(index: usize, record: Record, reason: impl Into<String>) -> Self {
        ResultRow {
            index,
            record,
            verdict: None,
            skipped: Some(reason.into()),
            candidates_tried: 0,
        }
    }

    pub fn status(&self) -> RowStatus {
        match &self.verdict {
            None if self.skipped.is_some() => RowStatus::Skipped,
            None => RowStatus::Unknown,
            Some(v) => match v.status {
                VerdictStatus::Valid => RowStatus::Valid,
                VerdictStatus::Invalid => RowStatus::Invalid,
                VerdictStatus::Unknown => RowStatus::Unknown,
                VerdictStatus::RateLimited => RowStatus::RateLimited,
                VerdictStatus::Error => RowStatus::Error,
            },
        }
    }

    /// The verified address, only when the verdict is valid.
    pub fn email(&self) -> Option<&str> {
        self.verdict
            .as_ref()
            .filter(|v| v.status == VerdictStatus::Valid)
            .map(|v| v.evidence.candidate.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_ranks_follow_valid_unknown_ratelimited_invalid_error() {
        let mut statuses = vec![
            VerdictStatus::Error,
            VerdictStatus::Valid,
            VerdictStatus::Invalid,
            VerdictStatus::RateLimited,
            VerdictStatus::Unknown,
        ];
        statuses.sort_by_key(|s| std::cmp::Reverse(s.rank()));
        assert_eq!(
            statuses,
            vec![
                VerdictStatus::Valid,
                VerdictStatus::Unknown,
                VerdictStatus::RateLimited,
                VerdictStatus::Invalid,
                VerdictStatus::Error,
            ]
        );
    }

    #[test]
    fn skipped_row_is_not_reported_as_invalid() {
        let row = ResultRow::skipped(0, Record::new("", "acme.com"), "missing name");
        assert_eq!(row.status(), RowStatus::Skipped);
        assert!(row.email().is_none());
    }

    #[test]
    fn candidate_key_is_normalized() {
        let c = Candidate {
            record: 0,
            ordinal: 0,
            address: "  ASmith@Acme.com ".to_string(),
            source: CandidateSource::Provided,
        };
        assert_eq!(c.key(), "asmith@acme.com");
    }
}
