//! Turns a record into an ordered, capped list of candidate addresses.

use std::collections::HashSet;

use crate::error::ResolveError;
use crate::model::{Candidate, CandidateSource, Record};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub first: String,
    pub middle: Option<String>,
    pub last: String,
}

/// Strips scheme, `www.` and any path: `https://www.Acme.com/about` -> `acme.com`.
pub fn clean_domain(raw: &str) -> String {
    let mut domain = raw.trim();
    for prefix in ["https://", "http://", "www."] {
        if let Some(rest) = strip_prefix_ignore_case(domain, prefix) {
            domain = rest;
        }
    }
    let domain = domain.split('/').next().unwrap_or("");
    domain.trim().to_lowercase()
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    // `get` keeps multi-byte input from splitting mid-character
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

fn letters_only(s: &str) -> String {
    s.to_lowercase().chars().filter(|c| c.is_ascii_lowercase()).collect()
}

/// First token is the first name, last token the last name, the rest the middle.
/// A single token doubles as both first and last.
pub fn parse_name(full_name: &str) -> Option<ParsedName> {
    let parts: Vec<&str> = full_name.split_whitespace().collect();
    if parts.is_empty() {
        return None;
    }

    let first = letters_only(parts[0]);
    let (middle, mut last) = match parts.len() {
        1 => (None, String::new()),
        2 => (None, letters_only(parts[1])),
        n => {
            let middle = letters_only(&parts[1..n - 1].join(" "));
            (Some(middle).filter(|m| !m.is_empty()), letters_only(parts[n - 1]))
        }
    };

    if parts.len() == 1 && !first.is_empty() {
        last = first.clone();
    }
    if first.is_empty() || last.is_empty() {
        return None;
    }
    Some(ParsedName { first, middle, last })
}

fn initial(s: &str) -> String {
    s.chars().next().map(String::from).unwrap_or_default()
}

/// The fixed pattern order, most common corporate formats first.
pub fn local_parts(name: &ParsedName) -> Vec<(&'static str, String)> {
    let first = name.first.as_str();
    let last = name.last.as_str();
    let f = initial(first);
    let l = initial(last);
    let m = name.middle.as_deref().map(initial).unwrap_or_default();

    let mut parts = vec![
        ("flast", format!("{}{}", f, last)),
        ("first", first.to_string()),
        ("first.last", format!("{}.{}", first, last)),
        ("last", last.to_string()),
        ("fl", format!("{}{}", f, l)),
        ("firstlast", format!("{}{}", first, last)),
        ("firstl", format!("{}{}", first, l)),
        ("lastf", format!("{}{}", last, f)),
        ("last.f", format!("{}.{}", last, f)),
    ];
    if !m.is_empty() {
        parts.push(("fml", format!("{}{}{}", f, m, l)));
    }
    parts.push(("lastfirst", format!("{}{}", last, first)));
    if !m.is_empty() {
        parts.push(("first.m.last", format!("{}.{}.{}", first, m, last)));
        parts.push(("fmlast", format!("{}{}{}", f, m, last)));
    }
    parts.push(("first_last", format!("{}_{}", first, last)));
    parts
}

pub struct CandidateResolver {
    max_candidates: usize,
}

impl CandidateResolver {
    pub fn new(max_candidates: usize) -> Self {
        CandidateResolver {
            max_candidates: max_candidates.max(1),
        }
    }

    pub fn resolve(&self, index: usize, record: &Record) -> Result<Vec<Candidate>, ResolveError> {
        let hint = record
            .email_hint
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty());
        let domain = clean_domain(&record.domain);

        let mut addresses: Vec<(CandidateSource, String)> = Vec::new();

        if let Some(hint) = hint {
            addresses.push((CandidateSource::Provided, hint_address(hint, &domain)?));
        }

        match parse_name(&record.name) {
            Some(name) if !domain.is_empty() => {
                for (pattern, local) in local_parts(&name) {
                    if !local.is_empty() {
                        addresses.push((CandidateSource::Pattern(pattern), format!("{}@{}", local, domain)));
                    }
                }
            }
            // a full address alone is enough to verify
            _ if !addresses.is_empty() => {}
            Some(_) => return Err(ResolveError::MissingDomain),
            None if domain.is_empty() => return Err(ResolveError::MissingDomain),
            None => return Err(ResolveError::MissingName),
        }

        let mut seen = HashSet::new();
        let candidates = addresses
            .into_iter()
            .filter(|(_, address)| seen.insert(address.to_lowercase()))
            .take(self.max_candidates)
            .enumerate()
            .map(|(ordinal, (source, address))| Candidate {
                record: index,
                ordinal,
                address,
                source,
            })
            .collect();
        Ok(candidates)
    }
}

fn hint_address(hint: &str, domain: &str) -> Result<String, ResolveError> {
    if let Some((local, host)) = hint.split_once('@') {
        if local.is_empty() || !host.contains('.') || host.contains('@') {
            return Err(ResolveError::InvalidHint(hint.to_string()));
        }
        return Ok(hint.to_lowercase());
    }
    if domain.is_empty() || hint.contains(char::is_whitespace) {
        return Err(ResolveError::InvalidHint(hint.to_string()));
    }
    Ok(format!("{}@{}", hint.to_lowercase(), domain))
}
