use log::debug;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

use crate::resolver::{local_parts, parse_name};

/// What a search-results page says about one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageFinding {
    /// A profile link next to the query; strongest signal.
    Profile { url: String, title: Option<String> },
    /// The address itself appears in the result text.
    Mentioned,
    /// Search engine served a CAPTCHA / unusual-traffic page.
    Blocked,
    Nothing,
}

/// One profile link found on a results page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileHit {
    pub url: String,
    /// Link text, usually "Name - Role - Company | LinkedIn".
    pub title: Option<String>,
    /// Text of the enclosing search result (title plus snippet).
    pub context: String,
}

pub struct Extractor {
    email_regex: Regex,
    profile_regex: Regex,
    bare_profile_regex: Regex,
    anchor: Selector,
    attr_holder: Selector,
    heading: Selector,
}

impl Extractor {
    pub fn new() -> Self {
        Extractor {
            email_regex: Regex::new(r"(?i)[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}").unwrap(),
            profile_regex: Regex::new(r"(?i)https://[a-z0-9.-]*linkedin\.com/in/[a-z0-9\-_%]+/?").unwrap(),
            bare_profile_regex: Regex::new(r"(?i)linkedin\.com/in/[a-z0-9\-_%]+").unwrap(),
            anchor: Selector::parse("a[href]").unwrap(),
            attr_holder: Selector::parse("[data-href], [onclick]").unwrap(),
            heading: Selector::parse("h2, h3").unwrap(),
        }
    }

    pub fn extract_emails(&self, text: &str) -> HashSet<String> {
        let mut emails = HashSet::new();
        for m in self.email_regex.find_iter(text) {
            let email = m.as_str().to_lowercase();
            if ![".png", ".jpg", ".jpeg", ".gif", ".webp"].iter().any(|ext| email.ends_with(ext)) {
                emails.insert(email);
            }
        }
        emails
    }

    pub fn is_blocked(&self, html: &str) -> bool {
        let lower = html.to_lowercase();
        lower.contains("captcha") || lower.contains("unusual traffic") || lower.contains("/sorry/index")
    }

    /// Profile links, in page order, without duplicates.
    ///
    /// Anchors first (unwrapping search-engine redirects), then `data-href` /
    /// `onclick` attributes, then a regex sweep over the raw source.
    pub fn extract_profiles(&self, html: &str) -> Vec<ProfileHit> {
        let document = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for element in document.select(&self.anchor) {
            let Some(href) = element.value().attr("href") else { continue };
            let Some(target) = unwrap_redirect(href) else { continue };
            if is_profile_url(&target) && seen.insert(canonical_profile(&target)) {
                let title = squash(element.text());
                let context = result_block(element).map(|b| squash(b.text())).unwrap_or_else(|| title.clone());
                found.push(ProfileHit {
                    url: target,
                    title: Some(title).filter(|t| !t.is_empty()),
                    context,
                });
            }
        }

        let bare = |url: &str| ProfileHit {
            url: url.to_string(),
            title: None,
            context: String::new(),
        };
        for element in document.select(&self.attr_holder) {
            let combined = format!(
                "{} {}",
                element.value().attr("data-href").unwrap_or(""),
                element.value().attr("onclick").unwrap_or("")
            );
            for m in self.profile_regex.find_iter(&combined) {
                if seen.insert(canonical_profile(m.as_str())) {
                    found.push(bare(m.as_str()));
                }
            }
        }

        if found.is_empty() {
            for m in self.profile_regex.find_iter(html) {
                if seen.insert(canonical_profile(m.as_str())) {
                    found.push(bare(m.as_str()));
                }
            }
        }
        if found.is_empty() {
            if let Some(m) = self.bare_profile_regex.find(html) {
                found.push(bare(&format!("https://www.{}", m.as_str())));
            }
        }
        found
    }

    /// Decides what a search-results page says about `address`.
    ///
    /// A profile only counts when [`profile_matches`] ties it to the address;
    /// unrelated profiles leave the page inconclusive.
    pub fn assess_search_page(&self, html: &str, address: &str) -> PageFinding {
        if self.is_blocked(html) {
            return PageFinding::Blocked;
        }
        let profiles = self.extract_profiles(html);
        if let Some(hit) = profiles.iter().find(|hit| profile_matches(hit, address)) {
            return PageFinding::Profile {
                url: hit.url.clone(),
                title: hit.title.clone(),
            };
        }

        let document = Html::parse_document(html);
        let text = document.root_element().text().collect::<Vec<_>>().join(" ");
        if self.extract_emails(&text).contains(&address.to_lowercase()) {
            return PageFinding::Mentioned;
        }
        if !profiles.is_empty() {
            debug!("{} profile(s) on page, none related to {}", profiles.len(), address);
        }
        PageFinding::Nothing
    }

    /// First result heading, used as a profile title when the link had no text.
    pub fn first_heading(&self, html: &str) -> Option<String> {
        let document = Html::parse_document(html);
        document
            .select(&self.heading)
            .map(|h| h.text().collect::<Vec<_>>().join(" ").trim().to_string())
            .find(|t| !t.is_empty())
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Extractor::new()
    }
}

/// Whether a profile result is about `address`: the address appears in the
/// result, or the result names the company and a person whose usual local
/// parts include the address's local part.
pub fn profile_matches(hit: &ProfileHit, address: &str) -> bool {
    let address = address.trim().to_lowercase();
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    let haystack = format!("{} {}", hit.title.as_deref().unwrap_or(""), hit.context).to_lowercase();
    if haystack.contains(&address) {
        return true;
    }

    let company = domain.split('.').next().unwrap_or("");
    if company.len() < 2 || !haystack.contains(company) {
        return false;
    }
    candidate_names(hit).iter().any(|name| {
        parse_name(name)
            .map(|parsed| local_parts(&parsed).iter().any(|(_, l)| l == local))
            .unwrap_or(false)
    })
}

/// Person names a hit may carry: the lead segment of its title and the
/// words of its profile slug.
fn candidate_names(hit: &ProfileHit) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(title) = &hit.title {
        let lead = title
            .split(|c: char| matches!(c, '|' | '-' | ',' | '\u{2013}' | '\u{2014}'))
            .next()
            .unwrap_or("");
        names.push(lead.trim().to_string());
    }
    let lower = hit.url.to_lowercase();
    if let Some((_, rest)) = lower.split_once("/in/") {
        let slug = rest.split(['/', '?', '#']).next().unwrap_or("");
        let words: Vec<&str> = slug
            .split(['-', '_'])
            .filter(|w| !w.is_empty() && w.chars().all(|c| c.is_ascii_alphabetic()))
            .collect();
        names.push(words.join(" "));
    }
    names.retain(|n| !n.is_empty());
    names
}

fn squash<'a>(text: impl Iterator<Item = &'a str>) -> String {
    text.collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The search result an anchor belongs to (DuckDuckGo `result`, Google `g`).
fn result_block(anchor: ElementRef<'_>) -> Option<ElementRef<'_>> {
    anchor.ancestors().filter_map(ElementRef::wrap).find(|el| {
        el.value()
            .classes()
            .any(|c| c == "result" || c == "result__body" || c == "g")
    })
}

fn is_profile_url(url: &str) -> bool {
    url.starts_with("http") && url.to_lowercase().contains("linkedin.com/in/")
}

fn canonical_profile(url: &str) -> String {
    url.to_lowercase()
        .trim_end_matches('/')
        .replace("://linkedin.com", "://www.linkedin.com")
}

/// Resolves search-engine redirect links (`/l/?uddg=…`, `/url?q=…`) to their target.
pub fn unwrap_redirect(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else if href.starts_with('/') {
        format!("https://redirect.invalid{}", href)
    } else {
        href.to_string()
    };
    let parsed = Url::parse(&absolute).ok()?;

    let is_redirect = parsed.path() == "/l/" || parsed.path() == "/url";
    if is_redirect {
        for (key, value) in parsed.query_pairs() {
            if key == "uddg" || key == "q" || key == "url" {
                return Some(value.into_owned());
            }
        }
    }
    if parsed.host_str() == Some("redirect.invalid") {
        return None;
    }
    Some(absolute)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_profile_in_duckduckgo_redirect() {
        let html = r#"<html><body>
            <div class="result"><a class="result__a"
               href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.linkedin.com%2Fin%2Fasmith&rut=abc">
               Alice Smith - Acme | LinkedIn</a></div>
        </body></html>"#;
        let ex = Extractor::new();
        let profiles = ex.extract_profiles(html);
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].url, "https://www.linkedin.com/in/asmith");
        assert_eq!(profiles[0].title.as_deref(), Some("Alice Smith - Acme | LinkedIn"));
        assert_eq!(
            ex.assess_search_page(html, "asmith@acme.com"),
            PageFinding::Profile {
                url: "https://www.linkedin.com/in/asmith".into(),
                title: Some("Alice Smith - Acme | LinkedIn".into()),
            }
        );
    }

    #[test]
    fn finds_profile_in_google_url_redirect_and_attributes() {
        let html = r#"<a href="/url?q=https://uk.linkedin.com/in/bob-jones&sa=U">Bob</a>
            <div data-href="https://www.linkedin.com/in/carol-x"></div>"#;
        let profiles = Extractor::new().extract_profiles(html);
        let urls: Vec<&str> = profiles.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["https://uk.linkedin.com/in/bob-jones", "https://www.linkedin.com/in/carol-x"]);
    }

    #[test]
    fn regex_fallback_on_raw_source() {
        let html = r#"<script>var u = "linkedin.com/in/dana-w";</script>"#;
        let profiles = Extractor::new().extract_profiles(html);
        assert_eq!(profiles[0].url, "https://www.linkedin.com/in/dana-w");
        assert_eq!(profiles[0].title, None);
    }

    #[test]
    fn assess_detects_block_mention_and_nothing() {
        let ex = Extractor::new();
        assert_eq!(
            ex.assess_search_page("<p>Our systems have detected unusual traffic</p>", "a@b.com"),
            PageFinding::Blocked
        );
        assert_eq!(
            ex.assess_search_page("<p>Contact: ASmith@Acme.com</p>", "asmith@acme.com"),
            PageFinding::Mentioned
        );
        assert_eq!(
            ex.assess_search_page("<p>No results.</p>", "asmith@acme.com"),
            PageFinding::Nothing
        );
    }

    #[test]
    fn unrelated_profile_is_not_a_match() {
        let html = r#"<div class="result"><a class="result__a"
            href="https://www.linkedin.com/in/john-doe">John Doe - Engineer - Globex | LinkedIn</a>
            <a class="result__snippet">Ten years at Globex.</a></div>"#;
        let ex = Extractor::new();
        assert_eq!(ex.extract_profiles(html).len(), 1);
        assert_eq!(ex.assess_search_page(html, "zz.qq@acme.com"), PageFinding::Nothing);
        // right company, wrong person
        assert_eq!(ex.assess_search_page(html, "jdoe@acme.com"), PageFinding::Nothing);
        // right person, wrong company
        assert_eq!(ex.assess_search_page(html, "jdoe@initech.com"), PageFinding::Nothing);
        assert!(matches!(
            ex.assess_search_page(html, "jdoe@globex.com"),
            PageFinding::Profile { .. }
        ));
    }

    #[test]
    fn address_in_snippet_ties_profile_to_it() {
        let hit = ProfileHit {
            url: "https://www.linkedin.com/in/xyz123".into(),
            title: Some("Sales Lead | LinkedIn".into()),
            context: "Sales Lead | LinkedIn reach me at ops@acme.com".into(),
        };
        assert!(profile_matches(&hit, "OPS@acme.com"));
        assert!(!profile_matches(&hit, "hr@acme.com"));
    }

    #[test]
    fn profile_slug_counts_as_a_name() {
        let hit = ProfileHit {
            url: "https://www.linkedin.com/in/alice-smith-4b2a1/".into(),
            title: Some("Head of Ops at Acme".into()),
            context: String::new(),
        };
        assert!(profile_matches(&hit, "alice.smith@acme.com"));
        assert!(!profile_matches(&hit, "bob@acme.com"));
    }

    #[test]
    fn ignores_image_names_that_look_like_emails() {
        let emails = Extractor::new().extract_emails("logo@2x.png and real@acme.com");
        assert!(emails.contains("real@acme.com"));
        assert_eq!(emails.len(), 1);
    }
}
