//! Data-driven detection rules
//!
//! A detector is a [`RuleTable`]: a list of `{pattern, severity, category}`
//! rows scanned by one generic function. Rows are either case-insensitive
//! regexes or heuristic functions for checks a regex cannot express.

use crate::error::{GuardError, Result};
use crate::sanitizer::decode_entities;
use crate::types::{Identity, Severity, Violation, ViolationType};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Heuristic check: returns a short description of what it found
pub type Heuristic = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

enum Matcher {
    Pattern(Regex),
    Heuristic(Heuristic),
}

/// One row of a rule table
pub struct Rule {
    /// Identifies the rule; recorded as the violation's detected pattern
    pub pattern: String,
    pub severity: Severity,
    pub category: &'static str,
    matcher: Matcher,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("pattern", &self.pattern)
            .field("severity", &self.severity)
            .field("category", &self.category)
            .finish()
    }
}

impl Rule {
    /// Case-insensitive regex rule
    pub fn regex(pattern: &str, severity: Severity, category: &'static str) -> Result<Self> {
        let compiled = Regex::new(&format!("(?i){}", pattern))
            .map_err(|e| GuardError::Config(format!("invalid rule pattern {:?}: {}", pattern, e)))?;
        Ok(Self {
            pattern: pattern.to_string(),
            severity,
            category,
            matcher: Matcher::Pattern(compiled),
        })
    }

    /// Whole-phrase rule; the phrase is matched literally with flexible whitespace
    pub fn phrase(phrase: &str, severity: Severity, category: &'static str) -> Result<Self> {
        let words: Vec<String> = phrase.split_whitespace().map(regex::escape).collect();
        if words.is_empty() {
            return Err(GuardError::Config("empty rule phrase".to_string()));
        }
        let pattern = format!(r"\b{}\b", words.join(r"\s+"));
        let compiled = Regex::new(&format!("(?i){}", pattern))
            .map_err(|e| GuardError::Config(format!("invalid rule phrase {:?}: {}", phrase, e)))?;
        Ok(Self {
            pattern: phrase.to_lowercase(),
            severity,
            category,
            matcher: Matcher::Pattern(compiled),
        })
    }

    /// Rule backed by a function
    pub fn heuristic(
        name: &str,
        severity: Severity,
        category: &'static str,
        check: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            pattern: name.to_string(),
            severity,
            category,
            matcher: Matcher::Heuristic(Box::new(check)),
        }
    }

    fn find(&self, text: &str) -> Option<(usize, String)> {
        match &self.matcher {
            Matcher::Pattern(re) => re.find(text).map(|m| (m.start(), m.as_str().to_string())),
            Matcher::Heuristic(check) => check(text).map(|found| (0, found)),
        }
    }
}

/// A rule that fired
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub pattern: String,
    pub severity: Severity,
    pub category: &'static str,
    /// Matched text (or heuristic finding); for logs only
    pub matched: String,
    pub position: usize,
}

/// A detector: rules of one violation type
#[derive(Debug)]
pub struct RuleTable {
    name: &'static str,
    violation_type: ViolationType,
    rules: Vec<Rule>,
}

impl RuleTable {
    pub fn new(name: &'static str, violation_type: ViolationType, rules: Vec<Rule>) -> Self {
        Self {
            name,
            violation_type,
            rules,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn violation_type(&self) -> ViolationType {
        self.violation_type
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Scan text against every rule, in table order. Each rule fires at most once.
    pub fn scan(&self, text: &str) -> Vec<RuleMatch> {
        if text.trim().is_empty() {
            return vec![];
        }
        let view = scan_view(text);

        self.rules
            .iter()
            .filter_map(|rule| {
                rule.find(&view).map(|(position, matched)| RuleMatch {
                    pattern: rule.pattern.clone(),
                    severity: rule.severity,
                    category: rule.category,
                    matched,
                    position,
                })
            })
            .collect()
    }

    /// Collapse the matches of one scan into a single violation.
    ///
    /// The first matching rule (table order is priority order) names the
    /// pattern; severity is the highest among the matches.
    pub fn to_violation(
        &self,
        matches: &[RuleMatch],
        identity: Option<&Identity>,
        now: DateTime<Utc>,
    ) -> Option<Violation> {
        let first = matches.first()?;
        let severity = matches
            .iter()
            .map(|m| m.severity)
            .max()
            .unwrap_or(first.severity);

        let mut categories: Vec<&str> = vec![];
        for m in matches {
            if !categories.contains(&m.category) {
                categories.push(m.category);
            }
        }

        Some(Violation {
            violation_type: self.violation_type,
            severity,
            description: format!(
                "{} detector matched {} rule(s): {}",
                self.name,
                matches.len(),
                categories.join(", ")
            ),
            detected_pattern: first.pattern.clone(),
            timestamp: now,
            identity: identity.cloned(),
        })
    }

    /// Scan and collapse in one step
    pub fn detect(
        &self,
        text: &str,
        identity: Option<&Identity>,
        now: DateTime<Utc>,
    ) -> Option<Violation> {
        let matches = self.scan(text);
        self.to_violation(&matches, identity, now)
    }
}

static WHITESPACE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+").expect("valid whitespace regex"));

/// Text as detectors see it: entities decoded, runs of spaces collapsed
fn scan_view(text: &str) -> String {
    WHITESPACE_RUN
        .replace_all(&decode_entities(text), " ")
        .into_owned()
}

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bhttps?://[^\s<>"'\)\]]+"#).expect("valid url regex"));

static BARE_DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bwww\.[a-z0-9-]+(?:\.[a-z0-9-]+)+\b").expect("valid domain regex")
});

/// Absolute http(s) URLs found in text, trailing punctuation trimmed
pub fn extract_urls(text: &str) -> Vec<String> {
    URL.find_iter(text)
        .map(|m| {
            m.as_str()
                .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'))
                .to_string()
        })
        .collect()
}

/// Hostnames of every link in text, including bare `www.` domains
pub fn extract_hosts(text: &str) -> Vec<String> {
    let mut hosts: Vec<String> = extract_urls(text)
        .iter()
        .filter_map(|u| url::Url::parse(u).ok())
        .filter_map(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .collect();

    for m in BARE_DOMAIN.find_iter(text) {
        let host = m.as_str().to_ascii_lowercase();
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    hosts
}

/// Exact or parent-domain match against an allow-list
pub fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    allowed.iter().any(|domain| {
        let domain = domain.trim_start_matches('.').to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{}", domain))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RuleTable {
        RuleTable::new(
            "test",
            ViolationType::PolicyViolation,
            vec![
                Rule::phrase("bad   word", Severity::Medium, "vocabulary").unwrap(),
                Rule::regex(r"\bworse\b", Severity::High, "vocabulary").unwrap(),
                Rule::heuristic("long_text", Severity::Low, "shape", |t| {
                    (t.len() > 40).then(|| format!("{} chars", t.len()))
                }),
            ],
        )
    }

    #[test]
    fn test_scan_is_table_driven() {
        let matches = table().scan("a BAD word and a worse one");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].pattern, "bad word");
        assert_eq!(matches[1].severity, Severity::High);
    }

    #[test]
    fn test_scan_empty_is_quiet() {
        assert!(table().scan("").is_empty());
        assert!(table().scan("   ").is_empty());
    }

    #[test]
    fn test_scan_sees_decoded_entities() {
        let t = RuleTable::new(
            "quote",
            ViolationType::Spam,
            vec![Rule::phrase("don't", Severity::Low, "x").unwrap()],
        );
        assert_eq!(t.scan("I don&#x27;t know").len(), 1);
    }

    #[test]
    fn test_violation_collapses_matches() {
        let now = Utc::now();
        let identity = Identity::User("u1".to_string());
        let t = table();
        let v = t
            .detect("bad word, worse, and quite a lot of padding text", Some(&identity), now)
            .unwrap();

        assert_eq!(v.severity, Severity::High);
        assert_eq!(v.detected_pattern, "bad word");
        assert_eq!(v.identity, Some(identity));
        assert!(t.detect("fine", None, now).is_none());
    }

    #[test]
    fn test_deterministic() {
        let t = table();
        let text = "bad word then worse";
        assert_eq!(t.scan(text), t.scan(text));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        assert!(matches!(
            Rule::regex("(unclosed", Severity::Low, "x"),
            Err(GuardError::Config(_))
        ));
        assert!(Rule::phrase("   ", Severity::Low, "x").is_err());
    }

    #[test]
    fn test_host_allow_list() {
        let allowed = vec!["churchofjesuschrist.org".to_string()];
        assert!(host_allowed("churchofjesuschrist.org", &allowed));
        assert!(host_allowed("www.churchofjesuschrist.org", &allowed));
        assert!(!host_allowed("evilchurchofjesuschrist.org", &allowed));
        assert!(!host_allowed("example.com", &allowed));
    }

    #[test]
    fn test_extract_urls() {
        let urls = extract_urls("See https://example.com/x. Also http://a.org/b?c=1, done");
        assert_eq!(urls, vec!["https://example.com/x", "http://a.org/b?c=1"]);

        let hosts = extract_hosts("visit www.spam.biz or https://Example.com/x");
        assert_eq!(hosts, vec!["example.com", "www.spam.biz"]);
    }
}
