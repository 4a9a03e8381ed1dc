//! Sensitive-data detection and typed placeholder redaction

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Kinds of sensitive substrings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PiiKind {
    /// Social Security Number
    Ssn,
    /// Payment card number (Luhn-valid)
    CreditCard,
    /// Phone number
    Phone,
    /// Email address
    Email,
    /// API key, token or password assignment
    Credential,
    /// IPv4 address
    IpAddress,
}

impl PiiKind {
    /// Placeholder token substituted for a match
    pub fn placeholder(&self) -> &'static str {
        match self {
            PiiKind::Ssn => "[REDACTED_SSN]",
            PiiKind::CreditCard => "[REDACTED_CARD]",
            PiiKind::Phone => "[REDACTED_PHONE]",
            PiiKind::Email => "[REDACTED_EMAIL]",
            PiiKind::Credential => "[REDACTED_CREDENTIAL]",
            PiiKind::IpAddress => "[REDACTED_IP]",
        }
    }

    fn regex(&self) -> &'static Regex {
        match self {
            PiiKind::Ssn => &SSN,
            PiiKind::CreditCard => &CREDIT_CARD,
            PiiKind::Phone => &PHONE,
            PiiKind::Email => &EMAIL,
            PiiKind::Credential => &CREDENTIAL,
            PiiKind::IpAddress => &IP_V4,
        }
    }
}

impl fmt::Display for PiiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PiiKind::Ssn => write!(f, "SSN"),
            PiiKind::CreditCard => write!(f, "Credit Card"),
            PiiKind::Phone => write!(f, "Phone"),
            PiiKind::Email => write!(f, "Email"),
            PiiKind::Credential => write!(f, "Credential"),
            PiiKind::IpAddress => write!(f, "IP Address"),
        }
    }
}

// SSN: 123-45-6789 or 123456789
static SSN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}[-\s]?\d{2}[-\s]?\d{4}\b").expect("valid SSN regex"));

// 16 digits with optional separators, or 15-16 contiguous digits
static CREDIT_CARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{4}[-\s]?){3}\d{4}\b|\b\d{15,16}\b").expect("valid card regex")
});

static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\+?1[-.\s]?)?\(?[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}\b")
        .expect("valid phone regex")
});

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("valid email regex")
});

static CREDENTIAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:sk-[a-z0-9_-]{20,}|(?:api[_-]?key|secret|access[_-]?token|token|password|passwd)\s*[:=]\s*['"]?[^\s'"]{6,}['"]?)"#,
    )
    .expect("valid credential regex")
});

static IP_V4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b",
    )
    .expect("valid IPv4 regex")
});

/// A redaction made to content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redaction {
    pub kind: PiiKind,
    /// Hash of the original value, for audit correlation
    pub original_hash: String,
    pub replacement: String,
    /// Byte offsets in the scanned text
    pub start: usize,
    pub end: usize,
}

/// Detector for a fixed set of sensitive-data kinds
#[derive(Debug, Clone)]
pub struct PiiDetector {
    kinds: Vec<PiiKind>,
}

impl PiiDetector {
    /// Detector for the given kinds, checked in the given order
    pub fn new(kinds: &[PiiKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
        }
    }

    /// SSN, card, phone and email: what free-text inputs get scrubbed of
    pub fn for_input() -> Self {
        Self::new(&[
            PiiKind::Ssn,
            PiiKind::CreditCard,
            PiiKind::Phone,
            PiiKind::Email,
        ])
    }

    /// Input kinds plus credentials and IP addresses: what generated text gets scrubbed of
    pub fn for_output() -> Self {
        Self::new(&[
            PiiKind::Credential,
            PiiKind::Ssn,
            PiiKind::CreditCard,
            PiiKind::Phone,
            PiiKind::Email,
            PiiKind::IpAddress,
        ])
    }

    /// Detect all configured kinds, sorted by position with overlaps removed
    pub fn detect(&self, text: &str) -> Vec<Redaction> {
        let mut redactions = vec![];

        for kind in &self.kinds {
            for m in kind.regex().find_iter(text) {
                if *kind == PiiKind::CreditCard {
                    let digits: String =
                        m.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
                    if !luhn_check(&digits) {
                        continue;
                    }
                }
                redactions.push(Redaction {
                    kind: *kind,
                    original_hash: hash_value(m.as_str()),
                    replacement: kind.placeholder().to_string(),
                    start: m.start(),
                    end: m.end(),
                });
            }
        }

        // Earliest first; on a tie the longer match wins
        redactions.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
        remove_overlaps(&mut redactions);

        redactions
    }

    /// Apply redactions produced by [`detect`](Self::detect) on the same text
    pub fn redact(&self, text: &str, redactions: &[Redaction]) -> String {
        if redactions.is_empty() {
            return text.to_string();
        }

        let mut result = String::with_capacity(text.len());
        let mut last_end = 0;

        for redaction in redactions {
            if redaction.start > last_end {
                result.push_str(&text[last_end..redaction.start]);
            }
            result.push_str(&redaction.replacement);
            last_end = redaction.end;
        }

        if last_end < text.len() {
            result.push_str(&text[last_end..]);
        }

        result
    }

    /// Detect and redact in one step
    pub fn scrub(&self, text: &str) -> (String, Vec<Redaction>) {
        let redactions = self.detect(text);
        let scrubbed = self.redact(text, &redactions);
        (scrubbed, redactions)
    }
}

/// SHA-256 hex digest of a value. Used for audit correlation and cache keys
/// so the original never has to be kept.
pub(crate) fn hash_value(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

/// Luhn algorithm for card number validation
fn luhn_check(number: &str) -> bool {
    let digits: Vec<u32> = number.chars().filter_map(|c| c.to_digit(10)).collect();

    if digits.len() < 13 {
        return false;
    }

    let mut sum = 0;
    let mut double = false;

    for &digit in digits.iter().rev() {
        let mut d = digit;
        if double {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
        double = !double;
    }

    sum % 10 == 0
}

/// Remove overlapping redactions (keep the first one)
fn remove_overlaps(redactions: &mut Vec<Redaction>) {
    if redactions.len() < 2 {
        return;
    }

    let mut i = 0;
    while i < redactions.len() - 1 {
        if redactions[i].end > redactions[i + 1].start {
            redactions.remove(i + 1);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssn_detection() {
        let detector = PiiDetector::for_input();
        let redactions = detector.detect("My SSN is 123-45-6789 and yours is 987654321");

        assert_eq!(redactions.len(), 2);
        assert_eq!(redactions[0].kind, PiiKind::Ssn);
    }

    #[test]
    fn test_scrub_uses_typed_placeholders() {
        let detector = PiiDetector::for_input();
        let (text, redactions) =
            detector.scrub("Reach me at john.doe@example.com or 555-123-4567.");

        assert_eq!(redactions.len(), 2);
        assert!(text.contains("[REDACTED_EMAIL]"));
        assert!(text.contains("[REDACTED_PHONE]"));
        assert!(!text.contains("john.doe"));
    }

    #[test]
    fn test_card_requires_luhn() {
        let detector = PiiDetector::for_input();
        let (text, _) = detector.scrub("card 4532 0151 1283 0366 ok");
        assert_eq!(text, "card [REDACTED_CARD] ok");

        let redactions = detector.detect("order 1234567890123456");
        assert!(redactions.iter().all(|r| r.kind != PiiKind::CreditCard));
    }

    #[test]
    fn test_credential_only_in_output_detector() {
        let text = "use api_key=abcdef1234567890XYZ to log in";
        assert!(PiiDetector::for_input().detect(text).is_empty());

        let (scrubbed, redactions) = PiiDetector::for_output().scrub(text);
        assert_eq!(redactions[0].kind, PiiKind::Credential);
        assert!(scrubbed.contains("[REDACTED_CREDENTIAL]"));
    }

    #[test]
    fn test_ip_address_only_in_output_detector() {
        let text = "the server at 203.0.113.9 answered";
        assert!(PiiDetector::for_input().detect(text).is_empty());

        let (scrubbed, redactions) = PiiDetector::for_output().scrub(text);
        assert_eq!(redactions.len(), 1);
        assert_eq!(redactions[0].kind, PiiKind::IpAddress);
        assert_eq!(scrubbed, "the server at [REDACTED_IP] answered");
    }

    #[test]
    fn test_scrub_is_stable() {
        let detector = PiiDetector::for_input();
        let (once, _) = detector.scrub("SSN 123-45-6789");
        let (twice, redactions) = detector.scrub(&once);
        assert_eq!(once, twice);
        assert!(redactions.is_empty());
    }

    #[test]
    fn test_hash_value_is_sha256() {
        assert_eq!(
            hash_value("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hash_value("faith").len(), 64);
        assert_ne!(hash_value("faith"), hash_value("Faith"));
    }

    #[test]
    fn test_credit_card_luhn() {
        assert!(luhn_check("4532015112830366"));
        assert!(!luhn_check("1234567890123456"));
    }
}
