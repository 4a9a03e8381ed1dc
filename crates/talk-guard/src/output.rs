//! Validation of generated text
//!
//! Generated talks are re-sanitized, checked for links outside the domain
//! allow-list, scrubbed of sensitive data and screened for harm vocabulary.
//! A word count far from the requested speaking time is only a warning.

use crate::config::{OutputConfig, SanitizerConfig};
use crate::content::harm_table;
use crate::error::Result;
use crate::pii::{PiiDetector, Redaction};
use crate::policy::ContentPolicyFilter;
use crate::rules::{extract_hosts, host_allowed, RuleTable};
use crate::sanitizer::{decode_entities, Sanitizer};
use crate::types::{FieldType, SanitizeOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sanitization applied to generated text: light formatting survives
const OUTPUT_OPTIONS: SanitizeOptions = SanitizeOptions {
    allow_html: true,
    preserve_newlines: true,
    remove_sensitive_info: false,
};

/// Result of validating one generated text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Sanitized and redacted text
    pub text: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub redactions: Vec<Redaction>,
    pub word_count: usize,
    /// Hosts that failed the allow-list
    pub rejected_hosts: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct OutputValidator {
    config: OutputConfig,
    sanitizer: Sanitizer,
    policy: Arc<ContentPolicyFilter>,
    pii: PiiDetector,
    harm: RuleTable,
}

impl OutputValidator {
    pub fn new(config: OutputConfig, policy: Arc<ContentPolicyFilter>) -> Result<Self> {
        let sanitizer = Sanitizer::new(SanitizerConfig {
            story_max: config.max_output_chars,
            ..SanitizerConfig::default()
        });
        Ok(Self {
            config,
            sanitizer,
            policy,
            pii: PiiDetector::for_output(),
            harm: harm_table()?,
        })
    }

    /// Words expected for a talk of the given length
    pub fn expected_words(&self, duration_minutes: u32) -> usize {
        duration_minutes as usize * self.config.words_per_minute as usize
    }

    pub fn validate(&self, text: &str, duration_minutes: Option<u32>) -> ValidationReport {
        let sanitized = self
            .sanitizer
            .sanitize_with(text, FieldType::Story, OUTPUT_OPTIONS);

        let mut report = ValidationReport {
            warnings: sanitized.warnings,
            errors: sanitized.errors,
            ..Default::default()
        };
        if !sanitized.removed_patterns.is_empty() {
            warn!(removed = ?sanitized.removed_patterns, "Dangerous constructs removed from generated text");
            report.warnings.extend(
                sanitized
                    .removed_patterns
                    .iter()
                    .map(|p| format!("Removed from generated text: {}", p)),
            );
        }
        let plain = decode_entities(&sanitized.sanitized_value);

        for host in extract_hosts(&plain) {
            if !host_allowed(&host, &self.config.allowed_domains) {
                report
                    .errors
                    .push(format!("Link to non-approved domain: {}", host));
                report.rejected_hosts.push(host);
            }
        }

        report.warnings.extend(self.policy.inappropriate_warnings(&plain));

        let harm = self.harm.scan(&plain);
        if !harm.is_empty() {
            let mut categories: Vec<&str> = harm.iter().map(|m| m.category).collect();
            categories.dedup();
            warn!(categories = ?categories, "Harmful vocabulary in generated text");
            report.errors.push(format!(
                "Generated text contains prohibited content ({})",
                categories.join(", ")
            ));
        }

        let (redacted, redactions) = self.pii.scrub(&sanitized.sanitized_value);
        if !redactions.is_empty() {
            debug!(count = redactions.len(), "Redacted sensitive data from generated text");
        }
        report.text = redacted;
        report.redactions = redactions;
        report.word_count = report.text.split_whitespace().count();

        if let Some(minutes) = duration_minutes.filter(|m| *m > 0) {
            if let Some(warning) = self.length_warning(report.word_count, minutes) {
                report.warnings.push(warning);
            }
        }

        report
    }

    fn length_warning(&self, word_count: usize, minutes: u32) -> Option<String> {
        let expected = self.expected_words(minutes);
        if expected == 0 {
            return None;
        }
        let deviation = (word_count as f64 - expected as f64).abs() / expected as f64;
        (deviation > self.config.length_tolerance as f64).then(|| {
            format!(
                "Talk has {} words; about {} expected for {} minute(s)",
                word_count, expected, minutes
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;

    fn validator() -> OutputValidator {
        let config = OutputConfig::default();
        let policy = ContentPolicyFilter::new(&PolicyConfig::default(), &config.allowed_domains)
            .unwrap();
        OutputValidator::new(config, Arc::new(policy)).unwrap()
    }

    #[test]
    fn test_domain_allow_list() {
        let v = validator();
        let report = v.validate("Read more at https://example.com/x today.", None);
        assert!(!report.is_valid());
        assert_eq!(report.rejected_hosts, vec!["example.com"]);

        let report = v.validate(
            "Read more at https://www.churchofjesuschrist.org/study/scriptures today.",
            None,
        );
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn test_pii_redacted() {
        let report = validator().validate(
            "Call Brother Smith at 555-123-4567 or write to smith@example.org.",
            None,
        );
        assert!(report.is_valid());
        assert!(report.text.contains("[REDACTED_PHONE]"));
        assert!(report.text.contains("[REDACTED_EMAIL]"));
        assert!(!report.text.contains("555-123-4567"));
        assert_eq!(report.redactions.len(), 2);
    }

    #[test]
    fn test_credentials_redacted() {
        let report = validator().validate("api_key=sk-abcdefghijklmnopqrstuvwx", None);
        assert!(report.text.contains("[REDACTED_CREDENTIAL]"));
    }

    #[test]
    fn test_harm_is_error_inappropriate_is_warning() {
        let v = validator();
        let report = v.validate("Some people feel they should end their life.", None);
        assert!(!report.is_valid());

        let report = v.validate("Avoid gambling; choose faith instead.", None);
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("inappropriate")));
    }

    #[test]
    fn test_word_count_tolerance() {
        let v = validator();
        assert_eq!(v.expected_words(5), 550);

        let short = "faith ".repeat(100);
        let report = v.validate(&short, Some(5));
        assert!(report.is_valid());
        assert_eq!(report.word_count, 100);
        assert!(report.warnings.iter().any(|w| w.contains("550")));

        let right = "faith ".repeat(520);
        let report = v.validate(&right, Some(5));
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_script_removed_from_output() {
        let report = validator().validate("<p>Hope</p><script>alert(1)</script>", None);
        assert_eq!(report.text, "<p>Hope</p>");
        assert!(!report.warnings.is_empty());
    }
}
