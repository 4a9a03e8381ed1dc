//! Input sanitization
//!
//! Every user-supplied field goes through [`Sanitizer::sanitize`] before it
//! reaches a detector or the generation endpoint. The pipeline is:
//!
//! 1. decode the entities this module itself produces, then trim
//! 2. truncate to the field type's maximum length (warning only)
//! 3. remove dangerous constructs, repeating until nothing else matches
//! 4. optionally redact sensitive substrings with typed placeholders
//! 5. fold or normalize line breaks
//! 6. structural checks for email and URL fields (hard errors)
//! 7. HTML-escape, or strip tags outside the rich-text allow-list
//!
//! Step 1 makes the whole pipeline idempotent: sanitizing a sanitized value
//! yields the same value and fires no removal class.

use crate::config::SanitizerConfig;
use crate::pii::PiiDetector;
use crate::types::{FieldType, SanitizationResult, SanitizeOptions};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

/// Upper bound on removal passes; nested payloads rarely need more than two
const MAX_REMOVAL_PASSES: usize = 8;

/// Tags kept when rich text is allowed
const ALLOWED_TAGS: &[&str] = &[
    "p", "br", "b", "strong", "i", "em", "u", "ul", "ol", "li", "blockquote", "h1", "h2", "h3",
    "h4", "h5", "h6",
];

/// A class of dangerous construct removed from input
struct RemovalClass {
    description: &'static str,
    regex: Regex,
    /// Matches for which this returns true are left in place
    keep: Option<fn(&str) -> bool>,
}

impl RemovalClass {
    fn new(description: &'static str, pattern: &str) -> Self {
        Self {
            description,
            regex: Regex::new(pattern).expect("valid removal regex"),
            keep: None,
        }
    }

    fn keeping(mut self, keep: fn(&str) -> bool) -> Self {
        self.keep = Some(keep);
        self
    }

    /// Remove every match; `None` when the text is unchanged
    fn apply(&self, text: &str) -> Option<String> {
        if !self.regex.is_match(text) {
            return None;
        }
        let keep = self.keep;
        let out = self.regex.replace_all(text, |caps: &Captures| {
            let m = &caps[0];
            match keep {
                Some(keep) if keep(m) => m.to_string(),
                _ => String::new(),
            }
        });
        if out == text {
            None
        } else {
            Some(out.into_owned())
        }
    }
}

fn is_image_data_uri(m: &str) -> bool {
    let compact: String = m.chars().filter(|c| !c.is_whitespace()).collect();
    compact.to_ascii_lowercase().starts_with("data:image/")
}

static REMOVAL_CLASSES: Lazy<Vec<RemovalClass>> = Lazy::new(|| {
    vec![
        RemovalClass::new(
            "dangerous HTML element",
            r"(?is)<\s*(?:script|iframe|object|embed|style)\b[^>]*>.*?<\s*/\s*(?:script|iframe|object|embed|style)\s*>|<\s*/?\s*(?:script|iframe|object|embed|link|meta|style|base|frame|frameset|applet)\b[^>]*>",
        ),
        RemovalClass::new(
            "dangerous protocol",
            r"(?i)\b(?:javascript|vbscript|livescript)\s*:",
        ),
        RemovalClass::new(
            "non-image data URI",
            r"(?i)\bdata\s*:\s*[a-z]+/[a-z0-9.+-]+",
        )
        .keeping(is_image_data_uri),
        RemovalClass::new(
            "inline event handler",
            r#"(?i)\bon[a-z]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]*)"#,
        ),
        RemovalClass::new(
            "SQL keyword sequence",
            r"(?i)\b(?:union\s+(?:all\s+)?select|insert\s+into|delete\s+from|drop\s+(?:table|database)|truncate\s+table|alter\s+table|exec(?:ute)?\s+xp_\w+|or\s+1\s*=\s*1)\b|;\s*--|/\*|\*/",
        ),
        RemovalClass::new(
            "shell metacharacters",
            r"`|\$\(|\$\{|&&|\|\||\||;\s*(?:rm|curl|wget|sh|bash|nc|chmod|chown|sudo)\b",
        ),
        RemovalClass::new(
            "path traversal",
            r"(?i)(?:\.\.[/\\])+|(?:%2e%2e(?:%2f|%5c))+",
        ),
        RemovalClass::new("null byte", r"(?i)\x00|%00"),
    ]
});

static ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(?:amp|lt|gt|quot|#x27|#39|#x2[fF]|#47);").expect("valid entity regex")
});

static ANY_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<\s*(/?)\s*([a-zA-Z][a-zA-Z0-9]*)\b[^>]*>").expect("valid tag regex")
});

static LINE_BREAKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]*[\r\n]+[ \t]*").expect("valid newline regex"));

static EXCESS_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank line regex"));

static EMAIL_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+'-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$")
        .expect("valid email shape regex")
});

/// Decode the HTML entities produced by [`escape_html`]
pub fn decode_entities(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures| {
            match &caps[0] {
                "&amp;" => "&",
                "&lt;" => "<",
                "&gt;" => ">",
                "&quot;" => "\"",
                "&#x27;" | "&#39;" => "'",
                _ => "/",
            }
            .to_string()
        })
        .into_owned()
}

/// Escape the five HTML-significant characters
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Field sanitizer
#[derive(Debug, Clone)]
pub struct Sanitizer {
    config: SanitizerConfig,
    pii: PiiDetector,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(SanitizerConfig::default())
    }
}

impl Sanitizer {
    pub fn new(config: SanitizerConfig) -> Self {
        Self {
            config,
            pii: PiiDetector::for_input(),
        }
    }

    /// Sanitize with the field type's default options
    pub fn sanitize(&self, raw: &str, field_type: FieldType) -> SanitizationResult {
        self.sanitize_with(raw, field_type, field_type.default_options())
    }

    /// Sanitize a JSON request value. Anything that is not a string sanitizes to empty.
    pub fn sanitize_value(
        &self,
        value: &serde_json::Value,
        field_type: FieldType,
    ) -> SanitizationResult {
        match value.as_str() {
            Some(raw) => self.sanitize(raw, field_type),
            None => SanitizationResult::empty(),
        }
    }

    pub fn sanitize_with(
        &self,
        raw: &str,
        field_type: FieldType,
        options: SanitizeOptions,
    ) -> SanitizationResult {
        let mut result = SanitizationResult::empty();
        result.original_value = raw.to_string();

        if raw.trim().is_empty() {
            return result;
        }

        let confidential = field_type == FieldType::Password;
        let decoded = decode_entities(raw);
        let mut text = decoded.trim().to_string();

        let max = self.config.max_length(field_type);
        if text.chars().count() > max {
            text = text.chars().take(max).collect();
            result
                .warnings
                .push(format!("Input truncated to {} characters", max));
        }

        let mut fired: Vec<&'static str> = vec![];
        for _ in 0..MAX_REMOVAL_PASSES {
            let mut changed = false;
            for class in REMOVAL_CLASSES.iter() {
                if let Some(next) = class.apply(&text) {
                    text = next;
                    changed = true;
                    if !fired.contains(&class.description) {
                        fired.push(class.description);
                    }
                }
            }
            if !changed {
                break;
            }
        }

        if !confidential && !fired.is_empty() {
            debug!(field = %field_type, classes = ?fired, "Removed dangerous input patterns");
            result
                .removed_patterns
                .extend(fired.iter().map(|d| d.to_string()));
        }

        if options.remove_sensitive_info && !confidential {
            let (scrubbed, redactions) = self.pii.scrub(&text);
            if !redactions.is_empty() {
                text = scrubbed;
                let mut kinds: Vec<String> = vec![];
                for r in &redactions {
                    let label = format!("sensitive information ({})", r.kind);
                    if !kinds.contains(&label) {
                        kinds.push(label);
                    }
                }
                debug!(field = %field_type, count = redactions.len(), "Redacted sensitive information");
                result.removed_patterns.extend(kinds);
            }
        }

        text = if options.preserve_newlines {
            let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
            EXCESS_BLANK_LINES
                .replace_all(&normalized, "\n\n")
                .into_owned()
        } else {
            LINE_BREAKS.replace_all(&text, " ").into_owned()
        };
        let text = text.trim().to_string();

        match field_type {
            FieldType::Email if !EMAIL_SHAPE.is_match(&text) => {
                result.errors.push("Invalid email address".to_string());
            }
            FieldType::Url if !is_web_url(&text) => {
                result
                    .errors
                    .push("Invalid URL: must be an absolute http(s) address".to_string());
            }
            _ => {}
        }

        result.sanitized_value = if options.allow_html {
            let (kept, stripped) = strip_disallowed_tags(&text);
            if stripped && !confidential {
                result.removed_patterns.push("disallowed HTML tag".to_string());
            }
            kept
        } else {
            escape_html(&text)
        };

        if result.sanitized_value.is_empty() {
            result
                .warnings
                .push("Input was empty after sanitization".to_string());
        }

        result.success = result.errors.is_empty();
        result
    }
}

fn is_web_url(text: &str) -> bool {
    match url::Url::parse(text) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
        }
        Err(_) => false,
    }
}

/// Drop tags outside [`ALLOWED_TAGS`] and attributes on allowed ones.
/// Returns the new text and whether any disallowed tag was dropped.
fn strip_disallowed_tags(text: &str) -> (String, bool) {
    let mut stripped = false;
    let out = ANY_TAG.replace_all(text, |caps: &Captures| {
        let closing = &caps[1];
        let tag = caps[2].to_ascii_lowercase();
        if ALLOWED_TAGS.contains(&tag.as_str()) {
            format!("<{}{}>", closing, tag)
        } else {
            stripped = true;
            String::new()
        }
    });
    (out.into_owned(), stripped)
}
