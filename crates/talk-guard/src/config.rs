//! Configuration for Talk Guard

use crate::error::{GuardError, Result};
use crate::types::{FieldType, Severity};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable overriding the generation API key
pub const ENV_API_KEY: &str = "TALK_GUARD_API_KEY";
/// Environment variable overriding the generation endpoint
pub const ENV_ENDPOINT: &str = "TALK_GUARD_ENDPOINT";
/// Environment variable overriding the model name
pub const ENV_MODEL: &str = "TALK_GUARD_MODEL";

/// Longest accepted tier window, block or merge window: ten years
pub const MAX_WINDOW_MINUTES: i64 = 10 * 365 * 24 * 60;
/// Longest accepted retention period: ten years
pub const MAX_RETENTION_DAYS: i64 = 10 * 365;

/// Main configuration for Guard
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    /// Input sanitization
    pub sanitizer: SanitizerConfig,
    /// Content policy detectors
    pub policy: PolicyConfig,
    /// Violation-based rate limiting
    pub rate_limit: RateLimitConfig,
    /// Per-identity request throttle
    pub throttle: ThrottleConfig,
    /// Violation record retention
    pub retention: RetentionConfig,
    /// Generation endpoint client
    pub generation: GenerationConfig,
    /// Output validation
    pub output: OutputConfig,
    /// In-process caches
    pub cache: CacheConfig,
    /// Audit logging
    pub audit: AuditConfig,
}

impl GuardConfig {
    /// Parse a TOML document. Missing sections keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Apply `TALK_GUARD_*` environment overrides
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            if !key.trim().is_empty() {
                self.generation.api_key = Some(key);
            }
        }
        if let Ok(endpoint) = std::env::var(ENV_ENDPOINT) {
            if !endpoint.trim().is_empty() {
                self.generation.api_endpoint = endpoint;
            }
        }
        if let Ok(model) = std::env::var(ENV_MODEL) {
            if !model.trim().is_empty() {
                self.generation.model = model;
            }
        }
        self
    }

    /// Reject settings that would disable a safety stage by accident
    pub fn validate(&self) -> Result<()> {
        for severity in Severity::ALL {
            let tier = self.rate_limit.tiers.get(severity);
            if tier.max_violations == 0 {
                return Err(GuardError::Config(format!(
                    "rate_limit.tiers.{}.max_violations must be at least 1",
                    severity
                )));
            }
            if !(1..=MAX_WINDOW_MINUTES).contains(&tier.window_minutes)
                || !(1..=MAX_WINDOW_MINUTES).contains(&tier.block_minutes)
            {
                return Err(GuardError::Config(format!(
                    "rate_limit.tiers.{} window and block must be between 1 and {} minutes",
                    severity, MAX_WINDOW_MINUTES
                )));
            }
        }
        if !(1..=MAX_WINDOW_MINUTES).contains(&self.rate_limit.merge_window_minutes) {
            return Err(GuardError::Config(format!(
                "rate_limit.merge_window_minutes must be between 1 and {}",
                MAX_WINDOW_MINUTES
            )));
        }
        for (name, value) in [
            ("low_medium_days", self.retention.low_medium_days),
            ("high_critical_days", self.retention.high_critical_days),
        ] {
            if !(1..=MAX_RETENTION_DAYS).contains(&value) {
                return Err(GuardError::Config(format!(
                    "retention.{} must be between 1 and {}",
                    name, MAX_RETENTION_DAYS
                )));
            }
        }
        if self.output.allowed_domains.is_empty() {
            return Err(GuardError::Config(
                "output.allowed_domains must not be empty".to_string(),
            ));
        }
        if self.output.words_per_minute == 0 {
            return Err(GuardError::Config(
                "output.words_per_minute must be positive".to_string(),
            ));
        }
        if self.generation.max_retries == 0 {
            return Err(GuardError::Config(
                "generation.max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Maximum accepted length (in characters) for each field type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    pub email_max: usize,
    pub password_max: usize,
    pub name_max: usize,
    pub topic_max: usize,
    pub story_max: usize,
    pub url_max: usize,
    pub general_max: usize,
}

impl SanitizerConfig {
    pub fn max_length(&self, field_type: FieldType) -> usize {
        match field_type {
            FieldType::Email => self.email_max,
            FieldType::Password => self.password_max,
            FieldType::Name => self.name_max,
            FieldType::Topic => self.topic_max,
            FieldType::Story => self.story_max,
            FieldType::Url => self.url_max,
            FieldType::General => self.general_max,
        }
    }
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            email_max: 254,
            password_max: 128,
            name_max: 100,
            topic_max: 200,
            story_max: 10_000,
            url_max: 2048,
            general_max: 2000,
        }
    }
}

/// Content policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Run the manipulation-attempt detector
    pub detect_manipulation: bool,
    /// Run the inappropriate-content detector
    pub detect_inappropriate: bool,
    /// Run the spam detector
    pub detect_spam: bool,
    /// Extra manipulation phrases (plain text, case-insensitive)
    pub custom_manipulation_phrases: Vec<String>,
    /// Keywords that mark a request as on-topic
    pub topical_keywords: Vec<String>,
    /// Spam heuristics
    pub spam: SpamConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            detect_manipulation: true,
            detect_inappropriate: true,
            detect_spam: true,
            custom_manipulation_phrases: vec![],
            topical_keywords: [
                "faith", "god", "jesus", "christ", "gospel", "scripture", "prayer", "pray",
                "church", "hope", "charity", "love", "family", "service", "testimony",
                "repentance", "forgiveness", "grace", "spirit", "temple", "covenant",
                "gratitude", "kindness", "ministering", "savior", "atonement", "baptism",
                "sacrament", "discipleship", "humility", "obedience", "prophet",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            spam: SpamConfig::default(),
        }
    }
}

/// Spam heuristic thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamConfig {
    /// Same word repeated back to back this many times
    pub max_word_repeats: usize,
    /// Same character repeated this many times
    pub max_char_run: usize,
    /// Run of `!`/`?`/`.` punctuation at least this long
    pub punctuation_run: usize,
    /// Uppercase share of letters above which text counts as shouting
    pub max_caps_ratio: f32,
    /// Minimum letters before the caps ratio is considered
    pub caps_min_letters: usize,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            max_word_repeats: 4,
            max_char_run: 10,
            punctuation_run: 4,
            max_caps_ratio: 0.7,
            caps_min_letters: 20,
        }
    }
}

/// One severity tier: `max_violations` within `window_minutes` blocks for `block_minutes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub max_violations: u32,
    pub window_minutes: i64,
    pub block_minutes: i64,
}

impl TierConfig {
    pub const fn new(max_violations: u32, window_minutes: i64, block_minutes: i64) -> Self {
        Self {
            max_violations,
            window_minutes,
            block_minutes,
        }
    }
}

/// Tier table, configured independently per severity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub low: TierConfig,
    pub medium: TierConfig,
    pub high: TierConfig,
    pub critical: TierConfig,
}

impl TierTable {
    pub fn get(&self, severity: Severity) -> TierConfig {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            low: TierConfig::new(10, 60, 15),
            medium: TierConfig::new(5, 30, 60),
            high: TierConfig::new(3, 15, 240),
            critical: TierConfig::new(1, 5, 1440),
        }
    }
}

/// Violation-based rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    pub tiers: TierTable,
    /// Identical violations inside this window merge into one record
    pub merge_window_minutes: i64,
    /// How long a computed decision is reused
    pub decision_cache_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tiers: TierTable::default(),
            merge_window_minutes: 5,
            decision_cache_secs: 30,
        }
    }
}

/// Request throttle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Enable request throttling
    pub enabled: bool,
    /// Requests per minute per identity
    pub requests_per_minute: u32,
    /// Burst allowance
    pub burst_size: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 30,
            burst_size: 10,
        }
    }
}

/// How long violation records are kept
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Low and medium severity records
    pub low_medium_days: i64,
    /// High and critical severity records
    pub high_critical_days: i64,
}

impl RetentionConfig {
    pub fn days_for(&self, severity: Severity) -> i64 {
        match severity {
            Severity::Low | Severity::Medium => self.low_medium_days,
            Severity::High | Severity::Critical => self.high_critical_days,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            low_medium_days: 90,
            high_critical_days: 365,
        }
    }
}

/// Generation endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// OpenAI-compatible chat completions URL
    pub api_endpoint: String,
    /// Bearer token
    pub api_key: Option<String>,
    pub model: String,
    /// Total attempts per request
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Total message characters accepted before any network call
    pub max_prompt_chars: usize,
    pub timeout_secs: u64,
    pub default_max_tokens: u32,
    pub default_temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_cap_ms: 10_000,
            max_prompt_chars: 100_000,
            timeout_secs: 60,
            default_max_tokens: 2000,
            default_temperature: 0.7,
        }
    }
}

/// Output validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Hostnames allowed in generated links (exact or parent-domain match)
    pub allowed_domains: Vec<String>,
    /// Speaking rate used to derive the expected word count
    pub words_per_minute: u32,
    /// Allowed relative deviation from the expected word count
    pub length_tolerance: f32,
    /// Generated text beyond this many characters is truncated
    pub max_output_chars: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            allowed_domains: vec![
                "churchofjesuschrist.org".to_string(),
                "lds.org".to_string(),
                "biblegateway.com".to_string(),
                "bible.com".to_string(),
            ],
            words_per_minute: 110,
            length_tolerance: 0.25,
            max_output_chars: 50_000,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default TTL of the sanitization-result namespace
    pub sanitization_ttl_secs: u64,
    /// Interval of the background sweep
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sanitization_ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

/// Audit logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Enable audit logging
    pub enabled: bool,
    /// Log content excerpts (vs. just hashes)
    pub log_content: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_content: false, // Privacy by default
        }
    }
}
