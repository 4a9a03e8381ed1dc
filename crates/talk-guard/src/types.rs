//! Core types for Talk Guard

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Declared type of a user-supplied field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Email,
    Password,
    Name,
    Topic,
    Story,
    Url,
    General,
}

impl FieldType {
    /// Options applied when the caller does not pass any
    pub fn default_options(&self) -> SanitizeOptions {
        match self {
            FieldType::Story => SanitizeOptions {
                allow_html: false,
                preserve_newlines: true,
                remove_sensitive_info: true,
            },
            FieldType::General => SanitizeOptions {
                remove_sensitive_info: true,
                ..Default::default()
            },
            _ => SanitizeOptions::default(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Email => "email",
            FieldType::Password => "password",
            FieldType::Name => "name",
            FieldType::Topic => "topic",
            FieldType::Story => "story",
            FieldType::Url => "url",
            FieldType::General => "general",
        };
        f.write_str(name)
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(FieldType::Email),
            "password" => Ok(FieldType::Password),
            "name" => Ok(FieldType::Name),
            "topic" => Ok(FieldType::Topic),
            "story" => Ok(FieldType::Story),
            "url" => Ok(FieldType::Url),
            "general" => Ok(FieldType::General),
            other => Err(format!("unknown field type: {}", other)),
        }
    }
}

/// Sanitizer switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SanitizeOptions {
    /// Keep allow-listed formatting tags instead of escaping everything
    pub allow_html: bool,
    /// Keep line breaks instead of folding them into spaces
    pub preserve_newlines: bool,
    /// Replace SSN/card/phone/email-like substrings with typed placeholders
    pub remove_sensitive_info: bool,
}

/// Outcome of sanitizing one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizationResult {
    pub sanitized_value: String,
    /// Raw input. Never serialized.
    #[serde(skip_serializing, default)]
    pub original_value: String,
    /// Descriptions of the removal classes that fired
    pub removed_patterns: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub success: bool,
}

impl SanitizationResult {
    /// Empty, successful result
    pub fn empty() -> Self {
        Self {
            sanitized_value: String::new(),
            original_value: String::new(),
            removed_patterns: vec![],
            warnings: vec![],
            errors: vec![],
            success: true,
        }
    }
}

/// Kind of detected issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationType {
    ManipulationAttempt,
    InappropriateContent,
    Spam,
    PolicyViolation,
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationType::ManipulationAttempt => write!(f, "Manipulation Attempt"),
            ViolationType::InappropriateContent => write!(f, "Inappropriate Content"),
            ViolationType::Spam => write!(f, "Spam"),
            ViolationType::PolicyViolation => write!(f, "Policy Violation"),
        }
    }
}

/// Severity tier, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// All tiers, least severe first
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// The actor a request is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    User(String),
    Ip(String),
    Session(String),
}

impl Identity {
    /// Resolve an identity with precedence user id > IP address > session id.
    ///
    /// Blank values are ignored. Returns `None` when nothing usable is present.
    pub fn resolve(
        user_id: Option<&str>,
        ip_address: Option<&str>,
        session_id: Option<&str>,
    ) -> Option<Self> {
        let usable = |v: Option<&str>| {
            v.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        if let Some(id) = usable(user_id) {
            return Some(Identity::User(id));
        }
        if let Some(ip) = usable(ip_address) {
            return Some(Identity::Ip(ip));
        }
        usable(session_id).map(Identity::Session)
    }

    /// Stable key used by stores and caches
    pub fn key(&self) -> String {
        match self {
            Identity::User(id) => format!("user:{}", id),
            Identity::Ip(ip) => format!("ip:{}", ip),
            Identity::Session(id) => format!("session:{}", id),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// One detected content-policy or security issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub violation_type: ViolationType,
    pub severity: Severity,
    pub description: String,
    /// Pattern (rule text) that matched, not the matched user text
    pub detected_pattern: String,
    pub timestamp: DateTime<Utc>,
    pub identity: Option<Identity>,
}

impl Violation {
    /// Attribute this violation to an identity
    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }
}

/// Block decision for one identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub is_blocked: bool,
    pub violation_count: u32,
    pub block_duration_minutes: i64,
    pub next_allowed_time: Option<DateTime<Utc>>,
    /// Tier that tripped the block, if any
    pub severity: Option<Severity>,
}

impl RateLimitDecision {
    /// Decision that lets the request through
    pub fn allow(violation_count: u32) -> Self {
        Self {
            is_blocked: false,
            violation_count,
            block_duration_minutes: 0,
            next_allowed_time: None,
            severity: None,
        }
    }
}

/// Request context for guard operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardContext {
    /// Unique request ID
    pub request_id: Uuid,
    /// Authenticated user
    pub user_id: Option<String>,
    /// Session cookie identifier
    pub session_id: Option<String>,
    /// Client address
    pub source_ip: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Default for GuardContext {
    fn default() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user_id: None,
            session_id: None,
            source_ip: None,
            timestamp: Utc::now(),
        }
    }
}

impl GuardContext {
    /// Create a new context with a fresh request ID
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user ID
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the session ID
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the source IP
    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    /// Resolved identity for this request
    pub fn identity(&self) -> Option<Identity> {
        Identity::resolve(
            self.user_id.as_deref(),
            self.source_ip.as_deref(),
            self.session_id.as_deref(),
        )
    }
}

/// Chat role understood by the generation endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A talk-writing request handed to the orchestrator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TalkRequest {
    pub messages: Vec<ChatMessage>,
    /// Requested speaking time, drives the word-count check
    pub duration_minutes: Option<u32>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl TalkRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, minutes: u32) -> Self {
        self.duration_minutes = Some(minutes);
        self
    }
}

/// Result of a policy-wrapped generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutcome {
    /// Validated (redacted) text
    pub text: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Number of calls made to the generation endpoint
    pub attempts: u32,
}

impl GenerationOutcome {
    /// Non-empty errors mean the text must not be shown
    pub fn accepted(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Direction of content flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Input to the model
    Input,
    /// Output from the model
    Output,
}
