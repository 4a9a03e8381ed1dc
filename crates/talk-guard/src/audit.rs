//! Audit logging
//!
//! Detections, blocks and output rejections are emitted as structured
//! `tracing` events whatever the request's final decision. Raw content is
//! never logged unless `audit.log_content` is set; a hash stands in for it.
//! Confidential content (password fields) is passed as `None` and leaves
//! neither a hash nor an excerpt.

use crate::config::AuditConfig;
use crate::pii::hash_value;
use crate::types::{Direction, GuardContext, RateLimitDecision, Severity, Violation, ViolationType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// What happened to a request at one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    Passed,
    Violation {
        violation_type: ViolationType,
        severity: Severity,
        pattern: String,
    },
    RateLimited {
        severity: Option<Severity>,
        until: Option<DateTime<Utc>>,
    },
    OutputRejected {
        errors: Vec<String>,
    },
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub request_id: Uuid,
    /// Identity key, if one was resolvable
    pub identity: Option<String>,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub outcome: AuditOutcome,
    pub timestamp: DateTime<Utc>,
}

pub struct AuditLogger {
    config: AuditConfig,
}

impl AuditLogger {
    pub fn new(config: AuditConfig) -> Self {
        Self { config }
    }

    pub fn violation(
        &self,
        context: &GuardContext,
        direction: Direction,
        content: Option<&str>,
        violation: &Violation,
    ) -> Option<AuditEntry> {
        let entry = self.entry(
            context,
            direction,
            content,
            AuditOutcome::Violation {
                violation_type: violation.violation_type,
                severity: violation.severity,
                pattern: violation.detected_pattern.clone(),
            },
        )?;
        warn!(
            request_id = %entry.request_id,
            identity = ?entry.identity,
            direction = ?direction,
            violation_type = %violation.violation_type,
            severity = %violation.severity,
            pattern = %violation.detected_pattern,
            description = %violation.description,
            content_hash = ?entry.content_hash,
            content = ?self.excerpt(content),
            "Policy violation detected"
        );
        Some(entry)
    }

    pub fn rate_limited(
        &self,
        context: &GuardContext,
        decision: &RateLimitDecision,
    ) -> Option<AuditEntry> {
        let entry = self.entry(
            context,
            Direction::Input,
            None,
            AuditOutcome::RateLimited {
                severity: decision.severity,
                until: decision.next_allowed_time,
            },
        )?;
        warn!(
            request_id = %entry.request_id,
            identity = ?entry.identity,
            violation_count = decision.violation_count,
            block_minutes = decision.block_duration_minutes,
            next_allowed_time = ?decision.next_allowed_time,
            "Identity blocked"
        );
        Some(entry)
    }

    pub fn output_rejected(
        &self,
        context: &GuardContext,
        content: &str,
        errors: &[String],
    ) -> Option<AuditEntry> {
        let entry = self.entry(
            context,
            Direction::Output,
            Some(content),
            AuditOutcome::OutputRejected {
                errors: errors.to_vec(),
            },
        )?;
        warn!(
            request_id = %entry.request_id,
            identity = ?entry.identity,
            errors = ?errors,
            content_hash = ?entry.content_hash,
            content = ?self.excerpt(Some(content)),
            "Generated text rejected"
        );
        Some(entry)
    }

    pub fn passed(
        &self,
        context: &GuardContext,
        direction: Direction,
        content: Option<&str>,
    ) -> Option<AuditEntry> {
        let entry = self.entry(context, direction, content, AuditOutcome::Passed)?;
        info!(
            request_id = %entry.request_id,
            identity = ?entry.identity,
            direction = ?direction,
            content_hash = ?entry.content_hash,
            "Guard audit"
        );
        Some(entry)
    }

    fn entry(
        &self,
        context: &GuardContext,
        direction: Direction,
        content: Option<&str>,
        outcome: AuditOutcome,
    ) -> Option<AuditEntry> {
        if !self.config.enabled {
            return None;
        }
        Some(AuditEntry {
            request_id: context.request_id,
            identity: context.identity().map(|i| i.key()),
            direction,
            content_hash: content.map(hash_value),
            outcome,
            timestamp: Utc::now(),
        })
    }

    fn excerpt(&self, content: Option<&str>) -> Option<String> {
        content
            .filter(|_| self.config.log_content)
            .map(|c| truncate(c, 200))
    }
}

/// Truncate on a char boundary for logging
fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
