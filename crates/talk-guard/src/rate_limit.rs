//! Severity-tiered rate limiting over violation history
//!
//! Each tier `(max_violations, window_minutes, block_minutes)` is evaluated
//! on its own. A tier trips when the counts of its severity whose last
//! violation falls within one window reach the threshold; the block then
//! lasts `block_minutes` from the newest violation closing that window.
//! Any tripped tier blocks; the one blocking longest is reported.
//!
//! A block, once handed out, holds until it expires even if the history it
//! was computed from changes underneath it.
//!
//! Store failures fail open: the request is allowed and the failure logged.

use crate::cache::CacheLayer;
use crate::clock::{earlier, later, minutes, Clock, SystemClock};
use crate::config::{RateLimitConfig, TierTable};
use crate::error::Result;
use crate::types::{Identity, RateLimitDecision, Severity, Violation};
use crate::violation::{ViolationRecord, ViolationStore};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// How far back a decision needs to look
pub fn lookback(tiers: &TierTable) -> Duration {
    Severity::ALL
        .iter()
        .map(|s| {
            let tier = tiers.get(*s);
            minutes(tier.window_minutes)
                .checked_add(&minutes(tier.block_minutes))
                .unwrap_or(Duration::MAX)
        })
        .max()
        .unwrap_or_else(Duration::zero)
}

/// Block decision as a pure function of history and time
pub fn decide(records: &[ViolationRecord], tiers: &TierTable, now: DateTime<Utc>) -> RateLimitDecision {
    let mut blocked: Option<RateLimitDecision> = None;
    let mut in_window = 0u32;

    for severity in Severity::ALL {
        let tier = tiers.get(severity);
        let window = minutes(tier.window_minutes);
        let block = minutes(tier.block_minutes);

        let history: Vec<&ViolationRecord> = records
            .iter()
            .filter(|r| r.severity == severity && r.first_violation_at <= now)
            .collect();

        let window_start = earlier(now, window);
        in_window = in_window.saturating_add(
            history
                .iter()
                .filter(|r| r.last_violation_at > window_start)
                .map(|r| r.count)
                .fold(0u32, u32::saturating_add),
        );

        // Every instant a record started or last grew closes a candidate window
        let mut anchors: Vec<DateTime<Utc>> = history
            .iter()
            .flat_map(|r| [r.first_violation_at, r.last_violation_at])
            .filter(|at| *at <= now)
            .collect();
        anchors.sort();
        anchors.dedup();

        // Newest anchor first: the first one that trips blocks longest
        for anchor in anchors.iter().rev() {
            let until = later(*anchor, block);
            if until <= now {
                break;
            }
            // A merged record spans [first, last]; it counts in every window it overlaps
            let start = earlier(*anchor, window);
            let count = history
                .iter()
                .filter(|r| r.first_violation_at <= *anchor && r.last_violation_at > start)
                .map(|r| r.count)
                .fold(0u32, u32::saturating_add);
            if count < tier.max_violations {
                continue;
            }

            let longer = blocked
                .as_ref()
                .and_then(|b| b.next_allowed_time)
                .map_or(true, |current| until > current);
            if longer {
                blocked = Some(RateLimitDecision {
                    is_blocked: true,
                    violation_count: count,
                    block_duration_minutes: tier.block_minutes,
                    next_allowed_time: Some(until),
                    severity: Some(severity),
                });
            }
            break;
        }
    }

    blocked.unwrap_or_else(|| RateLimitDecision::allow(in_window))
}

/// Violation-history rate limiter
pub struct RateLimiter {
    store: Arc<dyn ViolationStore>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    decisions: Option<Arc<dyn CacheLayer<RateLimitDecision>>>,
    /// Active blocks by identity key
    blocks: DashMap<String, RateLimitDecision>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn ViolationStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            decisions: None,
            blocks: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cache decisions per identity; entries are dropped on every new violation
    pub fn with_decision_cache(mut self, cache: Arc<dyn CacheLayer<RateLimitDecision>>) -> Self {
        self.decisions = Some(cache);
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ViolationStore> {
        &self.store
    }

    /// Decide whether `identity` may proceed. Without an identity, always allow.
    pub async fn check(&self, identity: Option<&Identity>) -> RateLimitDecision {
        let Some(identity) = identity else {
            return RateLimitDecision::allow(0);
        };
        if !self.config.enabled {
            return RateLimitDecision::allow(0);
        }

        let now = self.clock.now();
        let key = identity.key();

        if let Some(cache) = &self.decisions {
            if let Some(cached) = cache.get(&key).await {
                let expired = cached.next_allowed_time.is_some_and(|t| t <= now);
                if !expired {
                    return cached;
                }
            }
        }

        let decision = match self.evaluate(identity, now).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(identity = %identity, error = %e, fail_open = true, "Violation store unavailable, allowing request");
                return RateLimitDecision::allow(0);
            }
        };
        let decision = self.hold_block(&key, decision, now);

        if decision.is_blocked {
            debug!(
                identity = %identity,
                severity = ?decision.severity,
                until = ?decision.next_allowed_time,
                "Identity blocked"
            );
        }

        if let Some(cache) = &self.decisions {
            let ttl = std::time::Duration::from_secs(self.config.decision_cache_secs);
            cache.set(&key, decision.clone(), Some(ttl)).await;
        }
        decision
    }

    /// Keep the later of a fresh decision and a still-active earlier block
    fn hold_block(&self, key: &str, decision: RateLimitDecision, now: DateTime<Utc>) -> RateLimitDecision {
        let active = self
            .blocks
            .get(key)
            .map(|b| b.value().clone())
            .filter(|b| b.next_allowed_time.is_some_and(|t| t > now));

        match active {
            Some(held) if !decision.is_blocked || held.next_allowed_time > decision.next_allowed_time => held,
            _ if decision.is_blocked => {
                self.blocks.insert(key.to_string(), decision.clone());
                decision
            }
            _ => {
                self.blocks.remove(key);
                decision
            }
        }
    }

    /// Drop blocks that have run out. Returns how many were dropped.
    pub fn prune_blocks(&self) -> usize {
        let now = self.clock.now();
        let before = self.blocks.len();
        self.blocks
            .retain(|_, b| b.next_allowed_time.is_some_and(|t| t > now));
        before.saturating_sub(self.blocks.len())
    }

    async fn evaluate(&self, identity: &Identity, now: DateTime<Utc>) -> Result<RateLimitDecision> {
        let since = earlier(now, lookback(&self.config.tiers));
        let records = self.store.records_since(identity, since).await?;
        Ok(decide(&records, &self.config.tiers, now))
    }

    /// Persist a violation against its identity.
    ///
    /// Violations without an identity are not stored. Store failures are
    /// logged and swallowed.
    pub async fn record(&self, violation: &Violation) -> Option<ViolationRecord> {
        let identity = violation.identity.as_ref()?;
        let window = minutes(self.config.merge_window_minutes);

        let record = match self.store.increment_or_create(identity, violation, window).await {
            Ok(record) => record,
            Err(e) => {
                warn!(identity = %identity, error = %e, fail_open = true, "Failed to persist violation");
                return None;
            }
        };
        debug!(
            identity = %identity,
            violation_type = %record.violation_type,
            count = record.count,
            "Violation recorded"
        );

        if let Some(cache) = &self.decisions {
            cache.invalidate(&identity.key()).await;
        }
        Some(record)
    }
}
