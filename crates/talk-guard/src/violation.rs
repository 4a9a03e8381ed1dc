//! Violation persistence
//!
//! Identical violations `(identity, type, pattern)` arriving within the merge
//! window collapse into one [`ViolationRecord`] whose count is incremented.
//! The merge is a conditional upsert performed under the store's own lock,
//! so concurrent requests from one identity cannot lose updates.

use crate::clock::{days, earlier, later};
use crate::config::RetentionConfig;
use crate::error::Result;
use crate::types::{Identity, Severity, Violation, ViolationType};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted, possibly merged, violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub id: Uuid,
    pub identity: Identity,
    pub violation_type: ViolationType,
    pub severity: Severity,
    pub pattern: String,
    pub description: String,
    pub count: u32,
    pub first_violation_at: DateTime<Utc>,
    pub last_violation_at: DateTime<Utc>,
}

impl ViolationRecord {
    fn from_violation(violation: &Violation, identity: &Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.clone(),
            violation_type: violation.violation_type,
            severity: violation.severity,
            pattern: violation.detected_pattern.clone(),
            description: violation.description.clone(),
            count: 1,
            first_violation_at: violation.timestamp,
            last_violation_at: violation.timestamp,
        }
    }

    /// Same identity, type and pattern, created at or after `since`
    pub fn is_duplicate_of(
        &self,
        identity: &Identity,
        violation_type: ViolationType,
        pattern: &str,
        since: DateTime<Utc>,
    ) -> bool {
        &self.identity == identity
            && self.violation_type == violation_type
            && self.pattern == pattern
            && self.first_violation_at >= since
    }
}

/// Storage collaborator for violation records
#[async_trait]
pub trait ViolationStore: Send + Sync {
    /// Record created within the window for the same `(identity, type, pattern)`
    async fn find_recent_duplicate(
        &self,
        identity: &Identity,
        violation_type: ViolationType,
        pattern: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ViolationRecord>>;

    /// Atomically increment a recent duplicate or insert a new record.
    /// Returns the record as stored.
    async fn increment_or_create(
        &self,
        identity: &Identity,
        violation: &Violation,
        merge_window: Duration,
    ) -> Result<ViolationRecord>;

    /// Sum of counts for one severity whose last violation is at or after `since`
    async fn sum_counts(
        &self,
        identity: &Identity,
        severity: Severity,
        since: DateTime<Utc>,
    ) -> Result<u32>;

    /// Records whose last violation is at or after `since`
    async fn records_since(
        &self,
        identity: &Identity,
        since: DateTime<Utc>,
    ) -> Result<Vec<ViolationRecord>>;

    /// Delete records past their retention. Returns how many were removed.
    async fn purge_expired(&self, retention: &RetentionConfig, now: DateTime<Utc>)
        -> Result<usize>;
}

/// In-process store backed by [`DashMap`], keyed by identity
#[derive(Debug, Default)]
pub struct InMemoryViolationStore {
    records: DashMap<String, Vec<ViolationRecord>>,
}

impl InMemoryViolationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records held
    pub fn len(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ViolationStore for InMemoryViolationStore {
    async fn find_recent_duplicate(
        &self,
        identity: &Identity,
        violation_type: ViolationType,
        pattern: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ViolationRecord>> {
        Ok(self.records.get(&identity.key()).and_then(|records| {
            records
                .iter()
                .rev()
                .find(|r| r.is_duplicate_of(identity, violation_type, pattern, since))
                .cloned()
        }))
    }

    async fn increment_or_create(
        &self,
        identity: &Identity,
        violation: &Violation,
        merge_window: Duration,
    ) -> Result<ViolationRecord> {
        let since = earlier(violation.timestamp, merge_window);
        // The entry guard holds the shard write lock for the whole upsert
        let mut records = self.records.entry(identity.key()).or_default();

        if let Some(existing) = records.iter_mut().rev().find(|r| {
            r.is_duplicate_of(
                identity,
                violation.violation_type,
                &violation.detected_pattern,
                since,
            )
        }) {
            existing.count += 1;
            if violation.timestamp > existing.last_violation_at {
                existing.last_violation_at = violation.timestamp;
            }
            return Ok(existing.clone());
        }

        let record = ViolationRecord::from_violation(violation, identity);
        records.push(record.clone());
        Ok(record)
    }

    async fn sum_counts(
        &self,
        identity: &Identity,
        severity: Severity,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        Ok(self
            .records
            .get(&identity.key())
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.severity == severity && r.last_violation_at >= since)
                    .map(|r| r.count)
                    .sum()
            })
            .unwrap_or(0))
    }

    async fn records_since(
        &self,
        identity: &Identity,
        since: DateTime<Utc>,
    ) -> Result<Vec<ViolationRecord>> {
        Ok(self
            .records
            .get(&identity.key())
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.last_violation_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn purge_expired(
        &self,
        retention: &RetentionConfig,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut removed = 0;
        self.records.retain(|_, records| {
            let before = records.len();
            records.retain(|r| {
                later(r.last_violation_at, days(retention.days_for(r.severity))) > now
            });
            removed += before - records.len();
            !records.is_empty()
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn violation(severity: Severity, pattern: &str, at: DateTime<Utc>) -> Violation {
        Violation {
            violation_type: ViolationType::InappropriateContent,
            severity,
            description: "test".to_string(),
            detected_pattern: pattern.to_string(),
            timestamp: at,
            identity: None,
        }
    }

    fn alice() -> Identity {
        Identity::User("alice".to_string())
    }

    #[tokio::test]
    async fn test_merge_within_window() {
        let store = InMemoryViolationStore::new();
        let t0 = Utc::now();
        let window = Duration::minutes(5);

        store
            .increment_or_create(&alice(), &violation(Severity::High, "p", t0), window)
            .await
            .unwrap();
        let merged = store
            .increment_or_create(
                &alice(),
                &violation(Severity::High, "p", t0 + Duration::minutes(2)),
                window,
            )
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(merged.count, 2);
        assert_eq!(merged.last_violation_at, t0 + Duration::minutes(2));
        assert_eq!(merged.first_violation_at, t0);
    }

    #[tokio::test]
    async fn test_no_merge_outside_window_or_on_different_key() {
        let store = InMemoryViolationStore::new();
        let t0 = Utc::now();
        let window = Duration::minutes(5);

        store
            .increment_or_create(&alice(), &violation(Severity::High, "p", t0), window)
            .await
            .unwrap();
        store
            .increment_or_create(
                &alice(),
                &violation(Severity::High, "p", t0 + Duration::minutes(6)),
                window,
            )
            .await
            .unwrap();
        store
            .increment_or_create(&alice(), &violation(Severity::High, "q", t0), window)
            .await
            .unwrap();
        store
            .increment_or_create(
                &Identity::Ip("10.0.0.1".to_string()),
                &violation(Severity::High, "p", t0),
                window,
            )
            .await
            .unwrap();

        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_find_recent_duplicate() {
        let store = InMemoryViolationStore::new();
        let t0 = Utc::now();
        store
            .increment_or_create(&alice(), &violation(Severity::Low, "p", t0), Duration::minutes(5))
            .await
            .unwrap();

        let found = store
            .find_recent_duplicate(
                &alice(),
                ViolationType::InappropriateContent,
                "p",
                t0 - Duration::minutes(5),
            )
            .await
            .unwrap();
        assert!(found.is_some());

        let missing = store
            .find_recent_duplicate(&alice(), ViolationType::Spam, "p", t0 - Duration::minutes(5))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_sum_counts_by_severity() {
        let store = InMemoryViolationStore::new();
        let t0 = Utc::now();
        let window = Duration::minutes(5);
        for pattern in ["a", "b", "b"] {
            store
                .increment_or_create(&alice(), &violation(Severity::High, pattern, t0), window)
                .await
                .unwrap();
        }
        store
            .increment_or_create(&alice(), &violation(Severity::Low, "c", t0), window)
            .await
            .unwrap();

        let since = t0 - Duration::minutes(15);
        assert_eq!(store.sum_counts(&alice(), Severity::High, since).await.unwrap(), 3);
        assert_eq!(store.sum_counts(&alice(), Severity::Low, since).await.unwrap(), 1);
        assert_eq!(
            store
                .sum_counts(&alice(), Severity::High, t0 + Duration::seconds(1))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_concurrent_upserts_do_not_lose_updates() {
        let store = Arc::new(InMemoryViolationStore::new());
        let t0 = Utc::now();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .increment_or_create(
                            &alice(),
                            &violation(Severity::Medium, "same", t0),
                            Duration::minutes(5),
                        )
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let records = store
            .records_since(&alice(), t0 - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 32);
    }

    #[tokio::test]
    async fn test_purge_by_severity_retention() {
        let store = InMemoryViolationStore::new();
        let retention = RetentionConfig::default();
        let old = Utc::now() - Duration::days(100);
        let window = Duration::minutes(5);

        store
            .increment_or_create(&alice(), &violation(Severity::Low, "a", old), window)
            .await
            .unwrap();
        store
            .increment_or_create(&alice(), &violation(Severity::Critical, "b", old), window)
            .await
            .unwrap();

        let removed = store.purge_expired(&retention, Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);

        let removed = store
            .purge_expired(&retention, Utc::now() + Duration::days(300))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_huge_windows_saturate() {
        let store = InMemoryViolationStore::new();
        let t0 = Utc::now();
        let huge = Duration::MAX;

        store
            .increment_or_create(&alice(), &violation(Severity::Low, "p", t0), huge)
            .await
            .unwrap();
        let merged = store
            .increment_or_create(&alice(), &violation(Severity::Low, "p", t0), huge)
            .await
            .unwrap();
        assert_eq!(merged.count, 2);

        let forever = RetentionConfig {
            low_medium_days: i64::MAX,
            high_critical_days: i64::MAX,
        };
        assert_eq!(store.purge_expired(&forever, t0).await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }
}
