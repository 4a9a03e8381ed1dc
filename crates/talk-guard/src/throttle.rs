//! Per-identity request throttle
//!
//! Independent of violation history: caps how many requests one identity
//! may make per minute.

use crate::config::ThrottleConfig;
use crate::error::Result;
use crate::types::Identity;

#[cfg(feature = "throttle")]
use crate::error::GuardError;
#[cfg(feature = "throttle")]
use governor::clock::{Clock as _, DefaultClock};
#[cfg(feature = "throttle")]
use governor::{Quota, RateLimiter as GovernorLimiter};
#[cfg(feature = "throttle")]
use std::collections::HashMap;
#[cfg(feature = "throttle")]
use std::num::NonZeroU32;
#[cfg(feature = "throttle")]
use std::sync::Arc;
#[cfg(feature = "throttle")]
use tokio::sync::RwLock;
#[cfg(feature = "throttle")]
use tracing::debug;

#[cfg(feature = "throttle")]
type InnerLimiter =
    GovernorLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

/// Limiters above this count are dropped by [`Throttle::cleanup`]
#[cfg(feature = "throttle")]
const MAX_TRACKED: usize = 10_000;

pub struct Throttle {
    config: ThrottleConfig,
    #[cfg(feature = "throttle")]
    limiters: Arc<RwLock<HashMap<String, Arc<InnerLimiter>>>>,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            #[cfg(feature = "throttle")]
            limiters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && cfg!(feature = "throttle")
    }

    /// Take one request from the identity's quota
    #[cfg(feature = "throttle")]
    pub async fn check(&self, identity: &Identity) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let limiter = self.limiter_for(&identity.key()).await;
        match limiter.check() {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                let wait = chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
                debug!(identity = %identity, wait_ms = wait.num_milliseconds(), "Request throttled");
                Err(GuardError::RateLimited {
                    next_allowed_at: chrono::Utc::now() + wait,
                    block_minutes: (wait.num_seconds() + 59) / 60,
                })
            }
        }
    }

    #[cfg(not(feature = "throttle"))]
    pub async fn check(&self, _identity: &Identity) -> Result<()> {
        Ok(())
    }

    #[cfg(feature = "throttle")]
    async fn limiter_for(&self, key: &str) -> Arc<InnerLimiter> {
        {
            let limiters = self.limiters.read().await;
            if let Some(limiter) = limiters.get(key) {
                return limiter.clone();
            }
        }

        let mut limiters = self.limiters.write().await;
        // Another task may have inserted it meanwhile
        if let Some(limiter) = limiters.get(key) {
            return limiter.clone();
        }

        let quota = Quota::per_minute(
            NonZeroU32::new(self.config.requests_per_minute).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(self.config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = Arc::new(GovernorLimiter::direct(quota));
        limiters.insert(key.to_string(), limiter.clone());
        limiter
    }

    /// Number of identities currently tracked
    #[cfg(feature = "throttle")]
    pub async fn tracked(&self) -> usize {
        self.limiters.read().await.len()
    }

    #[cfg(not(feature = "throttle"))]
    pub async fn tracked(&self) -> usize {
        0
    }

    /// Drop all limiters once the table grows past its bound
    #[cfg(feature = "throttle")]
    pub async fn cleanup(&self) {
        let mut limiters = self.limiters.write().await;
        if limiters.len() > MAX_TRACKED {
            debug!(tracked = limiters.len(), "Clearing throttle table");
            limiters.clear();
        }
    }

    #[cfg(not(feature = "throttle"))]
    pub async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(addr: &str) -> Identity {
        Identity::Ip(addr.to_string())
    }

    #[tokio::test]
    async fn test_throttle_disabled() {
        let throttle = Throttle::new(ThrottleConfig {
            enabled: false,
            requests_per_minute: 1,
            burst_size: 1,
        });

        for _ in 0..5 {
            assert!(throttle.check(&ip("10.0.0.1")).await.is_ok());
        }
    }

    #[tokio::test]
    #[cfg(feature = "throttle")]
    async fn test_burst_then_throttled() {
        let throttle = Throttle::new(ThrottleConfig {
            enabled: true,
            requests_per_minute: 2,
            burst_size: 2,
        });

        assert!(throttle.check(&ip("10.0.0.1")).await.is_ok());
        assert!(throttle.check(&ip("10.0.0.1")).await.is_ok());
        let err = throttle.check(&ip("10.0.0.1")).await.unwrap_err();
        assert!(matches!(err, GuardError::RateLimited { .. }));

        // Quotas are per identity
        assert!(throttle.check(&ip("10.0.0.2")).await.is_ok());
        assert_eq!(throttle.tracked().await, 2);
    }
}
