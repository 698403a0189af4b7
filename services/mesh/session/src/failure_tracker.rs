//! Handshake failure tracker bounding retries per peer

use mesh_wire::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Tracks handshake failures to bound how often a peer is retried
#[derive(Debug, Clone)]
pub struct HandshakeRetryTracker {
    /// Failure counts per peer
    failures: Arc<RwLock<HashMap<PeerId, FailureInfo>>>,
    /// Failures tolerated inside one window
    retry_limit: u32,
    /// Time window for failure counting
    failure_window: Duration,
}

#[derive(Debug, Clone)]
struct FailureInfo {
    /// Failures in the current window
    count: u32,
    /// Timestamp of first failure in current window
    first_failure: Instant,
    /// Timestamp of last failure
    last_failure: Instant,
    /// Whether we've already warned about the limit
    limit_notified: bool,
}

impl HandshakeRetryTracker {
    /// Create a tracker allowing `retry_limit` failures per `failure_window`
    pub fn new(retry_limit: u32, failure_window: Duration) -> Self {
        Self {
            failures: Arc::new(RwLock::new(HashMap::new())),
            retry_limit: retry_limit.max(1),
            failure_window,
        }
    }

    /// Record a failed handshake; returns the count and whether the limit
    /// was reached by this failure
    pub async fn record_failure(&self, peer: PeerId, now: Instant) -> (u32, bool) {
        let mut failures = self.failures.write().await;

        let info = failures.entry(peer).or_insert(FailureInfo {
            count: 0,
            first_failure: now,
            last_failure: now,
            limit_notified: false,
        });

        if now.saturating_duration_since(info.first_failure) > self.failure_window {
            info.count = 1;
            info.first_failure = now;
            info.limit_notified = false;
        } else {
            info.count += 1;
        }
        info.last_failure = now;

        let reached = info.count >= self.retry_limit && !info.limit_notified;
        if reached {
            info.limit_notified = true;
            warn!(
                "Handshake retries with {} exhausted after {} failures",
                peer, info.count
            );
        }

        debug!("Recorded handshake failure for {} (count: {})", peer, info.count);
        (info.count, reached)
    }

    /// Record a completed handshake, clearing the count
    ///
    /// Returns whether the peer had been retry limited.
    pub async fn record_success(&self, peer: PeerId) -> bool {
        let mut failures = self.failures.write().await;
        match failures.remove(&peer) {
            Some(info) => {
                if info.limit_notified {
                    debug!("Handshake with {} recovered after retry limit", peer);
                }
                info.limit_notified
            }
            None => false,
        }
    }

    /// Whether a new handshake with `peer` may be initiated now
    pub async fn allow(&self, peer: PeerId, now: Instant) -> bool {
        let failures = self.failures.read().await;
        match failures.get(&peer) {
            Some(info) => {
                info.count < self.retry_limit
                    || now.saturating_duration_since(info.first_failure) > self.failure_window
            }
            None => true,
        }
    }

    /// Current failure count for a peer
    pub async fn failure_count(&self, peer: PeerId) -> u32 {
        let failures = self.failures.read().await;
        failures.get(&peer).map(|info| info.count).unwrap_or(0)
    }

    /// Clean up old failure records
    pub async fn cleanup(&self, now: Instant) {
        let mut failures = self.failures.write().await;
        failures.retain(|_, info| {
            now.saturating_duration_since(info.last_failure) < self.failure_window * 2
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_and_window() {
        let tracker = HandshakeRetryTracker::new(2, Duration::from_secs(60));
        let base = Instant::now();
        let peer = PeerId(7);

        assert!(tracker.allow(peer, base).await);
        assert_eq!(tracker.record_failure(peer, base).await, (1, false));
        assert!(tracker.allow(peer, base).await);
        assert_eq!(tracker.record_failure(peer, base).await, (2, true));
        assert!(!tracker.allow(peer, base + Duration::from_secs(10)).await);

        // Window passed
        assert!(tracker.allow(peer, base + Duration::from_secs(61)).await);
        assert_eq!(
            tracker
                .record_failure(peer, base + Duration::from_secs(61))
                .await,
            (1, false)
        );
    }

    #[tokio::test]
    async fn test_success_clears() {
        let tracker = HandshakeRetryTracker::new(1, Duration::from_secs(60));
        let now = Instant::now();
        let peer = PeerId(3);

        tracker.record_failure(peer, now).await;
        assert!(!tracker.allow(peer, now).await);
        assert!(tracker.record_success(peer).await);
        assert!(tracker.allow(peer, now).await);
        assert_eq!(tracker.failure_count(peer).await, 0);
        assert!(!tracker.record_success(peer).await);
    }

    #[tokio::test]
    async fn test_cleanup() {
        let tracker = HandshakeRetryTracker::new(3, Duration::from_secs(10));
        let now = Instant::now();
        tracker.record_failure(PeerId(1), now).await;
        tracker.cleanup(now + Duration::from_secs(5)).await;
        assert_eq!(tracker.failure_count(PeerId(1)).await, 1);
        tracker.cleanup(now + Duration::from_secs(20)).await;
        assert_eq!(tracker.failure_count(PeerId(1)).await, 0);
    }
}
