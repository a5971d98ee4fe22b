// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authorization primitives: the credential validator and authorization
//! rules collaborator interfaces, plus the token-bucket rate limiter.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Authentication context produced by a [`CredentialValidator`] and attached
/// to a connection record for the lifetime of that connection.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub permissions: std::collections::HashSet<String>,
    pub connected_at: Instant,
    pub last_activity_at: Instant,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        let now = Instant::now();
        Self {
            user_id: None,
            session_id: None,
            permissions: Default::default(),
            connected_at: now,
            last_activity_at: now,
        }
    }

    /// The key used to look up this connection's rate-limit bucket: the
    /// authenticated user ID if present, falling back to the caller-supplied
    /// peer ID.
    pub fn rate_limit_key<'a>(&'a self, peer_id: &'a str) -> &'a str {
        self.user_id.as_deref().unwrap_or(peer_id)
    }
}

/// Validates a bearer token (or its absence) against an inbound upgrade
/// request. Returning `None` rejects the upgrade with 401.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, token: Option<&str>) -> Option<AuthContext>;
}

/// Authorization rules consulted on every publish/direct-message — never
/// cached from the upgrade step.
pub trait AuthorizationRules: Send + Sync {
    fn can_subscribe_to_topic(&self, user_id: Option<&str>, topic: &str) -> bool;
    fn can_publish_to_topic(&self, user_id: Option<&str>, topic: &str) -> bool;
    fn can_message_peer(&self, user_id: Option<&str>, target_peer_id: &str) -> bool;
    /// Messages per second allotted to this user for the token bucket.
    fn get_rate_limit(&self, user_id: Option<&str>) -> f64;
}

/// A permissive validator/rule set: accepts any token (or none), allows any
/// subscribe/publish/message action, and applies a single flat rate limit.
/// Useful for tests and as a starting point for a real deployment.
pub struct AllowAll {
    pub rate_limit: f64,
}

impl Default for AllowAll {
    fn default() -> Self {
        Self { rate_limit: 50.0 }
    }
}

impl CredentialValidator for AllowAll {
    fn validate(&self, _token: Option<&str>) -> Option<AuthContext> {
        Some(AuthContext::anonymous())
    }
}

impl AuthorizationRules for AllowAll {
    fn can_subscribe_to_topic(&self, _user_id: Option<&str>, _topic: &str) -> bool {
        true
    }

    fn can_publish_to_topic(&self, _user_id: Option<&str>, _topic: &str) -> bool {
        true
    }

    fn can_message_peer(&self, _user_id: Option<&str>, _target_peer_id: &str) -> bool {
        true
    }

    fn get_rate_limit(&self, _user_id: Option<&str>) -> f64 {
        self.rate_limit
    }
}

/// A token-bucket accumulator: `capacity` tokens, refilled at `refill_rate`
/// tokens/second, consumed one at a time.
struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self { capacity, refill_rate, tokens: capacity, last_refill: Instant::now() }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// The relay's rate-limit table: one bucket per key (userId, falling back to
/// peerId), created lazily on first chargeable action and destroyed on
/// disconnect.
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to consume one token for `key`, whose bucket has `capacity ==
    /// refill_rate == limit_per_second` (spec §4.4 step 2: "capacity =
    /// refillRate = rules.getRateLimit(userId)").
    pub fn try_consume(&self, key: &str, limit_per_second: f64) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(key.to_owned())
            .or_insert_with(|| TokenBucket::new(limit_per_second, limit_per_second));
        bucket.try_consume(now)
    }

    /// Drop the bucket for `key` (called on connection close).
    pub fn clear(&self, key: &str) {
        self.buckets.lock().remove(key);
    }

    #[cfg(test)]
    fn tokens_remaining(&self, key: &str) -> Option<f64> {
        self.buckets.lock().get(key).map(|b| b.tokens)
    }
}
