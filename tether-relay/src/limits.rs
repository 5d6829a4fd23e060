//! Rate limiting for tether-relay.
//!
//! Protects against handshake flooding and event spam. Handshakes are keyed by
//! the authenticated user (a flapping phone reconnecting in a loop is the usual
//! culprit), inbound events by connection, and a global limiter caps aggregate
//! throughput regardless of per-key limits.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tether_types::{ConnectionId, UserId};

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the relay.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits handshakes per user.
    connection_limiter: Arc<KeyedLimiter<UserId>>,

    /// Limits inbound events per connection.
    event_limiter: Arc<KeyedLimiter<ConnectionId>>,

    /// Caps inbound events across all connections.
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_limiter", &"KeyedLimiter<UserId>")
            .field("event_limiter", &"KeyedLimiter<ConnectionId>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// A zero quota is treated as one, so a misconfigured limit throttles
    /// hard instead of refusing to start.
    pub fn new(config: &LimitsConfig) -> Self {
        let connection_quota = Quota::per_minute(non_zero(config.connections_per_user_per_minute));
        let event_quota = Quota::per_minute(non_zero(config.events_per_minute));
        let global_quota = Quota::per_second(non_zero(config.global_events_per_second));

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            event_limiter: Arc::new(RateLimiter::keyed(event_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check if a handshake for `user_id` is allowed.
    pub fn check_connection(&self, user_id: &UserId) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(user_id)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check if an inbound event from `connection_id` is allowed.
    pub fn check_event(&self, connection_id: &ConnectionId) -> Result<(), RateLimitError> {
        self.event_limiter
            .check_key(connection_id)
            .map_err(|_| RateLimitError::EventLimitExceeded)
    }

    /// Check the relay-wide event rate.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Number of tracked handshake keys (for metrics).
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Number of tracked event keys (for metrics).
    pub fn event_keys_count(&self) -> usize {
        self.event_limiter.len()
    }

    /// Evict keys whose cells have fully recharged.
    ///
    /// Disconnected connections otherwise leave entries behind forever. Call
    /// periodically from the cleanup task.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.event_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many handshakes for this user.
    #[error("connection rate limit exceeded")]
    ConnectionLimitExceeded,
    /// Too many events from this connection.
    #[error("event rate limit exceeded")]
    EventLimitExceeded,
    /// Relay-wide event rate exceeded.
    #[error("global rate limit exceeded")]
    GlobalLimitExceeded,
}
