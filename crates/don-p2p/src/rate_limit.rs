//! Per-link token bucket rate limiting.
//!
//! Every link owns a [`LinkRateLimiter`] holding two independent buckets: one
//! counting messages and one counting payload bytes. A send withdraws from
//! both buckets or from neither.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::{StreamConfig, TokenBucketParams};

/// Which bucket rejected a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateLimitKind {
    /// The message-count bucket.
    Messages,
    /// The byte bucket.
    Bytes,
}

impl fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Messages => write!(f, "messages"),
            Self::Bytes => write!(f, "bytes"),
        }
    }
}

/// Continuously refilling token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Current tokens available.
    tokens: f64,
    /// Last time tokens were refilled.
    last_refill: Instant,
    /// Tokens added per second.
    rate: f64,
    /// Maximum tokens (burst size).
    capacity: f64,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(params: TokenBucketParams) -> Self {
        Self::new_at(params, Instant::now())
    }

    /// Creates a full bucket whose refill clock starts at `now`.
    #[must_use]
    pub fn new_at(params: TokenBucketParams, now: Instant) -> Self {
        let capacity = f64::from(params.capacity);
        Self {
            tokens: capacity,
            last_refill: now,
            rate: params.rate,
            capacity,
        }
    }

    fn refill(&mut self, now: Instant) {
        // Instants earlier than the last refill add nothing.
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = elapsed
            .as_secs_f64()
            .mul_add(self.rate, self.tokens)
            .min(self.capacity);
        self.last_refill = self.last_refill.max(now);
    }

    /// Tokens available at `now`.
    pub fn available_at(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Withdraws `amount` tokens if available at `now`.
    pub fn try_consume_at(&mut self, amount: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// Applies new parameters, keeping current tokens clamped to the new capacity.
    pub fn reconfigure_at(&mut self, params: TokenBucketParams, now: Instant) {
        self.refill(now);
        self.rate = params.rate;
        self.capacity = f64::from(params.capacity);
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Refills the bucket to capacity and restarts its clock at `now`.
    pub fn reset_at(&mut self, now: Instant) {
        self.tokens = self.capacity;
        self.last_refill = now;
    }

    /// Configured refill rate.
    #[must_use]
    pub const fn rate(&self) -> f64 {
        self.rate
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Message and byte buckets for one peer link.
#[derive(Debug, Clone)]
pub struct LinkRateLimiter {
    messages: TokenBucket,
    bytes: TokenBucket,
}

impl LinkRateLimiter {
    /// Creates full buckets from the link's stream config.
    #[must_use]
    pub fn new(config: &StreamConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    /// Creates full buckets whose clocks start at `now`.
    #[must_use]
    pub fn new_at(config: &StreamConfig, now: Instant) -> Self {
        Self {
            messages: TokenBucket::new_at(config.message_rate_limiter, now),
            bytes: TokenBucket::new_at(config.bytes_rate_limiter, now),
        }
    }

    /// Withdraws one message token and `len` byte tokens, or nothing.
    ///
    /// # Errors
    ///
    /// Returns the bucket that was short.
    pub fn try_acquire(&mut self, len: usize) -> Result<(), RateLimitKind> {
        self.try_acquire_at(len, Instant::now())
    }

    /// Like [`try_acquire`](Self::try_acquire) at an explicit instant.
    ///
    /// # Errors
    ///
    /// Returns the bucket that was short.
    pub fn try_acquire_at(&mut self, len: usize, now: Instant) -> Result<(), RateLimitKind> {
        let byte_cost = len as f64;
        if self.messages.available_at(now) < 1.0 {
            trace!(tokens = self.messages.tokens, "message bucket empty");
            return Err(RateLimitKind::Messages);
        }
        if self.bytes.available_at(now) < byte_cost {
            trace!(tokens = self.bytes.tokens, len, "byte bucket short");
            return Err(RateLimitKind::Bytes);
        }
        // Both checks passed at the same instant, so both withdrawals succeed.
        self.messages.try_consume_at(1.0, now);
        self.bytes.try_consume_at(byte_cost, now);
        Ok(())
    }

    /// Applies a new stream config without refilling.
    pub fn reconfigure(&mut self, config: &StreamConfig) {
        let now = Instant::now();
        self.messages.reconfigure_at(config.message_rate_limiter, now);
        self.bytes.reconfigure_at(config.bytes_rate_limiter, now);
    }

    /// Restores both buckets to capacity.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.messages.reset_at(now);
        self.bytes.reset_at(now);
    }

    /// Snapshot of the available tokens.
    pub fn snapshot(&mut self) -> RateLimiterSnapshot {
        let now = Instant::now();
        RateLimiterSnapshot {
            message_tokens: self.messages.available_at(now),
            byte_tokens: self.bytes.available_at(now),
        }
    }
}

/// Available tokens in a link's buckets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    /// Tokens in the message bucket.
    pub message_tokens: f64,
    /// Tokens in the byte bucket.
    pub byte_tokens: f64,
}
