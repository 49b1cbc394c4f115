// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Exponential-backoff reconnection policy for channel adapters:
//! `min(base * 2^attempt, max)` with an attempt-counter reset on success
//! and terminal disconnect causes that skip reconnection entirely.

use std::sync::Mutex;
use std::time::Duration;

/// Why an adapter's connection dropped. `LoggedOut`/`Forbidden` are terminal:
/// the credentials are no longer valid and retrying would just repeat the
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    Unexpected,
    LoggedOut,
    Forbidden,
}

impl DisconnectCause {
    pub fn is_terminal(self) -> bool {
        matches!(self, DisconnectCause::LoggedOut | DisconnectCause::Forbidden)
    }
}

/// What the adapter should do after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait this long, then attempt to reconnect.
    Wait(Duration),
    /// Stop retrying — the adapter transitions to `error` status.
    GiveUp,
}

pub struct Reconnector {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: Mutex<u32>,
}

impl Reconnector {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self { base, max, max_attempts, attempts: Mutex::new(0) }
    }

    /// `base=2s, max=60s, max_attempts=10` — the default backoff schedule.
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60), 10)
    }

    /// Record a disconnect and decide what to do next.
    pub fn on_disconnect(&self, cause: DisconnectCause) -> ReconnectDecision {
        if cause.is_terminal() {
            return ReconnectDecision::GiveUp;
        }
        let mut attempts = self.attempts.lock().unwrap();
        *attempts += 1;
        if *attempts > self.max_attempts {
            return ReconnectDecision::GiveUp;
        }
        ReconnectDecision::Wait(self.delay_for_attempt(*attempts))
    }

    /// Reset the attempt counter — call after a successful `start()`.
    pub fn on_connected(&self) {
        *self.attempts.lock().unwrap() = 0;
    }

    /// `min(base * 2^(attempt-1), max)` for the `attempt`-th reconnect try
    /// (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let scaled = base_ms.saturating_mul(factor);
        Duration::from_millis(scaled.min(max_ms))
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_sequence_matches_exponential_backoff() {
        let r = Reconnector::new(Duration::from_secs(2), Duration::from_secs(60), 100);
        assert_eq!(r.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(r.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(r.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(r.delay_for_attempt(4), Duration::from_secs(16));
        assert_eq!(r.delay_for_attempt(5), Duration::from_secs(32));
        assert_eq!(r.delay_for_attempt(6), Duration::from_secs(60)); // clamped
        assert_eq!(r.delay_for_attempt(20), Duration::from_secs(60));
    }

    #[test]
    fn attempts_reset_on_successful_connect() {
        let r = Reconnector::with_defaults();
        assert_eq!(r.on_disconnect(DisconnectCause::Unexpected), ReconnectDecision::Wait(Duration::from_secs(2)));
        assert_eq!(r.on_disconnect(DisconnectCause::Unexpected), ReconnectDecision::Wait(Duration::from_secs(4)));
        r.on_connected();
        assert_eq!(r.attempts(), 0);
        assert_eq!(r.on_disconnect(DisconnectCause::Unexpected), ReconnectDecision::Wait(Duration::from_secs(2)));
    }

    #[test]
    fn terminal_cause_gives_up_without_incrementing_attempts() {
        let r = Reconnector::with_defaults();
        assert_eq!(r.on_disconnect(DisconnectCause::LoggedOut), ReconnectDecision::GiveUp);
        assert_eq!(r.attempts(), 0);
        assert_eq!(r.on_disconnect(DisconnectCause::Forbidden), ReconnectDecision::GiveUp);
    }

    #[test]
    fn exceeding_max_attempts_gives_up() {
        let r = Reconnector::new(Duration::from_millis(1), Duration::from_millis(10), 2);
        assert!(matches!(r.on_disconnect(DisconnectCause::Unexpected), ReconnectDecision::Wait(_)));
        assert!(matches!(r.on_disconnect(DisconnectCause::Unexpected), ReconnectDecision::Wait(_)));
        assert_eq!(r.on_disconnect(DisconnectCause::Unexpected), ReconnectDecision::GiveUp);
    }
}
