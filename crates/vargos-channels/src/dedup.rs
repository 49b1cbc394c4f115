// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded TTL set keyed by provider message id, grounded in
//! the same `lru` crate `vargos-media`'s image cache already depends on.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// Default dedup TTL: 120 s.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Upper bound on distinct ids tracked at once, independent of TTL — caps
/// memory if a provider sends an unbounded stream of unique ids within one
/// TTL window.
const CAPACITY: usize = 10_000;

/// Bounded TTL set: `insert` returns `true` the first time an id is seen,
/// and `false` for every repeat within the TTL window. Expired entries are
/// swept lazily on insert rather than by a background task.
pub struct DedupCache {
    ttl: Duration,
    seen: Mutex<LruCache<String, Instant>>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, seen: Mutex::new(LruCache::new(NonZeroUsize::new(CAPACITY).unwrap())) }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_TTL)
    }

    /// Insert `id`. Returns `true` if this is the first sighting within the
    /// TTL window (caller should proceed), `false` if a duplicate (caller
    /// should drop the message).
    pub fn insert(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap();
        if let Some(at) = seen.get(id) {
            if now.duration_since(*at) < self.ttl {
                return false;
            }
        }
        seen.put(id.to_string(), now);
        true
    }
}
