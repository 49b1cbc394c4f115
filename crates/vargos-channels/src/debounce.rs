// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-sender debounce buffer: coalesces bursts of inbound
//! text into a single batch once the sender goes quiet for the configured
//! window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default debounce window: 1500 ms.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(1500);

struct SenderState {
    buffer: Vec<String>,
    generation: u64,
}

/// Keyed by sender id. `push` appends to that sender's buffer and (re)arms
/// a timer; on fire, `on_batch(sender_id, texts.join("\n"))` runs exactly
/// once per quiet period. `cancel_all` drops every pending timer's buffer
/// without flushing it.
pub struct Debouncer {
    delay: Duration,
    state: Mutex<HashMap<String, SenderState>>,
    on_batch: Arc<dyn Fn(String, String) + Send + Sync>,
}

impl Debouncer {
    pub fn new(delay: Duration, on_batch: impl Fn(String, String) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { delay, state: Mutex::new(HashMap::new()), on_batch: Arc::new(on_batch) })
    }

    /// Append `text` to `sender_id`'s buffer and restart its timer.
    pub fn push(self: &Arc<Self>, sender_id: &str, text: &str) {
        let generation = {
            let mut state = self.state.lock().unwrap();
            let entry = state
                .entry(sender_id.to_string())
                .or_insert_with(|| SenderState { buffer: Vec::new(), generation: 0 });
            entry.buffer.push(text.to_string());
            entry.generation += 1;
            entry.generation
        };

        let this = self.clone();
        let sender_id = sender_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(this.delay).await;
            this.maybe_flush(&sender_id, generation);
        });
    }

    /// Fires the batch only if no later push re-armed the timer in the
    /// meantime (`generation` would then have advanced past what this task
    /// captured at push time).
    fn maybe_flush(&self, sender_id: &str, generation: u64) {
        let batch = {
            let mut state = self.state.lock().unwrap();
            let still_current = matches!(state.get(sender_id), Some(entry) if entry.generation == generation);
            if !still_current {
                return;
            }
            state.remove(sender_id).map(|entry| entry.buffer)
        };
        if let Some(texts) = batch {
            if !texts.is_empty() {
                (self.on_batch)(sender_id.to_string(), texts.join("\n"));
            }
        }
    }

    /// Drop every pending sender's buffer without flushing.
    pub fn cancel_all(&self) {
        self.state.lock().unwrap().clear();
    }
}
