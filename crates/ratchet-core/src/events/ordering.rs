//! Subscriber-side ordered delivery buffer.
//!
//! Holds out-of-order envelopes in a small map and releases them when the
//! gap fills. A gap that persists longer than `max_wait` (default 5 s), or
//! a buffer that outgrows `max_buffer` (default 100), is released in
//! sequence order with a recorded gap warning -- bounded latency wins over
//! strict ordering. Duplicates (sequence id at or below the last released)
//! are discarded.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::EventEnvelope;

/// Tunables for the ordered buffer.
#[derive(Debug, Clone)]
pub struct OrderedBufferConfig {
    /// How long a gap may stall delivery before the buffer flushes past it.
    pub max_wait: Duration,
    /// Maximum held envelopes before a forced flush.
    pub max_buffer: usize,
}

impl Default for OrderedBufferConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(5),
            max_buffer: 100,
        }
    }
}

/// Reorder buffer for one subscription scope.
#[derive(Debug)]
pub struct OrderedBuffer {
    config: OrderedBufferConfig,
    /// Sequence id of the last envelope released to the consumer.
    last_released: i64,
    held: BTreeMap<i64, EventEnvelope>,
    /// When the oldest currently-held envelope arrived.
    holding_since: Option<Instant>,
    gaps: u64,
    duplicates: u64,
}

impl OrderedBuffer {
    pub fn new(config: OrderedBufferConfig) -> Self {
        Self {
            config,
            last_released: 0,
            held: BTreeMap::new(),
            holding_since: None,
            gaps: 0,
            duplicates: 0,
        }
    }

    /// Gaps flushed past so far.
    pub fn gap_count(&self) -> u64 {
        self.gaps
    }

    /// Duplicates discarded so far.
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates
    }

    /// Envelopes currently held back.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Offer an envelope; returns everything now releasable, in order.
    ///
    /// Envelopes without a sequence id bypass ordering entirely.
    pub fn offer(&mut self, envelope: EventEnvelope, now: Instant) -> Vec<EventEnvelope> {
        let Some(seq) = envelope.sequence_id else {
            return vec![envelope];
        };

        if seq <= self.last_released {
            self.duplicates += 1;
            tracing::debug!(sequence_id = seq, "discarding duplicate event");
            return Vec::new();
        }

        self.held.insert(seq, envelope);
        if self.holding_since.is_none() {
            self.holding_since = Some(now);
        }

        let mut released = self.drain_contiguous();

        if !self.held.is_empty() {
            let waited_too_long = self
                .holding_since
                .is_some_and(|since| now.duration_since(since) >= self.config.max_wait);
            if waited_too_long || self.held.len() > self.config.max_buffer {
                released.extend(self.flush_past_gap());
            }
        }

        if self.held.is_empty() {
            self.holding_since = None;
        } else if !released.is_empty() {
            self.holding_since = Some(now);
        }

        released
    }

    /// Force out everything held, in sequence order, recording a gap if
    /// the front does not line up. Used on shutdown and by timer-driven
    /// subscribers when no new event arrives to trigger the flush.
    pub fn flush(&mut self) -> Vec<EventEnvelope> {
        let mut out = self.drain_contiguous();
        out.extend(self.flush_past_gap());
        self.holding_since = None;
        out
    }

    fn drain_contiguous(&mut self) -> Vec<EventEnvelope> {
        let mut out = Vec::new();
        while let Some(entry) = self.held.first_entry() {
            if *entry.key() == self.last_released + 1 {
                let (seq, envelope) = entry.remove_entry();
                self.last_released = seq;
                out.push(envelope);
            } else {
                break;
            }
        }
        out
    }

    fn flush_past_gap(&mut self) -> Vec<EventEnvelope> {
        if self.held.is_empty() {
            return Vec::new();
        }
        self.gaps += 1;
        let expected = self.last_released + 1;
        let front = *self.held.keys().next().expect("held is non-empty");
        tracing::warn!(
            expected_sequence = expected,
            released_from = front,
            held = self.held.len(),
            "releasing events past sequence gap"
        );
        let mut out = Vec::new();
        for (seq, envelope) in std::mem::take(&mut self.held) {
            self.last_released = seq;
            out.push(envelope);
        }
        out
    }
}

impl Default for OrderedBuffer {
    fn default() -> Self {
        Self::new(OrderedBufferConfig::default())
    }
}
