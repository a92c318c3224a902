// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client-side continuity tracking for the terminal stream protocol.
//!
//! When a client reattaches, there is a race window where replayed frames
//! and freshly broadcast live frames can cover the same sequence range —
//! for example when a reconnect races a server that already considers the
//! previous attachment live. [`StreamCursor`] tracks the highest delivered
//! sequence per terminal and deduplicates so each sequence is rendered
//! exactly once; the cursor value doubles as the `sinceSeq` for the next
//! attach.

use std::time::Duration;

/// Per-terminal delivery cursor for one client.
#[derive(Debug, Default)]
pub struct StreamCursor {
    last_seq: u64,
}

impl StreamCursor {
    pub fn new() -> Self {
        Self { last_seq: 0 }
    }

    /// Highest sequence rendered so far; pass as `sinceSeq` on reattach.
    pub fn since_seq(&self) -> u64 {
        self.last_seq
    }

    /// Process `terminal.attach.ready`.
    ///
    /// Returns the inclusive range the server can no longer replay when its
    /// window has moved past this client's cursor. The cursor jumps over
    /// the lost range so the matching `replay_window_exceeded` gap (which
    /// the server sends next) dedupes to nothing.
    pub fn on_attach_ready(&mut self, replay_from_seq: u64) -> Option<(u64, u64)> {
        if replay_from_seq > self.last_seq + 1 {
            let lost = (self.last_seq + 1, replay_from_seq - 1);
            self.last_seq = replay_from_seq - 1;
            return Some(lost);
        }
        None
    }

    /// Process `terminal.output`. Returns whether the frame should be
    /// rendered; a frame whose whole range is at or below the cursor is a
    /// duplicate from a reattach race and must be dropped.
    pub fn on_output(&mut self, _seq_start: u64, seq_end: u64) -> bool {
        if seq_end <= self.last_seq {
            return false;
        }
        self.last_seq = seq_end;
        true
    }

    /// Process `terminal.output.gap`. Returns the portion of the dropped
    /// range that was actually news to this client, or `None` when the gap
    /// was already covered.
    pub fn on_gap(&mut self, from_seq: u64, to_seq: u64) -> Option<(u64, u64)> {
        if to_seq <= self.last_seq {
            return None;
        }
        let lost_from = from_seq.max(self.last_seq + 1);
        self.last_seq = to_seq;
        Some((lost_from, to_seq))
    }
}

/// Exponential reconnect backoff: doubles from `base` up to `max`, resets
/// after a successful attach.
#[derive(Debug)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Delay to wait before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        let delay = self.base.saturating_mul(factor).min(self.max);
        if delay < self.max {
            self.attempt += 1;
        }
        delay
    }

    /// Call after a successful attach.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
#[path = "gate_tests.rs"]
mod tests;
