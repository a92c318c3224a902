// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-attachment outbound queue.
//!
//! Holds copies of ring frames awaiting delivery to one client. The queue
//! has its own byte budget; when it overflows, the oldest frames are
//! evicted and folded into a single pending gap that is reported to the
//! client before the next data frame. Dequeue coalesces adjacent frames so
//! bursty terminals don't pay per-frame framing overhead on the wire.

use std::collections::VecDeque;

use crate::frame::Frame;
use crate::protocol::GapReason;

/// One element of a dequeued batch, in emission order.
#[derive(Debug)]
pub enum BatchItem {
    Frame(Frame),
    Gap { from_seq: u64, to_seq: u64, reason: GapReason },
}

#[derive(Debug, Clone, Copy)]
struct PendingGap {
    from_seq: u64,
    to_seq: u64,
}

/// Byte-budgeted outbound frame queue for a single attachment.
#[derive(Debug)]
pub struct ClientOutputQueue {
    frames: VecDeque<Frame>,
    total_bytes: usize,
    max_bytes: usize,
    /// At most one; widened as eviction proceeds, emitted before the next
    /// data frames.
    pending_gap: Option<PendingGap>,
}

impl ClientOutputQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self { frames: VecDeque::new(), total_bytes: 0, max_bytes, pending_gap: None }
    }

    /// Append a frame, evicting from the head if the budget overflows.
    /// Every evicted range widens the pending overflow gap.
    pub fn enqueue(&mut self, frame: Frame) {
        self.total_bytes += frame.bytes;
        self.frames.push_back(frame);

        while self.total_bytes > self.max_bytes {
            let Some(evicted) = self.frames.pop_front() else {
                break;
            };
            self.total_bytes -= evicted.bytes;
            match &mut self.pending_gap {
                Some(gap) => {
                    gap.from_seq = gap.from_seq.min(evicted.seq_start);
                    gap.to_seq = gap.to_seq.max(evicted.seq_end);
                }
                None => {
                    self.pending_gap =
                        Some(PendingGap { from_seq: evicted.seq_start, to_seq: evicted.seq_end });
                }
            }
        }
    }

    /// Dequeue up to `budget` bytes of frames, gap first.
    ///
    /// The head frame is always taken even when it alone exceeds the budget,
    /// so a single oversized frame cannot starve the flush loop. After each
    /// pop, adjacent successors that fit the remaining budget are merged
    /// into the popped frame; a sequence discontinuity starts a new item.
    pub fn next_batch(&mut self, budget: usize) -> Vec<BatchItem> {
        let mut out = Vec::new();

        if let Some(gap) = self.pending_gap.take() {
            out.push(BatchItem::Gap {
                from_seq: gap.from_seq,
                to_seq: gap.to_seq,
                reason: GapReason::QueueOverflow,
            });
        }

        let mut remaining = budget;
        let mut emitted_data = false;
        while let Some(head) = self.frames.front() {
            if head.bytes > remaining && emitted_data {
                break;
            }
            let mut frame = match self.frames.pop_front() {
                Some(f) => f,
                None => break,
            };
            self.total_bytes -= frame.bytes;
            remaining = remaining.saturating_sub(frame.bytes);
            emitted_data = true;

            while let Some(next) = self.frames.front() {
                if next.seq_start != frame.seq_end + 1 || next.bytes > remaining {
                    break;
                }
                let Some(next) = self.frames.pop_front() else {
                    break;
                };
                self.total_bytes -= next.bytes;
                remaining -= next.bytes;
                frame.absorb(next);
            }

            out.push(BatchItem::Frame(frame));
            if remaining == 0 {
                break;
            }
        }

        out
    }

    /// Bytes currently queued.
    pub fn pending_bytes(&self) -> usize {
        self.total_bytes
    }

    /// True when neither frames nor a pending gap are waiting.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.pending_gap.is_none()
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
