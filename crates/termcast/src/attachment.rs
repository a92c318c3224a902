// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-(connection, terminal) attachment state.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::AbortHandle;

use crate::conn::ClientConnection;
use crate::frame::Frame;
use crate::queue::ClientOutputQueue;

/// Delivery mode of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// Attach handshake in flight: live frames go to staging, nothing is
    /// delivered from the queue.
    Attaching,
    /// Steady state: live frames go to the queue and flush to the wire.
    Live,
}

/// The record the broker keeps for one client's subscription to one
/// terminal.
pub struct Attachment {
    pub conn: Arc<dyn ClientConnection>,
    pub mode: AttachMode,
    /// Greatest `seq_end` already delivered (or covered by a gap's
    /// `to_seq`). Non-decreasing for the life of the attachment.
    pub last_seq: u64,
    /// Live frames that arrived while the handshake was in flight.
    pub staging: Vec<Frame>,
    pub queue: ClientOutputQueue,
    /// At most one outstanding deferred flush.
    pub flush_task: Option<AbortHandle>,
    /// When outgoing buffered bytes first exceeded the catastrophic
    /// threshold; unset while healthy.
    pub catastrophic_since: Option<Instant>,
    /// Once set the attachment will only ever be detached.
    pub catastrophic_closed: bool,
}

impl Attachment {
    pub fn new(conn: Arc<dyn ClientConnection>, queue_max_bytes: usize) -> Self {
        Self {
            conn,
            mode: AttachMode::Attaching,
            last_seq: 0,
            staging: Vec::new(),
            queue: ClientOutputQueue::new(queue_max_bytes),
            flush_task: None,
            catastrophic_since: None,
            catastrophic_closed: false,
        }
    }

    /// Reset for a (re)attach handshake.
    ///
    /// Staging and the outbound queue are cleared — the handshake recomputes
    /// everything at or after the client's requested sequence, and stale
    /// queued frames would otherwise be delivered twice. `last_seq` is
    /// retained; it only ever moves forward.
    pub fn begin_attach(&mut self, queue_max_bytes: usize) {
        self.mode = AttachMode::Attaching;
        self.staging.clear();
        self.queue = ClientOutputQueue::new(queue_max_bytes);
        self.cancel_flush();
    }

    /// Record a delivered frame or gap upper bound.
    pub fn note_delivered(&mut self, seq: u64) {
        self.last_seq = self.last_seq.max(seq);
    }

    /// Abort the pending deferred flush, if any.
    pub fn cancel_flush(&mut self) {
        if let Some(handle) = self.flush_task.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "attachment_tests.rs"]
mod tests;
