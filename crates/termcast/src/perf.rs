// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Structured performance events for the streaming data path.
//!
//! The broker reports replay hits and misses, gap emissions, queue
//! pressure, and catastrophic closes to a [`PerfSink`]. The provided
//! [`TracingPerfSink`] forwards them to `tracing` at the event's severity;
//! deployments with a metrics pipeline plug in their own sink.

use tracing::{info, warn};

use crate::protocol::GapReason;

/// Severity attached to a performance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfLevel {
    Info,
    Warn,
}

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum PerfKind {
    /// Attach served entirely from the replay ring.
    ReplayHit { replayed_frames: usize },
    /// Attach requested state older than the ring tail.
    ReplayMiss { missed_from_seq: u64 },
    /// A gap was emitted to a client.
    Gap { from_seq: u64, to_seq: u64, reason: GapReason },
    /// Queued bytes exceed one batch budget.
    QueuePressure { pending_bytes: usize },
    /// A slow consumer was closed with code 4008.
    CatastrophicClose { buffered_bytes: u64 },
}

/// One structured performance event with its stream context.
#[derive(Debug, Clone, PartialEq)]
pub struct PerfEvent {
    pub terminal_id: String,
    pub connection_id: String,
    pub kind: PerfKind,
}

impl PerfEvent {
    pub fn replay_hit(terminal_id: &str, connection_id: &str, replayed_frames: usize) -> Self {
        Self::new(terminal_id, connection_id, PerfKind::ReplayHit { replayed_frames })
    }

    pub fn replay_miss(terminal_id: &str, connection_id: &str, missed_from_seq: u64) -> Self {
        Self::new(terminal_id, connection_id, PerfKind::ReplayMiss { missed_from_seq })
    }

    pub fn gap(
        terminal_id: &str,
        connection_id: &str,
        from_seq: u64,
        to_seq: u64,
        reason: GapReason,
    ) -> Self {
        Self::new(terminal_id, connection_id, PerfKind::Gap { from_seq, to_seq, reason })
    }

    pub fn queue_pressure(terminal_id: &str, connection_id: &str, pending_bytes: usize) -> Self {
        Self::new(terminal_id, connection_id, PerfKind::QueuePressure { pending_bytes })
    }

    pub fn catastrophic_close(
        terminal_id: &str,
        connection_id: &str,
        buffered_bytes: u64,
    ) -> Self {
        Self::new(terminal_id, connection_id, PerfKind::CatastrophicClose { buffered_bytes })
    }

    fn new(terminal_id: &str, connection_id: &str, kind: PerfKind) -> Self {
        Self { terminal_id: terminal_id.to_owned(), connection_id: connection_id.to_owned(), kind }
    }

    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self.kind {
            PerfKind::ReplayHit { .. } => "terminal_stream_replay_hit",
            PerfKind::ReplayMiss { .. } => "terminal_stream_replay_miss",
            PerfKind::Gap { .. } => "terminal_stream_gap",
            PerfKind::QueuePressure { .. } => "terminal_stream_queue_pressure",
            PerfKind::CatastrophicClose { .. } => "terminal_stream_catastrophic_close",
        }
    }

    /// Severity: queue-overflow gaps, misses, pressure, and catastrophic
    /// closes warn; replay hits and replay-window gaps are informational.
    pub fn level(&self) -> PerfLevel {
        match &self.kind {
            PerfKind::ReplayHit { .. } => PerfLevel::Info,
            PerfKind::Gap { reason: GapReason::ReplayWindowExceeded, .. } => PerfLevel::Info,
            PerfKind::Gap { reason: GapReason::QueueOverflow, .. }
            | PerfKind::ReplayMiss { .. }
            | PerfKind::QueuePressure { .. }
            | PerfKind::CatastrophicClose { .. } => PerfLevel::Warn,
        }
    }
}

/// Records performance events.
pub trait PerfSink: Send + Sync {
    fn record(&self, event: PerfEvent);
}

/// Default sink: forwards events to `tracing`.
pub struct TracingPerfSink;

impl PerfSink for TracingPerfSink {
    fn record(&self, event: PerfEvent) {
        let name = event.name();
        let terminal_id = event.terminal_id.as_str();
        let connection_id = event.connection_id.as_str();
        match event.level() {
            PerfLevel::Info => {
                info!(event = name, terminal_id, connection_id, detail = ?event.kind, "stream perf event");
            }
            PerfLevel::Warn => {
                warn!(event = name, terminal_id, connection_id, detail = ?event.kind, "stream perf event");
            }
        }
    }
}

#[cfg(test)]
#[path = "perf_tests.rs"]
mod tests;
