// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The terminal output streaming broker.
//!
//! Consumes raw output and exit events from a [`TerminalRegistry`] and
//! delivers sequenced, replayable, gap-reported output to any number of
//! attached client connections. Each terminal owns a replay ring; each
//! attachment owns an outbound queue with its own byte budget, so one slow
//! client can never hold back the terminal or its other viewers.
//!
//! Locking layers, in acquisition order:
//! 1. the terminal map,
//! 2. a per-terminal async attach gate (fair FIFO) serialising whole attach
//!    handshakes,
//! 3. a per-terminal core mutex over ring + attachments, held only for
//!    short non-awaiting sections,
//! 4. the connection reverse index.
//!
//! The handshake releases the core lock while replay frames are written to
//! the connection; live frames arriving in that window are staged on the
//! attachment and drained before it goes live, so a joining client sees
//! replay, staged, and live traffic exactly once and in order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attachment::{AttachMode, Attachment};
use crate::config::StreamConfig;
use crate::conn::{ClientConnection, ReadyState};
use crate::frame::Frame;
use crate::perf::{PerfEvent, PerfSink};
use crate::protocol::{
    CreatedEnvelope, GapReason, StreamMessage, CLOSE_CATASTROPHIC_BACKPRESSURE,
};
use crate::queue::BatchItem;
use crate::registry::{AttachOptions, RegistryEvent, TerminalRegistry};
use crate::ring::ReplayRing;

/// Streams sequenced terminal output to attached clients.
pub struct Broker {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<dyn TerminalRegistry>,
    sink: Arc<dyn PerfSink>,
    config: StreamConfig,
    terminals: Mutex<HashMap<String, Arc<Terminal>>>,
    /// connection_id → terminals it is attached to, so a closing connection
    /// detaches everywhere without scanning.
    by_conn: Mutex<HashMap<String, HashSet<String>>>,
    shutdown: CancellationToken,
}

struct Terminal {
    id: String,
    /// Serialises attach handshakes for this terminal against each other.
    attach_gate: tokio::sync::Mutex<()>,
    core: Mutex<TerminalCore>,
}

struct TerminalCore {
    ring: ReplayRing,
    attachments: HashMap<String, Attachment>,
}

/// Verdict of the per-flush backpressure check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backpressure {
    Healthy,
    Blocked,
}

/// What a flush tick decided to do after its locked section.
enum TickOutcome {
    Detach,
    Reschedule(Duration),
    Idle,
}

impl Broker {
    /// Construct a broker and start consuming registry events.
    ///
    /// Must be called from within a tokio runtime; the event loop runs as a
    /// background task until [`Broker::close`] or the registry's event
    /// channel closes.
    pub fn new(
        registry: Arc<dyn TerminalRegistry>,
        sink: Arc<dyn PerfSink>,
        config: StreamConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            registry,
            sink,
            config,
            terminals: Mutex::new(HashMap::new()),
            by_conn: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        let events = inner.registry.subscribe();
        tokio::spawn(run_events(Arc::clone(&inner), events));
        Self { inner }
    }

    /// Deliver the `terminal.created` envelope to the client, then attach it
    /// to that terminal.
    pub async fn send_created_and_attach(
        &self,
        conn: Arc<dyn ClientConnection>,
        created: CreatedEnvelope,
        since_seq: u64,
    ) -> bool {
        let terminal_id = created.terminal_id.clone();
        if !conn.send(&StreamMessage::from(created)) {
            return false;
        }
        self.attach(conn, &terminal_id, since_seq).await
    }

    /// Attach a connection to a terminal, replaying from `since_seq`.
    ///
    /// Returns `false` only when the registry refuses the attach. A
    /// connection that dies mid-handshake is abandoned for the close
    /// handler ([`Broker::detach_all_for_conn`]) to reap.
    pub async fn attach(
        &self,
        conn: Arc<dyn ClientConnection>,
        terminal_id: &str,
        since_seq: u64,
    ) -> bool {
        let inner = &self.inner;
        let terminal = inner.terminal_entry(terminal_id);
        let _gate = terminal.attach_gate.lock().await;

        let conn_id = conn.connection_id().to_owned();
        let Some(handle) = inner.registry.attach(
            terminal_id,
            Arc::clone(&conn),
            AttachOptions { suppress_output: true },
        ) else {
            debug!(terminal_id, connection_id = conn_id.as_str(), "registry refused attach");
            return false;
        };

        // Register the attachment and capture the replay window. Live
        // frames from here on are staged until the attachment goes live.
        let (replay, head_seq, replay_from_seq, replay_to_seq) = {
            let mut core = terminal.core.lock();
            let att = core
                .attachments
                .entry(conn_id.clone())
                .or_insert_with(|| Attachment::new(Arc::clone(&conn), inner.config.queue_max_bytes));
            att.begin_attach(inner.config.queue_max_bytes);

            if core.ring.head_seq() == 0 {
                if let Some(snapshot) = handle.snapshot() {
                    if !snapshot.is_empty() {
                        core.ring.append(snapshot);
                    }
                }
            }

            let replay = core.ring.replay_since(since_seq);
            let head_seq = core.ring.head_seq();
            let (from, to) = match (replay.frames.first(), replay.frames.last()) {
                (Some(first), Some(last)) => (first.seq_start, last.seq_end),
                _ => (head_seq + 1, head_seq),
            };

            let mut by_conn = inner.by_conn.lock();
            by_conn.entry(conn_id.clone()).or_default().insert(terminal_id.to_owned());

            (replay, head_seq, from, to)
        };

        match replay.missed_from_seq {
            Some(missed) => inner.sink.record(PerfEvent::replay_miss(terminal_id, &conn_id, missed)),
            None => {
                inner
                    .sink
                    .record(PerfEvent::replay_hit(terminal_id, &conn_id, replay.frames.len()));
            }
        }

        // Bring the client into continuity: readiness, the missed-prefix
        // gap if the window moved past `since_seq`, then the replay frames.
        let ready = StreamMessage::AttachReady {
            terminal_id: terminal_id.to_owned(),
            head_seq,
            replay_from_seq,
            replay_to_seq,
        };
        if !conn.send(&ready) {
            return true;
        }

        let mut delivered_seq = 0u64;
        if let Some(missed_from_seq) = replay.missed_from_seq {
            let missed_to_seq = replay_from_seq.saturating_sub(1);
            if missed_to_seq >= missed_from_seq {
                let gap = StreamMessage::OutputGap {
                    terminal_id: terminal_id.to_owned(),
                    from_seq: missed_from_seq,
                    to_seq: missed_to_seq,
                    reason: GapReason::ReplayWindowExceeded,
                };
                if !conn.send(&gap) {
                    return true;
                }
                inner.sink.record(PerfEvent::gap(
                    terminal_id,
                    &conn_id,
                    missed_from_seq,
                    missed_to_seq,
                    GapReason::ReplayWindowExceeded,
                ));
                delivered_seq = missed_to_seq;
            }
        }

        for frame in &replay.frames {
            let msg = StreamMessage::Output {
                terminal_id: terminal_id.to_owned(),
                seq_start: frame.seq_start,
                seq_end: frame.seq_end,
                data: frame.data.clone(),
            };
            if !conn.send(&msg) {
                inner.record_handshake_progress(&terminal, &conn_id, delivered_seq);
                return true;
            }
            delivered_seq = delivered_seq.max(frame.seq_end);
        }

        // Frames that arrived while replay was being written are waiting in
        // staging; anything replay already covered is dropped here.
        let staged: Vec<Frame> = {
            let mut core = terminal.core.lock();
            let Some(att) = core.attachments.get_mut(&conn_id) else {
                return true;
            };
            att.note_delivered(delivered_seq);
            att.staging.retain(|f| f.seq_start > replay_to_seq);
            att.staging.drain(..).collect()
        };

        for frame in &staged {
            let msg = StreamMessage::Output {
                terminal_id: terminal_id.to_owned(),
                seq_start: frame.seq_start,
                seq_end: frame.seq_end,
                data: frame.data.clone(),
            };
            if !conn.send(&msg) {
                inner.record_handshake_progress(&terminal, &conn_id, delivered_seq);
                return true;
            }
            delivered_seq = delivered_seq.max(frame.seq_end);
        }

        // Go live. Frames staged while the drain above was on the wire move
        // into the queue; the flush loop owns delivery from here.
        {
            let mut core = terminal.core.lock();
            let Some(att) = core.attachments.get_mut(&conn_id) else {
                return true;
            };
            att.note_delivered(delivered_seq);
            att.mode = AttachMode::Live;
            let last_seq = att.last_seq;
            let residual: Vec<Frame> = att.staging.drain(..).collect();
            for frame in residual {
                if frame.seq_start > last_seq {
                    att.queue.enqueue(frame);
                }
            }
            let needs_flush = att.queue.pending_bytes() > 0;
            if needs_flush {
                inner.schedule_flush(&terminal, &mut core, &conn_id, Duration::ZERO);
            }
        }

        debug!(
            terminal_id,
            connection_id = conn_id.as_str(),
            head_seq,
            since_seq,
            "attachment live"
        );
        true
    }

    /// Detach one connection from one terminal. Idempotent; returns whether
    /// an attachment was actually removed.
    pub fn detach(&self, terminal_id: &str, connection_id: &str) -> bool {
        let Some(terminal) = self.inner.terminal(terminal_id) else {
            return false;
        };
        let mut core = terminal.core.lock();
        self.inner.remove_attachment(&terminal, &mut core, connection_id)
    }

    /// Detach a connection from every terminal it is attached to. Called by
    /// the transport when the connection closes.
    pub fn detach_all_for_conn(&self, connection_id: &str) {
        let terminal_ids: Vec<String> = self
            .inner
            .by_conn
            .lock()
            .get(connection_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for terminal_id in terminal_ids {
            let Some(terminal) = self.inner.terminal(&terminal_id) else {
                continue;
            };
            let mut core = terminal.core.lock();
            self.inner.remove_attachment(&terminal, &mut core, connection_id);
        }
    }

    /// Number of connections currently attached to a terminal.
    pub fn attached_client_count(&self, terminal_id: &str) -> usize {
        self.inner
            .terminal(terminal_id)
            .map_or(0, |terminal| terminal.core.lock().attachments.len())
    }

    /// Stop the event loop, cancel every pending flush, and drop all
    /// per-terminal state. After close no timers fire and nothing is sent.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        let terminals: Vec<Arc<Terminal>> =
            self.inner.terminals.lock().drain().map(|(_, t)| t).collect();
        for terminal in terminals {
            let mut core = terminal.core.lock();
            for att in core.attachments.values_mut() {
                att.cancel_flush();
            }
            core.attachments.clear();
        }
        self.inner.by_conn.lock().clear();
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Registry event loop: ingest and exit, until shutdown or channel close.
async fn run_events(inner: Arc<Inner>, mut events: broadcast::Receiver<RegistryEvent>) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "registry event stream lagged, output frames lost");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = inner.shutdown.cancelled() => break,
        };
        match event {
            RegistryEvent::OutputRaw { terminal_id, data } => inner.ingest(&terminal_id, &data),
            RegistryEvent::Exit { terminal_id } => inner.terminal_exit(&terminal_id),
        }
    }
    debug!("registry event loop stopped");
}

impl Inner {
    fn terminal(&self, terminal_id: &str) -> Option<Arc<Terminal>> {
        self.terminals.lock().get(terminal_id).cloned()
    }

    fn terminal_entry(self: &Arc<Self>, terminal_id: &str) -> Arc<Terminal> {
        let mut terminals = self.terminals.lock();
        Arc::clone(terminals.entry(terminal_id.to_owned()).or_insert_with(|| {
            Arc::new(Terminal {
                id: terminal_id.to_owned(),
                attach_gate: tokio::sync::Mutex::new(()),
                core: Mutex::new(TerminalCore {
                    ring: ReplayRing::new(self.config.ring_max_bytes),
                    attachments: HashMap::new(),
                }),
            })
        }))
    }

    /// Route one raw output event: append to the ring, then stage or
    /// enqueue per attachment. Never waits for a slow client.
    fn ingest(self: &Arc<Self>, terminal_id: &str, data: &str) {
        let terminal = self.terminal_entry(terminal_id);
        let mut core = terminal.core.lock();
        let frame = core.ring.append(data);
        if frame.bytes < data.len() && self.config.warn_on_truncated_append {
            warn!(
                terminal_id,
                kept = frame.bytes,
                dropped = data.len() - frame.bytes,
                "oversized append truncated to ring budget"
            );
        }

        let mut to_flush = Vec::new();
        for (conn_id, att) in core.attachments.iter_mut() {
            match att.mode {
                AttachMode::Attaching => att.staging.push(frame.clone()),
                AttachMode::Live => {
                    att.queue.enqueue(frame.clone());
                    to_flush.push(conn_id.clone());
                }
            }
        }
        for conn_id in to_flush {
            self.schedule_flush(&terminal, &mut core, &conn_id, Duration::ZERO);
        }
    }

    /// The terminal is gone: cancel timers and drop all stream state. The
    /// registry emits its own connection-level notifications.
    fn terminal_exit(&self, terminal_id: &str) {
        let Some(terminal) = self.terminals.lock().remove(terminal_id) else {
            return;
        };
        let mut core = terminal.core.lock();
        let mut by_conn = self.by_conn.lock();
        for (conn_id, att) in core.attachments.iter_mut() {
            att.cancel_flush();
            unlink(&mut by_conn, conn_id, terminal_id);
        }
        drop(by_conn);
        core.attachments.clear();
        debug!(terminal_id, "terminal exited, stream state dropped");
    }

    /// Arrange a flush tick for an attachment. No-op when one is already
    /// outstanding.
    fn schedule_flush(
        self: &Arc<Self>,
        terminal: &Arc<Terminal>,
        core: &mut TerminalCore,
        conn_id: &str,
        delay: Duration,
    ) {
        let Some(att) = core.attachments.get_mut(conn_id) else {
            return;
        };
        if att.flush_task.is_some() {
            return;
        }
        let inner = Arc::clone(self);
        let terminal_id = terminal.id.clone();
        let conn_id = conn_id.to_owned();
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            inner.flush_tick(&terminal_id, &conn_id);
        });
        att.flush_task = Some(task.abort_handle());
    }

    /// One flush pass for one attachment.
    fn flush_tick(self: &Arc<Self>, terminal_id: &str, conn_id: &str) {
        let Some(terminal) = self.terminal(terminal_id) else {
            return;
        };
        let mut core = terminal.core.lock();

        let outcome = {
            let Some(att) = core.attachments.get_mut(conn_id) else {
                return;
            };
            att.flush_task = None;

            if att.mode == AttachMode::Attaching {
                // The handshake owns delivery until the attachment is live.
                TickOutcome::Idle
            } else if att.conn.ready_state() != ReadyState::Open {
                TickOutcome::Detach
            } else {
                let was_catastrophic_closed = att.catastrophic_closed;
                match self.check_backpressure(terminal_id, att) {
                    Backpressure::Blocked => {
                        if was_catastrophic_closed {
                            TickOutcome::Detach
                        } else if att.queue.pending_bytes() > 0 {
                            TickOutcome::Reschedule(self.config.retry_flush_delay)
                        } else {
                            TickOutcome::Idle
                        }
                    }
                    Backpressure::Healthy => self.drain_batch(terminal_id, conn_id, att),
                }
            }
        };

        match outcome {
            TickOutcome::Detach => {
                self.remove_attachment(&terminal, &mut core, conn_id);
            }
            TickOutcome::Reschedule(delay) => {
                self.schedule_flush(&terminal, &mut core, conn_id, delay);
            }
            TickOutcome::Idle => {}
        }
    }

    /// Send one batch from the queue, advancing `last_seq` per item.
    fn drain_batch(&self, terminal_id: &str, conn_id: &str, att: &mut Attachment) -> TickOutcome {
        if att.queue.pending_bytes() > self.config.batch_max_bytes {
            self.sink.record(PerfEvent::queue_pressure(
                terminal_id,
                conn_id,
                att.queue.pending_bytes(),
            ));
        }

        for item in att.queue.next_batch(self.config.batch_max_bytes) {
            match item {
                BatchItem::Gap { from_seq, to_seq, reason } => {
                    let msg = StreamMessage::OutputGap {
                        terminal_id: terminal_id.to_owned(),
                        from_seq,
                        to_seq,
                        reason,
                    };
                    if !att.conn.send(&msg) {
                        return TickOutcome::Detach;
                    }
                    att.note_delivered(to_seq);
                    self.sink.record(PerfEvent::gap(terminal_id, conn_id, from_seq, to_seq, reason));
                }
                BatchItem::Frame(frame) => {
                    let msg = StreamMessage::Output {
                        terminal_id: terminal_id.to_owned(),
                        seq_start: frame.seq_start,
                        seq_end: frame.seq_end,
                        data: frame.data,
                    };
                    if !att.conn.send(&msg) {
                        return TickOutcome::Detach;
                    }
                    att.note_delivered(frame.seq_end);
                }
            }
        }

        if att.queue.pending_bytes() > 0 {
            TickOutcome::Reschedule(Duration::ZERO)
        } else {
            TickOutcome::Idle
        }
    }

    /// Catastrophic-backpressure policy: arm, wait out the grace window,
    /// close.
    ///
    /// Healthy clears the arm timestamp. Blocked arms it, and once the
    /// stall outlives the grace window the connection is closed with 4008;
    /// the attachment is reaped on a later tick.
    fn check_backpressure(&self, terminal_id: &str, att: &mut Attachment) -> Backpressure {
        let buffered = att.conn.buffered_bytes();
        if buffered <= self.config.catastrophic_buffered_bytes {
            att.catastrophic_since = None;
            return Backpressure::Healthy;
        }

        let now = Instant::now();
        match att.catastrophic_since {
            None => {
                att.catastrophic_since = Some(now);
            }
            Some(_) if att.catastrophic_closed => {}
            Some(since) if now.duration_since(since) >= self.config.catastrophic_stall => {
                att.catastrophic_closed = true;
                self.sink.record(PerfEvent::catastrophic_close(
                    terminal_id,
                    att.conn.connection_id(),
                    buffered,
                ));
                warn!(
                    terminal_id,
                    connection_id = att.conn.connection_id(),
                    buffered,
                    "catastrophic backpressure, closing connection"
                );
                att.conn.close(CLOSE_CATASTROPHIC_BACKPRESSURE, "Catastrophic backpressure");
            }
            Some(_) => {}
        }
        Backpressure::Blocked
    }

    /// Fold handshake delivery progress back into the attachment after an
    /// aborted handshake, so a later reattach reports gaps honestly.
    fn record_handshake_progress(&self, terminal: &Terminal, conn_id: &str, delivered_seq: u64) {
        let mut core = terminal.core.lock();
        if let Some(att) = core.attachments.get_mut(conn_id) {
            att.note_delivered(delivered_seq);
        }
    }

    /// Drop one attachment: cancel its flush, tell the registry, unlink the
    /// reverse index. Idempotent.
    fn remove_attachment(
        &self,
        terminal: &Terminal,
        core: &mut TerminalCore,
        conn_id: &str,
    ) -> bool {
        let Some(mut att) = core.attachments.remove(conn_id) else {
            return false;
        };
        att.cancel_flush();
        self.registry.detach(&terminal.id, conn_id);
        let mut by_conn = self.by_conn.lock();
        unlink(&mut by_conn, conn_id, &terminal.id);
        debug!(
            terminal_id = terminal.id.as_str(),
            connection_id = conn_id,
            last_seq = att.last_seq,
            "attachment removed"
        );
        true
    }
}

/// Remove one (connection, terminal) edge from the reverse index.
fn unlink(by_conn: &mut HashMap<String, HashSet<String>>, conn_id: &str, terminal_id: &str) {
    let emptied = match by_conn.get_mut(conn_id) {
        Some(set) => {
            set.remove(terminal_id);
            set.is_empty()
        }
        None => false,
    };
    if emptied {
        by_conn.remove(conn_id);
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
