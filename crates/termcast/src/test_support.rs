// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: scriptable registry, recording connection,
//! and collecting perf sink.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::conn::{ClientConnection, ReadyState};
use crate::perf::{PerfEvent, PerfSink};
use crate::protocol::StreamMessage;
use crate::registry::{AttachHandle, AttachOptions, RegistryEvent, TerminalRegistry};

/// In-memory registry double: events are emitted on demand, attach can be
/// refused per terminal, and pre-broker buffers can be seeded.
pub struct ScriptedRegistry {
    event_tx: broadcast::Sender<RegistryEvent>,
    refused: Mutex<HashSet<String>>,
    buffers: Mutex<HashMap<String, String>>,
    attached: Mutex<Vec<(String, String)>>,
    detached: Mutex<Vec<(String, String)>>,
}

impl ScriptedRegistry {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            event_tx,
            refused: Mutex::new(HashSet::new()),
            buffers: Mutex::new(HashMap::new()),
            attached: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
        })
    }

    /// Refuse subsequent attach calls for this terminal.
    pub fn refuse_attach(&self, terminal_id: &str) {
        self.refused.lock().insert(terminal_id.to_owned());
    }

    /// Seed the pre-broker buffer returned by the next attach handle.
    pub fn seed_buffer(&self, terminal_id: &str, data: &str) {
        self.buffers.lock().insert(terminal_id.to_owned(), data.to_owned());
    }

    pub fn emit_output(&self, terminal_id: &str, data: &str) {
        let _ = self.event_tx.send(RegistryEvent::OutputRaw {
            terminal_id: terminal_id.to_owned(),
            data: data.to_owned(),
        });
    }

    pub fn emit_exit(&self, terminal_id: &str) {
        let _ = self.event_tx.send(RegistryEvent::Exit { terminal_id: terminal_id.to_owned() });
    }

    /// (terminal_id, connection_id) pairs seen by `attach`.
    pub fn attach_log(&self) -> Vec<(String, String)> {
        self.attached.lock().clone()
    }

    /// (terminal_id, connection_id) pairs seen by `detach`.
    pub fn detach_log(&self) -> Vec<(String, String)> {
        self.detached.lock().clone()
    }
}

impl TerminalRegistry for ScriptedRegistry {
    fn attach(
        &self,
        terminal_id: &str,
        conn: Arc<dyn ClientConnection>,
        _options: AttachOptions,
    ) -> Option<AttachHandle> {
        if self.refused.lock().contains(terminal_id) {
            return None;
        }
        self.attached.lock().push((terminal_id.to_owned(), conn.connection_id().to_owned()));
        Some(AttachHandle::new(self.buffers.lock().get(terminal_id).cloned()))
    }

    fn detach(&self, terminal_id: &str, connection_id: &str) -> bool {
        self.detached.lock().push((terminal_id.to_owned(), connection_id.to_owned()));
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }
}

type SendHook = Box<dyn Fn(&StreamMessage) + Send + Sync>;

/// Connection double that records every sent message and lets tests script
/// buffered bytes, ready state, and send failures.
pub struct RecordingConnection {
    id: String,
    sent: Mutex<Vec<StreamMessage>>,
    ready: Mutex<ReadyState>,
    buffered: AtomicU64,
    fail_sends: AtomicBool,
    closes: Mutex<Vec<(u16, String)>>,
    /// Invoked after each successful send, before it is recorded. Only safe
    /// for handshake-phase hooks (flush ticks send while holding the
    /// terminal core lock).
    send_hook: Mutex<Option<SendHook>>,
}

impl RecordingConnection {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            sent: Mutex::new(Vec::new()),
            ready: Mutex::new(ReadyState::Open),
            buffered: AtomicU64::new(0),
            fail_sends: AtomicBool::new(false),
            closes: Mutex::new(Vec::new()),
            send_hook: Mutex::new(None),
        }
    }

    pub fn sent(&self) -> Vec<StreamMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn closes(&self) -> Vec<(u16, String)> {
        self.closes.lock().clone()
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        *self.ready.lock() = state;
    }

    pub fn set_buffered_bytes(&self, bytes: u64) {
        self.buffered.store(bytes, Ordering::Release);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    pub fn set_send_hook(&self, hook: SendHook) {
        *self.send_hook.lock() = Some(hook);
    }

    pub fn clear_send_hook(&self) {
        *self.send_hook.lock() = None;
    }
}

impl ClientConnection for RecordingConnection {
    fn send(&self, message: &StreamMessage) -> bool {
        if self.fail_sends.load(Ordering::Acquire) {
            return false;
        }
        let hook = self.send_hook.lock().take();
        if let Some(hook) = hook {
            hook(message);
            *self.send_hook.lock() = Some(hook);
        }
        self.sent.lock().push(message.clone());
        true
    }

    fn buffered_bytes(&self) -> u64 {
        self.buffered.load(Ordering::Acquire)
    }

    fn ready_state(&self) -> ReadyState {
        *self.ready.lock()
    }

    fn close(&self, code: u16, reason: &str) {
        self.closes.lock().push((code, reason.to_owned()));
        *self.ready.lock() = ReadyState::Closed;
    }

    fn connection_id(&self) -> &str {
        &self.id
    }
}

/// Perf sink that stores every recorded event.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<PerfEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<PerfEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(PerfEvent::name).collect()
    }
}

impl PerfSink for CollectingSink {
    fn record(&self, event: PerfEvent) {
        self.events.lock().push(event);
    }
}
