// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal registry abstraction consumed by the broker.
//!
//! The registry owns the terminal processes and publishes their raw output
//! and exit events over a broadcast channel. The broker treats it as an
//! untrusted producer: events may arrive from arbitrary tasks and the
//! broker does its own synchronisation.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::conn::ClientConnection;

/// Events published by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// Raw terminal output, already UTF-8 decoded by the registry.
    OutputRaw { terminal_id: String, data: String },
    /// The terminal process ended.
    Exit { terminal_id: String },
}

/// Options for [`TerminalRegistry::attach`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachOptions {
    /// Suppress the registry's own output delivery for this connection;
    /// the broker takes over sequencing and replay.
    pub suppress_output: bool,
}

/// Handle returned by a successful registry attach.
pub struct AttachHandle {
    buffer: Option<String>,
}

impl AttachHandle {
    pub fn new(buffer: Option<String>) -> Self {
        Self { buffer }
    }

    /// Output the terminal produced before the broker was wired up, if any.
    pub fn snapshot(&self) -> Option<&str> {
        self.buffer.as_deref()
    }
}

/// Source of terminal events and attach/detach bookkeeping.
pub trait TerminalRegistry: Send + Sync {
    /// Register a connection with a terminal. `None` means the registry
    /// refuses the attach (unknown terminal, admission policy).
    fn attach(
        &self,
        terminal_id: &str,
        conn: Arc<dyn ClientConnection>,
        options: AttachOptions,
    ) -> Option<AttachHandle>;

    /// Unregister a connection from a terminal. Returns whether the
    /// registry considered it attached.
    fn detach(&self, terminal_id: &str, connection_id: &str) -> bool;

    /// Subscribe to the registry's event stream.
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}
