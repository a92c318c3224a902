// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire message types for the terminal stream protocol.
//!
//! Messages use internally-tagged JSON enums (`{"type": "terminal.output",
//! ...}`). Field names are part of the protocol; clients key their dedupe
//! and gap handling off `seqStart`/`seqEnd`/`fromSeq`/`toSeq` exactly as
//! spelled here.

use serde::{Deserialize, Serialize};

/// Application close code: authentication failed.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
/// Application close code: handshake timed out.
pub const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4002;
/// Application close code: admission limit reached.
pub const CLOSE_ADMISSION_LIMIT: u16 = 4003;
/// Application close code: slow consumer evicted under backpressure.
pub const CLOSE_CATASTROPHIC_BACKPRESSURE: u16 = 4008;
/// Application close code: server shutting down.
pub const CLOSE_SERVER_SHUTDOWN: u16 = 4009;

/// Why a contiguous sequence range was dropped for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapReason {
    /// The client's outbound queue overflowed its byte budget.
    QueueOverflow,
    /// The requested replay start predates the replay ring's tail.
    ReplayWindowExceeded,
}

/// The `terminal.created` envelope, forwarded verbatim to the creating
/// client before its attach begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedEnvelope {
    pub request_id: String,
    pub terminal_id: String,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_resume_session_id: Option<String>,
}

/// Messages sent by the broker to attached clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamMessage {
    #[serde(rename = "terminal.created", rename_all = "camelCase")]
    Created {
        request_id: String,
        terminal_id: String,
        created_at: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        effective_resume_session_id: Option<String>,
    },
    /// Emitted exactly once per successful attach, before any frames or
    /// gaps for that attach.
    #[serde(rename = "terminal.attach.ready", rename_all = "camelCase")]
    AttachReady {
        terminal_id: String,
        head_seq: u64,
        replay_from_seq: u64,
        replay_to_seq: u64,
    },
    /// Sequenced output. Ranges are strictly non-overlapping and
    /// non-decreasing per attachment.
    #[serde(rename = "terminal.output", rename_all = "camelCase")]
    Output {
        terminal_id: String,
        seq_start: u64,
        seq_end: u64,
        data: String,
    },
    /// A range that was deliberately dropped; always delivered before the
    /// next data frame so clients never see a silent jump in `seqStart`.
    #[serde(rename = "terminal.output.gap", rename_all = "camelCase")]
    OutputGap {
        terminal_id: String,
        from_seq: u64,
        to_seq: u64,
        reason: GapReason,
    },
}

impl StreamMessage {
    /// The terminal this message belongs to.
    pub fn terminal_id(&self) -> &str {
        match self {
            Self::Created { terminal_id, .. }
            | Self::AttachReady { terminal_id, .. }
            | Self::Output { terminal_id, .. }
            | Self::OutputGap { terminal_id, .. } => terminal_id,
        }
    }
}

impl From<CreatedEnvelope> for StreamMessage {
    fn from(envelope: CreatedEnvelope) -> Self {
        Self::Created {
            request_id: envelope.request_id,
            terminal_id: envelope.terminal_id,
            created_at: envelope.created_at,
            effective_resume_session_id: envelope.effective_resume_session_id,
        }
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
