// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared harness for end-to-end stream scenarios: a real broker wired to
//! the in-memory registry and connection doubles, plus deadline-polling
//! helpers.

use std::sync::Arc;
use std::time::Duration;

use termcast::broker::Broker;
use termcast::config::StreamConfig;
use termcast::perf::PerfSink;
use termcast::protocol::StreamMessage;
use termcast::registry::TerminalRegistry;
use termcast::test_support::{CollectingSink, RecordingConnection, ScriptedRegistry};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A broker with scriptable collaborators.
pub struct StreamStack {
    pub registry: Arc<ScriptedRegistry>,
    pub sink: Arc<CollectingSink>,
    pub broker: Broker,
}

/// Install a test log subscriber honoring `RUST_LOG`. Safe to call from
/// every test; repeat installs are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl StreamStack {
    pub fn new(config: StreamConfig) -> Self {
        init_tracing();
        let registry = ScriptedRegistry::new();
        let sink = CollectingSink::new();
        let broker = Broker::new(
            Arc::clone(&registry) as Arc<dyn TerminalRegistry>,
            Arc::clone(&sink) as Arc<dyn PerfSink>,
            config,
        );
        Self { registry, sink, broker }
    }

    /// A config with fast flush retries for test turnaround.
    pub fn quick_config() -> StreamConfig {
        StreamConfig {
            retry_flush_delay: Duration::from_millis(5),
            ..StreamConfig::default()
        }
    }

    /// Attach a fresh recording connection to a terminal.
    pub async fn attach_client(
        &self,
        connection_id: &str,
        terminal_id: &str,
        since_seq: u64,
    ) -> anyhow::Result<Arc<RecordingConnection>> {
        let conn = Arc::new(RecordingConnection::new(connection_id));
        let attached = self
            .broker
            .attach(Arc::clone(&conn) as Arc<dyn termcast::conn::ClientConnection>, terminal_id, since_seq)
            .await;
        anyhow::ensure!(attached, "attach refused for {connection_id}");
        Ok(conn)
    }
}

/// Poll `condition` until it holds or the deadline passes.
pub async fn wait_until(
    what: &str,
    mut condition: impl FnMut() -> bool,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    Ok(())
}

/// Data frames in delivery order as `(seq_start, seq_end, data)`.
pub fn output_frames(msgs: &[StreamMessage]) -> Vec<(u64, u64, String)> {
    msgs.iter()
        .filter_map(|m| match m {
            StreamMessage::Output { seq_start, seq_end, data, .. } => {
                Some((*seq_start, *seq_end, data.clone()))
            }
            _ => None,
        })
        .collect()
}

/// Gap notifications in delivery order as `(from_seq, to_seq)`.
pub fn gap_ranges(msgs: &[StreamMessage]) -> Vec<(u64, u64)> {
    msgs.iter()
        .filter_map(|m| match m {
            StreamMessage::OutputGap { from_seq, to_seq, .. } => Some((*from_seq, *to_seq)),
            _ => None,
        })
        .collect()
}

/// Concatenated payload of all delivered frames.
pub fn delivered_text(msgs: &[StreamMessage]) -> String {
    output_frames(msgs).iter().map(|(_, _, data)| data.as_str()).collect()
}

/// Highest sequence covered by delivered frames and gaps.
pub fn max_delivered_seq(msgs: &[StreamMessage]) -> u64 {
    msgs.iter()
        .map(|m| match m {
            StreamMessage::Output { seq_end, .. } => *seq_end,
            StreamMessage::OutputGap { to_seq, .. } => *to_seq,
            _ => 0,
        })
        .max()
        .unwrap_or(0)
}

/// Assert the delivery-order invariant: `attach.ready` precedes all frames
/// and gaps, whose ranges are strictly increasing and non-overlapping.
pub fn assert_ordered_delivery(msgs: &[StreamMessage]) -> anyhow::Result<()> {
    let mut seen_ready = false;
    let mut last_end = 0u64;
    for msg in msgs {
        match msg {
            StreamMessage::Created { .. } => {}
            StreamMessage::AttachReady { .. } => seen_ready = true,
            StreamMessage::Output { seq_start, seq_end, .. } => {
                anyhow::ensure!(seen_ready, "frame before attach.ready");
                anyhow::ensure!(
                    *seq_start > last_end,
                    "sequence range regressed: {seq_start} after {last_end}"
                );
                anyhow::ensure!(seq_end >= seq_start, "inverted frame range");
                last_end = *seq_end;
            }
            StreamMessage::OutputGap { from_seq, to_seq, .. } => {
                anyhow::ensure!(seen_ready, "gap before attach.ready");
                anyhow::ensure!(
                    *from_seq > last_end,
                    "gap range regressed: {from_seq} after {last_end}"
                );
                anyhow::ensure!(to_seq >= from_seq, "inverted gap range");
                last_end = *to_seq;
            }
        }
    }
    Ok(())
}
