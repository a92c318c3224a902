// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios for the terminal output stream: attach, replay,
//! coalescing, overflow gaps, replay-window gaps, concurrent attach, and
//! catastrophic backpressure.

use std::time::Duration;

use termcast::perf::PerfKind;
use termcast::protocol::{GapReason, StreamMessage};

use termcast_specs::{
    assert_ordered_delivery, delivered_text, gap_ranges, max_delivered_seq, output_frames,
    wait_until, StreamStack,
};

fn ready(terminal_id: &str, head: u64, from: u64, to: u64) -> StreamMessage {
    StreamMessage::AttachReady {
        terminal_id: terminal_id.to_owned(),
        head_seq: head,
        replay_from_seq: from,
        replay_to_seq: to,
    }
}

// ===== 1. basic delivery =====================================================

#[tokio::test]
async fn basic_delivery() -> anyhow::Result<()> {
    let mut config = StreamStack::quick_config();
    config.ring_max_bytes = 1024;
    config.queue_max_bytes = 1024;
    config.batch_max_bytes = 1024;
    let stack = StreamStack::new(config);

    let conn = stack.attach_client("c1", "t1", 0).await?;
    assert_eq!(conn.sent()[0], ready("t1", 0, 1, 0));

    stack.registry.emit_output("t1", "hello");
    wait_until("hello delivered", || max_delivered_seq(&conn.sent()) == 1).await?;

    assert_eq!(output_frames(&conn.sent()), vec![(1, 1, "hello".to_owned())]);
    assert!(gap_ranges(&conn.sent()).is_empty());
    assert_ordered_delivery(&conn.sent())
}

// ===== 2. coalescing =========================================================

#[tokio::test]
async fn back_to_back_ingest_coalesces() -> anyhow::Result<()> {
    let stack = StreamStack::new(StreamStack::quick_config());

    let observer = stack.attach_client("observer", "t1", 0).await?;
    let conn = stack.attach_client("c1", "t1", 0).await?;
    // Park this client's flush loop so the burst queues up whole.
    conn.set_buffered_bytes(u64::MAX);

    for s in ["he", "ll", "o"] {
        stack.registry.emit_output("t1", s);
    }
    // The observer confirms all three ingests ran (ingest is serialized
    // per terminal, so the blocked client's queue holds all three too).
    wait_until("observer caught up", || max_delivered_seq(&observer.sent()) == 3).await?;

    conn.set_buffered_bytes(0);
    wait_until("burst delivered", || max_delivered_seq(&conn.sent()) == 3).await?;

    assert_eq!(output_frames(&conn.sent()), vec![(1, 3, "hello".to_owned())]);
    assert_ordered_delivery(&conn.sent())
}

// ===== 3. queue overflow gap =================================================

#[tokio::test]
async fn overflow_gap_precedes_surviving_frames() -> anyhow::Result<()> {
    let mut config = StreamStack::quick_config();
    config.queue_max_bytes = 2;
    let stack = StreamStack::new(config);

    let observer = stack.attach_client("observer", "t1", 0).await?;
    let conn = stack.attach_client("c1", "t1", 0).await?;
    conn.set_buffered_bytes(u64::MAX);

    for s in ["1", "2", "3", "4", "5"] {
        stack.registry.emit_output("t1", s);
    }
    wait_until("observer caught up", || max_delivered_seq(&observer.sent()) == 5).await?;

    conn.set_buffered_bytes(0);
    wait_until("client caught up", || max_delivered_seq(&conn.sent()) == 5).await?;

    let sent = conn.sent();
    assert_eq!(
        sent[1],
        StreamMessage::OutputGap {
            terminal_id: "t1".to_owned(),
            from_seq: 1,
            to_seq: 3,
            reason: GapReason::QueueOverflow,
        }
    );
    assert_eq!(output_frames(&sent), vec![(4, 5, "45".to_owned())]);
    // Dropped sequences are never delivered later.
    assert_eq!(delivered_text(&sent), "45");
    assert_ordered_delivery(&sent)
}

// ===== 4. replay window exceeded =============================================

#[tokio::test]
async fn reattach_behind_ring_tail_reports_window_gap() -> anyhow::Result<()> {
    let mut config = StreamStack::quick_config();
    config.ring_max_bytes = 2;
    let stack = StreamStack::new(config);

    let observer = stack.attach_client("observer", "t1", 0).await?;
    for s in ["1", "2", "3", "4", "5"] {
        stack.registry.emit_output("t1", s);
    }
    wait_until("observer caught up", || max_delivered_seq(&observer.sent()) == 5).await?;

    let late = stack.attach_client("late", "t1", 2).await?;
    let sent = late.sent();
    assert_eq!(sent[0], ready("t1", 5, 4, 5));
    assert_eq!(
        sent[1],
        StreamMessage::OutputGap {
            terminal_id: "t1".to_owned(),
            from_seq: 3,
            to_seq: 3,
            reason: GapReason::ReplayWindowExceeded,
        }
    );
    assert_eq!(delivered_text(&sent), "45");
    assert!(stack
        .sink
        .events()
        .iter()
        .any(|e| matches!(e.kind, PerfKind::ReplayMiss { missed_from_seq: 3 })));
    assert_ordered_delivery(&sent)
}

// ===== 5. attach during live traffic =========================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attach_during_live_traffic_delivers_exactly_once() -> anyhow::Result<()> {
    let stack = StreamStack::new(StreamStack::quick_config());

    let a = stack.attach_client("a", "t1", 0).await?;
    for i in 1..=10 {
        stack.registry.emit_output("t1", &i.to_string());
    }
    wait_until("a caught up", || max_delivered_seq(&a.sent()) == 10).await?;

    // B attaches while 11 and 12 arrive.
    let b_attach = {
        let broker_conn =
            std::sync::Arc::new(termcast::test_support::RecordingConnection::new("b"));
        let conn = std::sync::Arc::clone(&broker_conn);
        let broker = &stack.broker;
        let fut = broker.attach(
            conn as std::sync::Arc<dyn termcast::conn::ClientConnection>,
            "t1",
            0,
        );
        stack.registry.emit_output("t1", "11");
        stack.registry.emit_output("t1", "12");
        assert!(fut.await);
        broker_conn
    };

    wait_until("a saw live frames", || max_delivered_seq(&a.sent()) == 12).await?;
    wait_until("b fully synced", || max_delivered_seq(&b_attach.sent()) == 12).await?;

    let expected: String = (1..=12).map(|i| i.to_string()).collect();
    assert_eq!(delivered_text(&a.sent()), expected);
    assert_eq!(delivered_text(&b_attach.sent()), expected);
    assert!(gap_ranges(&b_attach.sent()).is_empty());
    assert_ordered_delivery(&a.sent())?;
    assert_ordered_delivery(&b_attach.sent())
}

// ===== 6. catastrophic close =================================================

#[tokio::test]
async fn catastrophic_backpressure_closes_after_stall_window() -> anyhow::Result<()> {
    let mut config = StreamStack::quick_config();
    config.catastrophic_buffered_bytes = 1024;
    config.catastrophic_stall = Duration::from_millis(150);
    config.retry_flush_delay = Duration::from_millis(10);
    let stack = StreamStack::new(config);

    let conn = stack.attach_client("c1", "t1", 0).await?;
    conn.set_buffered_bytes(1 << 20);
    stack.registry.emit_output("t1", "x");

    // Inside the grace window: still open.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conn.closes().is_empty());

    wait_until("connection closed", || !conn.closes().is_empty()).await?;
    assert_eq!(conn.closes(), vec![(4008, "Catastrophic backpressure".to_owned())]);

    wait_until("attachment reaped", || stack.broker.attached_client_count("t1") == 0).await?;
    // Nothing was ever delivered to the stalled client, and nothing follows
    // the close.
    assert!(output_frames(&conn.sent()).is_empty());
    assert!(stack
        .sink
        .events()
        .iter()
        .any(|e| matches!(e.kind, PerfKind::CatastrophicClose { .. })));
    Ok(())
}

// ===== laws ==================================================================

#[tokio::test]
async fn attach_at_head_yields_no_replay_and_no_gap() -> anyhow::Result<()> {
    let stack = StreamStack::new(StreamStack::quick_config());

    let first = stack.attach_client("first", "t1", 0).await?;
    for s in ["a", "b", "c"] {
        stack.registry.emit_output("t1", s);
    }
    wait_until("first caught up", || max_delivered_seq(&first.sent()) == 3).await?;

    let second = stack.attach_client("second", "t1", 3).await?;
    assert_eq!(second.sent(), vec![ready("t1", 3, 4, 3)]);
    Ok(())
}

#[tokio::test]
async fn created_envelope_precedes_attach_ready() -> anyhow::Result<()> {
    let stack = StreamStack::new(StreamStack::quick_config());
    let conn = std::sync::Arc::new(termcast::test_support::RecordingConnection::new("c1"));
    let created = termcast::protocol::CreatedEnvelope {
        request_id: "req-7".to_owned(),
        terminal_id: "t1".to_owned(),
        created_at: 1_700_000_000_000,
        effective_resume_session_id: Some("resume-1".to_owned()),
    };

    assert!(
        stack
            .broker
            .send_created_and_attach(
                std::sync::Arc::clone(&conn) as std::sync::Arc<dyn termcast::conn::ClientConnection>,
                created,
                0,
            )
            .await
    );

    let sent = conn.sent();
    let json = serde_json::to_value(&sent[0])?;
    assert_eq!(json["type"], "terminal.created");
    assert_eq!(json["requestId"], "req-7");
    assert_eq!(json["effectiveResumeSessionId"], "resume-1");
    assert!(matches!(sent[1], StreamMessage::AttachReady { .. }));
    Ok(())
}

#[tokio::test]
async fn disconnect_and_reattach_resumes_continuously() -> anyhow::Result<()> {
    let stack = StreamStack::new(StreamStack::quick_config());

    let conn = stack.attach_client("c1", "t1", 0).await?;
    for s in ["one", "two"] {
        stack.registry.emit_output("t1", s);
    }
    wait_until("initial delivery", || max_delivered_seq(&conn.sent()) == 2).await?;

    // The connection drops; the transport reaps its attachments.
    stack.broker.detach_all_for_conn("c1");
    assert_eq!(stack.broker.attached_client_count("t1"), 0);

    // Output keeps flowing while the client is away.
    stack.registry.emit_output("t1", "three");

    // Reattach from the client's remembered sequence.
    let reconn = stack.attach_client("c1-reborn", "t1", 2).await?;
    wait_until("replayed missed output", || max_delivered_seq(&reconn.sent()) >= 3).await?;
    assert_eq!(delivered_text(&reconn.sent()), "three");
    assert!(gap_ranges(&reconn.sent()).is_empty());
    assert_ordered_delivery(&reconn.sent())
}
