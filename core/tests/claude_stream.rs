#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Claude Code happy path against a fake CLI on a PTY.
//!
//! Sandboxes that deny `openpty` make these tests skip rather than fail,
//! matching how PTY-dependent tests behave elsewhere in the workspace.

mod common;

use common::collect_until_terminal;
use common::engine_with_program;
use common::request;
use common::wait_for_status;
use corral_core::CorralErr;
use corral_protocol::EventKind;
use corral_protocol::ExecutorKind;
use corral_protocol::SessionStatus;
use corral_protocol::SubscribeOptions;

fn pty_restricted(err: &CorralErr) -> bool {
    let text = err.to_string();
    text.contains("openpty") || text.contains("not permitted") || text.contains("Permission denied")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn result_line_becomes_message_then_done() {
    let dir = tempfile::tempdir().unwrap();
    let script = common::write_script(
        dir.path(),
        "claude",
        r#"#!/bin/sh
printf '{"type":"system","subtype":"init","session_id":"claude-sess-1"}\n'
printf '{"type":"result","result":"Hello","is_error":false}\n'
"#,
    );

    let engine = engine_with_program(ExecutorKind::ClaudeCode, &script);
    let response = match engine
        .execute(request(ExecutorKind::ClaudeCode, "say hello"))
        .await
    {
        Ok(response) => response,
        Err(err) if pty_restricted(&err) => {
            eprintln!("skipping: PTY unavailable in this sandbox: {err}");
            return;
        }
        Err(err) => panic!("execute failed: {err}"),
    };

    let mut stream = engine.subscribe(
        &response.session_id,
        SubscribeOptions {
            return_all: true,
            ..Default::default()
        },
    );
    let events = collect_until_terminal(&mut stream).await;

    let message = events
        .iter()
        .find(|event| event.kind == EventKind::Message)
        .expect("result message event");
    assert_eq!(message.content.source_type, "result");
    assert_eq!(message.content.text.as_deref(), Some("Hello"));

    let last = events.last().unwrap();
    assert!(last.is_terminal());
    assert!(events.iter().all(|event| event.seq >= 1));

    wait_for_status(&engine, &response.session_id, SessionStatus::Done).await;

    // `--print` is single-shot and the session captured a resume id, so
    // continuation spawns a fresh adapter rather than failing.
    let summary = engine.session(&response.session_id).unwrap();
    assert_eq!(summary.executor, ExecutorKind::ClaudeCode);
    assert_eq!(summary.title, "say hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_result_surfaces_as_error_event() {
    let dir = tempfile::tempdir().unwrap();
    let script = common::write_script(
        dir.path(),
        "claude",
        r#"#!/bin/sh
printf '{"type":"result","result":"exploded","is_error":true}\n'
"#,
    );

    let engine = engine_with_program(ExecutorKind::ClaudeCode, &script);
    let response = match engine
        .execute(request(ExecutorKind::ClaudeCode, "break something"))
        .await
    {
        Ok(response) => response,
        Err(err) if pty_restricted(&err) => {
            eprintln!("skipping: PTY unavailable in this sandbox: {err}");
            return;
        }
        Err(err) => panic!("execute failed: {err}"),
    };

    let mut stream = engine.subscribe(
        &response.session_id,
        SubscribeOptions {
            return_all: true,
            ..Default::default()
        },
    );
    let events = collect_until_terminal(&mut stream).await;
    assert!(
        events.iter().any(|event| event.kind == EventKind::Error),
        "expected an error event, got {events:#?}"
    );
    assert!(events.last().unwrap().is_terminal());
}
