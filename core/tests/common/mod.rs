#![allow(clippy::unwrap_used)]
#![allow(dead_code)]

//! Shared helpers for the end-to-end suite: fake agent CLIs written as
//! shell scripts into a tempdir, plus an engine wired to launch them.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use corral_core::Config;
use corral_core::Engine;
use corral_core::EventStream;
use corral_protocol::Event;
use corral_protocol::EventKind;
use corral_protocol::ExecuteRequest;
use corral_protocol::ExecutorKind;
use corral_protocol::SessionStatus;

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// An engine whose `executor` launches `program` instead of the real CLI.
pub fn engine_with_program(executor: ExecutorKind, program: &Path) -> Engine {
    let mut config = Config {
        cleanup_interval: Duration::from_secs(3600),
        expire_after_done: Duration::from_secs(3600),
        rpc_timeout: Duration::from_secs(10),
        ..Config::default()
    };
    config
        .programs
        .insert(executor, program.to_string_lossy().into_owned());
    Engine::new(config)
}

pub fn request(executor: ExecutorKind, prompt: &str) -> ExecuteRequest {
    ExecuteRequest {
        prompt: prompt.to_string(),
        executor,
        working_dir: Some(std::env::temp_dir()),
        model: None,
        plan: false,
        sandbox: None,
        ask_for_approval: None,
        env: HashMap::new(),
    }
}

/// Drain the stream until the terminal event (inclusive).
pub async fn collect_until_terminal(stream: &mut EventStream) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), stream.recv()).await {
            Ok(Some(event)) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => panic!("timed out waiting for terminal event; got {events:#?}"),
        }
    }
    events
}

/// Wait for the next event of the given kind, skipping others.
pub async fn wait_for_kind(stream: &mut EventStream, kind: EventKind) -> Event {
    loop {
        match tokio::time::timeout(Duration::from_secs(10), stream.recv()).await {
            Ok(Some(event)) if event.kind == kind => return event,
            Ok(Some(_)) => {}
            Ok(None) => panic!("stream closed before a {kind} event arrived"),
            Err(_) => panic!("timed out waiting for a {kind} event"),
        }
    }
}

pub async fn wait_for_status(engine: &Engine, session_id: &str, status: SessionStatus) {
    for _ in 0..200 {
        if engine
            .session(session_id)
            .map(|summary| summary.status == status)
            .unwrap_or(false)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session {session_id} never reached status {status}");
}

/// Poll a file written by a fake agent until it has content.
pub async fn read_file_when_written(path: &Path) -> String {
    for _ in 0..200 {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if !contents.trim().is_empty() {
                return contents;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("fake agent never wrote {}", path.display());
}
