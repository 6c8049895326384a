// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Child-process ownership for protocol adapters.
//!
//! Two stdio modes: **piped** (separate stdin/stdout/stderr, required by the
//! JSON-RPC and stdin-framed adapters so request framing is unambiguous) and
//! **pty** (merged output on a pseudo-terminal, required by Node-based CLIs
//! that buffer differently when not on a TTY). Either way the output is
//! surfaced as a channel of UTF-8 lines; the reader keeps a 1 MiB budget per
//! line to accommodate large embedded JSON.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::io::Read;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::CorralErr;
use crate::error::Result;

/// Per-line scan budget. Agent CLIs embed whole tool outputs in single JSON
/// lines, so this is generous.
const LINE_BUFFER_BYTES: usize = 1024 * 1024;

/// Capacity of the line channels between the OS readers and the adapter.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// Merged stdout/stderr on a pseudo-terminal.
    Pty,
    /// Separate stdin/stdout/stderr pipes.
    Piped,
}

/// A spawned agent process. Output is consumed by taking the line
/// receivers; input, interrupt, and kill go through `&self` so the handle
/// can be shared behind an `Arc` by the adapter's tasks.
pub struct ChildHandle {
    pid: Option<u32>,
    input: Mutex<Input>,
    stdout: StdMutex<Option<mpsc::Receiver<String>>>,
    stderr: StdMutex<Option<mpsc::Receiver<String>>>,
    kill: StdMutex<Option<KillHandle>>,
    exit: StdMutex<Option<oneshot::Receiver<i32>>>,
    /// Keeps the PTY master (and with it the child's terminal) alive for
    /// the lifetime of the handle.
    _master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
}

enum Input {
    Piped(tokio::process::ChildStdin),
    Pty(mpsc::Sender<Vec<u8>>),
    Closed,
}

enum KillHandle {
    Piped(oneshot::Sender<()>),
    Pty(Box<dyn portable_pty::ChildKiller + Send + Sync>),
}

impl ChildHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The merged (pty) or stdout (piped) line stream. Yields `None` once.
    pub fn take_stdout(&self) -> Option<mpsc::Receiver<String>> {
        self.stdout.lock().unwrap().take()
    }

    /// stderr lines; only present in piped mode.
    pub fn take_stderr(&self) -> Option<mpsc::Receiver<String>> {
        self.stderr.lock().unwrap().take()
    }

    /// Resolves with the exit code once the child exits. Yields `None` once.
    pub fn take_exit(&self) -> Option<oneshot::Receiver<i32>> {
        self.exit.lock().unwrap().take()
    }

    /// Write one line (newline appended) to the child's input.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut input = self.input.lock().await;
        match &mut *input {
            Input::Piped(stdin) => {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await?;
                Ok(())
            }
            Input::Pty(tx) => {
                let mut bytes = line.as_bytes().to_vec();
                bytes.push(b'\n');
                tx.send(bytes)
                    .await
                    .map_err(|_| CorralErr::ExecutorClosed)
            }
            Input::Closed => Err(CorralErr::ExecutorClosed),
        }
    }

    /// Close the child's stdin (EOF). Subsequent writes fail.
    pub async fn close_stdin(&self) {
        *self.input.lock().await = Input::Closed;
    }

    /// Deliver SIGINT. Never kills; kill is reserved for [`Self::kill`].
    pub fn interrupt(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SAFETY: pid came from our own spawned child; SIGINT to our
            // own child is always safe.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
        }
        #[cfg(not(unix))]
        debug!("interrupt is a no-op on this platform");
    }

    /// Forcefully terminate the child. Idempotent.
    pub fn kill(&self) {
        if let Some(kill) = self.kill.lock().unwrap().take() {
            match kill {
                KillHandle::Piped(tx) => {
                    let _ = tx.send(());
                }
                KillHandle::Pty(mut killer) => {
                    let _ = killer.kill();
                }
            }
        }
    }
}

/// Spawn `program` with the given arguments, working directory, and the
/// exact environment `env` (the parent environment is not inherited here;
/// callers build it with [`crate::exec_env::build_env`]).
pub async fn spawn(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    mode: StdioMode,
) -> Result<ChildHandle> {
    match mode {
        StdioMode::Piped => spawn_piped(program, args, cwd, env).await,
        StdioMode::Pty => spawn_pty(program, args, cwd, env),
    }
}

async fn spawn_piped(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<ChildHandle> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| CorralErr::Spawn(format!("{program}: {e}")))?;
    let pid = child.id();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| CorralErr::Spawn("stdin pipe was not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CorralErr::Spawn("stdout pipe was not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CorralErr::Spawn("stderr pipe was not captured".to_string()))?;

    let (stdout_tx, stdout_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    tokio::spawn(read_lines(stdout, stdout_tx));
    let (stderr_tx, stderr_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    tokio::spawn(read_lines(stderr, stderr_tx));

    let (exit_tx, exit_rx) = oneshot::channel();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let code = tokio::select! {
            status = child.wait() => {
                status.ok().and_then(|s| s.code()).unwrap_or(-1)
            }
            requested = kill_rx => {
                if requested.is_ok() {
                    let _ = child.start_kill();
                }
                child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1)
            }
        };
        let _ = exit_tx.send(code);
    });

    Ok(ChildHandle {
        pid,
        input: Mutex::new(Input::Piped(stdin)),
        stdout: StdMutex::new(Some(stdout_rx)),
        stderr: StdMutex::new(Some(stderr_rx)),
        kill: StdMutex::new(Some(KillHandle::Piped(kill_tx))),
        exit: StdMutex::new(Some(exit_rx)),
        _master: StdMutex::new(None),
    })
}

fn spawn_pty(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<ChildHandle> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| CorralErr::Spawn(format!("openpty: {e}")))?;

    let mut builder = CommandBuilder::new(program);
    builder.args(args);
    builder.cwd(cwd);
    builder.env_clear();
    for (key, value) in env {
        builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| CorralErr::Spawn(format!("{program}: {e}")))?;
    // The slave fd is owned by the child now.
    drop(pair.slave);

    let killer = child.clone_killer();
    let pid = child.process_id();

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| CorralErr::Spawn(format!("pty reader: {e}")))?;
    let (stdout_tx, stdout_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || read_pty_lines(reader, stdout_tx));

    let writer = pair
        .master
        .take_writer()
        .map_err(|e| CorralErr::Spawn(format!("pty writer: {e}")))?;
    let writer = Arc::new(StdMutex::new(writer));
    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(128);
    tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            let writer = writer.clone();
            // The PTY writer is blocking; keep it off the runtime threads.
            let _ = tokio::task::spawn_blocking(move || {
                if let Ok(mut guard) = writer.lock() {
                    use std::io::Write;
                    let _ = guard.write_all(&bytes);
                    let _ = guard.flush();
                }
            })
            .await;
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => -1,
        };
        let _ = exit_tx.send(code);
    });

    Ok(ChildHandle {
        pid,
        input: Mutex::new(Input::Pty(writer_tx)),
        stdout: StdMutex::new(Some(stdout_rx)),
        stderr: StdMutex::new(None),
        kill: StdMutex::new(Some(KillHandle::Pty(killer))),
        exit: StdMutex::new(Some(exit_rx)),
        _master: StdMutex::new(Some(pair.master)),
    })
}

/// Drain an async byte stream into trimmed lines.
async fn read_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::with_capacity(LINE_BUFFER_BYTES, reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if tx.send(trimmed.to_string()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("output reader error: {e}");
                break;
            }
        }
    }
}

/// Blocking PTY reader: accumulate bytes, split on `\n`, strip `\r`.
fn read_pty_lines(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<String>) {
    let mut acc: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                acc.extend_from_slice(&buf[..n]);
                while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
                    let mut line: Vec<u8> = acc.drain(..=pos).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if tx
                        .blocking_send(String::from_utf8_lossy(&line).into_owned())
                        .is_err()
                    {
                        return;
                    }
                }
                // A pathological line over the budget is flushed as-is
                // rather than growing without bound.
                if acc.len() > LINE_BUFFER_BYTES {
                    let text = String::from_utf8_lossy(&acc).into_owned();
                    acc.clear();
                    if tx.blocking_send(text).is_err() {
                        return;
                    }
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            Err(_) => break,
        }
    }
    if !acc.is_empty() {
        let _ = tx.blocking_send(String::from_utf8_lossy(&acc).into_owned());
    }
}
