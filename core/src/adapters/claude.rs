//! Claude Code adapter: `claude --print` in stream-json mode on a PTY.
//!
//! The CLI is single-shot: one prompt in, a stream of line-JSON out,
//! terminated by a `result` line. Follow-up turns go through a fresh
//! adapter with `--resume <session_id>`; `send_message` is therefore
//! unsupported rather than silently buffered.

use std::sync::Arc;

use corral_protocol::ControlDecision;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapters::AdapterOptions;
use crate::adapters::AdapterShared;
use crate::adapters::Log;
use crate::adapters::command_log;
use crate::adapters::log_kinds;
use crate::error::CorralErr;
use crate::error::Result;
use crate::exec_env::build_env;
use crate::exec_env::node_cli_defaults;
use crate::process::ChildHandle;
use crate::process::StdioMode;
use crate::process::spawn;

pub struct ClaudeAdapter {
    options: AdapterOptions,
    shared: Arc<AdapterShared>,
    child: Mutex<Option<Arc<ChildHandle>>>,
}

impl ClaudeAdapter {
    pub(crate) fn new(options: AdapterOptions) -> Self {
        let shared = AdapterShared::new(options.log_capacity);
        Self {
            options,
            shared,
            child: Mutex::new(None),
        }
    }

    pub async fn start(&self, prompt: &str) -> Result<()> {
        if self.shared.is_closed() {
            return Err(CorralErr::ExecutorClosed);
        }

        let args = self.build_args(prompt);
        let env = build_env(&[node_cli_defaults(), self.options.env.clone()]);
        let handle = Arc::new(
            spawn(
                &self.options.program,
                &args,
                &self.options.working_dir,
                &env,
                StdioMode::Pty,
            )
            .await?,
        );
        let stdout = handle
            .take_stdout()
            .ok_or_else(|| CorralErr::Spawn("output stream unavailable".to_string()))?;

        self.shared
            .emit(command_log(&self.options.program, &args))
            .await;
        *self.child.lock().await = Some(handle);

        let shared = self.shared.clone();
        tokio::spawn(pump_output(stdout, shared));
        Ok(())
    }

    fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if self.options.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(model) = &self.options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if self.options.plan {
            args.push("--plan".to_string());
        }
        if let Some(resume) = &self.options.resume_session_id {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }
        args
    }

    pub async fn send_message(&self, _text: &str) -> Result<()> {
        if self.shared.is_closed() {
            return Err(CorralErr::ExecutorClosed);
        }
        Err(CorralErr::Unsupported("claude_code send_message"))
    }

    pub async fn respond_control(
        &self,
        _request_id: &str,
        _decision: ControlDecision,
        _reason: Option<&str>,
    ) -> Result<()> {
        Err(CorralErr::Unsupported("claude_code respond_control"))
    }

    pub async fn interrupt(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(CorralErr::ExecutorClosed);
        }
        if let Some(child) = self.child.lock().await.as_ref() {
            child.interrupt();
        }
        Ok(())
    }

    pub fn logs(&self) -> async_channel::Receiver<Log> {
        self.shared.logs()
    }

    pub fn done_signal(&self) -> CancellationToken {
        self.shared.done_signal()
    }

    pub async fn close(&self) {
        if !self.shared.begin_close() {
            return;
        }
        if let Some(child) = self.child.lock().await.take() {
            child.kill();
        }
        self.shared.emit_done().await;
        self.shared.close_logs();
    }
}

/// Translate the merged PTY line stream into logs. EOF emits the synthetic
/// terminal log.
async fn pump_output(mut stdout: mpsc::Receiver<String>, shared: Arc<AdapterShared>) {
    while let Some(line) = stdout.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(Value::Object(obj)) => {
                let kind = obj
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                match kind.as_str() {
                    "result" => {
                        let is_error = obj
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        let tag = if is_error {
                            log_kinds::ERROR
                        } else {
                            log_kinds::RESULT
                        };
                        shared.emit(Log::new(tag, Value::Object(obj))).await;
                        shared.emit_done().await;
                    }
                    "" => {
                        shared.emit(Log::text(log_kinds::STDOUT, line)).await;
                    }
                    other => {
                        shared.emit(Log::new(other, Value::Object(obj))).await;
                    }
                }
            }
            _ => {
                shared.emit(Log::text(log_kinds::STDOUT, line)).await;
            }
        }
    }
    shared.emit_done().await;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::adapters::log_kinds;

    fn options() -> AdapterOptions {
        AdapterOptions {
            executor: corral_protocol::ExecutorKind::ClaudeCode,
            program: "claude".to_string(),
            working_dir: std::env::temp_dir(),
            model: Some("opus".to_string()),
            plan: false,
            sandbox: None,
            approvals: false,
            skip_permissions: true,
            auto_approve: true,
            env: HashMap::new(),
            resume_session_id: None,
            resume_path: None,
            rpc_timeout: Duration::from_secs(60),
            log_capacity: 64,
        }
    }

    #[test]
    fn args_include_stream_json_and_model() {
        let adapter = ClaudeAdapter::new(options());
        let args = adapter.build_args("fix the bug");
        assert_eq!(args[0], "--print");
        assert_eq!(args[1], "fix the bug");
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(args.windows(2).any(|w| w == ["--model", "opus"]));
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[test]
    fn resume_id_adds_resume_flag() {
        let mut opts = options();
        opts.resume_session_id = Some("sess-9".to_string());
        let adapter = ClaudeAdapter::new(opts);
        let args = adapter.build_args("go on");
        assert!(args.windows(2).any(|w| w == ["--resume", "sess-9"]));
    }

    #[tokio::test]
    async fn result_line_emits_result_then_done() {
        let shared = AdapterShared::new(16);
        let (tx, rx) = mpsc::channel(4);
        tx.send(r#"{"type":"result","result":"Hello","is_error":false}"#.to_string())
            .await
            .unwrap();
        drop(tx);

        pump_output(rx, shared.clone()).await;

        let logs = shared.logs();
        let first = logs.recv().await.unwrap();
        assert_eq!(first.kind, log_kinds::RESULT);
        assert_eq!(first.content["result"], "Hello");
        let second = logs.recv().await.unwrap();
        assert_eq!(second.kind, log_kinds::DONE);
        assert!(logs.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_json_lines_become_stdout_logs() {
        let shared = AdapterShared::new(16);
        let (tx, rx) = mpsc::channel(4);
        tx.send("npm WARN something".to_string()).await.unwrap();
        drop(tx);

        pump_output(rx, shared.clone()).await;

        let logs = shared.logs();
        let first = logs.recv().await.unwrap();
        assert_eq!(first.kind, log_kinds::STDOUT);
        assert_eq!(first.content["text"], "npm WARN something");
        assert_eq!(logs.recv().await.unwrap().kind, log_kinds::DONE);
    }

    #[tokio::test]
    async fn send_message_is_unsupported() {
        let adapter = ClaudeAdapter::new(options());
        assert!(matches!(
            adapter.send_message("more").await,
            Err(CorralErr::Unsupported(_))
        ));
    }
}
