//! Droid adapter: `droid exec --output-format stream-json` over piped
//! stdio. The prompt is written to stdin, stdin is closed, and the output
//! is a one-shot stream of line-JSON records. No message or approval
//! channel exists for this CLI.

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
use crate::process::ChildHandle;
use crate::process::StdioMode;
use crate::process::spawn;

pub struct DroidAdapter {
    options: AdapterOptions,
    shared: Arc<AdapterShared>,
    child: Mutex<Option<Arc<ChildHandle>>>,
}

impl DroidAdapter {
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

        let mut args = vec![
            "exec".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if let Some(model) = &self.options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        let env = build_env(&[self.options.env.clone()]);
        let handle = Arc::new(
            spawn(
                &self.options.program,
                &args,
                &self.options.working_dir,
                &env,
                StdioMode::Piped,
            )
            .await?,
        );
        let stdout = handle
            .take_stdout()
            .ok_or_else(|| CorralErr::Spawn("stdout stream unavailable".to_string()))?;
        let stderr = handle.take_stderr();

        self.shared
            .emit(command_log(&self.options.program, &args))
            .await;

        // One-shot prompt delivery; EOF tells droid the input is complete.
        handle.write_line(prompt).await?;
        handle.close_stdin().await;
        *self.child.lock().await = Some(handle);

        tokio::spawn(pump_output(stdout, self.shared.clone()));
        if let Some(mut stderr) = stderr {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                while let Some(line) = stderr.recv().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    shared.emit(Log::text(log_kinds::STDERR, line)).await;
                }
            });
        }
        Ok(())
    }

    pub async fn send_message(&self, _text: &str) -> Result<()> {
        if self.shared.is_closed() {
            return Err(CorralErr::ExecutorClosed);
        }
        Err(CorralErr::Unsupported("droid send_message"))
    }

    pub async fn respond_control(
        &self,
        _request_id: &str,
        _decision: ControlDecision,
        _reason: Option<&str>,
    ) -> Result<()> {
        Err(CorralErr::Unsupported("droid respond_control"))
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

/// Each stream-json record maps one-to-one to a log tag.
async fn pump_output(mut stdout: mpsc::Receiver<String>, shared: Arc<AdapterShared>) {
    while let Some(line) = stdout.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<Value>(&line).ok();
        let Some(obj) = parsed.as_ref().and_then(Value::as_object) else {
            shared.emit(Log::text(log_kinds::STDOUT, line)).await;
            continue;
        };
        let content = Value::Object(obj.clone());
        match obj.get("type").and_then(Value::as_str) {
            Some("system") => shared.emit(Log::new("droid_system", content)).await,
            Some("message") => shared.emit(Log::new("droid_message", content)).await,
            Some("tool_call") => shared.emit(Log::new("droid_tool_call", content)).await,
            Some("tool_result") => shared.emit(Log::new("droid_tool_result", content)).await,
            Some("completion") => {
                shared.emit(Log::new("droid_completion", content)).await;
                shared.emit_done().await;
            }
            Some("error") => shared.emit(Log::new(log_kinds::ERROR, content)).await,
            _ => shared.emit(Log::text(log_kinds::STDOUT, line)).await,
        }
    }
    shared.emit_done().await;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn stream_records_map_one_to_one() {
        let shared = AdapterShared::new(16);
        let (tx, rx) = mpsc::channel(8);
        for line in [
            r#"{"type":"system","subtype":"init"}"#,
            r#"{"type":"tool_call","name":"bash","input":{"cmd":"ls"}}"#,
            r#"{"type":"completion","result":"ok"}"#,
        ] {
            tx.send(line.to_string()).await.unwrap();
        }
        drop(tx);

        pump_output(rx, shared.clone()).await;

        let logs = shared.logs();
        assert_eq!(logs.recv().await.unwrap().kind, "droid_system");
        assert_eq!(logs.recv().await.unwrap().kind, "droid_tool_call");
        assert_eq!(logs.recv().await.unwrap().kind, "droid_completion");
        assert_eq!(logs.recv().await.unwrap().kind, log_kinds::DONE);
        assert!(logs.try_recv().is_err());
    }
}
