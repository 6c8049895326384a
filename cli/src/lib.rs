//! Headless driver: execute one prompt against one agent CLI through the
//! corral engine and stream the normalized events to the terminal.

use std::collections::HashMap;
use std::io::IsTerminal;

use anyhow::Context;
use corral_core::Config;
use corral_core::ConfigOverrides;
use corral_core::Engine;
use corral_protocol::EventKind;
use corral_protocol::ExecuteRequest;
use corral_protocol::SubscribeOptions;
use tokio::io::AsyncReadExt;
use tracing::debug;

pub mod cli;
mod event_printer;

use crate::cli::Cli;
use crate::cli::Color;
use crate::event_printer::EventPrinter;

/// Returns the process exit code: non-zero when the session surfaced an
/// error event.
pub async fn run_main(cli: Cli) -> anyhow::Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let prompt = match cli.prompt.as_deref() {
        Some("-") | None => {
            let mut buffer = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buffer)
                .await
                .context("failed to read prompt from stdin")?;
            buffer
        }
        Some(prompt) => prompt.to_string(),
    };

    let mut env = HashMap::new();
    for pair in &cli.env {
        let Some((key, value)) = pair.split_once('=') else {
            anyhow::bail!("--env takes KEY=VALUE, got `{pair}`");
        };
        env.insert(key.to_string(), value.to_string());
    }

    let config = Config::load(ConfigOverrides::default()).context("failed to load config")?;
    let engine = Engine::new(config);

    let response = engine
        .execute(ExecuteRequest {
            prompt,
            executor: cli.executor,
            working_dir: cli.cwd.clone(),
            model: cli.model.clone(),
            plan: cli.plan,
            sandbox: cli.sandbox.clone(),
            ask_for_approval: cli.ask_for_approval.clone(),
            env,
        })
        .await?;
    debug!("session {} started", response.session_id);

    let mut stream = engine.subscribe(
        &response.session_id,
        SubscribeOptions {
            return_all: true,
            include_debug: cli.debug,
            ..Default::default()
        },
    );

    let with_ansi = match cli.color {
        Color::Always => true,
        Color::Never => false,
        Color::Auto => std::io::stdout().is_terminal(),
    };
    let printer = EventPrinter::create_with_ansi(with_ansi);

    let mut failed = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = engine.pause_task(&response.session_id).await;
                break;
            }
            received = stream.recv() => match received {
                Some(event) => {
                    if event.kind == EventKind::Error {
                        failed = true;
                    }
                    if cli.json {
                        println!("{}", serde_json::to_string(&event)?);
                    } else {
                        printer.print_event(&event);
                    }
                    if event.is_terminal() {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    engine.shutdown().await;
    Ok(if failed { 1 } else { 0 })
}
