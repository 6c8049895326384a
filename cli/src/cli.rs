use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;
use corral_protocol::ExecutorKind;

#[derive(Parser, Debug)]
#[command(
    name = "corral",
    version,
    about = "Run a prompt against an AI coding-agent CLI and stream normalized events"
)]
pub struct Cli {
    /// Prompt text. Pass `-` (or nothing) to read it from stdin.
    pub prompt: Option<String>,

    /// Agent to drive: claude_code, codex, gemini, qwen, copilot, droid.
    #[arg(
        short = 'x',
        long = "executor",
        default_value = "claude_code",
        value_parser = parse_executor
    )]
    pub executor: ExecutorKind,

    /// Working directory for the agent process.
    #[arg(long = "cwd", value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    #[arg(long)]
    pub model: Option<String>,

    /// Plan mode: the agent proposes instead of executing, and tool use
    /// requires interactive approval.
    #[arg(long)]
    pub plan: bool,

    /// Agent-specific sandbox selector, passed through verbatim.
    #[arg(long)]
    pub sandbox: Option<String>,

    /// Approval policy; empty or "never" disables approval round-trips.
    #[arg(long = "ask-for-approval", value_name = "POLICY")]
    pub ask_for_approval: Option<String>,

    /// Extra environment for the agent process (repeatable).
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Print raw event JSON lines instead of the styled feed.
    #[arg(long)]
    pub json: bool,

    /// Include raw passthrough output (unparsed agent stdout).
    #[arg(long)]
    pub debug: bool,

    #[arg(long, value_enum, default_value_t = Color::Auto)]
    pub color: Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Color {
    Always,
    Never,
    Auto,
}

fn parse_executor(raw: &str) -> Result<ExecutorKind, String> {
    match raw.parse::<ExecutorKind>() {
        Ok(ExecutorKind::Harness) | Err(_) => Err(format!("unknown executor `{raw}`")),
        Ok(kind) => Ok(kind),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn parses_executor_and_env_pairs() {
        let cli = Cli::parse_from([
            "corral",
            "-x",
            "droid",
            "--env",
            "FOO=bar",
            "--env",
            "BAZ=qux",
            "do the thing",
        ]);
        assert_eq!(cli.executor, ExecutorKind::Droid);
        assert_eq!(cli.env, vec!["FOO=bar", "BAZ=qux"]);
        assert_eq!(cli.prompt.as_deref(), Some("do the thing"));
    }

    #[test]
    fn rejects_unknown_and_internal_executors() {
        assert!(parse_executor("harness").is_err());
        assert!(parse_executor("gpt9").is_err());
        assert!(parse_executor("codex").is_ok());
    }
}
