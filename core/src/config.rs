//! Engine configuration.
//!
//! Hard defaults, overlaid by an optional `~/.corral/config.toml`, overlaid
//! by caller-supplied [`ConfigOverrides`]. Later layers win.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use corral_protocol::ExecutorKind;
use serde::Deserialize;

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Period of the store's TTL sweep.
    pub cleanup_interval: Duration,

    /// How long a finished session's events are retained after its `done`
    /// event. Running sessions are never expired.
    pub expire_after_done: Duration,

    /// Capacity of each subscriber's live-event channel. A subscriber that
    /// falls this far behind starts losing live events and must re-subscribe
    /// with `after_seq`.
    pub subscriber_capacity: usize,

    /// Capacity of the adapter log queue between the protocol reader and
    /// the session pump.
    pub log_capacity: usize,

    /// Reply window for JSON-RPC requests to agents.
    pub rpc_timeout: Duration,

    /// Optional per-session cap on stored events.
    pub store_capacity: Option<usize>,

    /// Per-executor override of the agent binary to launch. Useful for
    /// pinning absolute paths or substituting test doubles.
    pub programs: HashMap<ExecutorKind, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(15),
            expire_after_done: Duration::from_secs(10 * 60),
            subscriber_capacity: 100,
            log_capacity: 64,
            rpc_timeout: Duration::from_secs(60),
            store_capacity: None,
            programs: HashMap::new(),
        }
    }
}

/// Caller-level overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub cleanup_interval: Option<Duration>,
    pub expire_after_done: Option<Duration>,
    pub subscriber_capacity: Option<usize>,
    pub rpc_timeout: Option<Duration>,
    pub store_capacity: Option<usize>,
    pub programs: Option<HashMap<ExecutorKind, String>>,
}

/// On-disk shape of `config.toml`. All fields optional.
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    cleanup_interval_ms: Option<u64>,
    expire_after_done_ms: Option<u64>,
    subscriber_capacity: Option<usize>,
    log_capacity: Option<usize>,
    rpc_timeout_ms: Option<u64>,
    store_capacity: Option<usize>,
    #[serde(default)]
    programs: HashMap<String, String>,
}

impl Config {
    /// Load `$CORRAL_HOME/config.toml` (default `~/.corral/config.toml`) if
    /// present and apply `overrides` on top. A missing file is not an error;
    /// a malformed one is.
    pub fn load(overrides: ConfigOverrides) -> std::io::Result<Self> {
        let path = corral_dir().map(|dir| dir.join("config.toml"));
        let file = match path {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path)?;
                toml::from_str::<ConfigToml>(&contents)
                    .map_err(|e| std::io::Error::other(format!("{}: {e}", path.display())))?
            }
            _ => ConfigToml::default(),
        };
        Ok(Self::merge(file, overrides))
    }

    fn merge(file: ConfigToml, overrides: ConfigOverrides) -> Self {
        let mut config = Config::default();

        if let Some(ms) = file.cleanup_interval_ms {
            config.cleanup_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.expire_after_done_ms {
            config.expire_after_done = Duration::from_millis(ms);
        }
        if let Some(cap) = file.subscriber_capacity {
            config.subscriber_capacity = cap;
        }
        if let Some(cap) = file.log_capacity {
            config.log_capacity = cap;
        }
        if let Some(ms) = file.rpc_timeout_ms {
            config.rpc_timeout = Duration::from_millis(ms);
        }
        if let Some(cap) = file.store_capacity {
            config.store_capacity = Some(cap);
        }
        for (name, program) in file.programs {
            match name.parse::<ExecutorKind>() {
                Ok(kind) => {
                    config.programs.insert(kind, program);
                }
                Err(_) => {
                    tracing::warn!("config.toml names unknown executor `{name}`; ignoring");
                }
            }
        }

        if let Some(v) = overrides.cleanup_interval {
            config.cleanup_interval = v;
        }
        if let Some(v) = overrides.expire_after_done {
            config.expire_after_done = v;
        }
        if let Some(v) = overrides.subscriber_capacity {
            config.subscriber_capacity = v;
        }
        if let Some(v) = overrides.rpc_timeout {
            config.rpc_timeout = v;
        }
        if let Some(v) = overrides.store_capacity {
            config.store_capacity = Some(v);
        }
        if let Some(programs) = overrides.programs {
            config.programs.extend(programs);
        }

        config
    }

    /// The binary to launch for `kind`, honoring overrides.
    pub fn program_for(&self, kind: ExecutorKind, default: &str) -> String {
        self.programs
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

/// Returns the corral state directory. `$CORRAL_HOME` wins over
/// `~/.corral`; `None` when no home directory can be determined.
pub fn corral_dir() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os("CORRAL_HOME") {
        if !home.is_empty() {
            return Some(PathBuf::from(home));
        }
    }
    dirs::home_dir().map(|home| home.join(".corral"))
}
