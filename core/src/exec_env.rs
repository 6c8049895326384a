//! Environment construction for agent child processes.
//!
//! The child environment is the parent environment with every `ANTHROPIC_*`
//! variable stripped, overlaid by adapter defaults and then caller
//! overrides. Later overlays win; empty keys are ignored; `ANTHROPIC_*`
//! never survives into the result regardless of which layer introduced it.

use std::collections::HashMap;

const STRIPPED_PREFIX: &str = "ANTHROPIC_";

/// Overlay `layers` (in order) on top of `base` and apply the contract
/// above. Pure; exposed separately from [`build_env`] so it can be tested
/// without touching the process environment.
pub fn overlay_env(
    base: HashMap<String, String>,
    layers: &[HashMap<String, String>],
) -> HashMap<String, String> {
    let mut env = base;
    for layer in layers {
        for (key, value) in layer {
            if key.is_empty() {
                continue;
            }
            env.insert(key.clone(), value.clone());
        }
    }
    env.retain(|key, _| !key.starts_with(STRIPPED_PREFIX));
    env
}

/// Build the full child environment from the current process environment.
pub fn build_env(layers: &[HashMap<String, String>]) -> HashMap<String, String> {
    overlay_env(std::env::vars().collect(), layers)
}

/// Defaults for Node-based agent CLIs: quiet, non-interactive, no color.
pub fn node_cli_defaults() -> HashMap<String, String> {
    [
        ("TERM", "dumb"),
        ("NO_COLOR", "1"),
        ("CI", "1"),
        ("NPM_CONFIG_LOGLEVEL", "error"),
        ("NODE_NO_WARNINGS", "1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
