//! corral-core: the session engine of the corral harness.
//!
//! Owns the lifecycle of agent CLI child processes, translates each
//! protocol-specific byte stream into canonical events, persists them with
//! per-session monotonic sequence numbers, and fans them out to concurrent
//! subscribers with an exactly-once history/live handoff.

pub mod adapters;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec_env;
pub mod process;
pub mod store;
mod streams;
pub mod transform;

pub use config::Config;
pub use config::ConfigOverrides;
pub use engine::DEFAULT_CONTINUE_MESSAGE;
pub use engine::Engine;
pub use engine::EventStream;
pub use engine::Hooks;
pub use engine::ResumeState;
pub use error::CorralErr;
pub use error::Result;
