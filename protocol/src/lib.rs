//! Canonical data model shared by the corral session engine and its
//! embedders: the normalized [`Event`] schema that every protocol adapter is
//! reduced to, plus the request/option types of the embedding surface.
//!
//! This crate is pure data — serde types only, no I/O.

mod event;
mod request;

pub use event::Action;
pub use event::Category;
pub use event::Event;
pub use event::EventContent;
pub use event::EventKind;
pub use event::Phase;
pub use request::ControlDecision;
pub use request::ControlResponse;
pub use request::ExecuteRequest;
pub use request::ExecuteResponse;
pub use request::ExecutorKind;
pub use request::SessionStatus;
pub use request::SessionSummary;
pub use request::SubscribeOptions;
