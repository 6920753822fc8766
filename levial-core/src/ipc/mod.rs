//! Wire protocol between the orchestrator and its observers.
//!
//! Both directions are JSON objects tagged by a snake_case `type` field with
//! the payload fields beside the tag.

pub mod commands;
pub mod events;

pub use commands::{ConfigPatch, ControlCommand, ProtocolError};
pub use events::OutboundEvent;
