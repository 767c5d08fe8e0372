//! examguard.input.v1 schema
//!
//! This module defines the recorded-input format used to replay a session
//! offline: host events, vision frames, fullscreen probes and candidate
//! commands in arrival order.

mod input;
mod reader;

pub use input::*;
pub use reader::*;
