//! Fuzzing harnesses for localcall wire-level components.
//!
//! These fuzzers drive the control-frame codec and the service-name
//! rules with hostile inputs, without touching sockets or real shared
//! memory.

pub mod frame_model;
pub mod name_model;
