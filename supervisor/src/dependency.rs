//! Dependency validation: per-dependency liveness probing with bounded
//! retry, run before agents are started and on explicit check requests.

pub mod checker;
pub mod probe;
