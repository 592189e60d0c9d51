//! Heartbeat tracking: the periodic liveness sweep and the PID probe it
//! combines with recorded heartbeat ages.

pub mod monitor;
pub mod pid;
