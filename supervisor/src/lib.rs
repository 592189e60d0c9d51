//! # Centerfire Supervisor library
//!
//! Core functionality for the Centerfire agent supervisor: the agent
//! registry, the lifecycle manager, the dependency checker, the heartbeat
//! monitor, the pub/sub control plane and the discovery/gateway HTTP facets.
//! The `centerfire-supervisor` binary consumes this library.

pub mod bus;
pub mod cli;
pub mod control;
pub mod dependency;
pub mod discovery;
pub mod event;
pub mod gateway;
pub mod heartbeat;
pub mod httpd;
pub mod instrumentation;
pub mod lifecycle;
pub mod registry;
pub mod supervisor;
pub mod utils;
