//! Typed event channels used for communication between supervisor components.
//!
//! Reaper and timer threads publish [`LifecycleEvent`]s consumed by the main
//! supervisor loop; OS signal handlers publish [`ApplicationEvent`]s.

pub mod cancellation;
pub mod channel;

use crate::registry::definition::AgentKind;

/// Events sent directly to the application, e.g. OS signals.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplicationEvent {
    StopRequested,
}

/// Events produced by reaper threads, ephemeral timers and restart timers,
/// consumed by the supervisor event loop.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    /// A supervised process reached a terminal exit. Published by the reaper.
    AgentExited {
        instance: String,
        agent: String,
        kind: AgentKind,
        session_id: Option<String>,
        task_id: Option<String>,
        exit_code: Option<i32>,
    },
    /// An ephemeral instance exceeded its maximum runtime and was killed.
    EphemeralTimedOut {
        instance: String,
        agent: String,
        task_id: String,
        max_runtime_seconds: u64,
    },
    /// The delay before an automatic restart has elapsed.
    RestartDue { agent: String, attempt: usize },
}
