//! Contract-gated HTTP gateway: authenticates callers against declarative
//! access contracts and forwards requests to agents over the bus, matching
//! responses by correlation id.

pub mod contracts;
pub mod server;
