//! Abstraction over the shared pub/sub + key/value store.
//!
//! The [`BusAdapter`] trait is the only seam through which supervisor
//! components reach the coordination store: channel publish/subscribe for the
//! control plane, keyed values and hashes for shared agent records, and an
//! append-only stream for observability events. The adapter alone holds the
//! store configuration; every other component consumes this interface.

pub mod in_memory;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publishing on `{channel}` failed: {reason}")]
    Publish { channel: String, reason: String },
    #[error("bus connection lost: {0}")]
    Disconnected(String),
    #[error("bus store operation failed: {0}")]
    Store(String),
}

/// A single message delivered on a pub/sub channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// A live subscription to a single channel. Dropping the subscription
/// releases it; messages published while unsubscribed are lost.
pub struct BusSubscription {
    channel: String,
    receiver: Receiver<BusMessage>,
}

impl BusSubscription {
    pub fn new(channel: String, receiver: Receiver<BusMessage>) -> Self {
        Self { channel, receiver }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn receiver(&self) -> &Receiver<BusMessage> {
        &self.receiver
    }

    /// Waits for the next message, returning `None` on timeout.
    ///
    /// A disconnected channel is surfaced as an error so callers can tell a
    /// quiet channel apart from a lost bus.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(BusError::Disconnected(self.channel.clone()))
            }
        }
    }
}

/// Contract over the pub/sub + key/value store.
///
/// Channel semantics: fire-and-forget delivery to all current subscribers,
/// ordered per channel, no replay. Key/value semantics: last-writer-wins
/// with optional time-to-live. Stream semantics: append-only field maps with
/// monotonically ordered ids.
#[cfg_attr(test, mockall::automock)]
pub trait BusAdapter: Send + Sync {
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError>;

    fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError>;

    /// Cheap liveness probe of the store itself.
    fn ping(&self) -> Result<(), BusError>;

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), BusError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BusError>;

    fn delete(&self, key: &str) -> Result<(), BusError>;

    fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> Result<(), BusError>;

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, BusError>;

    fn hash_delete(&self, key: &str, field: &str) -> Result<(), BusError>;

    fn stream_append(
        &self,
        stream: &str,
        entry: &HashMap<String, String>,
    ) -> Result<String, BusError>;
}
