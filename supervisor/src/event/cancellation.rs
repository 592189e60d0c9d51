use super::channel::EventConsumer;
use crossbeam::channel::RecvTimeoutError;
use std::time::Duration;

/// Message type carried by cancellation channels. The message itself carries
/// no information, only its arrival matters.
pub type CancellationMessage = ();

impl EventConsumer<CancellationMessage> {
    /// Returns true if a cancellation message (or a channel disconnect) is
    /// observed before `timeout` elapses. Otherwise it blocks until the
    /// timeout is elapsed and returns false.
    pub fn is_cancelled(&self, timeout: Duration) -> bool {
        !matches!(
            self.as_ref().recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }
}
