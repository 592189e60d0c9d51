//! In-process implementation of the bus contract.
//!
//! Channels are backed by per-channel subscriber lists over unbounded
//! crossbeam channels; disconnected subscribers are pruned on the next
//! publish. Keyed values carry an optional deadline and expire lazily on
//! read. Good enough for a single-host deployment, and the reference
//! implementation behind the [`BusAdapter`] seam.

use super::{BusAdapter, BusError, BusMessage, BusSubscription};
use crossbeam::channel::{Sender, unbounded};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

struct ValueEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Default)]
pub struct InMemoryBus {
    channels: Mutex<HashMap<String, Vec<Sender<BusMessage>>>>,
    values: Mutex<HashMap<String, ValueEntry>>,
    hashes: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
    streams: Mutex<HashMap<String, StreamState>>,
}

#[derive(Default)]
struct StreamState {
    last_millis: u64,
    last_seq: u64,
    entries: Vec<(String, HashMap<String, String>)>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_poisoned(what: &str) -> BusError {
        BusError::Store(format!("{what} lock poisoned"))
    }
}

impl BusAdapter for InMemoryBus {
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| Self::lock_poisoned("channels"))?;
        if let Some(subscribers) = channels.get_mut(channel) {
            let message = BusMessage {
                channel: channel.to_string(),
                payload: payload.to_vec(),
            };
            subscribers.retain(|sender| sender.send(message.clone()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        let (sender, receiver) = unbounded();
        self.channels
            .lock()
            .map_err(|_| Self::lock_poisoned("channels"))?
            .entry(channel.to_string())
            .or_default()
            .push(sender);
        Ok(BusSubscription::new(channel.to_string(), receiver))
    }

    fn ping(&self) -> Result<(), BusError> {
        Ok(())
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), BusError> {
        self.values
            .lock()
            .map_err(|_| Self::lock_poisoned("values"))?
            .insert(
                key.to_string(),
                ValueEntry {
                    value: value.to_vec(),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BusError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| Self::lock_poisoned("values"))?;
        match values.get(key) {
            Some(entry) if entry.is_expired() => {
                values.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<(), BusError> {
        self.values
            .lock()
            .map_err(|_| Self::lock_poisoned("values"))?
            .remove(key);
        Ok(())
    }

    fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> Result<(), BusError> {
        self.hashes
            .lock()
            .map_err(|_| Self::lock_poisoned("hashes"))?
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_vec());
        Ok(())
    }

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, BusError> {
        Ok(self
            .hashes
            .lock()
            .map_err(|_| Self::lock_poisoned("hashes"))?
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    fn hash_delete(&self, key: &str, field: &str) -> Result<(), BusError> {
        let mut hashes = self
            .hashes
            .lock()
            .map_err(|_| Self::lock_poisoned("hashes"))?;
        if let Some(fields) = hashes.get_mut(key) {
            fields.remove(field);
            if fields.is_empty() {
                hashes.remove(key);
            }
        }
        Ok(())
    }

    fn stream_append(
        &self,
        stream: &str,
        entry: &HashMap<String, String>,
    ) -> Result<String, BusError> {
        let mut streams = self
            .streams
            .lock()
            .map_err(|_| Self::lock_poisoned("streams"))?;
        let state = streams.entry(stream.to_string()).or_default();

        let now_millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        // Ids must stay monotonic even when the clock does not advance
        // between appends.
        if now_millis > state.last_millis {
            state.last_millis = now_millis;
            state.last_seq = 0;
        } else {
            state.last_seq += 1;
        }
        let id = format!("{}-{}", state.last_millis, state.last_seq);
        state.entries.push((id.clone(), entry.clone()));
        Ok(id)
    }
}
