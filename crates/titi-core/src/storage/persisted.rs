use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, trace, warn};

use super::{KvBackend, StorageEvent};

pub const DEFAULT_DEBOUNCE_MS: i64 = 300;

/// A typed value bound to one storage key.
///
/// Reads see every `set` immediately; the durable write waits until the
/// value has been quiet for the debounce window. Dropping the slot flushes
/// a pending write.
pub struct Persisted<T: Serialize> {
    key: String,
    value: T,
    backend: Rc<dyn KvBackend>,
    debounce: Duration,
    write_due: Option<DateTime<Utc>>,
}

impl<T: Serialize + DeserializeOwned> Persisted<T> {
    /// Loads `key`, falling back to `fallback` when the key is absent or
    /// does not parse.
    #[tracing::instrument(skip(backend, fallback, debounce))]
    pub fn load(backend: Rc<dyn KvBackend>, key: &str, fallback: T, debounce: Duration) -> Self {
        let value = match backend.get_item(key) {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => value,
                Err(err) => {
                    debug!(key, error = %err, "stored value did not parse; using fallback");
                    fallback
                }
            },
            Ok(None) => {
                trace!(key, "no stored value; using fallback");
                fallback
            }
            Err(err) => {
                debug!(key, error = %err, "storage read failed; using fallback");
                fallback
            }
        };

        Self {
            key: key.to_string(),
            value,
            backend,
            debounce,
            write_due: None,
        }
    }

    /// Replaces the in-memory value with a remote one when `event` is for
    /// this key and carries a parsable value. A pending local write is
    /// dropped.
    pub fn apply_remote(&mut self, event: &StorageEvent) -> bool {
        if event.key != self.key {
            return false;
        }
        let Some(raw) = event.new_value.as_deref() else {
            trace!(key = %self.key, "remote removal ignored");
            return false;
        };
        match serde_json::from_str::<T>(raw) {
            Ok(value) => {
                if self.write_due.take().is_some() {
                    debug!(key = %self.key, "remote value superseded pending write");
                }
                self.value = value;
                true
            }
            Err(err) => {
                trace!(key = %self.key, error = %err, "ignoring unparsable remote value");
                false
            }
        }
    }
}

impl<T: Serialize> Persisted<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T, now: DateTime<Utc>) {
        self.value = value;
        self.schedule(now);
    }

    /// Mutates the value in place and schedules a write.
    pub fn update<R>(&mut self, now: DateTime<Utc>, f: impl FnOnce(&mut T) -> R) -> R {
        let out = f(&mut self.value);
        self.schedule(now);
        out
    }

    fn schedule(&mut self, now: DateTime<Utc>) {
        let due = now
            .checked_add_signed(self.debounce)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if self.write_due.replace(due).is_some() {
            trace!(key = %self.key, %due, "rescheduled pending write");
        } else {
            trace!(key = %self.key, %due, "scheduled write");
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.write_due.is_some()
    }

    pub fn write_due(&self) -> Option<DateTime<Utc>> {
        self.write_due
    }

    /// Writes the value if its debounce window has elapsed at `now`.
    pub fn poll(&mut self, now: DateTime<Utc>) -> bool {
        match self.write_due {
            Some(due) if due <= now => {
                self.flush();
                true
            }
            _ => false,
        }
    }

    /// Writes a pending value right away. Failures are logged; the value
    /// stays in memory only.
    pub fn flush(&mut self) {
        if self.write_due.take().is_none() {
            return;
        }

        let payload = match serde_json::to_string(&self.value) {
            Ok(payload) => payload,
            Err(err) => {
                error!(key = %self.key, error = %err, "failed to serialize value for storage");
                return;
            }
        };

        match self.backend.set_item(&self.key, &payload) {
            Ok(()) => debug!(key = %self.key, bytes = payload.len(), "persisted value"),
            Err(err) => error!(key = %self.key, error = %err, "failed to persist value"),
        }
    }
}

impl<T: Serialize> Drop for Persisted<T> {
    fn drop(&mut self) {
        if self.is_dirty() {
            warn!(key = %self.key, "flushing pending write on teardown");
            self.flush();
        }
    }
}

impl<T: Serialize + fmt::Debug> fmt::Debug for Persisted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persisted")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("write_due", &self.write_due)
            .finish()
    }
}
