//! Registry correlating invocation ids with pending callbacks.

use crate::error::ClientError;
use hubwire_protocol::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Message used to cancel callbacks still pending when the manager is dropped.
pub const DEFAULT_DISCONNECT_MESSAGE: &str =
    "connection went out of scope before invocation result was received";

/// Single-shot continuation for an invocation.
pub type InvocationCallback = Box<dyn FnOnce(Result<Value, ClientError>) + Send>;

/// Thread-safe map of invocation id to pending callback.
///
/// Every registered callback fires at most once: on a matching completion or
/// on cancellation. Callbacks always run after the registry lock is released.
pub struct CallbackManager {
    /// `None` marks an id whose callback already fired but has not been removed.
    callbacks: Mutex<HashMap<String, Option<InvocationCallback>>>,
    next_id: AtomicU64,
    disconnect_message: String,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::with_disconnect_message(DEFAULT_DISCONNECT_MESSAGE)
    }

    /// Creates a manager that cancels leftovers with `message` when dropped.
    pub fn with_disconnect_message(message: impl Into<String>) -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            disconnect_message: message.into(),
        }
    }

    /// Stores `callback` under a fresh id and returns the id.
    pub fn register(&self, callback: InvocationCallback) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        self.callbacks.lock().insert(id.clone(), Some(callback));
        id
    }

    /// Fires the callback registered under `id`.
    ///
    /// With an `error` the callback receives [`ClientError::Hub`], otherwise
    /// `value`. When `remove` is false the id stays reserved until
    /// [`remove`](Self::remove), but the callback never fires again.
    ///
    /// Returns `false` if no unfired callback was registered under `id`.
    pub fn invoke(&self, id: &str, error: Option<&str>, value: Value, remove: bool) -> bool {
        let callback = {
            let mut callbacks = self.callbacks.lock();
            if remove {
                callbacks.remove(id).flatten()
            } else {
                callbacks.get_mut(id).and_then(Option::take)
            }
        };

        match callback {
            Some(callback) => {
                match error {
                    Some(error) => callback(Err(ClientError::Hub(error.to_string()))),
                    None => callback(Ok(value)),
                }
                true
            }
            None => false,
        }
    }

    /// Removes the entry for `id` without firing it.
    pub fn remove(&self, id: &str) -> bool {
        self.callbacks.lock().remove(id).is_some()
    }

    /// Fires every pending callback with [`ClientError::Cancelled`] and empties
    /// the registry.
    pub fn cancel_all(&self, message: &str) {
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        if !callbacks.is_empty() {
            tracing::debug!("cancelling {} pending invocations", callbacks.len());
        }
        for callback in callbacks.into_values().flatten() {
            callback(Err(ClientError::Cancelled(message.to_string())));
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallbackManager {
    fn drop(&mut self) {
        let message = std::mem::take(&mut self.disconnect_message);
        self.cancel_all(&message);
    }
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackManager")
            .field("pending", &self.len())
            .finish()
    }
}
