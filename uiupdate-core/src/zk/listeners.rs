//! Keyed fan-out of connection state transitions

use super::ClientState;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Tracks the connection state and notifies registered listeners on change
#[derive(Debug)]
pub struct StateListeners {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: ClientState,
    listeners: HashMap<String, mpsc::UnboundedSender<ClientState>>,
}

impl StateListeners {
    pub fn new(initial: ClientState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: initial,
                listeners: HashMap::new(),
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    /// Register a listener and hand it the current state
    pub fn register(&self, id: &str, listener: mpsc::UnboundedSender<ClientState>) {
        let mut inner = self.inner.lock();
        if listener.send(inner.state).is_ok() {
            inner.listeners.insert(id.to_string(), listener);
        }
    }

    pub fn unregister(&self, id: &str) {
        self.inner.lock().listeners.remove(id);
    }

    /// Record a new state; listeners are only notified when it differs from the last one
    ///
    /// Returns whether the state changed.
    pub fn transition(&self, state: ClientState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == state {
            return false;
        }
        debug!(from = ?inner.state, to = ?state, "coordination client state change");
        inner.state = state;
        inner
            .listeners
            .retain(|_, listener| listener.send(state).is_ok());
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
