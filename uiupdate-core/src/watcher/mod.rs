//! Long-lived znode watchers
//!
//! Coordination-service watches are one-shot. A watcher keeps one armed at
//! all times while the client is connected, re-reads the node after every
//! event and publishes a [`WatchUpdate`] on its channel whenever the observed
//! value differs from the cached one. A poll ticker re-reads the node
//! between events so drift is noticed even if an event is lost.
//!
//! Two targets are provided:
//!
//! - [`NodeWatcher`]: a single node's data and data version. The node does
//!   not have to exist.
//! - [`ChildrenWatcher`]: the child names of a node that must exist.
//!
//! Each watcher runs its loop on its own task. Closing (or dropping) the
//! handle stops the loop and unregisters its state listener.

pub mod children;
pub mod value;

pub use children::ChildrenTarget;
pub use value::{NodeValue, ValueTarget};

use crate::error::{UiUpdateError, UiUpdateResult};
use crate::retry::{BackoffConfig, ExponentialBackoff};
use crate::zk::{ClientState, EventReceiver, WatchEvent, ZkClient};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Watcher over a single node's value
pub type NodeWatcher = Watcher<ValueTarget>;

/// Watcher over a node's children
pub type ChildrenWatcher = Watcher<ChildrenTarget>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// A change observed by a watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchUpdate<T> {
    pub path: String,
    pub value: T,
}

/// What a watcher observes and how it reads it
#[async_trait]
pub trait WatchTarget: Send + Sync + 'static {
    type Value: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// Read the value when the watcher is created
    async fn initial(&self, client: &dyn ZkClient, path: &str) -> UiUpdateResult<Self::Value>;

    /// Read the current value without leaving a watch
    async fn read(&self, client: &dyn ZkClient, path: &str) -> UiUpdateResult<Self::Value>;

    /// Read the current value and leave a one-shot watch
    async fn arm(
        &self,
        client: &dyn ZkClient,
        path: &str,
    ) -> UiUpdateResult<(Self::Value, EventReceiver)>;
}

struct Shared<V> {
    value: Mutex<V>,
}

impl<V: Clone + PartialEq> Shared<V> {
    /// Store `value`, returning whether it differs from the cached one
    fn replace(&self, value: &V) -> bool {
        let mut current = self.value.lock();
        if *current == *value {
            return false;
        }
        *current = value.clone();
        true
    }
}

/// Handle of a running watch loop
pub struct Watcher<T: WatchTarget> {
    path: String,
    listener_id: String,
    client: Arc<dyn ZkClient>,
    shared: Arc<Shared<T::Value>>,
    closed: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: WatchTarget> Watcher<T> {
    /// Start watching `path`
    ///
    /// Fails with `ListenerNotProvided` if `listener` is already closed and
    /// with `Disconnected` if the client is not connected.
    pub async fn start(
        target: T,
        client: Arc<dyn ZkClient>,
        path: &str,
        poll_timeout: Duration,
        listener: mpsc::Sender<WatchUpdate<T::Value>>,
    ) -> UiUpdateResult<Self> {
        if listener.is_closed() {
            return Err(UiUpdateError::ListenerNotProvided {
                path: path.to_string(),
            });
        }
        if client.client_state() != ClientState::Connected {
            return Err(UiUpdateError::Disconnected {
                path: path.to_string(),
            });
        }

        let initial = target.initial(client.as_ref(), path).await?;
        let shared = Arc::new(Shared {
            value: Mutex::new(initial),
        });

        let listener_id = format!(
            "{}#{}",
            path,
            NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)
        );
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        client.register_listener(&listener_id, state_tx);

        let (closed, closed_rx) = watch::channel(false);
        let watch_loop = WatchLoop {
            target,
            client: client.clone(),
            path: path.to_string(),
            shared: shared.clone(),
            listener,
            poll_timeout,
            backoff: ExponentialBackoff::new(BackoffConfig::watcher()),
            state_rx,
            closed_rx,
        };
        let task = tokio::spawn(watch_loop.run());
        debug!(path = %path, "watcher started");

        Ok(Self {
            path: path.to_string(),
            listener_id,
            client,
            shared,
            closed,
            task: Mutex::new(Some(task)),
        })
    }

    /// Last observed value
    pub fn value(&self) -> T::Value {
        self.shared.value.lock().clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stop the loop; it observes the signal at its next select
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.client.unregister_listener(&self.listener_id);
        debug!(path = %self.path, "watcher closed");
    }

    /// Close and wait for the loop to exit
    pub async fn shutdown(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl<T: WatchTarget> Drop for Watcher<T> {
    fn drop(&mut self) {
        self.close();
    }
}

struct WatchLoop<T: WatchTarget> {
    target: T,
    client: Arc<dyn ZkClient>,
    path: String,
    shared: Arc<Shared<T::Value>>,
    listener: mpsc::Sender<WatchUpdate<T::Value>>,
    poll_timeout: Duration,
    backoff: ExponentialBackoff,
    state_rx: mpsc::UnboundedReceiver<ClientState>,
    closed_rx: watch::Receiver<bool>,
}

/// Resolves once the watcher is closed or its handle is gone
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Next event of the armed watch; pending forever when none is armed
async fn next_event(events: &mut Option<EventReceiver>) -> Result<WatchEvent, oneshot::error::RecvError> {
    match events {
        Some(events) => events.await,
        None => futures::future::pending().await,
    }
}

enum Step {
    Continue,
    Stop,
}

impl<T: WatchTarget> WatchLoop<T> {
    async fn run(mut self) {
        let mut connected = self.client.client_state() == ClientState::Connected;
        let mut events: Option<EventReceiver> = None;
        let mut ticker = interval(self.poll_timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if connected && events.is_none() {
                match self.target.arm(self.client.as_ref(), &self.path).await {
                    Ok((value, armed)) => {
                        self.backoff.reset();
                        events = Some(armed);
                        if let Step::Stop = self.publish(value).await {
                            break;
                        }
                    }
                    Err(e) => {
                        let delay = self.backoff.next_delay();
                        warn!(path = %self.path, error = %e, delay = ?delay, "failed to arm watch, backing off");
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = wait_closed(&mut self.closed_rx) => break,
                            state = self.state_rx.recv() => match state {
                                Some(state) => connected = state == ClientState::Connected,
                                None => break,
                            },
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = wait_closed(&mut self.closed_rx) => break,
                state = self.state_rx.recv() => match state {
                    Some(ClientState::Connected) => {
                        if !connected {
                            debug!(path = %self.path, "reconnected, re-arming watch");
                        }
                        connected = true;
                    }
                    Some(ClientState::Disconnected) => {
                        debug!(path = %self.path, "disconnected, pausing watch");
                        connected = false;
                        events = None;
                    }
                    None => break,
                },
                event = next_event(&mut events) => {
                    events = None;
                    match event {
                        Ok(WatchEvent::Disconnected) | Err(_) => {
                            if self.client.client_state() != ClientState::Connected {
                                connected = false;
                            }
                        }
                        Ok(event) => trace!(path = %self.path, ?event, "watch fired"),
                    }
                }
                _ = ticker.tick() => {
                    if connected {
                        match self.target.read(self.client.as_ref(), &self.path).await {
                            Ok(value) => {
                                if let Step::Stop = self.publish(value).await {
                                    break;
                                }
                            }
                            Err(e) => debug!(path = %self.path, error = %e, "poll read failed"),
                        }
                    }
                }
            }
        }

        debug!(path = %self.path, "watch loop stopped");
    }

    /// Cache `value` and hand it to the listener if it changed
    async fn publish(&mut self, value: T::Value) -> Step {
        if !self.shared.replace(&value) {
            return Step::Continue;
        }
        let update = WatchUpdate {
            path: self.path.clone(),
            value,
        };
        tokio::select! {
            sent = self.listener.send(update) => match sent {
                Ok(()) => Step::Continue,
                Err(_) => {
                    debug!(path = %self.path, "listener dropped, stopping watcher");
                    Step::Stop
                }
            },
            _ = wait_closed(&mut self.closed_rx) => Step::Stop,
        }
    }
}
