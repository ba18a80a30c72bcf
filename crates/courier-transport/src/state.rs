//! Connection state cell with replay-latest subscriptions.

use courier_protocol::ConnectionState;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

const STATE_CAPACITY: usize = 64;

/// Holds the current [`ConnectionState`] of a binding and broadcasts every
/// transition. Only bindings publish; everyone else subscribes.
#[derive(Debug)]
pub struct StateCell {
    current: Mutex<ConnectionState>,
    tx: broadcast::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATE_CAPACITY);
        Self {
            current: Mutex::new(ConnectionState::Disconnected),
            tx,
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.current.lock()
    }

    /// Publish a transition. Returns `false` (and notifies nobody) when the
    /// state is unchanged.
    pub fn publish(&self, state: ConnectionState) -> bool {
        let mut current = self.current.lock();
        if *current == state {
            return false;
        }
        *current = state;
        // Sent under the lock so a concurrent subscriber either replays the
        // old value and then receives this one, or replays this one.
        let _ = self.tx.send(state);
        true
    }

    /// Subscribe to transitions. The first item is the current state.
    pub fn subscribe(&self) -> StateSubscription {
        let current = self.current.lock();
        StateSubscription {
            replay: Some(*current),
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// A stream of states that starts with the value current at subscription.
/// Dropping it releases the subscription.
#[derive(Debug)]
pub struct StateSubscription {
    replay: Option<ConnectionState>,
    rx: broadcast::Receiver<ConnectionState>,
}

impl StateSubscription {
    /// Next state, or `None` once the owning binding is gone.
    pub async fn next(&mut self) -> Option<ConnectionState> {
        if let Some(state) = self.replay.take() {
            return Some(state);
        }
        loop {
            match self.rx.recv().await {
                Ok(state) => return Some(state),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("State subscriber lagged, skipped {skipped} transitions");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Wait until `target` is observed. Returns `false` if the stream ended.
    pub async fn wait_for(&mut self, target: ConnectionState) -> bool {
        while let Some(state) = self.next().await {
            if state == target {
                return true;
            }
        }
        false
    }
}
