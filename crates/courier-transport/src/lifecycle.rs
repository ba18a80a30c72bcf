//! The active-connection slot shared by the bindings.
//!
//! Every binding runs one driver task per connection attempt. The slot
//! records which attempt is current, hands it a shutdown signal, and
//! serializes the two lifecycle edges that must never interleave across
//! attempts: entering `Connecting` and returning to `Disconnected`.

use std::sync::atomic::{AtomicU64, Ordering};

use courier_protocol::{ConnectionState, Result, TransportError};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::channel::Channel;

struct Active<T> {
    generation: u64,
    shutdown: Option<oneshot::Sender<()>>,
    resources: T,
}

pub(crate) struct ConnectionSlot<T> {
    active: Mutex<Option<Active<T>>>,
    generations: AtomicU64,
}

impl<T> ConnectionSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            active: Mutex::new(None),
            generations: AtomicU64::new(1),
        }
    }

    /// Start a new attempt: publish `Connecting` and store its resources.
    /// Returns `None` when an attempt is already active.
    pub(crate) fn begin(
        &self,
        channel: &Channel,
        resources: T,
    ) -> Option<(u64, oneshot::Receiver<()>)> {
        let mut active = self.active.lock();
        if active.is_some() {
            return None;
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (shutdown, shutdown_rx) = oneshot::channel();
        *active = Some(Active {
            generation,
            shutdown: Some(shutdown),
            resources,
        });
        channel.publish_state(ConnectionState::Connecting);
        Some((generation, shutdown_rx))
    }

    /// Signal the current attempt to shut down. Returns `false` when there
    /// is no active attempt.
    pub(crate) fn shutdown(&self) -> bool {
        let mut active = self.active.lock();
        match active.as_mut() {
            Some(current) => {
                if let Some(shutdown) = current.shutdown.take() {
                    let _ = shutdown.send(());
                }
                true
            }
            None => false,
        }
    }

    /// Run `f` against the resources of the current attempt.
    pub(crate) fn with<R>(&self, f: impl FnOnce(u64, &T) -> R) -> Option<R> {
        self.active
            .lock()
            .as_ref()
            .map(|current| f(current.generation, &current.resources))
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|current| current.generation == generation)
    }

    /// End an attempt: clear it and publish `Disconnected`. Called exactly
    /// once by the attempt's driver, whatever ended it.
    pub(crate) fn finish(&self, generation: u64, channel: &Channel) {
        let mut active = self.active.lock();
        if active
            .as_ref()
            .is_some_and(|current| current.generation == generation)
        {
            *active = None;
            channel.publish_state(ConnectionState::Disconnected);
        }
    }
}

/// Wait for the attempt already in progress to settle. Resolves once the
/// state reaches `Connected` and fails if it falls back to `Disconnected`.
pub(crate) async fn join_attempt(channel: &Channel) -> Result<()> {
    let mut state = channel.subscribe_state();
    while let Some(current) = state.next().await {
        match current {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected => {
                return Err(TransportError::channel(
                    "connection attempt ended before reaching Connected",
                ));
            }
            ConnectionState::Connecting => {}
        }
    }
    Err(TransportError::channel("binding dropped while connecting"))
}
