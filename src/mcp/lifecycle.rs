//! Connection state machine
//!
//! `Disconnected → Connecting → Ready → Disconnecting → Disconnected`.
//! Any transport error while `Connecting` or `Ready` goes straight to
//! `Disconnected`. The state lives in a `watch` channel so the transport,
//! the client read loop and observers all see the same value.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of a transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Shared, observable connection state
#[derive(Clone)]
pub struct LinkState {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl LinkState {
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.get() == ConnectionState::Ready
    }

    /// Move to `to` only if currently in `from`
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let moved = self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            debug!("Connection state {} -> {}", from, to);
        }
        moved
    }

    /// Transport failure or completed teardown
    pub fn mark_disconnected(&self) {
        let previous = self.tx.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            debug!("Connection state {} -> disconnected", previous);
        }
    }

    /// Watch for state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Wait until the state equals `target`
    pub async fn wait_for(&self, target: ConnectionState) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|state| *state == target).await;
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}

impl fmt::Debug for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LinkState").field(&self.get()).finish()
    }
}
