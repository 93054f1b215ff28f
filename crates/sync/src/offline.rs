//! Connectivity signal shared by the scheduler and the engine's step gate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use verdant_infra::workflow::StepGate;

/// Connectivity state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(self) -> bool {
        self == ConnectivityState::Online
    }
}

/// Current connectivity plus change notifications.
///
/// Cheap to clone; all clones share one signal. As a [`StepGate`] it lets a
/// step start only while online.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl Connectivity {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn online() -> Self {
        Self::new(ConnectivityState::Online)
    }

    pub fn offline() -> Self {
        Self::new(ConnectivityState::Offline)
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Update the state; returns whether it changed. Subscribers are only
    /// woken on a change.
    pub fn set(&self, state: ConnectivityState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            info!(state = ?state, "connectivity changed");
        }
        changed
    }

    pub fn set_online(&self) -> bool {
        self.set(ConnectivityState::Online)
    }

    pub fn set_offline(&self) -> bool {
        self.set(ConnectivityState::Offline)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}

impl StepGate for Connectivity {
    fn may_start_step(&self) -> bool {
        self.is_online()
    }
}
