//! Event system for UI decoupling.
//!
//! Lets the CLI (or an application shell) follow an upgrade without
//! reaching into the engine.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::peer::RelayState;
use crate::protocol::UpgradeStatus;
use crate::sm::{AppIndication, UpgradeState};

/// Which link a message travelled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Host,
    Peer,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Host => write!(f, "host"),
            Link::Peer => write!(f, "peer"),
        }
    }
}

/// Message direction, seen from this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx,
    Rx,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by a DFU session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuEvent {
    /// The upgrade machine changed state.
    StateChanged { from: UpgradeState, to: UpgradeState },
    /// The peer relay changed state.
    RelayStateChanged { from: RelayState, to: RelayState },
    /// Upgrade file bytes accepted from the host.
    Progress { received: u64 },
    /// A protocol message went out or came in.
    Packet {
        link: Link,
        direction: PacketDirection,
        name: &'static str,
        length: usize,
    },
    Indication(AppIndication),
    /// ERRORWARN_IND sent to the host.
    Error { status: UpgradeStatus },
    /// The engine asked for a reboot.
    Reboot,
    /// COMPLETE_IND sent; the upgrade is over.
    Complete,
}

/// Observer trait for receiving DFU events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Upgrade state changed");
            }
            DfuEvent::RelayStateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Relay state changed");
            }
            DfuEvent::Progress { received } => {
                tracing::debug!(received, "Progress");
            }
            DfuEvent::Packet {
                link,
                direction,
                name,
                length,
            } => {
                tracing::trace!(link = %link, dir = %direction, msg = name, len = length, "Packet");
            }
            DfuEvent::Indication(indication) => {
                tracing::debug!(?indication, "Application indication");
            }
            DfuEvent::Error { status } => {
                tracing::error!(code = status.code(), "Error: {}", status);
            }
            DfuEvent::Reboot => tracing::info!("Reboot requested"),
            DfuEvent::Complete => tracing::info!("Upgrade complete"),
        }
    }
}

/// Observer that keeps every event, for tests and the simulator.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<DfuEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DfuEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn take(&self) -> Vec<DfuEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Every state the upgrade machine entered, in order.
    pub fn states(&self) -> Vec<UpgradeState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DfuEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

impl DfuObserver for RecordingObserver {
    fn on_event(&self, event: &DfuEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
