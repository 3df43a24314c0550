use stackup_core::ConfigDiff;
use stackup_logging::LogLine;
use tokio::sync::broadcast;

use crate::sampler::ResourceSample;
use crate::state::ServiceStatus;

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Events published by the supervisor.
#[derive(Debug, Clone)]
pub enum Event {
    /// A visible lifecycle transition.
    StateChange {
        service: String,
        status: ServiceStatus,
    },
    /// A captured stdout/stderr line, including synthetic healthcheck
    /// lines.
    Log(LogLine),
    /// An asynchronous error not attributable to a specific call.
    Error { service: String, message: String },
    /// Every service reached a terminal status.
    AllStopped,
    /// A reload was applied; carries the change sets.
    ConfigReloaded(ConfigDiff),
    /// A reload failed; the previous config stays active.
    ConfigError { message: String },
    /// Samples that moved beyond the hysteresis threshold this tick.
    ResourcesUpdated(Vec<(String, ResourceSample)>),
}

/// Broadcast bus for supervisor events.
///
/// All subscribers receive every event published after they subscribed,
/// in publish order. Publishing with no subscribers drops the event;
/// the supervisor runs fine unobserved.
#[derive(Debug, Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
