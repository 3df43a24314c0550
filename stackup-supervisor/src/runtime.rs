use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use stackup_core::ServiceConfig;
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::events::{Bus, Event};
use crate::health::HealthPoller;
use crate::state::{ServiceState, ServiceStatus};

/// Per-service runtime bookkeeping, owned by the supervisor.
///
/// `op_lock` serializes user-facing operations (start/stop) for one
/// service; short state mutations go through the `state` lock and are
/// atomic on their own, which is what lets the exit monitor settle an
/// exit while a stop holds the operation lock.
pub(crate) struct ServiceRuntime {
    pub name: String,
    pub config: RwLock<ServiceConfig>,
    pub state: RwLock<ServiceState>,
    status_tx: watch::Sender<ServiceStatus>,
    pub op_lock: AsyncMutex<()>,
    /// Bumped on every stop request; pending restart timers abort when
    /// it moves.
    pub stop_epoch: AtomicU64,
    /// Bumped per spawn; a superseded exit monitor discards its result.
    pub monitor_gen: AtomicU64,
    poller: Mutex<Option<HealthPoller>>,
}

impl ServiceRuntime {
    pub fn new(config: ServiceConfig) -> Arc<Self> {
        let (status_tx, _rx) = watch::channel(ServiceStatus::Stopped);
        Arc::new(Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            state: RwLock::new(ServiceState::default()),
            status_tx,
            op_lock: AsyncMutex::new(()),
            stop_epoch: AtomicU64::new(0),
            monitor_gen: AtomicU64::new(0),
            poller: Mutex::new(None),
        })
    }

    pub fn status(&self) -> ServiceStatus {
        self.state.read().status
    }

    pub fn snapshot(&self) -> ServiceState {
        self.state.read().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }

    /// Unconditionally moves to `status`, notifying watchers and the
    /// bus if it actually changed.
    pub fn set_status(&self, status: ServiceStatus, bus: &Bus) {
        self.transition(bus, |_| Some(status));
    }

    /// Applies `f` under the state lock. `f` may mutate freely and
    /// returns the next status, or `None` to keep the current one.
    /// Watch and bus notifications fire inside the critical section so
    /// observers see transitions in order.
    pub fn transition<F>(&self, bus: &Bus, f: F) -> Option<(ServiceStatus, ServiceStatus)>
    where
        F: FnOnce(&mut ServiceState) -> Option<ServiceStatus>,
    {
        let mut state = self.state.write();
        let old = state.status;
        let new = f(&mut state)?;
        state.status = new;
        if new != old {
            self.status_tx.send_replace(new);
            bus.publish(Event::StateChange {
                service: self.name.clone(),
                status: new,
            });
        }
        Some((old, new))
    }

    pub fn install_poller(&self, poller: HealthPoller) {
        if let Some(old) = self.poller.lock().replace(poller) {
            old.cancel();
        }
    }

    /// Cancels the active poller and waits for it to wind down.
    pub async fn stop_poller(&self) {
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            poller.stop().await;
        }
    }
}
