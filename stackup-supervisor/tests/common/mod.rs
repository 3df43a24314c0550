#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;

use stackup_core::{
    DependencyEdge, ProbeSpec, Project, RestartPolicy, ServiceConfig, StopSignal, WaitCondition,
};
use stackup_supervisor::{Event, ServiceStatus, Supervisor};
use tokio::sync::broadcast;
use tokio::time;

static TRACING: Once = Once::new();

/// Opt-in test logging: `RUST_LOG=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn service(name: &str, cmd: &str) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        cmd: cmd.to_string(),
        cwd: std::env::temp_dir(),
        env: HashMap::new(),
        depends_on: Vec::new(),
        healthcheck: None,
        restart: RestartPolicy::No,
        stop_signal: StopSignal::Term,
        color: None,
        group: None,
    }
}

pub fn with_dep(mut svc: ServiceConfig, dep: &str, condition: WaitCondition) -> ServiceConfig {
    svc.depends_on.push(DependencyEdge {
        service: dep.to_string(),
        condition,
    });
    svc
}

pub fn with_probe(
    mut svc: ServiceConfig,
    cmd: &str,
    interval_ms: u64,
    timeout_ms: u64,
    retries: u32,
) -> ServiceConfig {
    svc.healthcheck = Some(ProbeSpec {
        cmd: cmd.to_string(),
        interval: Duration::from_millis(interval_ms),
        timeout: Duration::from_millis(timeout_ms),
        retries,
    });
    svc
}

pub fn project(services: Vec<ServiceConfig>) -> Project {
    Project {
        name: "test".to_string(),
        env: HashMap::new(),
        services,
        groups: Vec::new(),
        config_path: PathBuf::from("/nonexistent/stackup.yml"),
    }
}

/// Polls until the service reaches `status` or the timeout elapses.
pub async fn wait_for_status(
    supervisor: &Supervisor,
    name: &str,
    status: ServiceStatus,
    timeout: Duration,
) -> bool {
    let deadline = time::Instant::now() + timeout;
    loop {
        if supervisor
            .get_state(name)
            .map_or(false, |s| s.status == status)
        {
            return true;
        }
        if time::Instant::now() >= deadline {
            return false;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
}

/// Drains state-change events until `stop_at` matches one, returning
/// everything seen up to and including it.
pub async fn state_changes_until(
    rx: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    stop_at: impl Fn(&str, ServiceStatus) -> bool,
) -> Vec<(String, ServiceStatus)> {
    let mut seen = Vec::new();
    let deadline = time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        if remaining.is_zero() {
            return seen;
        }
        match time::timeout(remaining, rx.recv()).await {
            Ok(Ok(Event::StateChange { service, status })) => {
                let done = stop_at(&service, status);
                seen.push((service, status));
                if done {
                    return seen;
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return seen,
        }
    }
}

pub fn position_of(
    changes: &[(String, ServiceStatus)],
    service: &str,
    status: ServiceStatus,
) -> Option<usize> {
    changes
        .iter()
        .position(|(s, st)| s == service && *st == status)
}
