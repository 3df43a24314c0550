use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use stackup_core::{
    graph, reload_project, send_signal, ConfigDiff, Error, GroupConfig, Project, Result,
    ServiceCommand, ServiceConfig, StopSignal, WaitCondition,
};
use stackup_logging::{read_lines, LogLine, LogStore, StreamKind};
use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};

use crate::events::{Bus, Event};
use crate::health::{self, HealthPoller};
use crate::runtime::ServiceRuntime;
use crate::sampler::{ResourceSample, ResourceSampler, SamplerConfig};
use crate::state::{ServiceState, ServiceStatus};

pub const DEPENDENCY_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
pub const RESTART_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Stop a live service first instead of treating start as a no-op.
    pub force: bool,
    /// Skip dependency resolution (used by policy restarts, where the
    /// dependencies are assumed to still be up).
    pub skip_deps: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    /// Leave services that depend on this one running.
    pub skip_dependents: bool,
    /// Override the configured stop signal.
    pub signal: Option<StopSignal>,
    /// Grace period before escalating to SIGKILL.
    pub timeout: Option<Duration>,
}

/// The orchestrator. Owns all runtime state, child handles and timers;
/// it is the sole mutator. Construct one per project; tests can run
/// several isolated supervisors side by side.
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    project: ArcSwap<Project>,
    services: Arc<DashMap<String, Arc<ServiceRuntime>>>,
    bus: Bus,
    logs: Arc<LogStore>,
    sampler: ResourceSampler,
}

impl Inner {
    fn runtime(&self, name: &str) -> Result<Arc<ServiceRuntime>> {
        self.services
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownService(name.to_string()))
    }
}

impl Supervisor {
    pub fn new(project: Project) -> Self {
        let bus = Bus::default();
        let logs = Arc::new(LogStore::default());
        let services: Arc<DashMap<String, Arc<ServiceRuntime>>> = Arc::new(DashMap::new());
        for svc in &project.services {
            services.insert(svc.name.clone(), ServiceRuntime::new(svc.clone()));
        }

        let sampler = ResourceSampler::spawn(SamplerConfig::default(), {
            let services = services.clone();
            let bus = bus.clone();
            move |changed| {
                for (name, sample) in &changed {
                    if let Some(rt) = services.get(name.as_str()) {
                        rt.state.write().resources = Some(sample.clone());
                    }
                }
                bus.publish(Event::ResourcesUpdated(changed));
            }
        });

        Self {
            inner: Arc::new(Inner {
                project: ArcSwap::from_pointee(project),
                services,
                bus,
                logs,
                sampler,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.bus.subscribe()
    }

    pub fn logs(&self) -> Arc<LogStore> {
        self.inner.logs.clone()
    }

    pub fn project(&self) -> Arc<Project> {
        self.inner.project.load_full()
    }

    pub fn get_state(&self, name: &str) -> Result<ServiceState> {
        Ok(self.inner.runtime(name)?.snapshot())
    }

    /// States for every service, in topological order.
    pub fn get_all_states(&self) -> Result<Vec<(String, ServiceState)>> {
        let project = self.inner.project.load_full();
        let order = graph::start_order(&project)?;
        Ok(order
            .into_iter()
            .filter_map(|name| {
                let state = self.inner.runtime(&name).ok()?.snapshot();
                Some((name, state))
            })
            .collect())
    }

    pub fn get_service_config(&self, name: &str) -> Result<ServiceConfig> {
        Ok(self.inner.runtime(name)?.config.read().clone())
    }

    pub fn get_groups(&self) -> Vec<GroupConfig> {
        self.inner.project.load().groups.clone()
    }

    pub fn get_resource_history(&self, name: &str) -> Vec<ResourceSample> {
        self.inner.sampler.history(name)
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.start_with(name, StartOptions::default()).await
    }

    pub async fn start_with(&self, name: &str, opts: StartOptions) -> Result<()> {
        start_task(self.inner.clone(), name.to_string(), opts, false).await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.stop_with(name, StopOptions::default()).await
    }

    pub async fn stop_with(&self, name: &str, opts: StopOptions) -> Result<()> {
        stop_task(self.inner.clone(), name.to_string(), opts).await
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Starts every service in topological order. Starts proceed
    /// concurrently; dependency waits enforce the ordering. Per-service
    /// errors do not abort the batch; the first one is returned after
    /// the batch settles.
    pub async fn start_all(&self) -> Result<()> {
        let project = self.inner.project.load_full();
        let order = graph::start_order(&project)?;
        self.start_batch(order).await
    }

    /// Stops every service, dependents strictly before their
    /// dependencies.
    pub async fn stop_all(&self) -> Result<()> {
        let project = self.inner.project.load_full();
        let order = graph::stop_order(&project)?;
        self.stop_batch(order).await
    }

    pub async fn restart_all(&self) -> Result<()> {
        self.stop_all().await?;
        self.start_all().await
    }

    pub async fn start_group(&self, group: &str) -> Result<()> {
        let order = self.group_order(group, false)?;
        self.start_batch(order).await
    }

    pub async fn stop_group(&self, group: &str) -> Result<()> {
        let order = self.group_order(group, true)?;
        self.stop_batch(order).await
    }

    /// Re-reads the config file this project came from, applies the
    /// diff with minimal disruption, and returns the change sets.
    pub async fn reload_config(&self) -> Result<ConfigDiff> {
        let inner = &self.inner;
        let current = inner.project.load_full();
        let (fresh, diff) = match reload_project(&current) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "config reload failed");
                inner.bus.publish(Event::ConfigError {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        for name in &diff.removed {
            // stop_task also bumps the stop epoch, cancelling any
            // pending policy restart for the outgoing service.
            if let Err(e) = stop_task(
                inner.clone(),
                name.clone(),
                StopOptions {
                    skip_dependents: true,
                    ..Default::default()
                },
            )
            .await
            {
                inner.bus.publish(Event::Error {
                    service: name.clone(),
                    message: e.to_string(),
                });
            }
            inner.services.remove(name);
            inner.sampler.clear(name);
        }

        for name in &diff.added {
            if let Some(cfg) = fresh.service(name) {
                inner
                    .services
                    .insert(name.clone(), ServiceRuntime::new(cfg.clone()));
            }
        }

        let mut to_restart = Vec::new();
        for name in &diff.modified {
            let Ok(rt) = inner.runtime(name) else { continue };
            let was_live = rt.status().is_live();
            if let Err(e) = stop_task(
                inner.clone(),
                name.clone(),
                StopOptions {
                    skip_dependents: true,
                    ..Default::default()
                },
            )
            .await
            {
                inner.bus.publish(Event::Error {
                    service: name.clone(),
                    message: e.to_string(),
                });
            }
            rt.state.write().restart_count = 0;
            if was_live {
                to_restart.push(name.clone());
            }
        }

        // Swap definitions for every surviving service (an unmodified
        // service can still differ in fields that do not force a
        // restart, e.g. its healthcheck).
        for svc in &fresh.services {
            if let Ok(rt) = inner.runtime(&svc.name) {
                *rt.config.write() = svc.clone();
            }
        }
        inner.project.store(Arc::new(fresh));

        for name in to_restart {
            if let Err(e) = start_task(inner.clone(), name.clone(), StartOptions::default(), false).await
            {
                inner.bus.publish(Event::Error {
                    service: name,
                    message: e.to_string(),
                });
            }
        }

        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "config reloaded"
        );
        inner.bus.publish(Event::ConfigReloaded(diff.clone()));
        Ok(diff)
    }

    /// Stops everything and winds down background tasks. Call before
    /// process exit.
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.stop_all().await;
        self.inner.sampler.stop().await;
        result
    }

    fn group_order(&self, group: &str, reverse: bool) -> Result<Vec<String>> {
        let project = self.inner.project.load_full();
        let members = project
            .group(group)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown group '{group}'")))?;
        let order = if reverse {
            graph::stop_order(&project)?
        } else {
            graph::start_order(&project)?
        };
        Ok(order
            .into_iter()
            .filter(|name| members.services.contains(name))
            .collect())
    }

    async fn start_batch(&self, names: Vec<String>) -> Result<()> {
        let mut set = JoinSet::new();
        for name in names {
            set.spawn(start_task(
                self.inner.clone(),
                name,
                StartOptions::default(),
                false,
            ));
        }

        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "start failed");
                    first_err.get_or_insert(e);
                }
                Err(join_err) => {
                    warn!(error = %join_err, "start task panicked");
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stop_batch(&self, names: Vec<String>) -> Result<()> {
        let mut first_err = None;
        for name in names {
            // Sequential in reverse-topological order: a dependency only
            // comes down once its dependents are already terminal.
            if let Err(e) = stop_task(
                self.inner.clone(),
                name,
                StopOptions {
                    skip_dependents: true,
                    ..Default::default()
                },
            )
            .await
            {
                warn!(error = %e, "stop failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

type OpFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

fn start_task(inner: Arc<Inner>, name: String, opts: StartOptions, is_restart: bool) -> OpFuture {
    Box::pin(start_impl(inner, name, opts, is_restart))
}

fn stop_task(inner: Arc<Inner>, name: String, opts: StopOptions) -> OpFuture {
    Box::pin(stop_impl(inner, name, opts))
}

async fn start_impl(
    inner: Arc<Inner>,
    name: String,
    opts: StartOptions,
    is_restart: bool,
) -> Result<()> {
    let rt = inner.runtime(&name)?;
    let _op = rt.op_lock.lock().await;

    if rt.status().is_live() {
        if !opts.force {
            return Ok(());
        }
        stop_locked(&inner, &rt, StopOptions::default()).await?;
    }

    let config = rt.config.read().clone();

    if !opts.skip_deps {
        for edge in &config.depends_on {
            let dep = inner.runtime(&edge.service)?;
            let dep_status = dep.status();
            if !condition_met(dep_status, edge.condition) && !dep_status.is_live() {
                if let Err(e) = start_task(
                    inner.clone(),
                    edge.service.clone(),
                    StartOptions::default(),
                    false,
                )
                .await
                {
                    // The wait below surfaces this as DependencyFailed
                    // once the dependency settles in a terminal status.
                    debug!(service = %name, dependency = %edge.service, error = %e, "dependency start failed");
                }
            }

            if let Err(e) = wait_for_dependency(&name, &dep, edge.condition).await {
                fail_start(&inner, &rt, &e);
                return Err(e);
            }
        }
    }

    rt.transition(&inner.bus, |st| {
        st.exit_code = None;
        st.stopped_at = None;
        st.last_error = None;
        if is_restart {
            st.restart_count += 1;
        }
        Some(ServiceStatus::Starting)
    });

    // A child left behind by an exhausted healthcheck gate is still
    // ours; clear it out before spawning a replacement. The generation
    // bump comes first so the old exit monitor discards the kill.
    let generation = rt.monitor_gen.fetch_add(1, Ordering::SeqCst) + 1;
    let stale_pid = rt.state.read().pid;
    if let Some(pid) = stale_pid {
        let _ = send_signal(pid, StopSignal::Kill);
    }

    let spawned = ServiceCommand::parse(&config.cmd)
        .current_dir(&config.cwd)
        .envs(config.env.iter())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            fail_start(&inner, &rt, &e);
            return Err(e);
        }
    };

    let pid = child.pid;
    {
        let mut state = rt.state.write();
        state.pid = Some(pid);
        state.started_at = Some(Utc::now());
    }
    info!(service = %name, pid, "spawned");

    if let Some(stdout) = child.take_stdout() {
        spawn_reader(
            inner.logs.clone(),
            inner.bus.clone(),
            name.clone(),
            StreamKind::Stdout,
            stdout,
        );
    }
    if let Some(stderr) = child.take_stderr() {
        spawn_reader(
            inner.logs.clone(),
            inner.bus.clone(),
            name.clone(),
            StreamKind::Stderr,
            stderr,
        );
    }

    inner.sampler.track(&name, pid);
    spawn_monitor(inner.clone(), rt.clone(), child, generation);

    match config.healthcheck.clone() {
        None => {
            rt.transition(&inner.bus, |st| {
                (st.status == ServiceStatus::Starting).then_some(ServiceStatus::Running)
            });
        }
        Some(probe) => {
            let healthy = health::wait_for_healthy(&probe, &config.cwd, &config.env, |attempt, outcome| {
                let line = LogLine::now(
                    &name,
                    StreamKind::Stderr,
                    format!(
                        "healthcheck attempt {attempt}/{} {}",
                        probe.retries,
                        outcome.describe()
                    ),
                );
                inner.logs.append(line.clone());
                inner.bus.publish(Event::Log(line));
            })
            .await;

            if !healthy {
                let e = Error::HealthcheckExhausted {
                    service: name.clone(),
                    attempts: probe.retries,
                };
                // The child stays up: a failing probe does not imply the
                // process is gone. Its pid remains visible to the caller.
                fail_start(&inner, &rt, &e);
                return Err(e);
            }

            let promoted = rt.transition(&inner.bus, |st| {
                (st.status == ServiceStatus::Starting).then_some(ServiceStatus::Healthy)
            });
            if promoted.is_some() {
                let poller = HealthPoller::spawn(probe, config.cwd.clone(), config.env.clone(), {
                    let rt = rt.clone();
                    let bus = inner.bus.clone();
                    move |outcome| {
                        rt.transition(&bus, |st| match (st.status, outcome.is_healthy()) {
                            (ServiceStatus::Running, true) => Some(ServiceStatus::Healthy),
                            (ServiceStatus::Healthy, false) => Some(ServiceStatus::Running),
                            _ => None,
                        });
                    }
                });
                rt.install_poller(poller);
            }
        }
    }

    Ok(())
}

/// Marks a start attempt failed and surfaces the error on the bus.
fn fail_start(inner: &Arc<Inner>, rt: &Arc<ServiceRuntime>, error: &Error) {
    rt.transition(&inner.bus, |st| {
        st.last_error = Some(error.to_string());
        Some(ServiceStatus::Failed)
    });
    inner.bus.publish(Event::Error {
        service: rt.name.clone(),
        message: error.to_string(),
    });
    check_all_stopped(inner);
}

fn condition_met(status: ServiceStatus, condition: WaitCondition) -> bool {
    match condition {
        WaitCondition::Started => status.is_up(),
        WaitCondition::Healthy => status == ServiceStatus::Healthy,
    }
}

async fn wait_for_dependency(
    service: &str,
    dep: &Arc<ServiceRuntime>,
    condition: WaitCondition,
) -> Result<()> {
    let mut rx = dep.watch_status();
    let waited = time::timeout(DEPENDENCY_WAIT_TIMEOUT, async {
        loop {
            let status = *rx.borrow_and_update();
            if condition_met(status, condition) {
                return Ok(());
            }
            if matches!(status, ServiceStatus::Failed | ServiceStatus::Crashed) {
                return Err(Error::DependencyFailed {
                    service: service.to_string(),
                    dependency: dep.name.clone(),
                    status: status.to_string(),
                });
            }
            if rx.changed().await.is_err() {
                return Err(Error::DependencyFailed {
                    service: service.to_string(),
                    dependency: dep.name.clone(),
                    status: "dropped".to_string(),
                });
            }
        }
    })
    .await;

    match waited {
        Ok(result) => result,
        Err(_) => Err(Error::DependencyTimeout {
            service: service.to_string(),
            dependency: dep.name.clone(),
        }),
    }
}

async fn stop_impl(inner: Arc<Inner>, name: String, opts: StopOptions) -> Result<()> {
    let rt = inner.runtime(&name)?;

    // Dependents come down first, in parallel, before we take our own
    // operation lock (a dependent's cascade can never reach back to us,
    // the graph is acyclic).
    if !opts.skip_dependents {
        let dependents = inner.project.load().dependents_of(&name);
        if !dependents.is_empty() {
            let mut set = JoinSet::new();
            for dependent in dependents {
                set.spawn(stop_task(inner.clone(), dependent, StopOptions::default()));
            }
            while let Some(joined) = set.join_next().await {
                if let Ok(Err(e)) = joined {
                    inner.bus.publish(Event::Error {
                        service: name.clone(),
                        message: format!("stopping dependent failed: {e}"),
                    });
                }
            }
        }
    }

    // Any pending policy restart is a casualty of a manual stop, even
    // when the stop itself turns out to be a no-op.
    rt.stop_epoch.fetch_add(1, Ordering::SeqCst);

    let _op = rt.op_lock.lock().await;
    stop_locked(&inner, &rt, opts).await
}

async fn stop_locked(
    inner: &Arc<Inner>,
    rt: &Arc<ServiceRuntime>,
    opts: StopOptions,
) -> Result<()> {
    let entered = rt.transition(&inner.bus, |st| {
        st.status.is_live().then_some(ServiceStatus::Stopping)
    });
    if entered.is_none() {
        return Ok(());
    }

    rt.stop_poller().await;

    let pid = rt.state.read().pid;
    let Some(pid) = pid else {
        // No child to signal; settle the state directly.
        rt.transition(&inner.bus, |st| {
            st.stopped_at = Some(Utc::now());
            Some(ServiceStatus::Stopped)
        });
        check_all_stopped(inner);
        return Ok(());
    };

    let signal = opts.signal.unwrap_or_else(|| rt.config.read().stop_signal);
    let timeout = opts.timeout.unwrap_or(DEFAULT_STOP_TIMEOUT);

    debug!(service = %rt.name, pid, ?signal, "stopping");
    if let Err(e) = send_signal(pid, signal) {
        // Typically ESRCH: the child exited between the status check and
        // the signal; the exit monitor is already settling it.
        debug!(service = %rt.name, pid, error = %e, "stop signal not delivered");
    }

    let mut rx = rt.watch_status();
    let timed_out = match time::timeout(timeout, rx.wait_for(|s| *s == ServiceStatus::Stopped)).await
    {
        Ok(Ok(_)) => false,
        Ok(Err(_)) | Err(_) => true,
    };
    if timed_out {
        warn!(service = %rt.name, pid, "graceful stop timed out, sending SIGKILL");
        let _ = send_signal(pid, StopSignal::Kill);
        let mut rx = rt.watch_status();
        let _ = rx.wait_for(|s| *s == ServiceStatus::Stopped).await;
    }

    info!(service = %rt.name, "stopped");
    Ok(())
}

fn spawn_reader<R>(logs: Arc<LogStore>, bus: Bus, service: String, stream: StreamKind, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        read_lines(reader, &service, stream, |line| {
            logs.append(line.clone());
            bus.publish(Event::Log(line));
        })
        .await;
    });
}

fn spawn_monitor(
    inner: Arc<Inner>,
    rt: Arc<ServiceRuntime>,
    mut child: stackup_core::SpawnedChild,
    generation: u64,
) {
    tokio::spawn(async move {
        let waited = child.wait().await;
        if rt.monitor_gen.load(Ordering::SeqCst) != generation {
            // A force-restart replaced this child; nothing to record.
            return;
        }

        let exit = match waited {
            Ok(exit) => exit,
            Err(e) => {
                inner.bus.publish(Event::Error {
                    service: rt.name.clone(),
                    message: format!("wait failed: {e}"),
                });
                stackup_core::ExitStatus::new(None, None)
            }
        };

        rt.stop_poller().await;
        inner.sampler.untrack(&rt.name);

        let policy = rt.config.read().restart;
        let settled = rt.transition(&inner.bus, |st| {
            st.exit_code = Some(exit.indicator());
            st.stopped_at = Some(Utc::now());
            st.pid = None;
            match st.status {
                ServiceStatus::Stopping => Some(ServiceStatus::Stopped),
                // A failed gate keeps its status; the exit is recorded.
                ServiceStatus::Failed => None,
                _ if exit.success() => Some(ServiceStatus::Stopped),
                _ => {
                    st.last_error = Some(format!("{exit}"));
                    Some(ServiceStatus::Crashed)
                }
            }
        });
        check_all_stopped(&inner);

        let Some((was, now)) = settled else { return };
        info!(service = %rt.name, %exit, "child exited");

        // Policy restarts never follow a manual stop.
        if was == ServiceStatus::Stopping || !policy.should_restart(exit.success()) {
            return;
        }

        let epoch = rt.stop_epoch.load(Ordering::SeqCst);
        let inner = inner.clone();
        let rt = rt.clone();
        tokio::spawn(async move {
            time::sleep(RESTART_BACKOFF).await;
            if rt.stop_epoch.load(Ordering::SeqCst) != epoch || rt.status() != now {
                return;
            }
            debug!(service = %rt.name, "restart policy firing");
            if let Err(e) = start_task(
                inner.clone(),
                rt.name.clone(),
                StartOptions {
                    force: false,
                    skip_deps: true,
                },
                true,
            )
            .await
            {
                inner.bus.publish(Event::Error {
                    service: rt.name.clone(),
                    message: format!("policy restart failed: {e}"),
                });
            }
        });
    });
}

fn check_all_stopped(inner: &Arc<Inner>) {
    if inner.services.is_empty() {
        return;
    }
    let all_terminal = inner
        .services
        .iter()
        .all(|entry| entry.value().status().is_terminal());
    if all_terminal {
        inner.bus.publish(Event::AllStopped);
    }
}
