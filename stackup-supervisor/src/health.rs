use std::collections::HashMap;
use std::path::{Path, PathBuf};

use stackup_core::{ProbeSpec, ServiceCommand};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of a single probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// Probe exited non-zero; carries the exit indicator.
    Unhealthy(i32),
    /// Probe ran past its timeout and was force-killed.
    TimedOut,
    /// Probe could not be spawned or awaited.
    Error(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }

    /// Human-readable outcome, used in the synthetic log lines.
    pub fn describe(&self) -> String {
        match self {
            ProbeOutcome::Healthy => "succeeded".to_string(),
            ProbeOutcome::Unhealthy(code) => format!("failed (exit code {code})"),
            ProbeOutcome::TimedOut => "timed out".to_string(),
            ProbeOutcome::Error(msg) => format!("errored ({msg})"),
        }
    }
}

/// Runs the probe once, enforcing the per-attempt timeout. A probe that
/// outlives the timeout is force-killed and reaped.
pub async fn run_probe(probe: &ProbeSpec, cwd: &Path, env: &HashMap<String, String>) -> ProbeOutcome {
    let spawned = ServiceCommand::parse(&probe.cmd)
        .current_dir(cwd)
        .envs(env.iter())
        .discard_output()
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => return ProbeOutcome::Error(e.to_string()),
    };

    match time::timeout(probe.timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => ProbeOutcome::Healthy,
        Ok(Ok(status)) => ProbeOutcome::Unhealthy(status.indicator()),
        Ok(Err(e)) => ProbeOutcome::Error(e.to_string()),
        Err(_) => {
            let _ = child.kill().await;
            ProbeOutcome::TimedOut
        }
    }
}

/// Gate mode: retries the probe until it succeeds or `retries`
/// consecutive attempts have failed. `on_attempt` fires after every
/// attempt with the attempt number (1-based) and its outcome.
pub async fn wait_for_healthy<F>(
    probe: &ProbeSpec,
    cwd: &Path,
    env: &HashMap<String, String>,
    mut on_attempt: F,
) -> bool
where
    F: FnMut(u32, &ProbeOutcome),
{
    for attempt in 1..=probe.retries {
        let outcome = run_probe(probe, cwd, env).await;
        on_attempt(attempt, &outcome);
        if outcome.is_healthy() {
            return true;
        }
        if attempt < probe.retries {
            time::sleep(probe.interval).await;
        }
    }
    false
}

/// Poll mode: repeats the probe forever, spacing attempts by `interval`
/// measured from the previous attempt's completion. At most one probe
/// runs at a time.
pub struct HealthPoller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthPoller {
    pub fn spawn<F>(
        probe: ProbeSpec,
        cwd: PathBuf,
        env: HashMap<String, String>,
        on_result: F,
    ) -> Self
    where
        F: Fn(ProbeOutcome) + Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let poll_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                let outcome = tokio::select! {
                    _ = poll_token.cancelled() => break,
                    outcome = run_probe(&probe, &cwd, &env) => outcome,
                };
                if poll_token.is_cancelled() {
                    break;
                }
                on_result(outcome);

                tokio::select! {
                    _ = poll_token.cancelled() => break,
                    _ = time::sleep(probe.interval) => {}
                }
            }
            debug!("health poller exited");
        });

        Self { token, handle }
    }

    /// Cancels the poller and waits for it to wind down. No callback
    /// fires after this returns; a probe in flight is killed on drop.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }

    /// Fire-and-forget cancellation for drop paths that cannot await.
    pub fn cancel(&self) {
        self.token.cancel();
        self.handle.abort();
    }
}
