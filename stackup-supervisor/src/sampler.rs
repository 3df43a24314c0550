use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// One CPU/memory reading for a tracked process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    /// May exceed 100 on multi-core machines.
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub mem_percent: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub interval: Duration,
    /// Bounded history per service, oldest evicted.
    pub history_len: usize,
    /// Publish hysteresis: CPU delta that counts as a change.
    pub cpu_delta: f64,
    /// Publish hysteresis: RSS delta in bytes that counts as a change.
    pub rss_delta: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            history_len: 60,
            cpu_delta: 0.1,
            rss_delta: 1024,
        }
    }
}

/// Periodic CPU/RSS sampler over the platform process table.
///
/// One `ps` invocation per tick covers the union of tracked pids; a pid
/// that died between registration and the tick simply drops out of the
/// output and is skipped. Only the direct child pid is watched;
/// grandchildren (e.g. under `bash -c` or `docker compose up`) are
/// invisible to this sampler.
pub struct ResourceSampler {
    inner: Arc<SamplerInner>,
    token: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

struct SamplerInner {
    config: SamplerConfig,
    tracked: DashMap<String, u32>,
    history: DashMap<String, VecDeque<ResourceSample>>,
    last_published: DashMap<String, ResourceSample>,
}

impl ResourceSampler {
    pub fn spawn<F>(config: SamplerConfig, on_update: F) -> Self
    where
        F: Fn(Vec<(String, ResourceSample)>) + Send + Sync + 'static,
    {
        let inner = Arc::new(SamplerInner {
            config,
            tracked: DashMap::new(),
            history: DashMap::new(),
            last_published: DashMap::new(),
        });
        let token = CancellationToken::new();

        let tick_inner = inner.clone();
        let tick_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(tick_inner.config.interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick_token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Some(changed) = tick(&tick_inner).await {
                            on_update(changed);
                        }
                    }
                }
            }
        });

        Self {
            inner,
            token,
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Registers a pid under a service name. Re-tracking a name resets
    /// its history.
    pub fn track(&self, service: impl Into<String>, pid: u32) {
        let service = service.into();
        self.inner
            .history
            .insert(service.clone(), VecDeque::with_capacity(self.inner.config.history_len));
        self.inner.last_published.remove(&service);
        self.inner.tracked.insert(service, pid);
    }

    /// Stops sampling a service. Its history stays readable for
    /// post-mortem viewing until [`clear`](Self::clear) or a re-track.
    pub fn untrack(&self, service: &str) {
        self.inner.tracked.remove(service);
    }

    pub fn latest(&self, service: &str) -> Option<ResourceSample> {
        self.inner
            .history
            .get(service)
            .and_then(|h| h.back().cloned())
    }

    pub fn history(&self, service: &str) -> Vec<ResourceSample> {
        self.inner
            .history
            .get(service)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, service: &str) {
        self.inner.history.remove(service);
        self.inner.last_published.remove(service);
    }

    /// Cancels the ticker; no update callback fires after this returns.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn tick(inner: &SamplerInner) -> Option<Vec<(String, ResourceSample)>> {
    let tracked: Vec<(String, u32)> = inner
        .tracked
        .iter()
        .map(|entry| (entry.key().clone(), *entry.value()))
        .collect();
    if tracked.is_empty() {
        return None;
    }

    let pid_list = tracked
        .iter()
        .map(|(_, pid)| pid.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let output = Command::new("ps")
        .args(["-o", "pid=,pcpu=,pmem=,rss=", "-p", &pid_list])
        .output()
        .await
        .ok()?;

    // `ps` exits non-zero when every listed pid is gone; either way we
    // parse whatever rows came back and skip the rest.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut by_pid: HashMap<u32, ResourceSample> = HashMap::new();
    let now = Utc::now();
    for line in stdout.lines() {
        if let Some((pid, cpu, mem, rss_kib)) = parse_ps_line(line) {
            by_pid.insert(
                pid,
                ResourceSample {
                    cpu_percent: cpu,
                    rss_bytes: rss_kib * 1024,
                    mem_percent: mem,
                    timestamp: now,
                },
            );
        }
    }

    let mut changed = Vec::new();
    for (service, pid) in tracked {
        let Some(sample) = by_pid.get(&pid) else {
            trace!(service, pid, "no process-table row this tick");
            continue;
        };

        let mut history = inner
            .history
            .entry(service.clone())
            .or_insert_with(VecDeque::new);
        history.push_back(sample.clone());
        while history.len() > inner.config.history_len {
            history.pop_front();
        }
        drop(history);

        let moved = match inner.last_published.get(&service) {
            Some(prev) => {
                (sample.cpu_percent - prev.cpu_percent).abs() > inner.config.cpu_delta
                    || sample.rss_bytes.abs_diff(prev.rss_bytes) > inner.config.rss_delta
            }
            None => true,
        };
        if moved {
            inner
                .last_published
                .insert(service.clone(), sample.clone());
            changed.push((service, sample.clone()));
        }
    }

    if changed.is_empty() {
        None
    } else {
        Some(changed)
    }
}

/// Parses one `ps -o pid=,pcpu=,pmem=,rss=` row: pid, cpu%, mem%, RSS
/// in KiB.
fn parse_ps_line(line: &str) -> Option<(u32, f64, f64, u64)> {
    let mut fields = line.split_whitespace();
    let pid = fields.next()?.parse().ok()?;
    let cpu = fields.next()?.parse().ok()?;
    let mem = fields.next()?.parse().ok()?;
    let rss = fields.next()?.parse().ok()?;
    Some((pid, cpu, mem, rss))
}

const SPARK_BLOCKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Renders the last `width` values as a block-character sparkline,
/// scaled to the window's own min/max. Shorter histories are left-padded
/// with spaces.
pub fn sparkline(values: &[f64], width: usize) -> String {
    if width == 0 {
        return String::new();
    }
    let window = &values[values.len().saturating_sub(width)..];
    let mut out = String::with_capacity(width * 3);
    for _ in window.len()..width {
        out.push(' ');
    }
    if window.is_empty() {
        return out;
    }

    let min = window.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = window.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    for &v in window {
        let idx = if span <= f64::EPSILON {
            0
        } else {
            (((v - min) / span) * (SPARK_BLOCKS.len() - 1) as f64).round() as usize
        };
        out.push(SPARK_BLOCKS[idx.min(SPARK_BLOCKS.len() - 1)]);
    }
    out
}

/// Formats a byte count for display: plain bytes below 1 KB, one
/// decimal from KB upward.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    let b = bytes as f64;
    if b < KB {
        format!("{bytes} B")
    } else if b < MB {
        format!("{:.1} KB", b / KB)
    } else if b < GB {
        format!("{:.1} MB", b / MB)
    } else {
        format!("{:.1} GB", b / GB)
    }
}
