pub mod loader;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::StopSignal;

pub use loader::load_project;

/// A validated, normalized project description.
///
/// Construction goes through [`loader::load_project`]; the supervisor
/// treats the value as immutable and swaps the whole thing on reload.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub name: String,
    /// Global environment as declared (pre-merge). Per-service `env`
    /// maps are already merged (dotenv < global < service).
    pub env: HashMap<String, String>,
    /// Services in declaration order.
    pub services: Vec<ServiceConfig>,
    /// Groups in declaration order.
    pub groups: Vec<GroupConfig>,
    /// Source file, re-read on reload.
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupConfig {
    pub name: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    pub cmd: String,
    pub cwd: PathBuf,
    /// Fully merged environment for the child.
    pub env: HashMap<String, String>,
    /// Dependency edges in declaration order.
    pub depends_on: Vec<DependencyEdge>,
    pub healthcheck: Option<ProbeSpec>,
    pub restart: RestartPolicy,
    pub stop_signal: StopSignal,
    pub color: Option<ServiceColor>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub service: String,
    pub condition: WaitCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitCondition {
    Started,
    Healthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSpec {
    pub cmd: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

impl ProbeSpec {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(2_000);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5_000);
    pub const DEFAULT_RETRIES: u32 = 10;

    /// Expansion of the bare-string shorthand.
    pub fn from_cmd(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            interval: Self::DEFAULT_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
            retries: Self::DEFAULT_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[serde(rename = "no")]
    No,
    #[serde(rename = "on-failure")]
    OnFailure,
    #[serde(rename = "always")]
    Always,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::No
    }
}

impl RestartPolicy {
    /// Whether a child exit should trigger a policy-driven restart.
    pub fn should_restart(self, clean_exit: bool) -> bool {
        match self {
            RestartPolicy::No => false,
            RestartPolicy::OnFailure => !clean_exit,
            RestartPolicy::Always => true,
        }
    }
}

/// Display hint consumed by the UI layer; opaque to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceColor {
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
    Gray,
}

/// Change sets produced by comparing two configs during reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

impl Project {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.name.as_str())
    }

    /// Services that declare `name` among their dependencies, in
    /// declaration order.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.services
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d.service == name))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Diffs this config against `new`, classifying every service name.
    ///
    /// A service counts as modified when `cmd`, `cwd`, `env`,
    /// `depends_on`, `restart` or `group` changed. Healthcheck changes
    /// alone do not trip the detector.
    pub fn diff(&self, new: &Project) -> ConfigDiff {
        let mut changes = ConfigDiff::default();

        for svc in &new.services {
            match self.service(&svc.name) {
                None => changes.added.push(svc.name.clone()),
                Some(old) if requires_restart(old, svc) => {
                    changes.modified.push(svc.name.clone());
                }
                Some(_) => {}
            }
        }
        for svc in &self.services {
            if new.service(&svc.name).is_none() {
                changes.removed.push(svc.name.clone());
            }
        }

        changes
    }
}

fn requires_restart(old: &ServiceConfig, new: &ServiceConfig) -> bool {
    old.cmd != new.cmd
        || old.cwd != new.cwd
        || old.env != new.env
        || old.depends_on != new.depends_on
        || old.restart != new.restart
        || old.group != new.group
}
