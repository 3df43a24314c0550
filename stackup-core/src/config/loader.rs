use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use super::{
    ConfigDiff, DependencyEdge, GroupConfig, ProbeSpec, Project, ServiceColor, ServiceConfig,
    WaitCondition,
};
use crate::command::StopSignal;
use crate::config::RestartPolicy;
use crate::duration::parse_duration;
use crate::{graph, Error, Result};

// Raw deserialization structs; field shorthands are expanded during
// normalization. `serde_yaml::Mapping` keeps document order for the
// order-sensitive mappings.

#[derive(Debug, Deserialize)]
struct RawProject {
    name: String,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    dotenv: Option<PathBuf>,
    #[serde(default)]
    groups: serde_yaml::Mapping,
    services: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
struct RawService {
    cmd: String,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    depends_on: Option<RawDependsOn>,
    #[serde(default)]
    healthcheck: Option<RawHealthcheck>,
    #[serde(default)]
    restart: RestartPolicy,
    #[serde(default)]
    color: Option<ServiceColor>,
    #[serde(default)]
    stop_signal: Option<StopSignal>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependsOn {
    /// `depends_on: [db, cache]`, where every entry waits for `started`.
    List(Vec<String>),
    /// `depends_on: {db: healthy}` with explicit wait conditions.
    Map(serde_yaml::Mapping),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawHealthcheck {
    /// Bare command shorthand with default interval/timeout/retries.
    Cmd(String),
    Spec {
        cmd: String,
        #[serde(default)]
        interval: Option<String>,
        #[serde(default)]
        timeout: Option<String>,
        #[serde(default)]
        retries: Option<u32>,
    },
}

/// Loads, normalizes and validates a project config from a YAML file.
///
/// Relative `cwd` entries resolve against the config file's directory;
/// per-service env maps come out fully merged (dotenv < global env <
/// service env). Every structural invariant is checked here so the
/// supervisor can assume a well-formed [`Project`].
pub fn load_project(path: impl AsRef<Path>) -> Result<Project> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::InvalidConfig(format!("cannot read {}: {e}", path.display()))
    })?;
    let raw: RawProject = serde_yaml::from_str(&content)
        .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;

    let config_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let dotenv_vars = match &raw.dotenv {
        Some(rel) => load_dotenv(&resolve_path(&config_dir, rel))?,
        None => HashMap::new(),
    };

    let group_of = normalize_groups(&raw)?;
    let mut services = Vec::with_capacity(raw.services.len());
    for (key, value) in &raw.services {
        let name = mapping_key(key, "services")?;
        let svc: RawService = serde_yaml::from_value(value.clone())
            .map_err(|e| Error::InvalidConfig(format!("service '{name}': {e}")))?;
        services.push(normalize_service(
            name,
            svc,
            &config_dir,
            &dotenv_vars,
            &raw.env,
            group_of.get(name).cloned(),
        )?);
    }

    let groups = collect_groups(&raw)?;
    let project = Project {
        name: raw.name,
        env: raw.env,
        services,
        groups,
        config_path: path.to_path_buf(),
    };

    validate(&project)?;
    debug!(
        project = %project.name,
        services = project.services.len(),
        "loaded config from {}",
        path.display()
    );
    Ok(project)
}

fn normalize_service(
    name: &str,
    raw: RawService,
    config_dir: &Path,
    dotenv_vars: &HashMap<String, String>,
    global_env: &HashMap<String, String>,
    group: Option<String>,
) -> Result<ServiceConfig> {
    if name.trim().is_empty() {
        return Err(Error::InvalidConfig("empty service name".to_string()));
    }

    let mut env = dotenv_vars.clone();
    env.extend(global_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(raw.env);

    let cwd = match raw.cwd {
        Some(dir) => resolve_path(config_dir, &dir),
        None => config_dir.to_path_buf(),
    };

    let depends_on = match raw.depends_on {
        None => Vec::new(),
        Some(RawDependsOn::List(names)) => names
            .into_iter()
            .map(|service| DependencyEdge {
                service,
                condition: WaitCondition::Started,
            })
            .collect(),
        Some(RawDependsOn::Map(map)) => {
            let mut edges = Vec::with_capacity(map.len());
            for (key, value) in &map {
                let dep = mapping_key(key, "depends_on")?;
                let condition: WaitCondition =
                    serde_yaml::from_value(value.clone()).map_err(|e| {
                        Error::InvalidConfig(format!(
                            "service '{name}', dependency '{dep}': {e}"
                        ))
                    })?;
                edges.push(DependencyEdge {
                    service: dep.to_string(),
                    condition,
                });
            }
            edges
        }
    };

    let healthcheck = match raw.healthcheck {
        None => None,
        Some(RawHealthcheck::Cmd(cmd)) => Some(ProbeSpec::from_cmd(cmd)),
        Some(RawHealthcheck::Spec {
            cmd,
            interval,
            timeout,
            retries,
        }) => {
            let retries = retries.unwrap_or(ProbeSpec::DEFAULT_RETRIES);
            if retries == 0 {
                return Err(Error::InvalidConfig(format!(
                    "service '{name}': healthcheck retries must be positive"
                )));
            }
            Some(ProbeSpec {
                cmd,
                interval: match interval {
                    Some(s) => parse_duration(&s)?,
                    None => ProbeSpec::DEFAULT_INTERVAL,
                },
                timeout: match timeout {
                    Some(s) => parse_duration(&s)?,
                    None => ProbeSpec::DEFAULT_TIMEOUT,
                },
                retries,
            })
        }
    };

    Ok(ServiceConfig {
        name: name.to_string(),
        cmd: raw.cmd,
        cwd,
        env,
        depends_on,
        healthcheck,
        restart: raw.restart,
        stop_signal: raw.stop_signal.unwrap_or_default(),
        color: raw.color,
        group,
    })
}

/// Maps service name -> group name, rejecting double membership.
fn normalize_groups(raw: &RawProject) -> Result<HashMap<String, String>> {
    let mut group_of: HashMap<String, String> = HashMap::new();
    for (key, value) in &raw.groups {
        let group = mapping_key(key, "groups")?;
        let members: Vec<String> = serde_yaml::from_value(value.clone())
            .map_err(|e| Error::InvalidConfig(format!("group '{group}': {e}")))?;
        for member in members {
            if let Some(previous) = group_of.insert(member.clone(), group.to_string()) {
                return Err(Error::InvalidConfig(format!(
                    "service '{member}' is in both group '{previous}' and group '{group}'"
                )));
            }
        }
    }
    Ok(group_of)
}

fn collect_groups(raw: &RawProject) -> Result<Vec<GroupConfig>> {
    let mut groups = Vec::with_capacity(raw.groups.len());
    for (key, value) in &raw.groups {
        let name = mapping_key(key, "groups")?;
        let services: Vec<String> = serde_yaml::from_value(value.clone())
            .map_err(|e| Error::InvalidConfig(format!("group '{name}': {e}")))?;
        groups.push(GroupConfig {
            name: name.to_string(),
            services,
        });
    }
    Ok(groups)
}

fn validate(project: &Project) -> Result<()> {
    if project.services.is_empty() {
        return Err(Error::InvalidConfig(
            "config must declare at least one service".to_string(),
        ));
    }

    let names: HashSet<&str> = project.service_names().collect();
    for svc in &project.services {
        for edge in &svc.depends_on {
            if !names.contains(edge.service.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "service '{}' depends on unknown service '{}'",
                    svc.name, edge.service
                )));
            }
            if edge.condition == WaitCondition::Healthy {
                let dep = project.service(&edge.service).expect("validated above");
                if dep.healthcheck.is_none() {
                    return Err(Error::InvalidConfig(format!(
                        "service '{}' waits for '{}' to be healthy, but '{}' has no healthcheck",
                        svc.name, edge.service, edge.service
                    )));
                }
            }
        }
    }

    for group in &project.groups {
        for member in &group.services {
            if !names.contains(member.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "group '{}' references unknown service '{}'",
                    group.name, member
                )));
            }
        }
    }

    // A successful traversal proves acyclicity.
    graph::start_order(project)?;
    Ok(())
}

/// Reloads the config a project was built from and diffs the two.
pub fn reload_project(current: &Project) -> Result<(Project, ConfigDiff)> {
    let fresh = load_project(&current.config_path)?;
    let diff = current.diff(&fresh);
    Ok((fresh, diff))
}

fn load_dotenv(path: &Path) -> Result<HashMap<String, String>> {
    let iter = dotenvy::from_path_iter(path).map_err(|e| {
        Error::InvalidConfig(format!("cannot read dotenv {}: {e}", path.display()))
    })?;
    let mut vars = HashMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| {
            Error::InvalidConfig(format!("dotenv {}: {e}", path.display()))
        })?;
        vars.insert(key, value);
    }
    Ok(vars)
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn mapping_key<'a>(key: &'a serde_yaml::Value, context: &str) -> Result<&'a str> {
    key.as_str().ok_or_else(|| {
        Error::InvalidConfig(format!("{context}: mapping keys must be strings"))
    })
}
