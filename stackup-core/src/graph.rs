use std::collections::HashSet;

use crate::config::Project;
use crate::{Error, Result};

/// Total start order: depth-first post-order over services in
/// declaration order, so every dependency precedes its dependents.
/// Deterministic for a given config.
pub fn start_order(project: &Project) -> Result<Vec<String>> {
    let mut order = Vec::with_capacity(project.services.len());
    let mut done: HashSet<&str> = HashSet::with_capacity(project.services.len());
    let mut path: Vec<&str> = Vec::new();

    for svc in &project.services {
        visit(project, &svc.name, &mut done, &mut path, &mut order)?;
    }
    Ok(order)
}

/// Stop order is the exact reverse of [`start_order`]: dependents come
/// down before the services they depend on.
pub fn stop_order(project: &Project) -> Result<Vec<String>> {
    let mut order = start_order(project)?;
    order.reverse();
    Ok(order)
}

fn visit<'a>(
    project: &'a Project,
    name: &'a str,
    done: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
    order: &mut Vec<String>,
) -> Result<()> {
    if done.contains(name) {
        return Ok(());
    }
    if path.contains(&name) {
        let mut cycle = path.join(" -> ");
        cycle.push_str(" -> ");
        cycle.push_str(name);
        return Err(Error::InvalidConfig(format!(
            "dependency cycle: {cycle}"
        )));
    }

    let svc = project
        .service(name)
        .ok_or_else(|| Error::InvalidConfig(format!("unknown dependency '{name}'")))?;

    path.push(&svc.name);
    for edge in &svc.depends_on {
        visit(project, &edge.service, done, path, order)?;
    }
    path.pop();

    done.insert(&svc.name);
    order.push(svc.name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::StopSignal;
    use crate::config::{DependencyEdge, RestartPolicy, ServiceConfig, WaitCondition};
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn service(name: &str, deps: &[&str]) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            cmd: "true".to_string(),
            cwd: PathBuf::from("/tmp"),
            env: HashMap::new(),
            depends_on: deps
                .iter()
                .map(|d| DependencyEdge {
                    service: d.to_string(),
                    condition: WaitCondition::Started,
                })
                .collect(),
            healthcheck: None,
            restart: RestartPolicy::No,
            stop_signal: StopSignal::Term,
            color: None,
            group: None,
        }
    }

    fn project(services: Vec<ServiceConfig>) -> Project {
        Project {
            name: "test".to_string(),
            env: HashMap::new(),
            services,
            groups: Vec::new(),
            config_path: PathBuf::from("/tmp/stackup.yml"),
        }
    }

    #[test]
    fn test_dependencies_come_first() {
        let p = project(vec![
            service("web", &["db", "cache"]),
            service("db", &[]),
            service("cache", &[]),
        ]);
        assert_eq!(start_order(&p).unwrap(), ["db", "cache", "web"]);
    }

    #[test]
    fn test_diamond_resolves_once() {
        let p = project(vec![
            service("top", &["left", "right"]),
            service("left", &["base"]),
            service("right", &["base"]),
            service("base", &[]),
        ]);
        assert_eq!(
            start_order(&p).unwrap(),
            ["base", "left", "right", "top"]
        );
    }

    #[test]
    fn test_order_is_deterministic() {
        let build = || {
            project(vec![
                service("c", &[]),
                service("a", &["c"]),
                service("b", &["c"]),
            ])
        };
        let first = start_order(&build()).unwrap();
        for _ in 0..10 {
            assert_eq!(start_order(&build()).unwrap(), first);
        }
    }

    #[test]
    fn test_stop_order_is_reversed() {
        let p = project(vec![service("b", &["a"]), service("a", &[])]);
        assert_eq!(start_order(&p).unwrap(), ["a", "b"]);
        assert_eq!(stop_order(&p).unwrap(), ["b", "a"]);
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let p = project(vec![service("a", &["b"]), service("b", &["a"])]);
        let err = start_order(&p).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("a -> b -> a"), "got: {msg}");
    }

    #[test]
    fn test_self_cycle_detected() {
        let p = project(vec![service("a", &["a"])]);
        let msg = start_order(&p).unwrap_err().to_string();
        assert!(msg.contains("a -> a"), "got: {msg}");
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let p = project(vec![service("a", &["ghost"])]);
        assert!(start_order(&p).is_err());
    }
}
