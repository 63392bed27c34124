//! Start ordering for the services of a multi-service app
//!
//! Edges come from each service's `depends_on`. Names that do not match a
//! sibling service are ignored. Among services whose dependencies are all
//! satisfied, the alphabetically first is emitted first, so the output is
//! deterministic. A cycle makes a full order impossible; in that case every
//! service is returned in alphabetical order instead.

use crate::config::ServiceConfig;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::warn;

/// Order all services so that dependencies come before their dependents.
pub fn resolve_order(services: &BTreeMap<String, ServiceConfig>) -> Vec<String> {
    let mut pending: HashMap<&str, usize> = HashMap::with_capacity(services.len());
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::with_capacity(services.len());

    for (name, service) in services {
        let known: BTreeSet<&str> = service
            .depends_on
            .iter()
            .map(String::as_str)
            .filter(|dep| services.contains_key(*dep) && *dep != name.as_str())
            .collect();
        pending.insert(name.as_str(), known.len());
        for dep in known {
            dependents.entry(dep).or_default().push(name.as_str());
        }
    }

    // BTreeSet doubles as a sorted ready queue
    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&name, _)| name)
        .collect();

    let mut order = Vec::with_capacity(services.len());
    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        if let Some(children) = dependents.get(name) {
            for child in children {
                if let Some(count) = pending.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
    }

    if order.len() != services.len() {
        warn!(
            services = ?services.keys().collect::<Vec<_>>(),
            "Dependency cycle detected, falling back to alphabetical order"
        );
        return services.keys().cloned().collect();
    }

    order
}

/// All services `name` depends on, directly or transitively, in start order.
///
/// `name` itself is not included. Unknown names yield an empty list.
pub fn dependency_closure(services: &BTreeMap<String, ServiceConfig>, name: &str) -> Vec<String> {
    let mut needed = HashSet::new();
    let mut stack: Vec<&str> = match services.get(name) {
        Some(service) => service.depends_on.iter().map(String::as_str).collect(),
        None => return Vec::new(),
    };

    while let Some(dep) = stack.pop() {
        if dep == name || !needed.insert(dep) {
            continue;
        }
        if let Some(service) = services.get(dep) {
            stack.extend(service.depends_on.iter().map(String::as_str));
        }
    }

    resolve_order(services)
        .into_iter()
        .filter(|s| needed.contains(s.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services(defs: &[(&str, Vec<&str>)]) -> BTreeMap<String, ServiceConfig> {
        defs.iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    ServiceConfig::new(name, "true").depends_on(deps),
                )
            })
            .collect()
    }

    #[test]
    fn test_dependency_comes_first() {
        let graph = services(&[("web", vec!["api"]), ("api", vec![])]);
        assert_eq!(resolve_order(&graph), vec!["api", "web"]);
    }

    #[test]
    fn test_chain_and_diamond() {
        let graph = services(&[
            ("app", vec!["cache", "db"]),
            ("cache", vec!["db"]),
            ("db", vec![]),
            ("worker", vec!["db"]),
        ]);
        let order = resolve_order(&graph);
        assert_eq!(order, vec!["db", "cache", "app", "worker"]);
    }

    #[test]
    fn test_no_dependencies_is_alphabetical() {
        let graph = services(&[("zeta", vec![]), ("alpha", vec![]), ("mid", vec![])]);
        assert_eq!(resolve_order(&graph), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_cycle_terminates_with_all_services() {
        let graph = services(&[("a", vec!["b"]), ("b", vec!["a"]), ("c", vec![])]);
        let order = resolve_order(&graph);
        assert_eq!(order.len(), 3);
        assert_eq!(order, vec!["a", "b", "c"]);
        // Stable across calls
        assert_eq!(resolve_order(&graph), order);
    }

    #[test]
    fn test_unknown_and_self_dependencies_ignored() {
        let graph = services(&[("web", vec!["missing", "web"]), ("api", vec!["ghost"])]);
        assert_eq!(resolve_order(&graph), vec!["api", "web"]);
    }

    #[test]
    fn test_empty_graph() {
        assert!(resolve_order(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_dependency_closure_is_transitive() {
        let graph = services(&[
            ("web", vec!["api"]),
            ("api", vec!["db", "queue"]),
            ("db", vec![]),
            ("queue", vec![]),
            ("docs", vec![]),
        ]);
        assert_eq!(dependency_closure(&graph, "web"), vec!["db", "queue", "api"]);
        assert!(dependency_closure(&graph, "db").is_empty());
        assert!(dependency_closure(&graph, "nope").is_empty());
    }

    #[test]
    fn test_dependency_closure_with_cycle() {
        let graph = services(&[("a", vec!["b"]), ("b", vec!["a"])]);
        assert_eq!(dependency_closure(&graph, "a"), vec!["b"]);
    }
}
