//! Step dependency graph ordering and cycle detection.

use std::collections::{BTreeSet, HashMap};

use crate::error::PlanError;

use super::Step;

/// Compute a deterministic topological order over `steps`.
///
/// Returns indices into `steps` such that every step's prerequisites appear
/// earlier. Ties between independent steps break by declaration order, so
/// repeated runs of the same plan execute in the same order (Kahn's
/// algorithm with an ordered ready set).
///
/// # Errors
///
/// Returns [`PlanError::UnknownDependency`] if a step names an undeclared
/// prerequisite, or [`PlanError::Cycle`] (naming the offending cycle) if the
/// graph is not a DAG.
pub fn topological_order(steps: &[Step]) -> Result<Vec<usize>, PlanError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    // Reject dangling references before ordering so the error names the
    // exact step/dependency pair instead of surfacing as a bogus cycle.
    for step in steps {
        for dep in &step.prerequisites {
            if !id_to_idx.contains_key(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut in_degree: Vec<usize> = steps.iter().map(|s| s.prerequisites.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.prerequisites {
            if let Some(&dep_idx) = id_to_idx.get(dep.as_str()) {
                if let Some(d) = dependents.get_mut(dep_idx) {
                    d.push(i);
                }
            }
        }
    }

    // BTreeSet keeps the ready set sorted by declaration index — the
    // determinism guarantee.
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| (d == 0).then_some(i))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(&idx) = ready.iter().next() {
        ready.remove(&idx);
        order.push(idx);
        if let Some(deps) = dependents.get(idx) {
            for &dep in deps {
                if let Some(count) = in_degree.get_mut(dep) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dep);
                    }
                }
            }
        }
    }

    if order.len() == steps.len() {
        Ok(order)
    } else {
        Err(PlanError::Cycle {
            path: describe_cycle(steps, &in_degree, &id_to_idx),
        })
    }
}

/// Produce a human-readable `a -> b -> a` path for one cycle among the
/// steps left with unresolved prerequisites after Kahn's algorithm.
fn describe_cycle(
    steps: &[Step],
    in_degree: &[usize],
    id_to_idx: &HashMap<&str, usize>,
) -> String {
    let stuck: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| (d > 0).then_some(i))
        .collect();

    let Some(&start) = stuck.iter().next() else {
        return "<unknown>".to_string();
    };

    // Walk prerequisite edges within the stuck set until a node repeats;
    // every stuck node has at least one stuck prerequisite, so this
    // terminates at a repeat within |stuck| hops.
    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = steps
            .get(current)
            .into_iter()
            .flat_map(|s| &s.prerequisites)
            .filter_map(|dep| id_to_idx.get(dep.as_str()).copied())
            .find(|idx| stuck.contains(idx));
        let Some(next) = next else {
            return "<unknown>".to_string();
        };
        if let Some(pos) = path.iter().position(|&i| i == next) {
            let mut names: Vec<&str> = path
                .get(pos..)
                .unwrap_or_default()
                .iter()
                .filter_map(|&i| steps.get(i).map(|s| s.id.as_str()))
                .collect();
            names.push(steps.get(next).map_or("<unknown>", |s| s.id.as_str()));
            return names.join(" -> ");
        }
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::plan::{ApplySpec, Classification, ProbeSpec, StepSpec};

    fn step(id: &str, prerequisites: &[&str]) -> Step {
        Step::from_spec(StepSpec {
            id: id.to_string(),
            label: id.to_string(),
            classification: Classification::Command,
            prerequisites: prerequisites.iter().map(ToString::to_string).collect(),
            probe: ProbeSpec {
                check: Some("true".to_string()),
                ..ProbeSpec::default()
            },
            apply: ApplySpec {
                command: Some("true".to_string()),
            },
            timeout_secs: None,
        })
        .expect("valid step spec")
    }

    #[test]
    fn independent_steps_keep_declaration_order() {
        let steps = vec![step("b", &[]), step("a", &[]), step("c", &[])];
        let order = topological_order(&steps).unwrap();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn linear_chain_orders_by_dependency() {
        let steps = vec![step("c", &["b"]), step("b", &["a"]), step("a", &[])];
        let order = topological_order(&steps).unwrap();
        let ids: Vec<&str> = order.iter().map(|&i| steps[i].id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_orders_prerequisites_first() {
        // a -> (b, c) -> d
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        let order = topological_order(&steps).unwrap();
        let ids: Vec<&str> = order.iter().map(|&i| steps[i].id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn two_node_cycle_reports_path() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        let err = topological_order(&steps).unwrap_err();
        match err {
            PlanError::Cycle { path } => {
                assert!(path.contains("a") && path.contains("b"), "path: {path}");
                assert!(path.contains("->"), "path: {path}");
            }
            other => panic!("expected Cycle, got: {other}"),
        }
    }

    #[test]
    fn self_cycle_is_detected() {
        let steps = vec![step("a", &["a"])];
        let err = topological_order(&steps).unwrap_err();
        assert!(matches!(err, PlanError::Cycle { .. }));
    }

    #[test]
    fn cycle_in_larger_graph_leaves_acyclic_part_ok() {
        // a is fine; b <-> c cycle.
        let steps = vec![step("a", &[]), step("b", &["c"]), step("c", &["b"])];
        let err = topological_order(&steps).unwrap_err();
        match err {
            PlanError::Cycle { path } => {
                assert!(!path.starts_with("a"), "acyclic step in path: {path}");
            }
            other => panic!("expected Cycle, got: {other}"),
        }
    }

    #[test]
    fn unknown_dependency_is_reported_with_names() {
        let steps = vec![step("a", &["missing"])];
        let err = topological_order(&steps).unwrap_err();
        match err {
            PlanError::UnknownDependency { step, dependency } => {
                assert_eq!(step, "a");
                assert_eq!(dependency, "missing");
            }
            other => panic!("expected UnknownDependency, got: {other}"),
        }
    }

    #[test]
    fn empty_plan_is_ordered() {
        let order = topological_order(&[]).unwrap();
        assert!(order.is_empty());
    }
}
