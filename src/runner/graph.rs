// Dependency graph for a flow: explicit depends_on entries plus
// `flows.<name>.` references scanned out of input templates. Validated
// before anything runs.

use crate::errors::RunnerError;
use crate::flow::Step;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

// Anchored on the literal `flows.` prefix; richer expressions (indexing,
// filters) are not inferred and need an explicit depends_on.
static FLOW_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"flows\.([A-Za-z0-9_]+)\.").expect("valid flow reference regex"));

#[derive(Debug)]
pub struct DepGraph {
    pub deps: HashMap<String, HashSet<String>>,
    pub dependents: HashMap<String, HashSet<String>>,
    /// Remaining unsatisfied dependencies per step; -1 marks a step
    /// withdrawn from scheduling (skipped).
    pub in_degree: HashMap<String, i64>,
}

pub fn build(steps: &[Step]) -> Result<DepGraph, RunnerError> {
    let mut names: HashSet<String> = HashSet::new();
    for step in steps {
        if !names.insert(step.name.clone()) {
            return Err(RunnerError::DuplicateStep(step.name.clone()));
        }
    }

    let mut deps: HashMap<String, HashSet<String>> = steps
        .iter()
        .map(|step| (step.name.clone(), HashSet::new()))
        .collect();
    for step in steps {
        let entry = deps.get_mut(&step.name).expect("step registered above");
        for dep in &step.depends_on {
            entry.insert(dep.clone());
        }
        if let Some(input) = &step.input {
            let fields = [input.value.as_deref(), input.template.as_deref()];
            for text in fields.into_iter().flatten() {
                for captures in FLOW_REF_RE.captures_iter(text) {
                    entry.insert(captures[1].to_string());
                }
            }
        }
    }

    let mut invalid: Vec<(String, Vec<String>)> = Vec::new();
    for step in steps {
        let mut missing: Vec<String> = deps[&step.name]
            .iter()
            .filter(|dep| !names.contains(*dep))
            .cloned()
            .collect();
        if !missing.is_empty() {
            missing.sort();
            invalid.push((step.name.clone(), missing));
        }
    }
    if !invalid.is_empty() {
        invalid.sort();
        return Err(RunnerError::InvalidDependencies(invalid));
    }

    let mut dependents: HashMap<String, HashSet<String>> = steps
        .iter()
        .map(|step| (step.name.clone(), HashSet::new()))
        .collect();
    for (name, step_deps) in &deps {
        for dep in step_deps {
            dependents
                .get_mut(dep)
                .expect("validated above")
                .insert(name.clone());
        }
    }
    let in_degree: HashMap<String, i64> = deps
        .iter()
        .map(|(name, step_deps)| (name.clone(), step_deps.len() as i64))
        .collect();

    let graph = DepGraph {
        deps,
        dependents,
        in_degree,
    };
    detect_cycle(&graph)?;
    Ok(graph)
}

/// Kahn's algorithm over a scratch copy of the in-degrees. Anything left
/// with a positive degree can never run.
fn detect_cycle(graph: &DepGraph) -> Result<(), RunnerError> {
    let mut degrees = graph.in_degree.clone();
    let mut queue: Vec<String> = degrees
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| name.clone())
        .collect();
    let mut visited = 0usize;
    while let Some(name) = queue.pop() {
        visited += 1;
        for dependent in graph.dependents.get(&name).into_iter().flatten() {
            let degree = degrees.get_mut(dependent).expect("known step");
            *degree -= 1;
            if *degree == 0 {
                queue.push(dependent.clone());
            }
        }
    }
    if visited < degrees.len() {
        let mut stuck: Vec<String> = degrees
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(name, _)| name.clone())
            .collect();
        stuck.sort();
        return Err(RunnerError::CycleDetected(stuck));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(name: &str, depends_on: &[&str], input_value: Option<&str>) -> Step {
        serde_json::from_value(json!({
            "name": name,
            "depends_on": depends_on,
            "input": input_value.map(|v| json!({"type": "parameter", "value": v})),
        }))
        .unwrap()
    }

    #[test]
    fn infers_dependencies_from_templates_and_depends_on() {
        let steps = vec![
            step("login", &[], None),
            step("profile", &[], Some("{{ flows.login.token }}")),
            step("report", &["profile"], Some("{{ flows.login.token }}-{{ flows.profile.id }}")),
        ];
        let graph = build(&steps).unwrap();
        assert_eq!(graph.deps["profile"], HashSet::from(["login".to_string()]));
        assert_eq!(
            graph.deps["report"],
            HashSet::from(["login".to_string(), "profile".to_string()])
        );
        assert_eq!(graph.in_degree["login"], 0);
        assert_eq!(graph.in_degree["report"], 2);
        assert!(graph.dependents["login"].contains("profile"));
    }

    #[test]
    fn references_without_a_trailing_field_are_not_inferred() {
        let steps = vec![
            step("a", &[], None),
            step("b", &[], Some("{{ flows.a }} and flows['a'].x")),
        ];
        let graph = build(&steps).unwrap();
        assert!(graph.deps["b"].is_empty());
    }

    #[test]
    fn missing_dependencies_are_collected_across_steps() {
        let steps = vec![
            step("step1", &["missing1", "missing2"], None),
            step("step2", &["step1", "missing3"], None),
        ];
        let err = build(&steps).unwrap_err();
        match &err {
            RunnerError::InvalidDependencies(entries) => {
                assert_eq!(entries.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        let msg = err.to_string();
        for needle in ["step1", "step2", "missing1", "missing2", "missing3"] {
            assert!(msg.contains(needle));
        }
    }

    #[test]
    fn template_reference_to_missing_step_is_invalid() {
        let steps = vec![step("step1", &[], Some("{{ flows.missing_step.output }}"))];
        let err = build(&steps).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("step1"));
        assert!(msg.contains("missing_step"));
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let steps = vec![step("twin", &[], None), step("twin", &[], None)];
        assert!(matches!(
            build(&steps),
            Err(RunnerError::DuplicateStep(name)) if name == "twin"
        ));
    }

    #[test]
    fn cycles_are_detected_up_front() {
        let steps = vec![
            step("a", &["b"], None),
            step("b", &["a"], None),
            step("free", &[], None),
        ];
        let err = build(&steps).unwrap_err();
        match err {
            RunnerError::CycleDetected(members) => {
                assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let steps = vec![step("ouroboros", &["ouroboros"], None)];
        assert!(matches!(build(&steps), Err(RunnerError::CycleDetected(_))));
    }
}
