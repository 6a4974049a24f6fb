// Module: Errors
// Typed failure kinds raised before any step executes, plus the template
// errors that fail individual steps.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// One or more steps reference dependencies that do not exist. Collected
    /// across the whole flow so every bad reference is reported at once.
    #[error("flow configuration has invalid dependencies:\n{}", invalid_dependency_lines(.0))]
    InvalidDependencies(Vec<(String, Vec<String>)>),

    #[error("duplicate step name '{0}' in flow")]
    DuplicateStep(String),

    /// Steps that can never reach in-degree zero. Detected up front so a
    /// cyclic flow fails instead of stalling.
    #[error("dependency cycle detected among steps: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    #[error("unknown provider type '{type_name}'; available providers: {}", available.join(", "))]
    UnknownProvider {
        type_name: String,
        available: Vec<String>,
    },

    #[error("undefined template variable: {0}")]
    UndefinedVariable(String),

    #[error("template error: {0}")]
    Template(String),
}

fn invalid_dependency_lines(entries: &[(String, Vec<String>)]) -> String {
    entries
        .iter()
        .map(|(step, missing)| {
            let list = missing
                .iter()
                .map(|d| format!("'{d}'"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("  - step '{step}' depends on missing step(s): {list}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_dependencies_lists_every_step_and_missing_name() {
        let err = RunnerError::InvalidDependencies(vec![
            ("step1".into(), vec!["missing1".into(), "missing2".into()]),
            ("step2".into(), vec!["missing3".into()]),
        ]);
        let msg = err.to_string();
        assert!(msg.to_lowercase().contains("invalid dependencies"));
        for needle in ["step1", "step2", "missing1", "missing2", "missing3"] {
            assert!(msg.contains(needle), "missing {needle} in: {msg}");
        }
    }

    #[test]
    fn unknown_provider_names_available_types() {
        let err = RunnerError::UnknownProvider {
            type_name: "carrier-pigeon".into(),
            available: vec!["env".into(), "process".into(), "rest".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("carrier-pigeon"));
        assert!(msg.contains("env, process, rest"));
    }
}
