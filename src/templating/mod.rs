// Module: Templating
// Strict template rendering over the {flows, sources} context, recursive
// rendering of configuration trees, and the path-query extractor.

use crate::errors::RunnerError;
use minijinja::{Environment, UndefinedBehavior};
use once_cell::sync::Lazy;
use serde_json::{Map, Value};

static ENV: Lazy<Environment<'static>> = Lazy::new(|| {
    let mut env = Environment::new();
    // Missing references must fail the step, never render as empty.
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
});

/// Renders a template against the run snapshot. Any reference to a name
/// absent from the context is an error.
pub fn render(template: &str, flows: &Value, sources: &Value) -> Result<String, RunnerError> {
    ENV.render_str(template, minijinja::context! { flows, sources })
        .map_err(|err| match err.kind() {
            minijinja::ErrorKind::UndefinedError => RunnerError::UndefinedVariable(err.to_string()),
            _ => RunnerError::Template(err.to_string()),
        })
}

/// Recursively rewrites a JSON tree, rendering only strings that carry
/// template markers. Applied to resolved source configurations at
/// step-dispatch time.
pub fn render_value(value: &Value, flows: &Value, sources: &Value) -> Result<Value, RunnerError> {
    match value {
        Value::String(text) if text.contains("{{") || text.contains("{%") => {
            Ok(Value::String(render(text, flows, sources)?))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_value(item, flows, sources)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), render_value(item, flows, sources)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Evaluates a jmespath expression against `data`. Returns `Value::Null`
/// on any compile or evaluation error; this never raises.
pub fn search(expr: &str, data: &Value) -> Value {
    let compiled = match jmespath::compile(expr) {
        Ok(compiled) => compiled,
        Err(_) => return Value::Null,
    };
    let haystack = match jmespath::Variable::from_json(&data.to_string()) {
        Ok(variable) => variable,
        Err(_) => return Value::Null,
    };
    match compiled.search(haystack) {
        Ok(found) => serde_json::to_value(&*found).unwrap_or(Value::Null),
        Err(_) => Value::Null,
    }
}
