// Module: Flow
// In-memory model of a parsed flow configuration: sources by name, ordered
// steps, runner settings. Immutable once a run starts.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
    #[serde(default)]
    pub flow: Vec<Step>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerSettings {
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub on_error: Option<ErrorPolicy>,
}

/// A named or inline provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default = "empty_object")]
    pub configuration: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// How a step points at its source: a name (falling back to an inline type
/// tag when no source of that name exists), a base source with overrides,
/// or a full inline definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SourceRef {
    Derived {
        base: String,
        #[serde(default = "empty_object")]
        r#override: Value,
    },
    Inline(SourceConfig),
    Name(String),
}

impl SourceRef {
    /// Resolves the reference against the named sources. Derived sources
    /// shallow-merge the override over the base definition, so an override
    /// may replace `type` or `configuration` wholesale.
    pub fn resolve(&self, sources: &HashMap<String, SourceConfig>) -> anyhow::Result<SourceConfig> {
        match self {
            SourceRef::Name(name) => Ok(sources.get(name).cloned().unwrap_or_else(|| {
                SourceConfig {
                    type_name: name.clone(),
                    configuration: empty_object(),
                }
            })),
            SourceRef::Derived { base, r#override } => {
                let mut merged = match sources.get(base) {
                    Some(cfg) => serde_json::to_value(cfg).expect("source serializes"),
                    None => empty_object(),
                };
                if let (Some(dst), Some(src)) = (merged.as_object_mut(), r#override.as_object()) {
                    for (key, value) in src {
                        dst.insert(key.clone(), value.clone());
                    }
                }
                serde_json::from_value(merged)
                    .with_context(|| format!("invalid source derived from base '{base}'"))
            }
            SourceRef::Inline(cfg) => Ok(cfg.clone()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub source: Option<SourceRef>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub on_error: Option<ErrorPolicy>,
    #[serde(default)]
    pub input: Option<InputSpec>,
    #[serde(default)]
    pub output: Vec<OutputSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputSpec {
    #[serde(rename = "type")]
    pub kind: InputKind,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Parameter,
    Filter,
    Body,
    /// Unrecognized kinds dispatch the provider with no payload.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Json,
    Jmespath,
    /// Unrecognized kinds fall back to the whole response data.
    #[serde(other)]
    Other,
}

/// Per-step directive governing how a step reacts when a dependency fails.
/// Unknown values deliberately collapse to `Fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum ErrorPolicy {
    #[default]
    Fail,
    Skip,
    Continue,
}

impl From<String> for ErrorPolicy {
    fn from(raw: String) -> Self {
        match raw.to_lowercase().as_str() {
            "skip" => ErrorPolicy::Skip,
            "continue" => ErrorPolicy::Continue,
            _ => ErrorPolicy::Fail,
        }
    }
}
