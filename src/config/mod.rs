// Module: Config
// Loads one or more YAML documents and deep-merges them in order of
// appearance before typing the result as a FlowConfig.

use crate::flow::FlowConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

pub fn load_config<P: AsRef<Path>>(paths: &[P]) -> Result<FlowConfig> {
    let merged = load_merged_value(paths)?;
    serde_json::from_value(merged).context("invalid flow configuration")
}

/// Reads every document in every file and folds them together with
/// `deep_merge`. A file may hold multiple `---`-separated documents.
pub fn load_merged_value<P: AsRef<Path>>(paths: &[P]) -> Result<Value> {
    let mut merged = Value::Object(Map::new());
    for path in paths {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        for document in serde_yaml::Deserializer::from_str(&text) {
            let value = Value::deserialize(document)
                .with_context(|| format!("failed to parse YAML in {}", path.display()))?;
            if value.is_null() {
                continue;
            }
            merged = deep_merge(&merged, &value);
        }
    }
    Ok(merged)
}

/// Merges `b` into `a`: maps merge recursively, everything else (scalars,
/// lists) is replaced by the later value.
pub fn deep_merge(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            let mut out = left.clone();
            for (key, value) in right {
                let merged = match out.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (_, later) => later.clone(),
    }
}
