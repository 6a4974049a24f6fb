// Environment snapshot provider: reads a configured list of variables.

use super::Provider;
use crate::result::{make_result, Envelope};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Default, Deserialize)]
struct EnvConfig {
    #[serde(default)]
    vars: Vec<String>,
}

pub struct EnvProvider {
    vars: Vec<String>,
}

pub fn construct(configuration: Value) -> Result<Box<dyn Provider>> {
    let config: EnvConfig = serde_json::from_value(configuration)?;
    Ok(Box::new(EnvProvider { vars: config.vars }))
}

impl EnvProvider {
    fn snapshot(&self) -> Value {
        let mut data = Map::new();
        for name in &self.vars {
            let value = std::env::var(name)
                .map(Value::String)
                .unwrap_or(Value::Null);
            data.insert(name.clone(), value);
        }
        Value::Object(data)
    }
}

#[async_trait]
impl Provider for EnvProvider {
    async fn call(&self, _payload: Option<&str>) -> Result<Envelope> {
        Ok(make_result(
            true,
            Some(0),
            self.snapshot(),
            json!([]),
            Map::new(),
        ))
    }

    // The snapshot doubles as template context, which is what lets
    // `{{ sources.<name>.<VAR> }}` resolve inside other configurations.
    fn context_data(&self) -> Option<Value> {
        Some(self.snapshot())
    }
}
