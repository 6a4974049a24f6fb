// Module: Providers
// Provider trait and the type-name registry used at step dispatch.

pub mod env;
pub mod process;
pub mod rest;

use crate::errors::RunnerError;
use crate::result::Envelope;
use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// A constructed data source with a single operation. Construction must be
/// cheap; all I/O happens inside `call`, which enforces its own timeouts.
/// Runtime failures are reported through the envelope; a returned `Err` is
/// reserved for configuration or programmer errors and gets normalized by
/// the scheduler.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn call(&self, payload: Option<&str>) -> Result<Envelope>;

    /// Values this source contributes to the `sources` template context
    /// without being invoked as a step. Data-only sources (env) override
    /// this; everything else is represented by its configuration mapping.
    fn context_data(&self) -> Option<Value> {
        None
    }
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Provider")
    }
}

pub type ProviderCtor = fn(Value) -> Result<Box<dyn Provider>>;

static RUNTIME: Lazy<RwLock<HashMap<String, ProviderCtor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

// Built-in table, populated by a one-time pass on first lookup.
static BUILTIN: Lazy<HashMap<String, ProviderCtor>> = Lazy::new(|| {
    let mut table: HashMap<String, ProviderCtor> = HashMap::new();
    table.insert("env".into(), env::construct);
    table.insert("process".into(), process::construct);
    table.insert("rest".into(), rest::construct);
    table
});

/// Registers a constructor at runtime. Runtime registrations win over the
/// built-in table, so a deployment can shadow a built-in type.
pub fn register_provider(name: &str, ctor: ProviderCtor) {
    RUNTIME
        .write()
        .expect("provider registry poisoned")
        .insert(name.to_string(), ctor);
}

/// Creates an instance of the named provider. Lookup order, first hit
/// wins: runtime-registered constructors, then built-ins.
pub fn create_provider(type_name: &str, configuration: Value) -> Result<Box<dyn Provider>> {
    let runtime_hit = RUNTIME
        .read()
        .expect("provider registry poisoned")
        .get(type_name)
        .copied();
    let ctor = runtime_hit
        .or_else(|| BUILTIN.get(type_name).copied())
        .ok_or_else(|| RunnerError::UnknownProvider {
            type_name: type_name.to_string(),
            available: available_providers(),
        })?;
    ctor(configuration)
}

pub fn available_providers() -> Vec<String> {
    let mut names: Vec<String> = BUILTIN.keys().cloned().collect();
    names.extend(
        RUNTIME
            .read()
            .expect("provider registry poisoned")
            .keys()
            .cloned(),
    );
    names.sort();
    names.dedup();
    names
}
