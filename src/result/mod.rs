// Module: Result
// Canonical envelope returned by every provider call. Providers report
// runtime failures through the envelope; errors are reserved for bugs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Meta keys whose value is never allowed to leave the provider boundary.
/// Matching is on lowercased substrings.
const REDACT_KEYS: [&str; 5] = ["password", "secret", "token", "bind_password", "pw"];

const REDACTED: &str = "<redacted>";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub status: Status,
    pub data: Value,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub success: bool,
    pub code: Option<i64>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Builds the canonical envelope. `notes` accepts any JSON shape: nested
/// arrays are flattened, nulls dropped, scalars stringified.
pub fn make_result(
    success: bool,
    code: Option<i64>,
    data: Value,
    notes: Value,
    meta: Map<String, Value>,
) -> Envelope {
    Envelope {
        status: Status {
            success,
            code,
            notes: normalize_notes(&notes),
        },
        data,
        meta: redact_meta(meta),
    }
}

/// Envelope for an error that escaped a provider: `success=false`, the
/// display form in `notes`, the full chain under `meta.exception`.
pub fn from_error(err: &anyhow::Error) -> Envelope {
    let mut meta = Map::new();
    meta.insert("exception".into(), Value::String(format!("{err:#}")));
    make_result(
        false,
        None,
        Value::Null,
        Value::Array(vec![Value::String(err.to_string())]),
        meta,
    )
}

pub fn normalize_notes(notes: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_notes(notes, &mut out);
    out
}

fn collect_notes(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::Array(items) => {
            for item in items {
                collect_notes(item, out);
            }
        }
        Value::String(s) => out.push(s.clone()),
        other => out.push(other.to_string()),
    }
}

/// Shallow copy with secret-bearing keys blanked out. Idempotent.
pub fn redact_meta(meta: Map<String, Value>) -> Map<String, Value> {
    meta.into_iter()
        .map(|(key, value)| {
            let lower = key.to_lowercase();
            if REDACT_KEYS.iter().any(|r| lower.contains(r)) {
                (key, Value::String(REDACTED.into()))
            } else {
                (key, value)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn make_result_round_trips_inputs() {
        let envelope = make_result(
            true,
            Some(0),
            json!({"answer": 42}),
            json!(["first", "second"]),
            Map::new(),
        );
        assert!(envelope.status.success);
        assert_eq!(envelope.status.code, Some(0));
        assert_eq!(envelope.status.notes, vec!["first", "second"]);
        assert_eq!(envelope.data, json!({"answer": 42}));
    }

    #[test]
    fn notes_flatten_nested_arrays_and_drop_nulls() {
        let notes = normalize_notes(&json!(["a", null, ["b", null, ["c"]], 7]));
        assert_eq!(notes, vec!["a", "b", "c", "7"]);
    }

    #[test]
    fn meta_redacts_secret_bearing_keys() {
        let meta: Map<String, Value> = json!({
            "api_token": "sk-123",
            "Bind_Password": "hunter2",
            "stderr": "boom",
        })
        .as_object()
        .cloned()
        .unwrap();
        let redacted = redact_meta(meta);
        assert_eq!(redacted["api_token"], json!("<redacted>"));
        assert_eq!(redacted["Bind_Password"], json!("<redacted>"));
        assert_eq!(redacted["stderr"], json!("boom"));
    }

    #[test]
    fn redaction_is_idempotent() {
        let meta: Map<String, Value> = json!({"secret_key": "x", "plain": 1})
            .as_object()
            .cloned()
            .unwrap();
        let once = redact_meta(meta);
        let twice = redact_meta(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn from_error_carries_message_and_exception_meta() {
        let err = anyhow::anyhow!("connection refused");
        let envelope = from_error(&err);
        assert!(!envelope.status.success);
        assert_eq!(envelope.status.code, None);
        assert_eq!(envelope.status.notes, vec!["connection refused"]);
        assert!(envelope.meta["exception"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
    }
}
