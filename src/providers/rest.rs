// HTTP provider backed by reqwest. The payload travels as a query
// parameter or as the request body depending on `input_mode`; transport
// failures come back as failed envelopes, never as errors.

use super::Provider;
use crate::result::{from_error, make_result, Envelope};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum InputMode {
    Parameter,
    Body,
    /// Unknown modes ignore the payload.
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
struct RestConfig {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    input_mode: Option<InputMode>,
    #[serde(default = "default_param_name")]
    param_name: String,
    /// Seconds before the request is abandoned.
    #[serde(default)]
    timeout: Option<f64>,
}

fn default_method() -> String {
    "GET".into()
}

fn default_param_name() -> String {
    "id".into()
}

pub struct RestProvider {
    config: RestConfig,
    client: Client,
}

pub fn construct(configuration: Value) -> Result<Box<dyn Provider>> {
    let config: RestConfig = serde_json::from_value(configuration)?;
    let mut builder = Client::builder();
    if let Some(seconds) = config.timeout {
        builder = builder.timeout(Duration::from_secs_f64(seconds));
    }
    let client = builder.build().context("failed to build HTTP client")?;
    Ok(Box::new(RestProvider { config, client }))
}

#[async_trait]
impl Provider for RestProvider {
    async fn call(&self, payload: Option<&str>) -> Result<Envelope> {
        let method = Method::from_bytes(self.config.method.to_uppercase().as_bytes())
            .with_context(|| format!("invalid HTTP method '{}'", self.config.method))?;
        let mut request = self.client.request(method, &self.config.url);
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        match (self.config.input_mode, payload) {
            (Some(InputMode::Parameter), Some(text)) => {
                request = request.query(&[(self.config.param_name.as_str(), text)]);
            }
            (Some(InputMode::Body), Some(text)) => {
                request = request.json(&text);
            }
            _ => {}
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return Ok(from_error(&anyhow::Error::from(err))),
        };

        let status = response.status();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.to_string(),
                Value::String(value.to_str().unwrap_or_default().to_string()),
            );
        }
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => return Ok(from_error(&anyhow::Error::from(err))),
        };
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        let code = i64::from(status.as_u16());
        let success = status.is_success();
        let notes = if success {
            json!([])
        } else {
            json!([format!("HTTP status {code}")])
        };
        let mut meta = Map::new();
        meta.insert("status_code".into(), json!(code));
        meta.insert("headers".into(), Value::Object(headers));
        Ok(make_result(success, Some(code), data, notes, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::net::SocketAddr;

    async fn spawn_server() -> SocketAddr {
        let app = Router::new()
            .route(
                "/people",
                get(|| async { Json(json!({"items": ["ada", "grace"]})) }),
            )
            .route(
                "/lookup",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    Json(json!(params))
                }),
            )
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "nope") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn json_responses_are_parsed() {
        let addr = spawn_server().await;
        let provider = construct(json!({"url": format!("http://{addr}/people")})).unwrap();
        let envelope = provider.call(None).await.unwrap();
        assert!(envelope.status.success);
        assert_eq!(envelope.status.code, Some(200));
        assert_eq!(envelope.data, json!({"items": ["ada", "grace"]}));
        assert_eq!(envelope.meta["status_code"], json!(200));
    }

    #[tokio::test]
    async fn parameter_mode_sends_payload_as_query() {
        let addr = spawn_server().await;
        let provider = construct(json!({
            "url": format!("http://{addr}/lookup"),
            "input_mode": "parameter",
            "param_name": "user",
        }))
        .unwrap();
        let envelope = provider.call(Some("42")).await.unwrap();
        assert_eq!(envelope.data, json!({"user": "42"}));
    }

    #[tokio::test]
    async fn non_success_status_fails_with_note() {
        let addr = spawn_server().await;
        let provider = construct(json!({"url": format!("http://{addr}/missing")})).unwrap();
        let envelope = provider.call(None).await.unwrap();
        assert!(!envelope.status.success);
        assert_eq!(envelope.status.code, Some(404));
        assert_eq!(envelope.status.notes, vec!["HTTP status 404"]);
        assert_eq!(envelope.data, json!("nope"));
    }

    #[tokio::test]
    async fn transport_errors_become_failed_envelopes() {
        let provider = construct(json!({
            "url": "http://127.0.0.1:1/unreachable",
            "timeout": 1.0,
        }))
        .unwrap();
        let envelope = provider.call(None).await.unwrap();
        assert!(!envelope.status.success);
        assert!(!envelope.status.notes.is_empty());
        assert!(envelope.meta.contains_key("exception"));
    }
}
