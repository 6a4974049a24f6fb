// Subprocess provider. Runs a configured command, captures stdout/stderr,
// and reports the exit code through the envelope. The payload reaches the
// command as a trailing argument, on stdin, or through argument templates.

use super::Provider;
use crate::result::{from_error, make_result, Envelope};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use minijinja::{Environment, UndefinedBehavior};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PassTo {
    #[default]
    Arg,
    Stdin,
    Template,
    /// Unknown modes fall back to arg behaviour.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ProcessConfig {
    command: CommandSpec,
    #[serde(default)]
    pass_to: PassTo,
    /// Seconds the command may run before the call is abandoned.
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default)]
    redact_args: Vec<usize>,
    #[serde(default)]
    redact_patterns: Vec<String>,
    #[serde(default)]
    log_full_command: bool,
    #[serde(default = "default_strict")]
    template_strict: bool,
}

fn default_strict() -> bool {
    true
}

pub struct ProcessProvider {
    config: ProcessConfig,
}

pub fn construct(configuration: Value) -> Result<Box<dyn Provider>> {
    let config: ProcessConfig = serde_json::from_value(configuration)?;
    Ok(Box::new(ProcessProvider { config }))
}

impl ProcessProvider {
    fn argv(&self) -> Result<Vec<String>> {
        let argv = match &self.config.command {
            CommandSpec::Argv(args) => args.clone(),
            CommandSpec::Line(line) => {
                shlex::split(line).ok_or_else(|| anyhow!("unparsable command line: {line}"))?
            }
        };
        Ok(argv)
    }

    /// Renders each argument as a template over the payload. The context
    /// exposes the raw text, the payload itself, its JSON parse (when it
    /// is one), and a `jmespath(expr)` query function over that parse.
    fn render_argv(&self, argv: &[String], payload: Option<&str>) -> Result<Vec<String>> {
        let parsed: Value = payload
            .and_then(|text| serde_json::from_str(text).ok())
            .unwrap_or(Value::Null);
        let mut env = Environment::new();
        env.set_undefined_behavior(if self.config.template_strict {
            UndefinedBehavior::Strict
        } else {
            UndefinedBehavior::Lenient
        });
        let query_target = parsed.clone();
        env.add_function("jmespath", move |expr: String| {
            minijinja::Value::from_serialize(&crate::templating::search(&expr, &query_target))
        });
        let ctx = minijinja::context! {
            raw => payload.unwrap_or(""),
            input => payload,
            json => parsed,
        };
        let mut rendered = Vec::with_capacity(argv.len());
        for arg in argv {
            rendered.push(
                env.render_str(arg, ctx.clone())
                    .map_err(|err| anyhow!("template error in command argument: {err}"))?,
            );
        }
        Ok(rendered)
    }

    /// Command-line view safe for logs. With no redaction settings only the
    /// program name and argument count are logged; `redact_args` indices and
    /// `redact_patterns` substrings blank individual arguments;
    /// `log_full_command` bypasses all of it.
    fn sanitize_for_logging(&self, argv: &[String]) -> Vec<String> {
        if self.config.log_full_command {
            return argv.to_vec();
        }
        if argv.is_empty() {
            return Vec::new();
        }
        if self.config.redact_args.is_empty() && self.config.redact_patterns.is_empty() {
            return vec![argv[0].clone(), format!("<{} args>", argv.len() - 1)];
        }
        argv.iter()
            .enumerate()
            .map(|(index, arg)| {
                let by_index = self.config.redact_args.contains(&index);
                let by_pattern = self
                    .config
                    .redact_patterns
                    .iter()
                    .any(|pattern| arg.contains(pattern));
                if by_index || by_pattern {
                    "[REDACTED]".to_string()
                } else {
                    arg.clone()
                }
            })
            .collect()
    }
}

#[async_trait]
impl Provider for ProcessProvider {
    async fn call(&self, payload: Option<&str>) -> Result<Envelope> {
        let mut argv = self.argv()?;
        if argv.is_empty() {
            bail!("process provider requires a non-empty command");
        }

        let mut stdin_bytes: Option<Vec<u8>> = None;
        match self.config.pass_to {
            PassTo::Stdin => {
                if let Some(text) = payload {
                    stdin_bytes = Some(text.as_bytes().to_vec());
                }
            }
            PassTo::Template => {
                argv = self.render_argv(&argv, payload)?;
            }
            PassTo::Arg | PassTo::Other => {
                if let Some(text) = payload {
                    argv.push(text.to_string());
                }
            }
        }

        info!(command = ?self.sanitize_for_logging(&argv), "running process command");
        let started = Instant::now();

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin_bytes.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return Ok(from_error(&anyhow::Error::from(err))),
        };
        if let Some(bytes) = stdin_bytes {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(&bytes).await;
            }
        }

        let waited = match self.config.timeout {
            Some(seconds) => {
                match tokio::time::timeout(
                    Duration::from_secs_f64(seconds),
                    child.wait_with_output(),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        let mut meta = Map::new();
                        meta.insert("timeout".into(), json!(true));
                        meta.insert(
                            "exception".into(),
                            json!(format!("command timed out after {seconds}s")),
                        );
                        return Ok(make_result(
                            false,
                            None,
                            Value::Null,
                            json!(["timeout"]),
                            meta,
                        ));
                    }
                }
            }
            None => child.wait_with_output().await,
        };
        let output = match waited {
            Ok(output) => output,
            Err(err) => return Ok(from_error(&anyhow::Error::from(err))),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let code = output.status.code().map(i64::from);
        let success = output.status.success();
        let data = serde_json::from_str::<Value>(&stdout).unwrap_or(Value::String(stdout));

        let notes = if success {
            json!([])
        } else {
            match code {
                Some(c) => json!([format!("process exited with code {c}")]),
                None => json!(["process terminated by signal"]),
            }
        };
        let mut meta = Map::new();
        meta.insert("stderr".into(), Value::String(stderr));
        meta.insert(
            "returncode".into(),
            code.map(Value::from).unwrap_or(Value::Null),
        );

        info!(
            returncode = ?code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "process command finished"
        );
        Ok(make_result(success, code, data, notes, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(configuration: Value) -> ProcessProvider {
        ProcessProvider {
            config: serde_json::from_value(configuration).unwrap(),
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let provider = provider(json!({"command": ["echo", "hello"]}));
        let envelope = provider.call(None).await.unwrap();
        assert!(envelope.status.success);
        assert_eq!(envelope.status.code, Some(0));
        assert_eq!(envelope.data, json!("hello\n"));
        assert_eq!(envelope.meta["stderr"], json!(""));
        assert_eq!(envelope.meta["returncode"], json!(0));
    }

    #[tokio::test]
    async fn json_stdout_is_parsed() {
        let provider = provider(json!({"command": ["sh", "-c", "echo '{\"a\": 1}'"]}));
        let envelope = provider.call(None).await.unwrap();
        assert_eq!(envelope.data, json!({"a": 1}));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_failure() {
        let provider = provider(json!({"command": ["sh", "-c", "exit 2"]}));
        let envelope = provider.call(None).await.unwrap();
        assert!(!envelope.status.success);
        assert_eq!(envelope.status.code, Some(2));
        assert_eq!(envelope.status.notes, vec!["process exited with code 2"]);
    }

    #[tokio::test]
    async fn payload_is_appended_as_argument_by_default() {
        let provider = provider(json!({"command": ["echo"]}));
        let envelope = provider.call(Some("world")).await.unwrap();
        assert_eq!(envelope.data, json!("world\n"));
    }

    #[tokio::test]
    async fn stdin_mode_pipes_the_payload() {
        let provider = provider(json!({"command": ["cat"], "pass_to": "stdin"}));
        let envelope = provider.call(Some("ping")).await.unwrap();
        assert_eq!(envelope.data, json!("ping"));
    }

    #[tokio::test]
    async fn string_commands_are_split_like_a_shell() {
        let provider = provider(json!({"command": "echo one two"}));
        let envelope = provider.call(None).await.unwrap();
        assert_eq!(envelope.data, json!("one two\n"));
    }

    #[tokio::test]
    async fn timeout_produces_a_structured_failure() {
        let provider = provider(json!({"command": ["sleep", "5"], "timeout": 0.1}));
        let envelope = provider.call(None).await.unwrap();
        assert!(!envelope.status.success);
        assert_eq!(envelope.status.notes, vec!["timeout"]);
        assert_eq!(envelope.meta["timeout"], json!(true));
    }

    #[tokio::test]
    async fn template_mode_renders_arguments_from_the_payload() {
        let provider = provider(json!({
            "command": ["echo", "{{ json.name }}"],
            "pass_to": "template",
        }));
        let envelope = provider.call(Some(r#"{"name": "zed"}"#)).await.unwrap();
        assert_eq!(envelope.data, json!("zed\n"));
    }

    #[tokio::test]
    async fn template_mode_exposes_a_jmespath_function() {
        let provider = provider(json!({
            "command": ["echo", "{{ jmespath('a.b') }}"],
            "pass_to": "template",
        }));
        let envelope = provider
            .call(Some(r#"{"a": {"b": "deep"}}"#))
            .await
            .unwrap();
        assert_eq!(envelope.data, json!("deep\n"));
    }

    #[tokio::test]
    async fn strict_templates_fail_on_missing_variables() {
        let provider = provider(json!({
            "command": ["echo", "{{ json.missing }}"],
            "pass_to": "template",
        }));
        assert!(provider.call(Some("not json")).await.is_err());
    }

    #[test]
    fn default_logging_hides_arguments() {
        let provider = provider(json!({
            "command": ["curl", "-H", "Authorization: Bearer SECRET_TOKEN"],
        }));
        let sanitized =
            provider.sanitize_for_logging(&["curl".into(), "-H".into(), "Authorization: Bearer SECRET_TOKEN".into()]);
        assert_eq!(sanitized, vec!["curl", "<2 args>"]);
    }

    #[test]
    fn redacts_by_index() {
        let provider = provider(json!({
            "command": ["curl", "-H", "Authorization: Bearer SECRET"],
            "redact_args": [2],
        }));
        let sanitized = provider.sanitize_for_logging(&[
            "curl".into(),
            "-H".into(),
            "Authorization: Bearer SECRET".into(),
        ]);
        assert_eq!(sanitized, vec!["curl", "-H", "[REDACTED]"]);
    }

    #[test]
    fn redacts_by_pattern_case_sensitively() {
        let provider = provider(json!({
            "command": ["curl", "-H", "authorization: secret"],
            "redact_patterns": ["Authorization:"],
        }));
        let sanitized = provider.sanitize_for_logging(&[
            "curl".into(),
            "-H".into(),
            "authorization: secret".into(),
        ]);
        // pattern has a capital A, so nothing matches
        assert_eq!(sanitized, vec!["curl", "-H", "authorization: secret"]);
    }

    #[test]
    fn combines_indices_and_patterns() {
        let provider = provider(json!({
            "command": ["tool", "--key", "KEY123", "--token", "TOKEN456", "--other", "safe"],
            "redact_args": [2],
            "redact_patterns": ["TOKEN"],
        }));
        let argv: Vec<String> = ["tool", "--key", "KEY123", "--token", "TOKEN456", "--other", "safe"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            provider.sanitize_for_logging(&argv),
            vec!["tool", "--key", "[REDACTED]", "--token", "[REDACTED]", "--other", "safe"]
        );
    }

    #[test]
    fn log_full_command_bypasses_redaction() {
        let provider = provider(json!({
            "command": ["curl", "-H", "Authorization: Bearer SECRET"],
            "log_full_command": true,
            "redact_args": [2],
        }));
        let argv: Vec<String> = ["curl", "-H", "Authorization: Bearer SECRET"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(provider.sanitize_for_logging(&argv), argv);
    }

    #[test]
    fn empty_command_sanitizes_to_nothing() {
        let provider = provider(json!({"command": []}));
        assert!(provider.sanitize_for_logging(&[]).is_empty());
    }
}
