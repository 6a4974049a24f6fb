// Module: Runner
// The concurrent scheduler: dependency graph, ready queue, bounded worker
// tasks, policy-driven failure propagation, and the shared run state.

pub mod graph;
pub mod status;

use crate::errors::RunnerError;
use crate::flow::{ErrorPolicy, FlowConfig, InputKind, OutputKind, SourceConfig, Step};
use crate::providers::create_provider;
use crate::templating;
use anyhow::{anyhow, bail};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use self::status::{RunState, StepState};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info};

/// Executes one flow to completion. The shared state handle can be given
/// to the status API for concurrent read access during the run.
pub struct LocalRunner {
    config: FlowConfig,
    shared: Arc<Mutex<RunState>>,
    max_workers_override: Option<usize>,
}

#[derive(Debug)]
pub struct RunReport {
    /// Set when a failing step had a direct dependent with `fail` policy.
    pub aborted: bool,
    pub states: HashMap<String, StepState>,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        !self.aborted
            && self
                .states
                .values()
                .all(|state| *state == StepState::Succeeded)
    }
}

#[derive(Debug)]
struct StepOutcome {
    name: String,
    ok: bool,
}

impl LocalRunner {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Mutex::new(RunState::new())),
            max_workers_override: None,
        }
    }

    pub fn with_max_workers(mut self, max_workers: Option<usize>) -> Self {
        self.max_workers_override = max_workers;
        self
    }

    /// Handle to the state guarded by the run lock, for status readers.
    pub fn shared(&self) -> Arc<Mutex<RunState>> {
        Arc::clone(&self.shared)
    }

    fn max_workers(&self) -> usize {
        self.max_workers_override
            .or(self.config.runner.max_workers)
            .unwrap_or_else(|| {
                let cores = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                (cores + 3).min(4)
            })
            .max(1)
    }

    /// Template context for the `sources` side of the snapshot: data-only
    /// sources contribute their data, everything else its configuration.
    fn materialize_sources_ctx(&self) -> Value {
        let mut ctx = Map::new();
        for (name, source) in &self.config.sources {
            let data = create_provider(&source.type_name, source.configuration.clone())
                .ok()
                .and_then(|provider| provider.context_data())
                .unwrap_or_else(|| source.configuration.clone());
            ctx.insert(name.clone(), data);
        }
        Value::Object(ctx)
    }

    pub async fn run(&self) -> Result<RunReport, RunnerError> {
        let graph = graph::build(&self.config.flow)?;
        let graph::DepGraph {
            mut in_degree,
            dependents,
            ..
        } = graph;

        let step_order: Vec<String> = self.config.flow.iter().map(|s| s.name.clone()).collect();
        let steps_by_name: HashMap<String, Step> = self
            .config
            .flow
            .iter()
            .map(|step| (step.name.clone(), step.clone()))
            .collect();
        let sources = Arc::new(self.config.sources.clone());
        let default_policy = self.config.runner.on_error.unwrap_or_default();
        let sources_ctx = self.materialize_sources_ctx();

        {
            let mut state = self.shared.lock().await;
            state.register_steps(&step_order);
            state.sources_ctx = sources_ctx;
            state.status.started_at = Some(chrono::Utc::now());
        }
        info!(steps = step_order.len(), "runner starting");

        let semaphore = Arc::new(Semaphore::new(self.max_workers()));
        let mut join_set: JoinSet<StepOutcome> = JoinSet::new();
        let mut ready: VecDeque<String> = step_order
            .iter()
            .filter(|name| in_degree[*name] == 0)
            .cloned()
            .collect();
        let mut aborted = false;

        loop {
            while let Some(name) = ready.pop_front() {
                let step = steps_by_name[&name].clone();
                let sources = Arc::clone(&sources);
                let shared = Arc::clone(&self.shared);
                let semaphore = Arc::clone(&semaphore);
                join_set.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("worker semaphore closed");
                    execute_step(step, sources, shared).await
                });
            }

            let outcome = match join_set.join_next().await {
                None => break,
                Some(Ok(outcome)) => outcome,
                Some(Err(join_err)) => {
                    // A worker panicking is a bug, not a step failure; stop
                    // handing out work rather than guess at the state.
                    error!(error = %join_err, "step task aborted unexpectedly");
                    aborted = true;
                    break;
                }
            };

            if !outcome.ok {
                let mut direct: Vec<&String> =
                    dependents[&outcome.name].iter().collect();
                direct.sort();
                for dependent in direct {
                    let policy = steps_by_name[dependent]
                        .on_error
                        .unwrap_or(default_policy);
                    match policy {
                        ErrorPolicy::Skip => {
                            let mut skipped = Vec::new();
                            let mut unblocked = Vec::new();
                            skip_cascade(
                                dependent,
                                &steps_by_name,
                                default_policy,
                                &dependents,
                                &mut in_degree,
                                &mut skipped,
                                &mut unblocked,
                            );
                            let mut state = self.shared.lock().await;
                            for name in &skipped {
                                info!(step = %name, cause = %outcome.name, "skipping step");
                                state.mark_skipped(name);
                            }
                            drop(state);
                            ready.extend(unblocked);
                        }
                        // The dependent runs without the failed step's
                        // outputs; its own render may then fail, which
                        // re-enters this machinery for its dependents.
                        ErrorPolicy::Continue => {}
                        ErrorPolicy::Fail => {
                            info!(step = %dependent, cause = %outcome.name, "abort requested by dependent policy");
                            aborted = true;
                            ready.clear();
                            break;
                        }
                    }
                }
            }

            if aborted {
                break;
            }

            let mut unblocked: Vec<&String> = dependents[&outcome.name].iter().collect();
            unblocked.sort();
            for dependent in unblocked {
                let degree = in_degree.get_mut(dependent).expect("known step");
                if *degree > 0 {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(dependent.clone());
                    }
                }
            }
        }

        if aborted {
            // Outstanding provider calls are abandoned, never interrupted.
            join_set.detach_all();
        }

        let mut state = self.shared.lock().await;
        state.status.ended_at = Some(chrono::Utc::now());
        let states: HashMap<String, StepState> = state
            .status
            .steps
            .iter()
            .map(|(name, step)| (name.clone(), step.state))
            .collect();
        info!(aborted, "runner finished");
        Ok(RunReport { aborted, states })
    }
}

/// Withdraws a step and its transitive dependents from scheduling. A
/// descendant whose own policy is `continue` is spared: the skipped
/// dependency counts as satisfied for it.
fn skip_cascade(
    name: &str,
    steps_by_name: &HashMap<String, Step>,
    default_policy: ErrorPolicy,
    dependents: &HashMap<String, HashSet<String>>,
    in_degree: &mut HashMap<String, i64>,
    skipped: &mut Vec<String>,
    unblocked: &mut Vec<String>,
) {
    let degree = in_degree.get_mut(name).expect("known step");
    if *degree < 0 {
        return;
    }
    *degree = -1;
    skipped.push(name.to_string());

    let mut children: Vec<&String> = dependents[name].iter().collect();
    children.sort();
    for child in children {
        let child_degree = in_degree.get_mut(child.as_str()).expect("known step");
        if *child_degree < 0 {
            continue;
        }
        let policy = steps_by_name[child].on_error.unwrap_or(default_policy);
        if policy == ErrorPolicy::Continue {
            *child_degree -= 1;
            if *child_degree == 0 {
                unblocked.push(child.clone());
            }
        } else {
            skip_cascade(
                child,
                steps_by_name,
                default_policy,
                dependents,
                in_degree,
                skipped,
                unblocked,
            );
        }
    }
}

async fn execute_step(
    step: Step,
    sources: Arc<HashMap<String, SourceConfig>>,
    shared: Arc<Mutex<RunState>>,
) -> StepOutcome {
    let name = step.name.clone();
    info!(step = %name, "starting step");
    shared.lock().await.mark_running(&name);

    match run_step_body(&step, &sources, &shared).await {
        Ok(outputs) => {
            shared.lock().await.mark_succeeded(&name, outputs);
            info!(step = %name, "step succeeded");
            StepOutcome { name, ok: true }
        }
        Err(err) => {
            let text = format!("{err:#}");
            shared.lock().await.mark_failed(&name, text.clone());
            error!(step = %name, error = %text, "step failed");
            StepOutcome { name, ok: false }
        }
    }
}

async fn run_step_body(
    step: &Step,
    sources: &HashMap<String, SourceConfig>,
    shared: &Arc<Mutex<RunState>>,
) -> anyhow::Result<Map<String, Value>> {
    let source = step
        .source
        .as_ref()
        .ok_or_else(|| anyhow!("step '{}' has no source", step.name))?
        .resolve(sources)?;

    // One consistent snapshot per dispatch; all rendering for this step
    // sees the same view of the run.
    let (flows_snapshot, sources_snapshot) = {
        let state = shared.lock().await;
        (
            serde_json::to_value(&state.flows)?,
            state.sources_ctx.clone(),
        )
    };

    let configuration =
        templating::render_value(&source.configuration, &flows_snapshot, &sources_snapshot)?;
    let provider = create_provider(&source.type_name, configuration)?;

    let payload: Option<String> = match &step.input {
        Some(input) => match input.kind {
            InputKind::Parameter => Some(templating::render(
                input.value.as_deref().unwrap_or_default(),
                &flows_snapshot,
                &sources_snapshot,
            )?),
            InputKind::Filter | InputKind::Body => Some(templating::render(
                input.template.as_deref().unwrap_or_default(),
                &flows_snapshot,
                &sources_snapshot,
            )?),
            InputKind::Other => None,
        },
        None => None,
    };

    let envelope = provider.call(payload.as_deref()).await?;
    if !envelope.status.success {
        let message = if envelope.status.notes.is_empty() {
            let code = envelope
                .status
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".into());
            format!("provider reported failure (code={code})")
        } else {
            envelope.status.notes.join("; ")
        };
        bail!(message);
    }

    let mut outputs = Map::new();
    for declared in &step.output {
        let value = match declared.kind {
            OutputKind::Jmespath => {
                templating::search(declared.value.as_deref().unwrap_or_default(), &envelope.data)
            }
            OutputKind::Json | OutputKind::Other => envelope.data.clone(),
        };
        outputs.insert(declared.name.clone(), value);
    }
    Ok(outputs)
}
