// Shared run state: per-step statuses, timestamps, and accumulated
// outputs. Mutated only while holding the runner's lock; the status API
// reads it through the same lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepStatus {
    pub name: String,
    pub state: StepState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StepStatus {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: StepState::Pending,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub steps: HashMap<String, StepStatus>,
}

#[derive(Debug)]
pub struct RunState {
    /// Outputs committed by succeeded steps, exactly one entry per step.
    pub flows: HashMap<String, Map<String, Value>>,
    pub status: RunStatus,
    /// Per-source template context, materialized once at run start.
    pub sources_ctx: Value,
    /// Step definition order; used for the current_step tie-break.
    step_order: Vec<String>,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            flows: HashMap::new(),
            status: RunStatus {
                run_id: Utc::now().timestamp_millis(),
                started_at: None,
                ended_at: None,
                steps: HashMap::new(),
            },
            sources_ctx: Value::Object(Map::new()),
            step_order: Vec::new(),
        }
    }

    /// Creates the pending status entries, in definition order.
    pub fn register_steps(&mut self, names: &[String]) {
        self.step_order = names.to_vec();
        for name in names {
            self.status
                .steps
                .insert(name.clone(), StepStatus::new(name));
        }
    }

    pub fn mark_running(&mut self, name: &str) {
        if let Some(step) = self.status.steps.get_mut(name) {
            step.state = StepState::Running;
            step.started_at = Some(Utc::now());
        }
    }

    pub fn mark_succeeded(&mut self, name: &str, outputs: Map<String, Value>) {
        self.flows.insert(name.to_string(), outputs);
        if let Some(step) = self.status.steps.get_mut(name) {
            step.state = StepState::Succeeded;
            step.ended_at = Some(Utc::now());
        }
    }

    pub fn mark_failed(&mut self, name: &str, error: String) {
        if let Some(step) = self.status.steps.get_mut(name) {
            step.state = StepState::Failed;
            step.error = Some(error);
            step.ended_at = Some(Utc::now());
        }
    }

    /// Skipped steps never ran: the start timestamp is cleared so exactly
    /// one of (skipped, no start) / (terminal, started) holds.
    pub fn mark_skipped(&mut self, name: &str) {
        if let Some(step) = self.status.steps.get_mut(name) {
            step.state = StepState::Skipped;
            step.started_at = None;
            step.ended_at = Some(Utc::now());
        }
    }

    pub fn state_of(&self, name: &str) -> Option<StepState> {
        self.status.steps.get(name).map(|step| step.state)
    }

    /// The `/status` document. Assembled in one pass under the lock so all
    /// fields are mutually consistent.
    pub fn status_snapshot(&self) -> Value {
        let mut steps = Map::new();
        let mut completed = 0usize;
        for name in &self.step_order {
            let Some(step) = self.status.steps.get(name) else {
                continue;
            };
            if matches!(step.state, StepState::Succeeded | StepState::Failed) {
                completed += 1;
            }
            let outputs: Vec<String> = self
                .flows
                .get(name)
                .map(|map| map.keys().cloned().collect())
                .unwrap_or_default();
            let notes: Vec<&String> = step.error.iter().collect();
            steps.insert(
                name.clone(),
                json!({
                    "state": step.state,
                    "started_at": step.started_at,
                    "ended_at": step.ended_at,
                    "notes": notes,
                    "outputs": outputs,
                }),
            );
        }
        let current_step = self
            .step_order
            .iter()
            .find(|name| self.state_of(name) == Some(StepState::Running));
        json!({
            "run_id": self.status.run_id,
            "started_at": self.status.started_at,
            "ended_at": self.status.ended_at,
            "total_steps": steps.len(),
            "completed_steps": completed,
            "current_step": current_step,
            "steps": steps,
        })
    }

    /// The `/outputs` document: a shallow copy of `flows`.
    pub fn outputs_snapshot(&self) -> Value {
        let mut out = Map::new();
        for (name, outputs) in &self.flows {
            out.insert(name.clone(), Value::Object(outputs.clone()));
        }
        Value::Object(out)
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered() -> RunState {
        let mut state = RunState::new();
        state.register_steps(&["first".into(), "second".into()]);
        state
    }

    #[test]
    fn steps_start_pending_without_timestamps() {
        let state = registered();
        let step = &state.status.steps["first"];
        assert_eq!(step.state, StepState::Pending);
        assert!(step.started_at.is_none() && step.ended_at.is_none());
    }

    #[test]
    fn terminal_transitions_order_their_timestamps() {
        let mut state = registered();
        state.mark_running("first");
        state.mark_succeeded("first", Map::new());
        let step = &state.status.steps["first"];
        assert_eq!(step.state, StepState::Succeeded);
        assert!(step.ended_at.unwrap() >= step.started_at.unwrap());
    }

    #[test]
    fn skipping_clears_the_start_timestamp() {
        let mut state = registered();
        state.mark_skipped("second");
        let step = &state.status.steps["second"];
        assert_eq!(step.state, StepState::Skipped);
        assert!(step.started_at.is_none());
        assert!(step.ended_at.is_some());
    }

    #[test]
    fn snapshot_counts_terminal_steps_and_reports_current() {
        let mut state = registered();
        state.mark_running("first");
        let snapshot = state.status_snapshot();
        assert_eq!(snapshot["total_steps"], json!(2));
        assert_eq!(snapshot["completed_steps"], json!(0));
        assert_eq!(snapshot["current_step"], json!("first"));

        let mut outputs = Map::new();
        outputs.insert("token".into(), json!("abc"));
        state.mark_succeeded("first", outputs);
        state.mark_running("second");
        state.mark_failed("second", "boom".into());
        let snapshot = state.status_snapshot();
        assert_eq!(snapshot["completed_steps"], json!(2));
        assert_eq!(snapshot["current_step"], Value::Null);
        assert_eq!(snapshot["steps"]["first"]["outputs"], json!(["token"]));
        assert_eq!(snapshot["steps"]["second"]["notes"], json!(["boom"]));
    }

    #[test]
    fn outputs_snapshot_copies_flows() {
        let mut state = registered();
        let mut outputs = Map::new();
        outputs.insert("value".into(), json!(7));
        state.mark_succeeded("first", outputs);
        assert_eq!(
            state.outputs_snapshot(),
            json!({"first": {"value": 7}})
        );
    }
}
