//! Execution state machine.
//!
//! `ExecutionState` owns one [`WorkflowExecution`] and applies step outcomes
//! to it. It never touches queues or storage: the engine asks it which steps
//! are ready, enqueues them, and feeds job results back in.
//!
//! ```text
//! pending -> running -> completed | failed | cancelled
//!              ^  |
//!              |  v
//!             paused
//! ```

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde_json::Value;
use stepwise_types::execution::{
    ExecutionStatus, LogLevel, StepState, StepStatus, TriggerSource, WorkflowExecution,
};
use stepwise_types::workflow::{FailureMode, StepDefinition, WorkflowDefinition};
use uuid::Uuid;

use super::dag::transitive_dependants;

/// What a step outcome did to the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The execution was already finished (or the step unknown); nothing changed.
    Discarded,
    /// Recorded; the execution is still in flight.
    Progressed,
    Completed,
    Failed,
}

/// One in-flight execution and the definition it runs.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    execution: WorkflowExecution,
    steps: Vec<StepDefinition>,
    failure_mode: FailureMode,
}

impl ExecutionState {
    /// A fresh `pending` execution with every step pending.
    pub fn new(
        definition: &WorkflowDefinition,
        input: Value,
        trigger: TriggerSource,
        retry_of: Option<Uuid>,
    ) -> Self {
        let steps: BTreeMap<String, StepState> = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepState::pending()))
            .collect();
        Self {
            execution: WorkflowExecution {
                execution_id: Uuid::now_v7(),
                workflow_id: definition.id.clone(),
                status: ExecutionStatus::Pending,
                input,
                current_step: None,
                progress: 0,
                logs: Vec::new(),
                result: None,
                error: None,
                steps,
                trigger,
                retry_of,
                started_at: Utc::now(),
                completed_at: None,
            },
            steps: definition.steps.clone(),
            failure_mode: definition.on_step_failure,
        }
    }

    /// Wrap a stored execution without its definition. Only lifecycle
    /// transitions apply; no step becomes ready.
    pub fn from_execution(execution: WorkflowExecution) -> Self {
        Self {
            execution,
            steps: Vec::new(),
            failure_mode: FailureMode::default(),
        }
    }

    pub fn into_execution(self) -> WorkflowExecution {
        self.execution
    }

    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution.execution_id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.execution.status
    }

    pub fn is_terminal(&self) -> bool {
        self.execution.status.is_terminal()
    }

    pub fn step_definition(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.execution.steps.get(step_id).map(|s| s.status)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// `pending -> running`. A workflow with no steps completes right away.
    pub fn start(&mut self) -> bool {
        if self.execution.status != ExecutionStatus::Pending {
            return false;
        }
        self.execution.status = ExecutionStatus::Running;
        let count = self.steps.len();
        self.execution
            .log(LogLevel::Info, format!("execution started with {count} steps"), None);
        if self.execution.steps.is_empty() {
            self.settle();
        }
        true
    }

    /// `running -> paused`. Queued jobs keep running; newly ready steps are held.
    pub fn pause(&mut self) -> bool {
        if self.execution.status != ExecutionStatus::Running {
            return false;
        }
        self.execution.status = ExecutionStatus::Paused;
        self.execution.log(LogLevel::Info, "execution paused", None);
        true
    }

    /// `paused -> running`. The caller enqueues whatever became ready meanwhile.
    pub fn resume(&mut self) -> bool {
        if self.execution.status != ExecutionStatus::Paused {
            return false;
        }
        self.execution.status = ExecutionStatus::Running;
        self.execution.log(LogLevel::Info, "execution resumed", None);
        true
    }

    /// Any non-terminal status -> `cancelled`. Steps not yet enqueued are skipped.
    pub fn cancel(&mut self, reason: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.skip_pending(|_| true);
        self.execution.status = ExecutionStatus::Cancelled;
        self.execution.error = Some(reason.to_string());
        self.execution.completed_at = Some(Utc::now());
        self.execution
            .log(LogLevel::Warn, format!("execution cancelled: {reason}"), None);
        true
    }

    /// Any non-terminal status -> `failed` for a reason outside any step.
    pub fn abort(&mut self, reason: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.skip_pending(|_| true);
        self.finish_failed(reason.to_string());
        true
    }

    // -----------------------------------------------------------------------
    // Sequencing
    // -----------------------------------------------------------------------

    /// Pending steps whose dependencies have all completed, in definition
    /// order. Empty unless the execution is running.
    pub fn ready_steps(&self) -> Vec<StepDefinition> {
        if self.execution.status != ExecutionStatus::Running {
            return Vec::new();
        }
        self.steps
            .iter()
            .filter(|s| self.step_status(&s.id) == Some(StepStatus::Pending))
            .filter(|s| {
                s.dependencies
                    .iter()
                    .all(|d| self.step_status(d) == Some(StepStatus::Completed))
            })
            .cloned()
            .collect()
    }

    /// Outputs of a step's dependencies, for the job payload.
    pub fn dependency_outputs(&self, step: &StepDefinition) -> BTreeMap<String, Value> {
        step.dependencies
            .iter()
            .filter_map(|d| {
                let output = self.execution.steps.get(d)?.output.clone()?;
                Some((d.clone(), output))
            })
            .collect()
    }

    /// Record that a step's job has been enqueued.
    pub fn mark_queued(&mut self, step_id: &str, job_id: &str) {
        if let Some(state) = self.execution.steps.get_mut(step_id) {
            state.status = StepStatus::Queued;
            state.job_id = Some(job_id.to_string());
        }
        self.execution.current_step = Some(step_id.to_string());
        self.execution
            .log(LogLevel::Info, format!("step queued as job {job_id}"), Some(step_id));
    }

    /// Note a failed attempt that will be retried.
    pub fn on_attempt_failed(&mut self, step_id: &str, reason: &str, attempts: u32) {
        if self.is_terminal() {
            return;
        }
        if let Some(state) = self.execution.steps.get_mut(step_id) {
            state.attempts = attempts;
        }
        self.execution.log(
            LogLevel::Warn,
            format!("attempt {attempts} failed, retrying: {reason}"),
            Some(step_id),
        );
    }

    pub fn on_step_completed(&mut self, step_id: &str, output: Value, attempts: u32) -> Transition {
        if self.is_terminal() {
            return Transition::Discarded;
        }
        let Some(state) = self.execution.steps.get_mut(step_id) else {
            return Transition::Discarded;
        };
        state.status = StepStatus::Completed;
        state.output = Some(output);
        state.error = None;
        state.attempts = attempts;
        self.execution
            .log(LogLevel::Info, "step completed", Some(step_id));
        self.update_progress();
        self.settle()
    }

    /// A step failed permanently.
    ///
    /// In `halt` mode the execution fails at once and every step not yet
    /// enqueued is skipped. In `continue` mode only the step's transitive
    /// dependants are skipped and the execution fails once nothing is left.
    pub fn on_step_failed(&mut self, step_id: &str, reason: &str, attempts: u32) -> Transition {
        if self.is_terminal() {
            return Transition::Discarded;
        }
        let Some(state) = self.execution.steps.get_mut(step_id) else {
            return Transition::Discarded;
        };
        state.status = StepStatus::Failed;
        state.error = Some(reason.to_string());
        state.attempts = attempts;
        self.execution
            .log(LogLevel::Error, format!("step failed: {reason}"), Some(step_id));

        let message = format!("step '{step_id}' failed: {reason}");
        match self.failure_mode {
            FailureMode::Halt => {
                self.skip_pending(|_| true);
                self.finish_failed(message);
                Transition::Failed
            }
            FailureMode::Continue => {
                let dependants = transitive_dependants(step_id, &self.steps);
                self.skip_pending(|id| dependants.contains(id));
                if self.execution.error.is_none() {
                    self.execution.error = Some(message);
                }
                self.settle()
            }
        }
    }

    fn skip_pending(&mut self, include: impl Fn(&str) -> bool) {
        let mut skipped = Vec::new();
        for (id, state) in self.execution.steps.iter_mut() {
            if state.status == StepStatus::Pending && include(id) {
                state.status = StepStatus::Skipped;
                skipped.push(id.clone());
            }
        }
        for id in skipped {
            self.execution.log(LogLevel::Warn, "step skipped", Some(id.as_str()));
        }
    }

    fn update_progress(&mut self) {
        let total = self.execution.steps.len();
        if total == 0 {
            return;
        }
        let completed = self
            .execution
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        self.execution.progress = ((completed * 100) / total).min(100) as u8;
    }

    /// Finish the execution once no step is pending or queued.
    fn settle(&mut self) -> Transition {
        let open = self
            .execution
            .steps
            .values()
            .any(|s| matches!(s.status, StepStatus::Pending | StepStatus::Queued));
        if open {
            return Transition::Progressed;
        }

        let failed = self
            .execution
            .steps
            .values()
            .any(|s| matches!(s.status, StepStatus::Failed | StepStatus::Skipped));
        if failed {
            let reason = self
                .execution
                .error
                .clone()
                .unwrap_or_else(|| "one or more steps failed".to_string());
            self.finish_failed(reason);
            return Transition::Failed;
        }

        let results: serde_json::Map<String, Value> = self
            .execution
            .steps
            .iter()
            .filter_map(|(id, s)| s.output.clone().map(|o| (id.clone(), o)))
            .collect();
        self.execution.status = ExecutionStatus::Completed;
        self.execution.progress = 100;
        self.execution.result = Some(Value::Object(results));
        self.execution.current_step = None;
        self.execution.completed_at = Some(Utc::now());
        self.execution.log(LogLevel::Info, "execution completed", None);
        Transition::Completed
    }

    fn finish_failed(&mut self, reason: String) {
        self.execution.status = ExecutionStatus::Failed;
        self.execution.log(LogLevel::Error, reason.clone(), None);
        self.execution.error = Some(reason);
        self.execution.completed_at = Some(Utc::now());
    }

    /// Job ids of steps still queued, e.g. to report what a cancel left running.
    pub fn outstanding_jobs(&self) -> HashMap<String, String> {
        self.execution
            .steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Queued)
            .filter_map(|(id, s)| s.job_id.clone().map(|j| (j, id.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::dag::test_support::step;
    use serde_json::json;
    use stepwise_types::workflow::TriggerConfig;

    fn definition(steps: Vec<StepDefinition>, mode: FailureMode) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: "Workflow".to_string(),
            description: None,
            steps,
            triggers: vec![TriggerConfig::Manual {}],
            schedule: None,
            enabled: true,
            on_step_failure: mode,
            created_at: None,
            updated_at: None,
            metadata: Default::default(),
        }
    }

    fn fan_out(mode: FailureMode) -> ExecutionState {
        // a -> {b, c}; d independent
        let def = definition(
            vec![step("a", &[]), step("b", &["a"]), step("c", &["a"]), step("d", &[])],
            mode,
        );
        let mut state = ExecutionState::new(&def, json!({"n": 1}), TriggerSource::Manual, None);
        assert!(state.start());
        state
    }

    fn ids(steps: &[StepDefinition]) -> Vec<&str> {
        steps.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_dependants_become_ready_after_completion() {
        let mut state = fan_out(FailureMode::Halt);
        assert_eq!(ids(&state.ready_steps()), vec!["a", "d"]);

        state.mark_queued("a", "j1");
        state.mark_queued("d", "j2");
        assert!(state.ready_steps().is_empty());

        assert_eq!(state.on_step_completed("a", json!("A"), 1), Transition::Progressed);
        assert_eq!(ids(&state.ready_steps()), vec!["b", "c"]);
        assert_eq!(state.execution().progress, 25);

        let b = state.step_definition("b").unwrap().clone();
        assert_eq!(state.dependency_outputs(&b)["a"], json!("A"));
    }

    #[test]
    fn test_all_steps_complete() {
        let mut state = fan_out(FailureMode::Halt);
        for id in ["a", "d", "b"] {
            state.mark_queued(id, id);
            assert_eq!(state.on_step_completed(id, json!(id), 1), Transition::Progressed);
        }
        state.mark_queued("c", "c");
        assert_eq!(state.on_step_completed("c", json!("c"), 1), Transition::Completed);

        let exec = state.execution();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.progress, 100);
        assert_eq!(exec.result.as_ref().unwrap()["d"], json!("d"));
        assert!(exec.completed_at.is_some());
    }

    #[test]
    fn test_halt_fails_and_skips_pending_steps() {
        let mut state = fan_out(FailureMode::Halt);
        state.mark_queued("a", "j1");
        state.mark_queued("d", "j2");

        assert_eq!(state.on_step_failed("a", "boom", 3), Transition::Failed);
        let exec = state.execution();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("step 'a' failed: boom"));
        assert_eq!(exec.steps["b"].status, StepStatus::Skipped);
        assert_eq!(exec.steps["d"].status, StepStatus::Queued);

        // A sibling finishing later is discarded.
        assert_eq!(state.on_step_completed("d", json!("late"), 1), Transition::Discarded);
        assert!(state.execution().steps["d"].output.is_none());
    }

    #[test]
    fn test_continue_mode_finishes_independent_branches() {
        let mut state = fan_out(FailureMode::Continue);
        state.mark_queued("a", "j1");
        state.mark_queued("d", "j2");

        assert_eq!(state.on_step_failed("a", "boom", 1), Transition::Progressed);
        assert_eq!(state.execution().steps["b"].status, StepStatus::Skipped);
        assert_eq!(state.execution().steps["c"].status, StepStatus::Skipped);
        assert_eq!(state.status(), ExecutionStatus::Running);

        assert_eq!(state.on_step_completed("d", json!("D"), 1), Transition::Failed);
        let exec = state.execution();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("step 'a' failed: boom"));
        assert_eq!(exec.steps["d"].output, Some(json!("D")));
    }

    #[test]
    fn test_pause_holds_ready_steps() {
        let mut state = fan_out(FailureMode::Halt);
        state.mark_queued("a", "j1");
        assert!(state.pause());
        assert!(!state.pause());

        state.on_step_completed("a", json!(1), 1);
        assert!(state.ready_steps().is_empty());

        assert!(state.resume());
        assert_eq!(ids(&state.ready_steps()), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_cancel_is_terminal() {
        let mut state = fan_out(FailureMode::Halt);
        state.mark_queued("a", "j1");
        assert!(state.cancel("cancelled by user"));
        assert!(!state.cancel("again"));
        assert!(!state.resume());
        assert!(state.ready_steps().is_empty());
        assert_eq!(state.status(), ExecutionStatus::Cancelled);
        assert_eq!(state.outstanding_jobs().get("j1").map(String::as_str), Some("a"));
        assert_eq!(state.on_step_completed("a", json!(1), 1), Transition::Discarded);
    }

    #[test]
    fn test_empty_workflow_completes_on_start() {
        let mut state = ExecutionState::new(
            &definition(vec![], FailureMode::Halt),
            json!({}),
            TriggerSource::Manual,
            None,
        );
        assert!(state.start());
        assert!(state.is_terminal());
        assert_eq!(state.status(), ExecutionStatus::Completed);
        assert_eq!(state.execution().result, Some(json!({})));
    }

    #[test]
    fn test_abort_restored_execution_skips_pending_steps() {
        let mut original = fan_out(FailureMode::Halt);
        original.start();
        original.mark_queued("a", "j1");

        let mut restored = ExecutionState::from_execution(original.execution().clone());
        assert!(restored.abort("interrupted by engine restart"));
        assert!(!restored.abort("again"));
        let execution = restored.into_execution();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.completed_at.is_some());
        assert_eq!(execution.steps["a"].status, StepStatus::Queued);
        assert_eq!(execution.steps["b"].status, StepStatus::Skipped);
    }

    #[test]
    fn test_abort_fails_execution() {
        let mut state = fan_out(FailureMode::Halt);
        assert!(state.abort("interrupted by engine restart"));
        assert_eq!(state.status(), ExecutionStatus::Failed);
        assert_eq!(
            state.execution().error.as_deref(),
            Some("interrupted by engine restart")
        );
    }
}
