//! Read-only aggregation over execution history.

use stepwise_types::execution::{ExecutionStatus, SystemMetrics, WorkflowExecution, WorkflowMetrics};
use stepwise_types::job::SystemStats;
use stepwise_types::workflow::WorkflowDefinition;

#[derive(Default)]
struct Tally {
    total: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    active: u64,
    completed_duration_ms: i64,
}

impl Tally {
    fn of<'a>(executions: impl IntoIterator<Item = &'a WorkflowExecution>) -> Self {
        let mut tally = Tally::default();
        for execution in executions {
            tally.total += 1;
            match execution.status {
                ExecutionStatus::Completed => {
                    tally.completed += 1;
                    tally.completed_duration_ms += execution.duration_ms().unwrap_or(0).max(0);
                }
                ExecutionStatus::Failed => tally.failed += 1,
                ExecutionStatus::Cancelled => tally.cancelled += 1,
                ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Paused => {
                    tally.active += 1
                }
            }
        }
        tally
    }

    /// Completed over terminal executions; 0 when nothing has finished.
    fn success_rate(&self) -> f64 {
        let terminal = self.completed + self.failed + self.cancelled;
        if terminal == 0 {
            0.0
        } else {
            self.completed as f64 / terminal as f64
        }
    }

    /// Mean wall-clock time of completed executions.
    fn average_duration_ms(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.completed_duration_ms as f64 / self.completed as f64
        }
    }
}

/// Aggregate the executions of one workflow.
pub fn workflow_metrics(workflow_id: &str, executions: &[WorkflowExecution]) -> WorkflowMetrics {
    let own = executions.iter().filter(|e| e.workflow_id == workflow_id);
    let tally = Tally::of(own.clone());
    WorkflowMetrics {
        workflow_id: workflow_id.to_string(),
        total: tally.total,
        completed: tally.completed,
        failed: tally.failed,
        cancelled: tally.cancelled,
        active: tally.active,
        success_rate: tally.success_rate(),
        average_duration_ms: tally.average_duration_ms(),
        last_run_at: own.map(|e| e.started_at).max(),
    }
}

/// Aggregate every execution, plus job counts when queue stats are available.
pub fn system_metrics(
    definitions: &[WorkflowDefinition],
    executions: &[WorkflowExecution],
    queues: Option<&SystemStats>,
) -> SystemMetrics {
    let tally = Tally::of(executions);
    SystemMetrics {
        workflows: definitions.len() as u64,
        enabled_workflows: definitions.iter().filter(|d| d.enabled).count() as u64,
        executions: tally.total,
        completed: tally.completed,
        failed: tally.failed,
        cancelled: tally.cancelled,
        active_executions: tally.active,
        success_rate: tally.success_rate(),
        average_duration_ms: tally.average_duration_ms(),
        queued_jobs: queues.map(|q| q.total_waiting).unwrap_or(0),
        active_jobs: queues.map(|q| q.total_active).unwrap_or(0),
    }
}
