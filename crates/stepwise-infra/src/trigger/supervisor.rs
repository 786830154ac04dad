//! Keeps cron schedules and file watchers aligned with workflow definitions.
//!
//! The supervisor re-arms a workflow's triggers whenever its definition is
//! created, updated, or deleted. Trigger errors are logged and never block
//! the definition change that caused them.

use std::sync::Arc;

use stepwise_core::trigger::CronScheduler;
use stepwise_types::event::DefinitionChange;
use stepwise_types::workflow::{TriggerConfig, WorkflowDefinition};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::file_watch::{FileWatcherManager, WatchOptions};

pub struct TriggerSupervisor {
    scheduler: Arc<CronScheduler>,
    watchers: Arc<FileWatcherManager>,
}

impl TriggerSupervisor {
    pub fn new(scheduler: Arc<CronScheduler>, watchers: Arc<FileWatcherManager>) -> Self {
        Self {
            scheduler,
            watchers,
        }
    }

    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.scheduler
    }

    pub fn watchers(&self) -> &Arc<FileWatcherManager> {
        &self.watchers
    }

    /// Replace every trigger of `workflow` with the ones its definition declares.
    /// Disabled workflows end up with none.
    pub fn sync_workflow(&self, workflow: &WorkflowDefinition) {
        self.remove_workflow(&workflow.id);
        if !workflow.enabled {
            tracing::debug!(workflow_id = %workflow.id, "workflow disabled, triggers left unarmed");
            return;
        }

        if let Some(schedule) = workflow.effective_schedule() {
            match self.scheduler.schedule_workflow(&workflow.id, &schedule) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(workflow_id = %workflow.id, "schedule disabled")
                }
                Err(e) => tracing::warn!(
                    workflow_id = %workflow.id,
                    cron = %schedule.cron_expression,
                    error = %e,
                    "failed to schedule workflow"
                ),
            }
        }

        for trigger in &workflow.triggers {
            let TriggerConfig::FileWatch {
                path,
                pattern,
                ignore_pattern,
                recursive,
            } = trigger
            else {
                continue;
            };
            let options = WatchOptions {
                recursive: *recursive,
                file_pattern: pattern.clone(),
                ignore_pattern: ignore_pattern.clone(),
            };
            if let Err(e) = self.watchers.add_file_watcher(&workflow.id, path, options) {
                tracing::warn!(
                    workflow_id = %workflow.id,
                    %path,
                    error = %e,
                    "failed to add file watcher"
                );
            }
        }
    }

    /// Disarm every trigger of a workflow.
    pub fn remove_workflow(&self, workflow_id: &str) {
        self.scheduler.unschedule_workflow(workflow_id);
        self.watchers.remove_workflow_watchers(workflow_id);
    }

    /// Arm triggers for every definition, typically at startup.
    pub fn sync_all(&self, workflows: &[WorkflowDefinition]) {
        for workflow in workflows {
            self.sync_workflow(workflow);
        }
        tracing::info!(
            workflows = workflows.len(),
            schedules = self.scheduler.list_scheduled_workflows().len(),
            watchers = self.watchers.list_file_watchers().len(),
            "triggers synchronized"
        );
    }

    pub fn apply(&self, change: &DefinitionChange) {
        match change {
            DefinitionChange::Created { workflow } | DefinitionChange::Updated { workflow } => {
                self.sync_workflow(workflow)
            }
            DefinitionChange::Deleted { workflow_id } => self.remove_workflow(workflow_id),
        }
    }

    /// Follow definition changes until `cancel` fires or the sender is dropped.
    pub fn spawn(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<DefinitionChange>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(change) => self.apply(&change),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "trigger supervisor lagged behind definition changes");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("trigger supervisor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::trigger::test_support::RecordingLauncher;

    fn supervisor(dir: &std::path::Path) -> (Arc<TriggerSupervisor>, WorkflowDefinition) {
        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = Arc::new(CronScheduler::new(launcher.clone()));
        let watchers = Arc::new(FileWatcherManager::new(
            launcher,
            Duration::from_millis(100),
            Duration::from_secs(5),
        ));
        let workflow: WorkflowDefinition = serde_json::from_value(json!({
            "id": "intake",
            "name": "Intake",
            "triggers": [
                {"type": "file-watch", "path": dir.display().to_string(), "pattern": "\\.pdf$"},
                {"type": "schedule", "cronExpression": "0 9 * * *"}
            ],
            "steps": [{
                "id": "notify",
                "name": "Notify",
                "type": "notification",
                "config": {"type": "notification", "channel": "email", "recipients": [], "message": "hi"}
            }]
        }))
        .unwrap();
        (
            Arc::new(TriggerSupervisor::new(scheduler, watchers)),
            workflow,
        )
    }

    #[tokio::test]
    async fn test_sync_arms_schedule_and_watchers() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, workflow) = supervisor(dir.path());

        sup.sync_workflow(&workflow);
        let schedules = sup.scheduler().list_scheduled_workflows();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].workflow_id, "intake");
        let watchers = sup.watchers().list_file_watchers();
        assert_eq!(watchers.len(), 1);
        assert!(watchers[0].recursive);
        assert_eq!(watchers[0].file_pattern.as_deref(), Some(r"\.pdf$"));

        // Resync replaces rather than duplicates.
        sup.sync_workflow(&workflow);
        assert_eq!(sup.watchers().list_file_watchers().len(), 1);
        assert_eq!(sup.scheduler().list_scheduled_workflows().len(), 1);

        sup.scheduler().shutdown().await;
        sup.watchers().shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_workflow_has_no_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, mut workflow) = supervisor(dir.path());

        sup.sync_workflow(&workflow);
        workflow.enabled = false;
        sup.apply(&DefinitionChange::Updated { workflow });

        assert!(sup.scheduler().list_scheduled_workflows().is_empty());
        assert!(sup.watchers().list_file_watchers().is_empty());
        sup.scheduler().shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_trigger_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, mut workflow) = supervisor(dir.path());
        workflow.triggers.push(TriggerConfig::FileWatch {
            path: "/nonexistent/inbox".to_string(),
            pattern: None,
            ignore_pattern: None,
            recursive: false,
        });

        sup.sync_workflow(&workflow);
        assert_eq!(sup.watchers().list_file_watchers().len(), 1);
        assert_eq!(sup.scheduler().list_scheduled_workflows().len(), 1);
        sup.scheduler().shutdown().await;
        sup.watchers().shutdown().await;
    }

    #[tokio::test]
    async fn test_spawned_supervisor_follows_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, workflow) = supervisor(dir.path());
        let (tx, rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&sup).spawn(rx, cancel.clone());

        tx.send(DefinitionChange::Created { workflow }).unwrap();
        for _ in 0..100 {
            if !sup.scheduler().list_scheduled_workflows().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sup.scheduler().list_scheduled_workflows().len(), 1);

        tx.send(DefinitionChange::Deleted {
            workflow_id: "intake".to_string(),
        })
        .unwrap();
        for _ in 0..100 {
            if sup.watchers().list_file_watchers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sup.scheduler().list_scheduled_workflows().is_empty());
        assert!(sup.watchers().list_file_watchers().is_empty());

        cancel.cancel();
        handle.await.unwrap();
        sup.scheduler().shutdown().await;
    }
}
