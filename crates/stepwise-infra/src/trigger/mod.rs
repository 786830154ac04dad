//! Trigger infrastructure: filesystem watchers and the supervisor that keeps
//! schedules and watchers in step with stored definitions.

pub mod file_watch;
pub mod supervisor;

pub use file_watch::{
    FileWatchError, FileWatcherInfo, FileWatcherManager, PathFilter, WatchOptions, WatcherError,
};
pub use supervisor::TriggerSupervisor;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use futures_util::future::BoxFuture;
    use stepwise_core::trigger::{LaunchError, WorkflowLauncher};
    use stepwise_types::execution::TriggerSource;
    use uuid::Uuid;

    /// Records every launch; never fails.
    #[derive(Default)]
    pub struct RecordingLauncher {
        pub launches: Mutex<Vec<(String, serde_json::Value, TriggerSource)>>,
    }

    impl RecordingLauncher {
        pub fn count(&self) -> usize {
            self.launches.lock().unwrap().len()
        }
    }

    impl WorkflowLauncher for RecordingLauncher {
        fn launch<'a>(
            &'a self,
            workflow_id: &'a str,
            input: serde_json::Value,
            source: TriggerSource,
        ) -> BoxFuture<'a, Result<Uuid, LaunchError>> {
            Box::pin(async move {
                self.launches
                    .lock()
                    .unwrap()
                    .push((workflow_id.to_string(), input, source));
                Ok(Uuid::now_v7())
            })
        }
    }
}
