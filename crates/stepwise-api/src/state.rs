//! Application state wiring all services together.
//!
//! AppState holds the concrete engine, queue, and trigger instances used by
//! the CLI. Core services are generic over repository traits; AppState pins
//! them to the SQLite and JSON-file implementations from stepwise-infra.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use stepwise_core::processor::collaborator::LogNotifier;
use stepwise_core::processor::{Collaborators, ProcessorRegistry, register_built_in_processors};
use stepwise_core::queue::QueueManager;
use stepwise_core::trigger::{CronScheduler, WorkflowLauncher};
use stepwise_core::workflow::WorkflowEngine;
use stepwise_infra::config::{
    CONFIG_FILE_NAME, apply_data_dir_defaults, load_engine_config, resolve_data_dir,
};
use stepwise_infra::definition::JsonFileDefinitionRepository;
use stepwise_infra::sqlite::{DatabasePool, SqliteExecutionRepository, SqliteJobStore};
use stepwise_infra::trigger::{FileWatcherManager, TriggerSupervisor};
use stepwise_types::config::EngineConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Concrete type aliases for the core generics pinned to infra implementations.
pub type ConcreteQueue = QueueManager<SqliteJobStore>;

pub type ConcreteEngine =
    WorkflowEngine<JsonFileDefinitionRepository, SqliteExecutionRepository, SqliteJobStore>;

/// Where the configuration came from and what it says.
pub struct Settings {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub config: EngineConfig,
}

impl Settings {
    /// Load `stepwise.toml` from `explicit` or the data directory and fill in
    /// path defaults.
    pub async fn load(explicit: Option<&Path>) -> Self {
        let data_dir = resolve_data_dir();
        let config_path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_dir.join(CONFIG_FILE_NAME));
        let mut config = load_engine_config(&config_path).await;
        apply_data_dir_defaults(&mut config, &data_dir);
        Self {
            data_dir,
            config_path,
            config,
        }
    }

    pub fn definitions_file(&self) -> PathBuf {
        self.config
            .definitions_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(stepwise_infra::config::DEFINITIONS_FILE_NAME))
    }
}

/// Shared application state holding all services.
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub db_pool: DatabasePool,
    pub queue: Arc<ConcreteQueue>,
    pub engine: Arc<ConcreteEngine>,
    pub scheduler: Arc<CronScheduler>,
    pub watchers: Arc<FileWatcherManager>,
    pub supervisor: Arc<TriggerSupervisor>,
    registry: Arc<ProcessorRegistry>,
}

impl AppState {
    /// Initialize the application state: connect to DB, wire services.
    ///
    /// Nothing runs yet; see [`start_processing`](Self::start_processing) and
    /// [`start_triggers`](Self::start_triggers).
    pub async fn init(settings: &Settings) -> anyhow::Result<Self> {
        let data_dir = settings.data_dir.clone();
        let config = settings.config.clone();

        // Ensure data directory exists
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let db_url = config
            .database_url
            .clone()
            .unwrap_or_else(|| stepwise_infra::config::default_database_url(&data_dir));
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open database {db_url}"))?;

        let queue = Arc::new(QueueManager::new(
            Arc::new(SqliteJobStore::new(db_pool.clone())),
            &config,
        ));
        let engine = WorkflowEngine::new(
            JsonFileDefinitionRepository::new(settings.definitions_file()),
            Arc::new(SqliteExecutionRepository::new(db_pool.clone())),
            Arc::clone(&queue),
            config.clone(),
        );
        let launcher: Arc<dyn WorkflowLauncher> = engine.clone();

        let mut registry = ProcessorRegistry::new();
        register_built_in_processors(
            &mut registry,
            Collaborators {
                notifier: Some(Arc::new(LogNotifier)),
                launcher: Some(Arc::clone(&launcher)),
                ..Collaborators::default()
            },
        );
        registry.apply_concurrency(&queue, |q| config.queue_concurrency(q));

        let scheduler = Arc::new(CronScheduler::new(Arc::clone(&launcher)));
        let watchers = Arc::new(FileWatcherManager::new(
            launcher,
            Duration::from_millis(config.file_watch_debounce_ms),
            Duration::from_millis(config.health_check_interval_ms),
        )
        .with_dedup_window(Duration::from_millis(config.file_watch_dedup_ms)));
        let supervisor = Arc::new(TriggerSupervisor::new(
            Arc::clone(&scheduler),
            Arc::clone(&watchers),
        ));

        Ok(Self {
            data_dir,
            config,
            db_pool,
            queue,
            engine,
            scheduler,
            watchers,
            supervisor,
            registry: Arc::new(registry),
        })
    }

    /// Start the queue workers and the engine sequencer.
    pub async fn start_processing(&self) -> anyhow::Result<()> {
        self.queue
            .start(self.registry.clone())
            .await
            .context("failed to start queue workers")?;
        self.engine
            .start()
            .await
            .context("failed to start workflow engine")?;
        Ok(())
    }

    /// Arm schedules and file watchers for every stored workflow and follow
    /// definition changes made through this process.
    pub async fn start_triggers(&self, cancel: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
        let changes = self.engine.definition_events().subscribe();
        let workflows = self
            .engine
            .list_workflows()
            .await
            .context("failed to load workflow definitions")?;
        self.supervisor.sync_all(&workflows);
        Ok(Arc::clone(&self.supervisor).spawn(changes, cancel))
    }

    /// Stop triggers first so nothing new starts, then drain the engine and
    /// queues, then close the database.
    pub async fn shutdown(&self) {
        self.watchers.shutdown().await;
        self.scheduler.shutdown().await;
        self.engine.shutdown().await;
        self.queue.shutdown().await;
        self.db_pool.close().await;
    }
}
