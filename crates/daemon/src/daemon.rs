//! Daemon startup and main loop for autotranscode
//!
//! Wires the queue store, the node registry, the directory watcher, the
//! control API and the processing orchestrator together, and tears them down
//! in order on shutdown.

use crate::api::{run_server, AppState, ServerError};
use crate::config::{Config, ConfigError};
use crate::orchestrator::{Orchestrator, OrchestratorError, OrchestratorSettings};
use crate::startup::{run_startup_checks, StartupError};
use crate::store::{self, Database, JobStore, Node, NodeKey, NodeRegistry, NodeStatus, StoreError};
use crate::watch::{initial_scan, FileFilter, QueueWatcher, WatchError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Queue storage error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Directory watching error
    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    /// Processing loop error
    #[error("Processing error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// Control API error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// A background task panicked
    #[error("Task failed: {0}")]
    Task(String),
}

/// Hostname this node registers under.
pub fn local_hostname() -> String {
    sysinfo::System::host_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Identity generated for this process
    pub node_id: String,
    /// Registry hostname of this node
    pub hostname: String,
    jobs: JobStore,
    nodes: NodeRegistry,
    orchestrator: Arc<Orchestrator>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file (missing file means defaults)
    /// 2. Apply environment overrides
    /// 3. Run startup checks
    /// 4. Open the shared queue database
    ///
    /// # Arguments
    /// * `config_path` - Path to the config.toml file
    ///
    /// # Returns
    /// * `Ok(Daemon)` - Daemon initialized successfully
    /// * `Err(DaemonError)` - Initialization failed
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load_or_default(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::open(config, local_hostname())
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Used by the queue maintenance subcommands and by tests, which do not
    /// need a processing command.
    pub fn open(config: Config, hostname: impl Into<String>) -> Result<Self, DaemonError> {
        let db = Database::open(&config.queue.database_path())?;
        let jobs = JobStore::new(db.clone(), config.processing.output_extension.clone());
        let nodes = NodeRegistry::new(db);
        let hostname = hostname.into();

        let orchestrator = Arc::new(Orchestrator::new(
            jobs.clone(),
            nodes.clone(),
            hostname.clone(),
            OrchestratorSettings::from_config(&config.processing),
        ));

        Ok(Self {
            config,
            node_id: Uuid::new_v4().to_string(),
            hostname,
            jobs,
            nodes,
            orchestrator,
        })
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// Handles for the control API
    pub fn app_state(&self) -> AppState {
        AppState {
            jobs: self.jobs.clone(),
            nodes: self.nodes.clone(),
            orchestrator: self.orchestrator(),
        }
    }

    async fn set_node_status(&self, status: NodeStatus) -> Result<Node, DaemonError> {
        let nodes = self.nodes.clone();
        let id = self.node_id.clone();
        let hostname = self.hostname.clone();
        let node = store::blocking(move || match status {
            NodeStatus::Online => nodes.upsert(&id, &hostname, status),
            _ => nodes.set_status(&NodeKey::ByHostname(hostname), status),
        })
        .await?;
        Ok(node)
    }

    /// Starts the watcher (after an optional initial scan) when directories
    /// are configured.
    async fn start_watching(&self) -> Result<Option<QueueWatcher>, DaemonError> {
        let watch = &self.config.watch;
        if watch.directories.is_empty() {
            tracing::info!("No watch directories configured, processing shared queue only");
            return Ok(None);
        }

        let filter = FileFilter::new(
            &watch.include_patterns,
            &watch.exclude_patterns,
            watch.case_sensitive,
        )?;

        if watch.initial_scan {
            let dirs = watch.directories.clone();
            let scan_filter = filter.clone();
            let jobs = self.jobs.clone();
            let reprocess = watch.reprocess;
            tokio::task::spawn_blocking(move || initial_scan(&dirs, &scan_filter, &jobs, reprocess))
                .await
                .map_err(|e| DaemonError::Task(e.to_string()))??;
        }

        let watcher = QueueWatcher::start(
            &watch.directories,
            filter,
            self.jobs.clone(),
            watch.reprocess,
        )?;
        tracing::info!(dirs = ?watcher.dirs(), "Watching for new media files");
        Ok(Some(watcher))
    }

    /// Run the daemon until `shutdown` is cancelled
    ///
    /// Registers this node ONLINE, starts the watcher, the control API and the
    /// processing loop. On shutdown the active run is soft-interrupted so its
    /// job returns to the queue, the loop is stopped, the node is marked
    /// OFFLINE and the watcher and API are stopped.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let node = self.set_node_status(NodeStatus::Online).await?;
        tracing::info!(
            node = %node.id,
            hostname = %node.hostname,
            cpu_threads = node.cpu_threads,
            cpu = %node.cpu_details,
            "Node online"
        );

        let watcher = self.start_watching().await?;

        let server_token = shutdown.child_token();
        let server = if self.config.server.enabled {
            let state = self.app_state();
            let bind = self.config.server.bind.clone();
            let token = server_token.clone();
            Some(tokio::spawn(async move { run_server(state, &bind, token).await }))
        } else {
            None
        };

        let orchestrator = self.orchestrator();
        let mut processing = tokio::spawn(async move { orchestrator.run().await });

        let processing_result = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = &mut processing => Some(result),
        };

        tracing::info!("Shutting down");
        self.orchestrator.request_stop();
        match self.orchestrator.interrupt(true) {
            Ok(()) => tracing::info!("Interrupted running media processing"),
            Err(OrchestratorError::NotRunning) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to interrupt media processing"),
        }
        self.orchestrator.stop().await;

        let processing_result = match processing_result {
            Some(result) => result,
            None => processing.await,
        };

        if let Err(e) = self.set_node_status(NodeStatus::Offline).await {
            tracing::error!(error = %e, "Failed to mark node offline");
        }

        if let Some(watcher) = watcher {
            watcher.stop();
        }

        server_token.cancel();
        if let Some(server) = server {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Control API failed"),
                Err(e) => tracing::error!(error = %e, "Control API task failed"),
            }
        }

        processing_result.map_err(|e| DaemonError::Task(e.to_string()))??;
        tracing::info!(hostname = %self.hostname, "Node offline");
        Ok(())
    }
}
