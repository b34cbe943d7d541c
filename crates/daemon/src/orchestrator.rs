//! Processing orchestrator module for autotranscode
//!
//! Claims waiting jobs one at a time, runs the configured command for each and
//! records the verdict. While a run is alive the orchestrator follows this
//! node's registry status and quiet periods, suspending and resuming the run.

use std::ffi::OsString;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::ProcessingConfig;
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::quiet::{QuietAction, QuietSchedule};
use crate::runner::{CommandRunner, CommandSpec, ExitOutcome, RunControl, RunVerdict, RunnerError};
use crate::store::{self, Job, JobKey, JobStore, NodeKey, NodeRegistry, NodeStatus, StoreError};

/// First wait before retrying a failed outcome commit; doubles up to
/// [`COMMIT_RETRY_MAX`].
const COMMIT_RETRY_INITIAL: Duration = Duration::from_millis(500);
const COMMIT_RETRY_MAX: Duration = Duration::from_secs(30);
/// Commit attempts allowed once shutdown has been requested.
const SHUTDOWN_COMMIT_ATTEMPTS: u32 = 3;

/// Error type for orchestrator operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No command is running on this node
    #[error("No running media processing found")]
    NotRunning,

    /// The active run rejected a control request
    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    /// Queue storage failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Knobs for the processing loop.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Shell command run for each job
    pub command: String,
    /// Wall-clock limit per run
    pub timeout: Duration,
    /// Remove the source file after a successful run
    pub delete_source: bool,
    /// Sleep between empty polls
    pub poll_interval: Duration,
    /// Period of the status and quiet-period checks during a run
    pub monitor_interval: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &ProcessingConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            timeout: cfg.timeout(),
            delete_source: cfg.delete_source,
            poll_interval: cfg.poll_interval(),
            monitor_interval: cfg.monitor_interval(),
        }
    }
}

/// Snapshot of local processing state.
#[derive(Debug, Clone, Serialize)]
pub struct LocalStatus {
    pub hostname: String,
    pub running: bool,
    pub suspended: bool,
    pub exiting: bool,
    pub job: Option<Job>,
}

struct ActiveRun {
    job: Job,
    control: RunControl,
    /// Suspended because the registry marked this node SUSPENDED.
    node_suspended: bool,
}

/// Clears the busy flag when a processing attempt ends, however it ends.
struct BusyGuard<'a>(&'a watch::Sender<bool>);

impl<'a> BusyGuard<'a> {
    fn enter(busy: &'a watch::Sender<bool>) -> Self {
        busy.send_replace(true);
        Self(busy)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

/// Single-worker processing loop for one node.
pub struct Orchestrator {
    jobs: JobStore,
    nodes: NodeRegistry,
    hostname: String,
    settings: OrchestratorSettings,
    active: Mutex<Option<ActiveRun>>,
    schedule: Mutex<QuietSchedule>,
    shutdown: CancellationToken,
    busy: watch::Sender<bool>,
}

impl Orchestrator {
    /// # Arguments
    /// * `jobs` - Shared job store
    /// * `nodes` - Shared node registry
    /// * `hostname` - This node's registry hostname
    /// * `settings` - Command, timeout and loop intervals
    pub fn new(
        jobs: JobStore,
        nodes: NodeRegistry,
        hostname: impl Into<String>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            jobs,
            nodes,
            hostname: hostname.into(),
            settings,
            active: Mutex::new(None),
            schedule: Mutex::new(QuietSchedule::new()),
            shutdown: CancellationToken::new(),
            busy,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn node_key(&self) -> NodeKey {
        NodeKey::ByHostname(self.hostname.clone())
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self) -> Result<RunControl, OrchestratorError> {
        self.active()
            .as_ref()
            .map(|run| run.control.clone())
            .ok_or(OrchestratorError::NotRunning)
    }

    /// Processes jobs until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> Result<(), OrchestratorError> {
        tracing::info!(hostname = %self.hostname, "Media processing started");

        while !self.shutdown.is_cancelled() {
            let processed = match self.process_next().await {
                Ok(processed) => processed,
                Err(e) => {
                    tracing::error!(error = %e, "Media processing attempt failed");
                    false
                }
            };

            if !processed {
                tokio::select! {
                    _ = sleep(self.settings.poll_interval) => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }
        }

        tracing::info!(hostname = %self.hostname, "Media processing stopped");
        Ok(())
    }

    /// Claims and processes one job.
    ///
    /// # Returns
    /// * `Ok(true)` - A job was claimed and its outcome recorded
    /// * `Ok(false)` - Nothing was waiting, or shutdown was requested
    pub async fn process_next(&self) -> Result<bool, OrchestratorError> {
        let _busy = BusyGuard::enter(&self.busy);
        if self.shutdown.is_cancelled() {
            return Ok(false);
        }

        let jobs = self.jobs.clone();
        let claimed = store::blocking(move || {
            let Some(snapshot) = jobs.claim_next_waiting()? else {
                return Ok(None);
            };
            let current = jobs.get(&JobKey::ById(snapshot.id.clone()))?;
            Ok(Some(current.unwrap_or(snapshot)))
        })
        .await?;

        let Some(job) = claimed else {
            return Ok(false);
        };

        tracing::info!(job = %job.identifier(), "Processing media file");

        let spec = CommandSpec {
            command: self.settings.command.clone(),
            env: command_env(&job),
            timeout: self.settings.timeout,
            log_path: job.log_path.clone(),
        };

        let runner = match CommandRunner::spawn(spec).await {
            Ok(runner) => runner,
            Err(e) => {
                tracing::error!(job = %job.identifier(), error = %e, "Failed to launch command");
                self.record_failure(&job).await?;
                return Ok(true);
            }
        };

        self.start_run(ActiveRun {
            job: job.clone(),
            control: runner.control(),
            node_suspended: false,
        });

        let outcome = self.monitor(runner).await;
        *self.active() = None;

        match outcome {
            Ok(outcome) => self.finish(&job, outcome).await?,
            Err(e) => {
                tracing::error!(job = %job.identifier(), error = %e, "Lost track of command");
                self.record_failure(&job).await?;
            }
        }
        Ok(true)
    }

    /// Publishes `run` as the active run.
    ///
    /// A shutdown requested while the job was being claimed found nothing to
    /// interrupt, so the run is soft-interrupted here instead.
    fn start_run(&self, run: ActiveRun) {
        let mut active = self.active();
        if self.shutdown.is_cancelled() {
            match run.control.interrupt(true) {
                Ok(()) => {
                    tracing::info!(job = %run.job.identifier(), "Shutting down, run interrupted")
                }
                Err(e) => tracing::warn!(error = %e, "Failed to interrupt run during shutdown"),
            }
        }
        *active = Some(run);
    }

    /// Waits for the run, checking node status and quiet periods on every
    /// monitor interval.
    async fn monitor(&self, runner: CommandRunner) -> Result<ExitOutcome, RunnerError> {
        let period = self.settings.monitor_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let wait = runner.wait();
        tokio::pin!(wait);

        loop {
            tokio::select! {
                outcome = &mut wait => return outcome,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Local::now().naive_local()).await {
                        tracing::warn!(error = %e, "Monitor check failed");
                    }
                }
            }
        }
    }

    async fn finish(&self, job: &Job, outcome: ExitOutcome) -> Result<(), OrchestratorError> {
        match outcome.classify() {
            RunVerdict::Success => {
                self.commit(job, JobStore::complete).await?;

                remove_file(&job.log_path, "log").await;
                if self.settings.delete_source {
                    remove_file(&job.path, "source").await;
                }
                tracing::info!(job = %job.identifier(), "Media file processed");
            }
            RunVerdict::Interrupted => {
                self.commit(job, JobStore::requeue).await?;
                tracing::info!(
                    job = %job.identifier(),
                    "Media processing interrupted, job requeued"
                );
            }
            RunVerdict::TimedOut | RunVerdict::Failed => {
                self.record_failure(job).await?;
                tracing::error!(
                    job = %job.id,
                    log = %job.log_path.display(),
                    exit_code = ?outcome.exit_code,
                    timed_out = outcome.timed_out,
                    "Failed to process media file, see log for details"
                );
            }
        }
        Ok(())
    }

    async fn record_failure(&self, job: &Job) -> Result<(), OrchestratorError> {
        self.commit(job, JobStore::fail).await?;
        Ok(())
    }

    /// Applies the terminal transition `op` to `job`, retrying storage
    /// failures with backoff.
    ///
    /// Retries continue until the commit succeeds. Once shutdown has been
    /// requested only [`SHUTDOWN_COMMIT_ATTEMPTS`] further attempts are made.
    /// `NotFound` and `InvalidState` are returned at once.
    async fn commit<F>(&self, job: &Job, op: F) -> Result<Job, StoreError>
    where
        F: Fn(&JobStore, &Job) -> Result<Job, StoreError> + Copy + Send + 'static,
    {
        let mut delay = COMMIT_RETRY_INITIAL;
        let mut attempts_after_stop = 0;

        loop {
            let jobs = self.jobs.clone();
            let target = job.clone();
            let err = match store::blocking(move || op(&jobs, &target)).await {
                Ok(updated) => return Ok(updated),
                Err(e @ (StoreError::NotFound(_) | StoreError::InvalidState(_))) => return Err(e),
                Err(e) => e,
            };

            if self.shutdown.is_cancelled() {
                attempts_after_stop += 1;
                if attempts_after_stop >= SHUTDOWN_COMMIT_ATTEMPTS {
                    tracing::error!(
                        job = %job.id,
                        log = %job.log_path.display(),
                        error = %err,
                        "Giving up recording job outcome during shutdown"
                    );
                    return Err(err);
                }
            }

            tracing::error!(
                job = %job.id,
                log = %job.log_path.display(),
                error = %err,
                retry_in = ?delay,
                "Failed to record job outcome, retrying"
            );
            sleep(delay).await;
            delay = (delay * 2).min(COMMIT_RETRY_MAX);
        }
    }

    /// One monitor check at local wall-clock time `now`.
    ///
    /// Follows the registry status of this node, then rebuilds the quiet
    /// schedule if the node's periods changed and applies every due action.
    pub async fn tick(&self, now: NaiveDateTime) -> Result<(), OrchestratorError> {
        let nodes = self.nodes.clone();
        let key = self.node_key();
        let Some(node) = store::blocking(move || nodes.get(&key)).await? else {
            tracing::debug!(hostname = %self.hostname, "Node not registered, skipping checks");
            self.schedule
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            return Ok(());
        };

        self.follow_node_status(node.status);

        let actions = {
            let mut schedule = self.schedule.lock().unwrap_or_else(PoisonError::into_inner);
            if schedule.reconcile(&node.quiet_periods, now) {
                tracing::debug!(periods = ?node.quiet_periods, "Quiet periods rescheduled");
            }
            schedule.due(now)
        };

        for action in actions {
            self.apply_quiet_action(action);
        }
        Ok(())
    }

    fn follow_node_status(&self, status: NodeStatus) {
        let mut active = self.active();
        let Some(run) = active.as_mut() else {
            return;
        };

        match status {
            NodeStatus::Suspended if !run.node_suspended => {
                match run.control.suspend() {
                    Ok(()) => tracing::info!(
                        job = %run.job.identifier(),
                        "Node suspended, media processing suspended"
                    ),
                    Err(RunnerError::InvalidState(_)) => {}
                    Err(e) => tracing::warn!(error = %e, "Failed to suspend media processing"),
                }
                run.node_suspended = true;
            }
            NodeStatus::Online if run.node_suspended => {
                match run.control.resume() {
                    Ok(()) => tracing::info!(
                        job = %run.job.identifier(),
                        "Node online, media processing resumed"
                    ),
                    Err(RunnerError::InvalidState(_)) => {}
                    Err(e) => tracing::warn!(error = %e, "Failed to resume media processing"),
                }
                run.node_suspended = false;
            }
            _ => {}
        }
    }

    fn apply_quiet_action(&self, action: QuietAction) {
        let active = self.active();
        let Some(run) = active.as_ref() else {
            tracing::debug!(?action, "Quiet period reached with no running media processing");
            return;
        };

        let result = match action {
            QuietAction::Suspend => run.control.suspend(),
            QuietAction::Resume => run.control.resume(),
        };
        match result {
            Ok(()) => {
                tracing::info!(?action, job = %run.job.identifier(), "Quiet period action applied")
            }
            Err(e) => tracing::warn!(?action, error = %e, "Quiet period action skipped"),
        }
    }

    /// Requests shutdown without waiting. Wakes an idle poll.
    pub fn request_stop(&self) {
        self.shutdown.cancel();
    }

    /// Requests shutdown and waits until no run is active.
    ///
    /// A running command is left to finish; interrupt it first to stop sooner.
    pub async fn stop(&self) {
        self.request_stop();
        let mut busy = self.busy.subscribe();
        // The sender lives in self, so this only ends once busy is false.
        let _ = busy.wait_for(|busy| !*busy).await;
    }

    pub fn is_exiting(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Interrupts the active run. See [`RunControl::interrupt`].
    pub fn interrupt(&self, soft: bool) -> Result<(), OrchestratorError> {
        self.control()?.interrupt(soft).map_err(runner_error)
    }

    pub fn suspend(&self) -> Result<(), OrchestratorError> {
        self.control()?.suspend().map_err(runner_error)?;
        tracing::info!("Media processing is suspended");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), OrchestratorError> {
        self.control()?.resume().map_err(runner_error)?;
        tracing::info!("Media processing is resumed");
        Ok(())
    }

    /// The job being processed, if any.
    pub fn current_job(&self) -> Option<Job> {
        self.active().as_ref().map(|run| run.job.clone())
    }

    pub fn status(&self) -> LocalStatus {
        let active = self.active();
        LocalStatus {
            hostname: self.hostname.clone(),
            running: active.is_some(),
            suspended: active.as_ref().is_some_and(|run| run.control.is_suspended()),
            exiting: self.is_exiting(),
            job: active.as_ref().map(|run| run.job.clone()),
        }
    }
}

fn runner_error(e: RunnerError) -> OrchestratorError {
    match e {
        RunnerError::NotRunning => OrchestratorError::NotRunning,
        other => OrchestratorError::Runner(other),
    }
}

async fn remove_file(path: &Path, what: &str) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed {} file", what),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove {} file", what)
        }
    }
}

/// Environment passed to the command for `job`.
pub fn command_env(job: &Job) -> Vec<(String, OsString)> {
    vec![
        ("INPUT_FILE".to_string(), job.path.clone().into_os_string()),
        ("OUTPUT_FILE".to_string(), job.output_path.clone().into_os_string()),
    ]
}
