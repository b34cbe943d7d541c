//! autotranscode daemon
//!
//! Shared media-processing queue: nodes watch directories, queue new media
//! files in a common SQLite store and run a transcoding command on them one
//! at a time, honouring suspension and quiet periods.

pub mod api;
pub mod daemon;
pub mod orchestrator;
pub mod quiet;
pub mod runner;
pub mod shutdown;
pub mod startup;
pub mod stats;
pub mod store;
pub mod watch;

pub use api::{create_router, run_server, AppState, ServerError};
pub use autotranscode_config as config;
pub use autotranscode_config::Config;
pub use daemon::{local_hostname, Daemon, DaemonError};
pub use orchestrator::{LocalStatus, Orchestrator, OrchestratorError, OrchestratorSettings};
pub use quiet::{parse_periods, QuietAction, QuietPeriod, QuietPeriodError, QuietSchedule};
pub use runner::{CommandRunner, CommandSpec, ExitOutcome, RunControl, RunVerdict, RunnerError};
pub use shutdown::install_shutdown_handler;
pub use startup::{run_startup_checks, StartupError};
pub use stats::{daily_load, queue_stats, QueueStats};
pub use store::{
    Database, InsertOutcome, Job, JobKey, JobStatus, JobStore, Node, NodeKey, NodeMetadata,
    NodeRegistry, NodeStatus, QueueCounts, StoreError,
};
pub use watch::{initial_scan, FileFilter, QueueWatcher, WatchError};
