//! CLI entry point for autotranscode
//!
//! Parses command line arguments, then either runs the daemon or performs a
//! one-off queue maintenance command against the shared store.

use autotranscode::{
    install_shutdown_handler, local_hostname, Config, Daemon, Job, JobKey, StoreError,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// autotranscode - shared media transcoding queue
#[derive(Parser, Debug)]
#[command(name = "autotranscode")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Directory holding the shared queue store, overrides queue.queue_dir
    #[arg(short, long, global = true)]
    queue_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch directories, process queued files and serve the control API
    Run(RunArgs),
    /// Print the queue and exit
    List,
    /// Move FAILED or PROCESSED jobs back to WAITING
    Retry {
        /// Job id or source path
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        job: Option<String>,

        /// Retry every failed job
        #[arg(long)]
        all: bool,
    },
}

#[derive(ClapArgs, Debug, Default)]
struct RunArgs {
    /// Directory to watch, replaces watch.directories (repeatable)
    #[arg(short, long = "watch")]
    watch: Vec<PathBuf>,

    /// Skip startup checks. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(args: &Args) -> Result<Config, String> {
    let mut config = Config::load_or_default(&args.config)
        .map_err(|e| format!("Failed to load {}: {}", args.config.display(), e))?;
    if let Some(dir) = &args.queue_dir {
        config.queue.queue_dir = dir.clone();
    }
    if let Some(Command::Run(run)) = &args.command {
        if !run.watch.is_empty() {
            config.watch.directories = run.watch.clone();
        }
    }
    Ok(config)
}

async fn run(config: Config, skip_checks: bool) -> ExitCode {
    let daemon = if skip_checks {
        tracing::warn!("Skipping startup checks (--skip-checks enabled)");
        Daemon::open(config, local_hostname())
    } else {
        Daemon::with_config(config)
    };

    let daemon = match daemon {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = match install_shutdown_handler() {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        hostname = %daemon.hostname,
        queue = %daemon.config.queue.database_path().display(),
        watching = daemon.config.watch.directories.len(),
        "Daemon initialized"
    );

    match daemon.run(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Daemon error");
            ExitCode::FAILURE
        }
    }
}

fn print_job(job: &Job) {
    println!(
        "{:<10} {:<36} {}  {}",
        job.status,
        job.id,
        job.updated_at.format("%Y-%m-%d %H:%M:%S"),
        job.path.display()
    );
}

fn list(daemon: &Daemon) -> Result<(), StoreError> {
    if daemon.jobs().is_empty()? {
        println!("Queue is empty");
        return Ok(());
    }

    let jobs = daemon.jobs().list()?;
    let counts = daemon.jobs().count_by_status()?;
    for job in &jobs {
        print_job(job);
    }
    println!(
        "{} jobs: {} waiting, {} processing, {} processed, {} failed",
        counts.total(),
        counts.waiting,
        counts.processing,
        counts.processed,
        counts.failed
    );
    Ok(())
}

fn retry(daemon: &Daemon, job: Option<String>, all: bool) -> Result<(), StoreError> {
    let store = daemon.jobs();
    if all {
        let retried = store.retry_all()?;
        println!("{} jobs moved back to waiting", retried);
        return Ok(());
    }

    let Some(job) = job else {
        return Ok(());
    };
    let key = match store.get(&JobKey::ById(job.clone()))? {
        Some(_) => JobKey::ById(job),
        None => JobKey::ByPath(PathBuf::from(job)),
    };
    let job = store.retry_one(&key)?;
    print_job(&job);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging.level);

    let command = args.command.unwrap_or(Command::Run(RunArgs::default()));
    let command = match command {
        Command::Run(run_args) => return run(config, run_args.skip_checks).await,
        other => other,
    };

    let daemon = match Daemon::open(config, local_hostname()) {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("Failed to open queue: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match command {
        Command::List => list(&daemon),
        Command::Retry { job, all } => retry(&daemon, job, all),
        Command::Run(_) => Ok(()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
