//! Watch module for discovering media files in watched directories.
//!
//! New files are picked up from filesystem events through `notify`; an
//! optional initial scan walks the directories once at startup. Both feed
//! [`JobStore::insert_if_absent`].

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::store::{InsertOutcome, JobKey, JobStatus, JobStore, StoreError};

/// Stem suffix of files this daemon writes; never queued.
const OUTPUT_SUFFIX: &str = "_transcoded";

/// Error type for directory watching
#[derive(Debug, Error)]
pub enum WatchError {
    /// A configured glob pattern does not parse
    #[error("Invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// The filesystem watcher could not be created or attached
    #[error("Watcher error: {0}")]
    Notify(#[from] notify::Error),

    /// A watched directory could not be resolved
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Queue storage failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Include/exclude glob filter for candidate files.
#[derive(Debug, Clone)]
pub struct FileFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    options: MatchOptions,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, WatchError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|source| WatchError::Pattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

impl FileFilter {
    pub fn new(
        include: &[String],
        exclude: &[String],
        case_sensitive: bool,
    ) -> Result<Self, WatchError> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
            options: MatchOptions {
                case_sensitive,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            },
        })
    }

    fn any_match(&self, patterns: &[Pattern], path: &Path) -> bool {
        let name = path.file_name().map(Path::new);
        patterns.iter().any(|pattern| {
            pattern.matches_path_with(path, self.options)
                || name.is_some_and(|name| pattern.matches_path_with(name, self.options))
        })
    }

    /// Whether `path` should be queued.
    ///
    /// A file is accepted when an include pattern matches its name or full
    /// path, no exclude pattern does, and it is not one of our own outputs.
    pub fn matches(&self, path: &Path) -> bool {
        if is_output_file(path) {
            return false;
        }
        self.any_match(&self.include, path) && !self.any_match(&self.exclude, path)
    }
}

fn is_output_file(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem.ends_with(OUTPUT_SUFFIX))
}

/// Queues `path`, logging the outcome. Returns true when the file ended up
/// waiting because of this call.
pub fn enqueue(store: &JobStore, path: &Path, reprocess: bool) -> bool {
    let id = Uuid::new_v4().to_string();
    match store.insert_if_absent(&id, path, reprocess) {
        Ok(InsertOutcome::Inserted(job)) => {
            tracing::info!(job = %job.identifier(), "File added to processing queue");
            true
        }
        Ok(InsertOutcome::Requeued(job)) => {
            tracing::info!(job = %job.identifier(), "File queued for reprocessing");
            true
        }
        Ok(InsertOutcome::Unchanged(job)) => {
            tracing::debug!(job = %job.identifier(), status = %job.status, "File already queued");
            false
        }
        Err(e) => {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Failed to add file to processing queue"
            );
            false
        }
    }
}

/// Walks `dirs` and queues every matching file that is not already FAILED.
///
/// Hidden directories below each root are skipped.
///
/// # Returns
/// Number of files that were queued or requeued
pub fn initial_scan(
    dirs: &[PathBuf],
    filter: &FileFilter,
    store: &JobStore,
    reprocess: bool,
) -> Result<usize, WatchError> {
    let mut queued = 0;

    for root in dirs {
        // Same form as the paths reported by the watcher.
        let root = root.canonicalize().map_err(|source| WatchError::Io {
            path: root.clone(),
            source,
        })?;
        let walker = WalkDir::new(&root).into_iter().filter_entry(|entry| {
            !(entry.depth() > 0
                && entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with('.')))
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !filter.matches(entry.path()) {
                continue;
            }

            let path = entry.path();
            let existing = store.get(&JobKey::ByPath(path.to_path_buf()))?;
            if existing.is_some_and(|job| job.status == JobStatus::Failed) {
                continue;
            }
            if enqueue(store, path, reprocess) {
                queued += 1;
            }
        }
    }

    tracing::info!(queued, "Initial processing scan finished");
    Ok(queued)
}

/// Recursive filesystem watcher feeding the job store.
///
/// Watching stops when the value is dropped.
pub struct QueueWatcher {
    _watcher: RecommendedWatcher,
    dirs: Vec<PathBuf>,
}

impl QueueWatcher {
    /// Starts watching `dirs` recursively.
    ///
    /// Every created regular file that passes `filter` is queued with
    /// [`JobStore::insert_if_absent`].
    pub fn start(
        dirs: &[PathBuf],
        filter: FileFilter,
        store: JobStore,
        reprocess: bool,
    ) -> Result<Self, WatchError> {
        let dirs = dirs
            .iter()
            .map(|dir| {
                dir.canonicalize().map_err(|source| WatchError::Io {
                    path: dir.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_)) {
                    return;
                }
                for path in &event.paths {
                    if path.is_file() && filter.matches(path) {
                        enqueue(&store, path, reprocess);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Watch error"),
        })?;

        for dir in &dirs {
            watcher.watch(dir, RecursiveMode::Recursive)?;
            tracing::info!(dir = %dir.display(), "Watching directory");
        }

        Ok(Self {
            _watcher: watcher,
            dirs,
        })
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Stops watching.
    pub fn stop(self) {
        tracing::info!("Directory watcher stopped");
    }
}
