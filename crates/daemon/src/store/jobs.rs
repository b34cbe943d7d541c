//! Job store: the durable, claimable queue of media files.
//!
//! Every mutation runs inside one exclusive transaction and checks the job's
//! current status against [`JobStatus::can_transition_to`] before writing.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{Database, StoreError};

/// Processing state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Waiting,
    /// Claimed by a node; the command is running.
    Processing,
    /// Command finished successfully.
    Processed,
    /// Command failed or timed out; needs an explicit retry.
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Waiting
    }
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Waiting,
        JobStatus::Processing,
        JobStatus::Processed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Processing => "processing",
            JobStatus::Processed => "processed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Waiting, Processing)
                | (Processing, Processed)
                | (Processing, Failed)
                | (Processing, Waiting)
                | (Failed, Waiting)
                | (Processed, Waiting)
        )
    }

    /// Check if the status is terminal (processed or failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Processed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Error for an unrecognised status string.
#[derive(Debug, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// One media file's transcoding work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier (UUID).
    pub id: String,
    /// Absolute path of the source file.
    pub path: PathBuf,
    pub status: JobStatus,
    /// Where the command writes the transcoded file.
    pub output_path: PathBuf,
    /// Where the command's output is logged.
    pub log_path: PathBuf,
    /// Source size in bytes at detection time.
    pub input_size: Option<u64>,
    /// Output size in bytes, set on success.
    pub output_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Short `"id" | "path"` label used in log lines.
    pub fn identifier(&self) -> String {
        format!("\"{}\" | \"{}\"", self.id, self.path.display())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            path: PathBuf::from(row.get::<_, String>("path")?),
            status: row.get("status")?,
            output_path: PathBuf::from(row.get::<_, String>("output_path")?),
            log_path: PathBuf::from(row.get::<_, String>("log_path")?),
            input_size: row.get::<_, Option<i64>>("input_size")?.map(|v| v as u64),
            output_size: row.get::<_, Option<i64>>("output_size")?.map(|v| v as u64),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
        })
    }
}

/// Lookup key for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKey {
    ById(String),
    ByPath(PathBuf),
}

impl JobKey {
    fn clause(&self) -> &'static str {
        match self {
            JobKey::ById(_) => "id = ?1",
            JobKey::ByPath(_) => "path = ?1",
        }
    }

    fn value(&self) -> String {
        match self {
            JobKey::ById(id) => id.clone(),
            JobKey::ByPath(path) => path_text(path),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKey::ById(id) => write!(f, "job {}", id),
            JobKey::ByPath(path) => write!(f, "job for {}", path.display()),
        }
    }
}

/// Result of [`JobStore::insert_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// A new WAITING job was created.
    Inserted(Job),
    /// An existing job was reset to WAITING for reprocessing.
    Requeued(Job),
    /// A job already existed and was left as it was.
    Unchanged(Job),
}

impl InsertOutcome {
    pub fn job(&self) -> &Job {
        match self {
            InsertOutcome::Inserted(job)
            | InsertOutcome::Requeued(job)
            | InsertOutcome::Unchanged(job) => job,
        }
    }
}

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub processing: usize,
    pub processed: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.processing + self.processed + self.failed
    }
}

const JOB_COLUMNS: &str = "id, path, status, output_path, log_path, input_size, output_size, \
                           created_at, updated_at, started_at, finished_at";

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Output and log paths for a source file.
///
/// `/dir/name.ext` becomes `/dir/name_transcoded.<extension>` and
/// `/dir/name_transcoding.log`.
pub fn derive_paths(path: &Path, extension: &str) -> (PathBuf, PathBuf) {
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path.file_stem().unwrap_or_default();

    let mut output = stem.to_os_string();
    output.push("_transcoded.");
    output.push(extension);

    let mut log = stem.to_os_string();
    log.push("_transcoding.log");

    (dir.join(output), dir.join(log))
}

fn find_job(conn: &Connection, key: &JobKey) -> Result<Option<Job>, StoreError> {
    let sql = format!("SELECT {} FROM jobs WHERE {} LIMIT 1", JOB_COLUMNS, key.clause());
    Ok(conn
        .query_row(&sql, params![key.value()], Job::from_row)
        .optional()?)
}

fn require_job(conn: &Connection, key: &JobKey) -> Result<Job, StoreError> {
    find_job(conn, key)?.ok_or_else(|| StoreError::NotFound(key.to_string()))
}

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

/// Applies `next` to `job` in memory, stamping the fields the transition owns.
fn apply_transition(job: &mut Job, next: JobStatus, now: DateTime<Utc>) {
    job.status = next;
    job.updated_at = now;
    match next {
        JobStatus::Processing => {
            job.started_at = Some(now);
            job.finished_at = None;
        }
        JobStatus::Processed => {
            job.finished_at = Some(now);
            job.output_size = file_size(&job.output_path);
            if job.output_size.is_none() {
                tracing::warn!(
                    output = %job.output_path.display(),
                    "Unable to obtain transcoded file size"
                );
            }
        }
        JobStatus::Failed => {
            job.finished_at = Some(now);
        }
        JobStatus::Waiting => {
            job.started_at = None;
            job.finished_at = None;
            job.output_size = None;
        }
    }
}

fn write_state(conn: &Connection, job: &Job) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE jobs SET status = ?2, output_size = ?3, updated_at = ?4,
         started_at = ?5, finished_at = ?6 WHERE id = ?1",
        params![
            job.id,
            job.status,
            job.output_size.map(|v| v as i64),
            job.updated_at,
            job.started_at,
            job.finished_at,
        ],
    )?;
    Ok(())
}

/// Handle to the `jobs` table.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
    output_extension: String,
}

impl JobStore {
    /// Creates a store whose new jobs write `<stem>_transcoded.<output_extension>`.
    pub fn new(db: Database, output_extension: impl Into<String>) -> Self {
        Self {
            db,
            output_extension: output_extension.into(),
        }
    }

    /// Creates a WAITING job for `path` unless one already exists.
    ///
    /// With `reprocess`, an existing job that is not waiting or processing is
    /// reset to WAITING. A PROCESSING job is never touched.
    pub fn insert_if_absent(
        &self,
        id: &str,
        path: &Path,
        reprocess: bool,
    ) -> Result<InsertOutcome, StoreError> {
        let key = JobKey::ByPath(path.to_path_buf());
        self.db.exclusive(|tx| {
            if let Some(mut existing) = find_job(tx, &key)? {
                if reprocess && existing.status.is_terminal() {
                    apply_transition(&mut existing, JobStatus::Waiting, Utc::now());
                    write_state(tx, &existing)?;
                    return Ok(InsertOutcome::Requeued(existing));
                }
                return Ok(InsertOutcome::Unchanged(existing));
            }

            let now = Utc::now();
            let (output_path, log_path) = derive_paths(path, &self.output_extension);
            let input_size = file_size(path);
            if input_size.is_none() {
                tracing::warn!(path = %path.display(), "Unable to obtain source file size");
            }

            let job = Job {
                id: id.to_string(),
                path: path.to_path_buf(),
                status: JobStatus::Waiting,
                output_path,
                log_path,
                input_size,
                output_size: None,
                created_at: now,
                updated_at: now,
                started_at: None,
                finished_at: None,
            };

            tx.execute(
                "INSERT INTO jobs (id, path, status, output_path, log_path, input_size,
                 output_size, created_at, updated_at, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, NULL, NULL)",
                params![
                    job.id,
                    path_text(&job.path),
                    job.status,
                    path_text(&job.output_path),
                    path_text(&job.log_path),
                    job.input_size.map(|v| v as i64),
                    job.created_at,
                    job.updated_at,
                ],
            )?;
            Ok(InsertOutcome::Inserted(job))
        })
    }

    /// Claims one WAITING job, moving it to PROCESSING.
    ///
    /// Returns the job as it was before the claim, or `None` when nothing is
    /// waiting. Safe across processes: the select and the update share one
    /// exclusive transaction.
    pub fn claim_next_waiting(&self) -> Result<Option<Job>, StoreError> {
        self.db.exclusive(|tx| {
            let sql = format!(
                "SELECT {} FROM jobs WHERE status = ?1 ORDER BY rowid LIMIT 1",
                JOB_COLUMNS
            );
            let Some(snapshot) = tx
                .query_row(&sql, params![JobStatus::Waiting], Job::from_row)
                .optional()?
            else {
                return Ok(None);
            };

            let mut claimed = snapshot.clone();
            apply_transition(&mut claimed, JobStatus::Processing, Utc::now());
            write_state(tx, &claimed)?;
            Ok(Some(snapshot))
        })
    }

    /// PROCESSING → PROCESSED, recording the output size.
    pub fn complete(&self, job: &Job) -> Result<Job, StoreError> {
        self.transition(&JobKey::ById(job.id.clone()), JobStatus::Processing, JobStatus::Processed)
    }

    /// PROCESSING → FAILED.
    pub fn fail(&self, job: &Job) -> Result<Job, StoreError> {
        self.transition(&JobKey::ById(job.id.clone()), JobStatus::Processing, JobStatus::Failed)
    }

    /// PROCESSING → WAITING, used after a soft interrupt.
    pub fn requeue(&self, job: &Job) -> Result<Job, StoreError> {
        self.transition(&JobKey::ById(job.id.clone()), JobStatus::Processing, JobStatus::Waiting)
    }

    fn transition(
        &self,
        key: &JobKey,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<Job, StoreError> {
        self.db.exclusive(|tx| {
            let mut job = require_job(tx, key)?;
            if job.status != expected || !job.status.can_transition_to(next) {
                return Err(StoreError::InvalidState(format!(
                    "{} is {}, cannot move to {}",
                    key, job.status, next
                )));
            }
            apply_transition(&mut job, next, Utc::now());
            write_state(tx, &job)?;
            Ok(job)
        })
    }

    /// Resets one FAILED or PROCESSED job to WAITING.
    ///
    /// A WAITING job is returned unchanged; a PROCESSING job is rejected.
    pub fn retry_one(&self, key: &JobKey) -> Result<Job, StoreError> {
        self.db.exclusive(|tx| {
            let mut job = require_job(tx, key)?;
            match job.status {
                JobStatus::Waiting => Ok(job),
                JobStatus::Processing => Err(StoreError::InvalidState(format!(
                    "{} is processing",
                    key
                ))),
                JobStatus::Failed | JobStatus::Processed => {
                    apply_transition(&mut job, JobStatus::Waiting, Utc::now());
                    write_state(tx, &job)?;
                    Ok(job)
                }
            }
        })
    }

    /// Resets every FAILED job to WAITING, returning how many were reset.
    pub fn retry_all(&self) -> Result<usize, StoreError> {
        self.db.exclusive(|tx| {
            let count = tx.execute(
                "UPDATE jobs SET status = ?1, started_at = NULL, finished_at = NULL,
                 output_size = NULL, updated_at = ?2 WHERE status = ?3",
                params![JobStatus::Waiting, Utc::now(), JobStatus::Failed],
            )?;
            Ok(count)
        })
    }

    /// Deletes a job that is not currently processing.
    pub fn delete(&self, key: &JobKey) -> Result<Job, StoreError> {
        self.db.exclusive(|tx| {
            let job = require_job(tx, key)?;
            if job.status == JobStatus::Processing {
                return Err(StoreError::InvalidState(format!(
                    "can't delete {} while it's processing",
                    key
                )));
            }
            tx.execute("DELETE FROM jobs WHERE id = ?1", params![job.id])?;
            Ok(job)
        })
    }

    pub fn get(&self, key: &JobKey) -> Result<Option<Job>, StoreError> {
        self.db.with_conn(|conn| find_job(conn, key))
    }

    /// All jobs, most recently updated first.
    pub fn list(&self) -> Result<Vec<Job>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM jobs ORDER BY updated_at DESC, rowid DESC",
                JOB_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let jobs = stmt
                .query_map([], Job::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
    }

    /// Total number of jobs in the queue, in any status.
    pub fn len(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
            Ok(count as usize)
        })
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn count_by_status(&self) -> Result<QueueCounts, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, JobStatus>(0)?, row.get::<_, i64>(1)? as usize))
            })?;

            let mut counts = QueueCounts::default();
            for row in rows {
                let (status, count) = row?;
                match status {
                    JobStatus::Waiting => counts.waiting = count,
                    JobStatus::Processing => counts.processing = count,
                    JobStatus::Processed => counts.processed = count,
                    JobStatus::Failed => counts.failed = count,
                }
            }
            Ok(counts)
        })
    }
}
