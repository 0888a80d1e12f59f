use super::{Database, UnknownVariant, from_millis, to_millis};
use crate::truncate_chars;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Stored error messages are cut to this many characters.
pub const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(UnknownVariant {
                kind: "job status",
                value: other.to_string(),
            }),
        }
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

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: i64,
    pub project_id: i64,
    pub scene_id: i64,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    /// Set on every claim. Only the holder of the latest token may heartbeat or finish the job.
    pub claim_token: Option<i64>,
}

impl Job {
    /// The claim this row was handed out under, if it was ever claimed.
    pub fn claim(&self) -> Option<Claim> {
        self.claim_token.map(|token| Claim {
            job_id: self.id,
            token,
        })
    }
}

/// Proof of ownership of a `processing` job.
///
/// Tokens grow monotonically across the whole table, so a job that was swept and claimed again
/// never hands out a token its previous holder still has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub job_id: i64,
    pub token: i64,
}

const JOB_COLUMNS: &str = "id, project_id, scene_id, status, error_message, created_at, updated_at, processing_started_at, claim_token";

const NEXT_TOKEN: &str = "(SELECT COALESCE(MAX(claim_token), 0) + 1 FROM jobs)";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        project_id: row.get(1)?,
        scene_id: row.get(2)?,
        status: row.get(3)?,
        error_message: row.get(4)?,
        created_at: from_millis(row.get(5)?),
        updated_at: from_millis(row.get(6)?),
        processing_started_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        claim_token: row.get(8)?,
    })
}

fn load_job(conn: &Connection, job_id: i64) -> Result<Option<Job>> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [job_id],
            job_from_row,
        )
        .optional()?;
    Ok(job)
}

impl Database {
    pub fn create_job(&self, project_id: i64, scene_id: i64) -> Result<i64> {
        self.create_job_at(project_id, scene_id, Utc::now())
    }

    pub fn create_job_at(&self, project_id: i64, scene_id: i64, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn();
        let ms = to_millis(now);
        conn.execute(
            "INSERT INTO jobs (project_id, scene_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![project_id, scene_id, JobStatus::Pending, ms],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn claim_next_pending(&self) -> Result<Option<Job>> {
        self.claim_next_pending_at(Utc::now())
    }

    /// Moves the oldest pending job to `processing` under a fresh claim token and returns it.
    ///
    /// Jobs whose scene already has a job in flight are passed over. The UPDATE re-checks the
    /// status, so when another worker wins the race the next candidate is tried.
    pub fn claim_next_pending_at(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let conn = self.conn();
        let ms = to_millis(now);
        loop {
            let candidate: Option<i64> = conn
                .query_row(
                    "SELECT id FROM jobs
                     WHERE status = 'pending'
                       AND scene_id NOT IN (SELECT scene_id FROM jobs WHERE status = 'processing')
                     ORDER BY created_at, id
                     LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(job_id) = candidate else {
                return Ok(None);
            };

            let claimed = conn.execute(
                &format!(
                    "UPDATE jobs
                     SET status = 'processing', processing_started_at = ?1, updated_at = ?1,
                         claim_token = {NEXT_TOKEN}
                     WHERE id = ?2
                       AND status = 'pending'
                       AND scene_id NOT IN (SELECT scene_id FROM jobs WHERE status = 'processing')"
                ),
                params![ms, job_id],
            )?;

            if claimed == 1 {
                return load_job(&conn, job_id);
            }
        }
    }

    pub fn claim_scene(&self, project_id: i64, scene_id: i64) -> Result<Option<Job>> {
        self.claim_scene_at(project_id, scene_id, Utc::now())
    }

    /// Inserts a job for `scene_id` that is already `processing` under a fresh claim.
    ///
    /// Returns `None` without inserting anything when the scene has a job in flight. Used by
    /// callers that synthesize a scene directly instead of waiting for a worker.
    pub fn claim_scene_at(
        &self,
        project_id: i64,
        scene_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let conn = self.conn();
        let ms = to_millis(now);
        let inserted = conn.execute(
            &format!(
                "INSERT INTO jobs
                    (project_id, scene_id, status, created_at, updated_at,
                     processing_started_at, claim_token)
                 SELECT ?1, ?2, 'processing', ?3, ?3, ?3, {NEXT_TOKEN}
                 WHERE NOT EXISTS (
                     SELECT 1 FROM jobs WHERE scene_id = ?2 AND status = 'processing'
                 )"
            ),
            params![project_id, scene_id, ms],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        load_job(&conn, conn.last_insert_rowid())
    }

    /// True while `claim` is the live claim on a `processing` job.
    pub fn holds_claim(&self, claim: Claim) -> Result<bool> {
        let held = self
            .conn()
            .query_row(
                "SELECT 1 FROM jobs WHERE id = ?1 AND status = 'processing' AND claim_token = ?2",
                params![claim.job_id, claim.token],
                |_| Ok(()),
            )
            .optional()?;
        Ok(held.is_some())
    }

    /// Refreshes the liveness stamp of a job this worker holds.
    pub fn mark_processing_started_at(&self, claim: Claim, now: DateTime<Utc>) -> Result<bool> {
        let ms = to_millis(now);
        let changed = self.conn().execute(
            "UPDATE jobs SET processing_started_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'processing' AND claim_token = ?3",
            params![ms, claim.job_id, claim.token],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_processing_started(&self, claim: Claim) -> Result<bool> {
        self.mark_processing_started_at(claim, Utc::now())
    }

    /// `processing -> completed`. False when the job was cancelled, swept or reclaimed meanwhile.
    pub fn mark_completed(&self, claim: Claim) -> Result<bool> {
        let ms = to_millis(Utc::now());
        let changed = self.conn().execute(
            "UPDATE jobs SET status = 'completed', error_message = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'processing' AND claim_token = ?3",
            params![ms, claim.job_id, claim.token],
        )?;
        Ok(changed == 1)
    }

    /// `processing -> failed` with the message cut to [`MAX_ERROR_CHARS`].
    pub fn mark_failed(&self, claim: Claim, message: &str) -> Result<bool> {
        let ms = to_millis(Utc::now());
        let message = truncate_chars(message, MAX_ERROR_CHARS);
        let changed = self.conn().execute(
            "UPDATE jobs SET status = 'failed', error_message = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'processing' AND claim_token = ?4",
            params![message, ms, claim.job_id, claim.token],
        )?;
        Ok(changed == 1)
    }

    /// `processing -> cancelled` by the holder itself, for work stopped before it finished.
    pub fn release_claim(&self, claim: Claim) -> Result<bool> {
        let ms = to_millis(Utc::now());
        let changed = self.conn().execute(
            "UPDATE jobs SET status = 'cancelled', updated_at = ?1
             WHERE id = ?2 AND status = 'processing' AND claim_token = ?3",
            params![ms, claim.job_id, claim.token],
        )?;
        Ok(changed == 1)
    }

    /// Cancels a job that has not reached a terminal state.
    pub fn mark_cancelled(&self, job_id: i64) -> Result<bool> {
        let ms = to_millis(Utc::now());
        let changed = self.conn().execute(
            "UPDATE jobs SET status = 'cancelled', updated_at = ?1
             WHERE id = ?2 AND status IN ('pending', 'processing')",
            params![ms, job_id],
        )?;
        Ok(changed == 1)
    }

    pub fn sweep_stuck(&self, threshold: Duration) -> Result<usize> {
        self.sweep_stuck_at(threshold, Utc::now())
    }

    /// Resets jobs that have been `processing` for longer than `threshold` back to `pending`.
    ///
    /// The old claim token stays on the row; it no longer matches once the job is reclaimed.
    pub fn sweep_stuck_at(&self, threshold: Duration, now: DateTime<Utc>) -> Result<usize> {
        let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        let cutoff = to_millis(now).saturating_sub(threshold_ms);
        let recovered = self.conn().execute(
            "UPDATE jobs
             SET status = 'pending', processing_started_at = NULL, updated_at = ?1
             WHERE status = 'processing' AND processing_started_at < ?2",
            params![to_millis(now), cutoff],
        )?;
        Ok(recovered)
    }

    pub fn get_status(&self, job_id: i64) -> Result<Option<JobStatus>> {
        let status = self
            .conn()
            .query_row("SELECT status FROM jobs WHERE id = ?1", [job_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(status)
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        load_job(&self.conn(), job_id)
    }

    pub fn list_jobs(&self, project_id: Option<i64>) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR project_id = ?1)
             ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([project_id], job_from_row)?;
        let mut jobs = Vec::new();
        for job in rows {
            jobs.push(job?);
        }
        Ok(jobs)
    }
}
