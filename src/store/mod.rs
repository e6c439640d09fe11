//! Durable job store backed by PostgreSQL.
//!
//! The authoritative record of every job: lifecycle state, command
//! text, retry counters, scheduling metadata, captured output, and an
//! append-only execution history. Operations surface persistence
//! errors to the caller; retry policy lives with the caller.

pub mod job;

pub use job::{Job, JobStatus};

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::{Result, SchedulerError};

#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    /// Open a connection pool and ensure the schema exists.
    pub async fn connect(config: &Config) -> Result<Self> {
        let mut opts = PgPoolOptions::new();
        if let Some(n) = config.pg_max_conns {
            opts = opts.max_connections(n);
        }
        if let Some(n) = config.pg_min_conns {
            opts = opts.min_connections(n);
        }
        if let Some(lifetime) = config.pg_max_conn_lifetime {
            opts = opts.max_lifetime(lifetime);
        }

        let pool = opts.connect(&config.database_url).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Idempotent schema setup: guarded table creation plus additive
    /// column migrations.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT,
                args JSONB,
                command TEXT,
                execute_at TIMESTAMPTZ,
                status TEXT NOT NULL CHECK (status IN ('PENDING', 'RUNNING', 'SUCCEEDED', 'FAILED')),
                retries INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 0,
                output TEXT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_history (
                id BIGSERIAL PRIMARY KEY,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TIMESTAMPTZ,
                end_time TIMESTAMPTZ,
                result TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for migration in [
            "ALTER TABLE tasks ADD COLUMN IF NOT EXISTS max_retries INTEGER NOT NULL DEFAULT 3",
            "ALTER TABLE tasks ADD COLUMN IF NOT EXISTS cron_expr TEXT",
            "ALTER TABLE tasks ADD COLUMN IF NOT EXISTS next_run_at TIMESTAMPTZ",
        ] {
            sqlx::query(migration).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Insert a new PENDING job row. A duplicate id maps to Conflict.
    pub async fn create_job(&self, id: &str, command: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO tasks (id, name, args, command, execute_at, status, retries, priority, output, created_at, updated_at)
            VALUES ($1, 'shell', NULL, $2, NULL, 'PENDING', 0, 0, NULL, $3, $3)
            "#,
        )
        .bind(id)
        .bind(command)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                SchedulerError::Conflict(id.to_string())
            }
            _ => SchedulerError::Database(e),
        })?;
        Ok(())
    }

    /// Update a job's status and output, and append a history row.
    /// The history insert is best-effort: a failure there is logged and
    /// never fails the status update.
    pub async fn update_status(&self, id: &str, status: JobStatus, output: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE tasks SET status = $1, output = $2, updated_at = $3 WHERE id = $4")
            .bind(status)
            .bind(nullable(output))
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;

        let stamp = Utc::now();
        let (start_time, end_time) = match status {
            JobStatus::Running => (Some(stamp), None),
            JobStatus::Succeeded | JobStatus::Failed => (None, Some(stamp)),
            JobStatus::Pending => (None, None),
        };
        if let Err(e) = sqlx::query(
            "INSERT INTO task_history (task_id, status, start_time, end_time, result) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(status)
        .bind(start_time)
        .bind(end_time)
        .bind(nullable(output))
        .execute(&self.pool)
        .await
        {
            tracing::warn!(job_id = id, error = %e, "failed to append history row");
        }

        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT id, status, COALESCE(command, '') AS command, output,
                   created_at, updated_at, retries, max_retries, cron_expr, next_run_at
            FROM tasks WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    /// Atomically bump the retry counter, returning the new count
    /// together with the job's retry budget.
    pub async fn increment_retry(&self, id: &str) -> Result<(i32, i32)> {
        let now = Utc::now().timestamp();
        let counters: (i32, i32) = sqlx::query_as(
            "UPDATE tasks SET retries = retries + 1, updated_at = $2 WHERE id = $1 RETURNING retries, max_retries",
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        Ok(counters)
    }

    /// Put a job back in line for another attempt, recording the
    /// diagnostic output from the failed one.
    pub async fn reset_to_pending(&self, id: &str, output: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE tasks SET status = 'PENDING', output = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(nullable(output))
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Ids of PENDING jobs eligible for enqueue: unscheduled rows, due
    /// one-shots, and due recurrences, oldest update first.
    pub async fn due_task_ids(&self, limit: i64) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT id FROM tasks
            WHERE status = 'PENDING' AND (
                execute_at IS NULL OR execute_at <= now()
                OR (next_run_at IS NOT NULL AND next_run_at <= now())
            )
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Record the next firing instant for a recurring job.
    pub async fn update_next_run(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE tasks SET next_run_at = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(at)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Null out `execute_at` so a one-shot schedule is not re-enqueued.
    pub async fn clear_execute_at(&self, id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE tasks SET execute_at = NULL, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fail every RUNNING job whose row has not been touched within the
    /// cutoff, tagging the output. Returns the number of rows reaped.
    pub async fn mark_stale_running_failed(&self, cutoff_seconds: i64) -> Result<u64> {
        let now = Utc::now().timestamp();
        let cutoff = now - cutoff_seconds;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'FAILED',
                output = COALESCE(output, '') || E'\n[auto] marked failed due to staleness',
                updated_at = $1
            WHERE status = 'RUNNING' AND updated_at < $2
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn nullable(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
