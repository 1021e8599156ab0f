//! C1 — durable, transactional storage for tasks, events, leases,
//! dependencies, reservations, and heartbeats.
//!
//! Backed by a single embedded SQLite database with write-ahead logging,
//! following the same connection-bootstrap shape as the teacher's
//! `storage::Storage` (WAL mode, `synchronous = NORMAL`, one shared pool).
//! Writes are serialized by SQLite itself; reads proceed in parallel under
//! WAL. The store never retries internally — contention surfaces as
//! `CoreError::Contended` and is retried by the scheduler.

pub mod model;

use crate::error::{CoreError, CoreResult};
use model::*;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Default timeout for individual SQLite queries. Prevents a hung statement
/// from blocking a caller indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = CoreResult<T>>) -> CoreResult<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Deadline),
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the SQLite database under `data_dir` and run
    /// migrations.
    pub async fn new(data_dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("beadbroker.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests — same schema, no file on disk.
    pub async fn new_in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — `Arc`-backed).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Tasks ──────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_task(
        &self,
        id: &str,
        title: &str,
        description: &str,
        policy_label: &str,
        priority: i64,
        files: &[String],
        payload: &str,
    ) -> CoreResult<TaskRow> {
        let now = now_ms();
        let files_json = serde_json::to_string(files).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "INSERT INTO tasks (id, title, description, policy_label, priority, state, attempts, files, payload, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 'PENDING', 0, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               title = excluded.title, description = excluded.description, \
               policy_label = excluded.policy_label, priority = excluded.priority, \
               files = excluded.files, payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(title)
        .bind(description)
        .bind(policy_label)
        .bind(priority)
        .bind(&files_json)
        .bind(payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?;
        self.load_task(id).await
    }

    pub async fn load_task(&self, id: &str) -> CoreResult<TaskRow> {
        sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))?
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))
    }

    pub async fn list_tasks_by_state(&self, state: &str) -> CoreResult<Vec<TaskRow>> {
        sqlx::query_as(
            "SELECT * FROM tasks WHERE state = ? ORDER BY priority DESC, created_at ASC",
        )
        .bind(state)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))
    }

    pub async fn list_all_tasks(&self) -> CoreResult<Vec<TaskRow>> {
        sqlx::query_as("SELECT * FROM tasks ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))
    }

    /// Transition a task's state, failing if its current state isn't `from`.
    pub async fn update_task_state(&self, id: &str, from: &str, to: &str) -> CoreResult<TaskRow> {
        let now = now_ms();
        let rows = sqlx::query(
            "UPDATE tasks SET state = ?, updated_at = ? WHERE id = ? AND state = ?",
        )
        .bind(to)
        .bind(now)
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?
        .rows_affected();

        if rows == 0 {
            // Distinguish "missing" from "wrong state" for a clearer error.
            let current = self.load_task(id).await?;
            return Err(CoreError::Contended(format!(
                "task {id} expected state {from}, found {}",
                current.state
            )));
        }
        debug!(task_id = id, from, to, "task state transition");
        self.load_task(id).await
    }

    /// Forcibly sets a task's attempts counter to zero and its state to
    /// READY — the `reset(task)` re-open operation in spec §4.5.
    pub async fn reset_task(&self, id: &str) -> CoreResult<TaskRow> {
        let now = now_ms();
        let rows = sqlx::query(
            "UPDATE tasks SET state = 'READY', attempts = 0, updated_at = ? WHERE id = ? AND state = 'FAILED'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?
        .rows_affected();
        if rows == 0 {
            return Err(CoreError::Invariant(format!(
                "task {id} is not FAILED — cannot reset"
            )));
        }
        self.load_task(id).await
    }

    /// Forbidden if an active lease still references the task.
    pub async fn remove_task(&self, id: &str) -> CoreResult<()> {
        let has_lease: Option<(String,)> =
            sqlx::query_as("SELECT task_id FROM leases WHERE task_id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CoreError::Other(e.into()))?;
        if has_lease.is_some() {
            return Err(CoreError::Invariant(format!(
                "task {id} has an active lease — release it before removing"
            )));
        }
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))?;
        Ok(())
    }

    // ─── Dependencies ───────────────────────────────────────────────────────
    //
    // Acyclicity is enforced by the caller (the DAG engine, C4) against its
    // in-memory graph before calling `add_dependency`; the store itself only
    // enforces the uniqueness constraint on `(task_id, depends_on_task_id)`.

    pub async fn add_dependency(
        &self,
        task_id: &str,
        depends_on_id: &str,
        kind: DependencyKind,
        description: Option<&str>,
    ) -> CoreResult<DependencyRow> {
        if task_id == depends_on_id {
            return Err(CoreError::WouldCycle(format!(
                "task {task_id} cannot depend on itself"
            )));
        }
        let id = new_id();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO task_dependencies \
             (id, task_id, depends_on_task_id, dependency_type, description, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(task_id, depends_on_task_id) DO UPDATE SET \
               dependency_type = excluded.dependency_type, description = excluded.description, updated_at = excluded.updated_at",
        )
        .bind(&id)
        .bind(task_id)
        .bind(depends_on_id)
        .bind(kind.as_str())
        .bind(description)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?;

        sqlx::query_as("SELECT * FROM task_dependencies WHERE task_id = ? AND depends_on_task_id = ?")
            .bind(task_id)
            .bind(depends_on_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))
    }

    pub async fn remove_dependency(&self, task_id: &str, depends_on_id: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM task_dependencies WHERE task_id = ? AND depends_on_task_id = ?")
            .bind(task_id)
            .bind(depends_on_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))?;
        Ok(())
    }

    pub async fn list_dependencies(&self, task_id: &str) -> CoreResult<Vec<DependencyRow>> {
        sqlx::query_as("SELECT * FROM task_dependencies WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))
    }

    pub async fn list_dependents(&self, task_id: &str) -> CoreResult<Vec<DependencyRow>> {
        sqlx::query_as("SELECT * FROM task_dependencies WHERE depends_on_task_id = ?")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))
    }

    pub async fn list_all_dependencies(&self) -> CoreResult<Vec<DependencyRow>> {
        sqlx::query_as("SELECT * FROM task_dependencies")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))
    }

    // ─── Leases ─────────────────────────────────────────────────────────────

    /// Atomic: if no active lease exists for the task, insert one and flip
    /// the task's state `READY -> RESERVED`. Returns `Contended` if another
    /// lease is already active, or if the task isn't currently `READY`.
    pub async fn try_reserve(
        &self,
        agent_id: &str,
        task_id: &str,
        ttl_ms: i64,
    ) -> CoreResult<LeaseRow> {
        let now = now_ms();
        let mut tx = self.pool.begin().await.map_err(|e| CoreError::Other(e.into()))?;

        // Expired leases are invisible to new reservations — delete them
        // opportunistically so the unique constraint below only blocks on a
        // genuinely live lease.
        sqlx::query("DELETE FROM leases WHERE task_id = ? AND lease_expires_at <= ?")
            .bind(task_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoreError::Other(e.into()))?;

        let rows = sqlx::query("UPDATE tasks SET state = 'RESERVED', updated_at = ? WHERE id = ? AND state = 'READY'")
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoreError::Other(e.into()))?
            .rows_affected();
        if rows == 0 {
            tx.rollback().await.ok();
            return Err(CoreError::Contended(format!("task {task_id} is not READY")));
        }

        let attempt = sqlx::query_scalar::<_, i64>("SELECT attempts FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| CoreError::Other(e.into()))?
            + 1;

        let insert = sqlx::query(
            "INSERT INTO leases (task_id, agent_id, lease_expires_at, attempt) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(agent_id)
        .bind(now + ttl_ms)
        .bind(attempt)
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            tx.rollback().await.ok();
            // UNIQUE constraint on leases.task_id -> lost the race to another reserver.
            return Err(CoreError::Contended(format!(
                "lease already held for task {task_id}: {e}"
            )));
        }

        sqlx::query("UPDATE tasks SET attempts = ? WHERE id = ?")
            .bind(attempt)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoreError::Other(e.into()))?;

        tx.commit().await.map_err(|e| CoreError::Other(e.into()))?;
        info!(task_id, agent_id, attempt, "task reserved");

        Ok(LeaseRow {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            lease_expires_at: now + ttl_ms,
            attempt,
        })
    }

    /// Succeeds only if the current lease is still owned by `agent_id` and
    /// not yet expired.
    pub async fn renew_lease(&self, agent_id: &str, task_id: &str, new_expiry_ms: i64) -> CoreResult<()> {
        let now = now_ms();
        let rows = sqlx::query(
            "UPDATE leases SET lease_expires_at = ? \
             WHERE task_id = ? AND agent_id = ? AND lease_expires_at > ?",
        )
        .bind(new_expiry_ms)
        .bind(task_id)
        .bind(agent_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?
        .rows_affected();

        if rows == 0 {
            return Err(CoreError::LeaseLost {
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }

    /// Deletes the lease row and sets the task to a terminal state
    /// (`COMPLETED` or `FAILED`). Idempotent: calling this twice with the
    /// same arguments is a no-op the second time (lease already gone).
    pub async fn release_lease(
        &self,
        agent_id: &str,
        task_id: &str,
        terminal_state: &str,
    ) -> CoreResult<()> {
        debug_assert!(terminal_state == "COMPLETED" || terminal_state == "FAILED");
        let now = now_ms();
        sqlx::query("DELETE FROM leases WHERE task_id = ? AND agent_id = ?")
            .bind(task_id)
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))?;

        sqlx::query(
            "UPDATE tasks SET state = ?, updated_at = ? \
             WHERE id = ? AND state IN ('RESERVED', 'RUNNING')",
        )
        .bind(terminal_state)
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?;

        Ok(())
    }

    /// Marks the `RESERVED -> RUNNING` transition driven by the agent's
    /// first reported progress.
    pub async fn mark_running(&self, task_id: &str) -> CoreResult<()> {
        let now = now_ms();
        sqlx::query("UPDATE tasks SET state = 'RUNNING', updated_at = ? WHERE id = ? AND state = 'RESERVED'")
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))?;
        Ok(())
    }

    /// Reclaims every lease whose `expires_at <= now`: deletes the lease row
    /// and flips the task back `RESERVED|RUNNING -> READY`, incrementing
    /// `attempts` only when the prior attempt recorded work (i.e. the task
    /// had reached `RUNNING`). Returns the reclaimed `(task_id, agent_id)`
    /// pairs. A no-op (empty result) when nothing is expired.
    pub async fn reclaim_expired(&self, now_ms_val: i64) -> CoreResult<Vec<(String, String)>> {
        let expired: Vec<(String, String)> = sqlx::query_as(
            "SELECT task_id, agent_id FROM leases WHERE lease_expires_at <= ?",
        )
        .bind(now_ms_val)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?;

        for (task_id, agent_id) in &expired {
            let was_running: Option<(String,)> =
                sqlx::query_as("SELECT state FROM tasks WHERE id = ? AND state = 'RUNNING'")
                    .bind(task_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| CoreError::Other(e.into()))?;

            sqlx::query("DELETE FROM leases WHERE task_id = ? AND agent_id = ?")
                .bind(task_id)
                .bind(agent_id)
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Other(e.into()))?;

            if was_running.is_some() {
                sqlx::query(
                    "UPDATE tasks SET state = 'READY', attempts = attempts + 1, updated_at = ? \
                     WHERE id = ?",
                )
                .bind(now_ms_val)
                .bind(task_id)
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Other(e.into()))?;
            } else {
                sqlx::query(
                    "UPDATE tasks SET state = 'READY', updated_at = ? WHERE id = ? AND state IN ('RESERVED','RUNNING')",
                )
                .bind(now_ms_val)
                .bind(task_id)
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Other(e.into()))?;
            }
            warn!(task_id, agent_id, "lease reclaimed — task returned to READY");
        }

        Ok(expired)
    }

    pub async fn load_lease(&self, task_id: &str) -> CoreResult<Option<LeaseRow>> {
        sqlx::query_as("SELECT * FROM leases WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))
    }

    // ─── Heartbeats ─────────────────────────────────────────────────────────

    pub async fn upsert_heartbeat(
        &self,
        agent_id: &str,
        status: &str,
        context_usage_percent: f64,
    ) -> CoreResult<()> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO agent_heartbeats (agent_id, last_seen, status, context_usage_percent) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(agent_id) DO UPDATE SET \
               last_seen = excluded.last_seen, status = excluded.status, \
               context_usage_percent = excluded.context_usage_percent",
        )
        .bind(agent_id)
        .bind(now)
        .bind(status)
        .bind(context_usage_percent)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?;
        Ok(())
    }

    pub async fn stale_agents(&self, threshold_ms: i64) -> CoreResult<Vec<String>> {
        let now = now_ms();
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT agent_id FROM agent_heartbeats WHERE last_seen < ?",
        )
        .bind(now - threshold_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // ─── Events ─────────────────────────────────────────────────────────────

    pub async fn append_event(&self, task_id: &str, kind: &str, data_json: &str) -> CoreResult<EventRow> {
        let id = new_id();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO events (id, task_id, ts, kind, data_json) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(task_id)
        .bind(now)
        .bind(kind)
        .bind(data_json)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?;
        sqlx::query_as("SELECT * FROM events WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))
    }

    pub async fn list_events(&self, task_id: &str) -> CoreResult<Vec<EventRow>> {
        with_timeout(async {
            sqlx::query_as("SELECT * FROM events WHERE task_id = ? ORDER BY ts ASC")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| CoreError::Other(e.into()))
        })
        .await
    }

    // ─── File reservations ──────────────────────────────────────────────────

    /// Acquire a file-path lease, identical in shape to `try_reserve` but
    /// keyed by `file_path` instead of `task_id`.
    pub async fn reservation_acquire(
        &self,
        file_path: &str,
        agent_id: &str,
        ttl_ms: i64,
        reason: Option<&str>,
    ) -> CoreResult<FileReservationRow> {
        let now = now_ms();

        // Expire stale rows opportunistically.
        sqlx::query(
            "UPDATE file_reservations SET status = 'expired' \
             WHERE file_path = ? AND status = 'active' AND lease_expires_at <= ?",
        )
        .bind(file_path)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?;

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM file_reservations WHERE file_path = ? AND status = 'active'",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?;
        if existing.is_some() {
            return Err(CoreError::Conflict(vec![file_path.to_string()]));
        }

        let id = new_id();
        sqlx::query(
            "INSERT INTO file_reservations \
             (id, file_path, agent_id, lease_expires_at, created_at, updated_at, status, lease_reason) \
             VALUES (?, ?, ?, ?, ?, ?, 'active', ?)",
        )
        .bind(&id)
        .bind(file_path)
        .bind(agent_id)
        .bind(now + ttl_ms)
        .bind(now)
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            // Lost the race on the UNIQUE(file_path) constraint for an
            // 'active' row inserted concurrently between our check and insert.
            debug!(file_path, error = %e, "reservation insert raced");
            CoreError::Conflict(vec![file_path.to_string()])
        })?;

        sqlx::query_as("SELECT * FROM file_reservations WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))
    }

    pub async fn reservation_release(&self, file_path: &str, agent_id: &str) -> CoreResult<()> {
        let now = now_ms();
        sqlx::query(
            "UPDATE file_reservations SET status = 'released', updated_at = ? \
             WHERE file_path = ? AND agent_id = ? AND status = 'active'",
        )
        .bind(now)
        .bind(file_path)
        .bind(agent_id)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Other(e.into()))?;
        Ok(())
    }

    /// Returns the subset of `paths` that are actively reserved by an agent
    /// other than `agent_id`.
    pub async fn reservation_conflicts(&self, paths: &[String], agent_id: &str) -> CoreResult<Vec<String>> {
        let now = now_ms();
        let mut conflicts = Vec::new();
        for path in paths {
            let row: Option<(String,)> = sqlx::query_as(
                "SELECT agent_id FROM file_reservations \
                 WHERE file_path = ? AND status = 'active' AND lease_expires_at > ?",
            )
            .bind(path)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Other(e.into()))?;
            if let Some((holder,)) = row {
                if holder != agent_id {
                    conflicts.push(path.clone());
                }
            }
        }
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        Store::new_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn upsert_and_load_round_trips() {
        let store = test_store().await;
        let task = store
            .upsert_task("t1", "Title", "Desc", "default", 5, &["a.rs".to_string()], "{}")
            .await
            .unwrap();
        assert_eq!(task.state, "PENDING");
        assert_eq!(task.files_vec(), vec!["a.rs".to_string()]);

        let loaded = store.load_task("t1").await.unwrap();
        assert_eq!(loaded.title, "Title");
    }

    #[tokio::test]
    async fn reserve_requires_ready_state() {
        let store = test_store().await;
        store.upsert_task("t1", "T", "", "", 0, &[], "{}").await.unwrap();
        // Still PENDING, not READY.
        let err = store.try_reserve("agent-1", "t1", 30_000).await.unwrap_err();
        assert!(matches!(err, CoreError::Contended(_)));

        store.update_task_state("t1", "PENDING", "READY").await.unwrap();
        let lease = store.try_reserve("agent-1", "t1", 30_000).await.unwrap();
        assert_eq!(lease.attempt, 1);

        // Second reservation attempt contends.
        let err = store.try_reserve("agent-2", "t1", 30_000).await.unwrap_err();
        assert!(matches!(err, CoreError::Contended(_)));
    }

    #[tokio::test]
    async fn reclaim_expired_returns_task_to_ready() {
        let store = test_store().await;
        store.upsert_task("t1", "T", "", "", 0, &[], "{}").await.unwrap();
        store.update_task_state("t1", "PENDING", "READY").await.unwrap();
        store.try_reserve("agent-1", "t1", -1_000).await.unwrap();

        let reclaimed = store.reclaim_expired(now_ms()).await.unwrap();
        assert_eq!(reclaimed, vec![("t1".to_string(), "agent-1".to_string())]);

        let task = store.load_task("t1").await.unwrap();
        assert_eq!(task.state, "READY");
        assert!(store.load_lease("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reservation_conflicts_detects_other_agents() {
        let store = test_store().await;
        store
            .reservation_acquire("src/lib.rs", "agent-1", 30_000, None)
            .await
            .unwrap();

        let conflicts = store
            .reservation_conflicts(&["src/lib.rs".to_string()], "agent-2")
            .await
            .unwrap();
        assert_eq!(conflicts, vec!["src/lib.rs".to_string()]);

        // Same agent sees no conflict with its own reservation.
        let none = store
            .reservation_conflicts(&["src/lib.rs".to_string()], "agent-1")
            .await
            .unwrap();
        assert!(none.is_empty());

        store.reservation_release("src/lib.rs", "agent-1").await.unwrap();
        let after_release = store
            .reservation_conflicts(&["src/lib.rs".to_string()], "agent-2")
            .await
            .unwrap();
        assert!(after_release.is_empty());
    }

    #[tokio::test]
    async fn dependency_self_loop_rejected() {
        let store = test_store().await;
        store.upsert_task("t1", "T", "", "", 0, &[], "{}").await.unwrap();
        let err = store
            .add_dependency("t1", "t1", DependencyKind::Hard, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::WouldCycle(_)));
    }
}
