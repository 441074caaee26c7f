//! The task store: guarded status transitions over a SQLite pool.

use chrono::Utc;
use sqlx::{migrate::Migrator, sqlite::SqlitePoolOptions, SqlitePool};
use uuid::Uuid;

use crate::{LiaError, LiaResult};

use super::{Task, TaskConfig, TaskSource, TaskStatus};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static MIGRATOR: Migrator = sqlx::migrate!("lib/store/migrations");

/// Hard cap on `per_page` for list queries.
const MAX_PER_PAGE: u32 = 100;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Durable record of every task.
///
/// All mutation goes through the `mark_*` methods, each of which asserts the
/// current status in its `UPDATE … WHERE` clause, so an illegal transition
/// surfaces as [`LiaError::InvalidState`] instead of corrupting the row.
#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TaskStore {
    /// Connects to the database, applying migrations.
    pub async fn connect(url: &str, max_connections: u32) -> LiaResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Inserts a new pending task, together with its group association when a
    /// group id was supplied, in one transaction.
    pub async fn create(
        &self,
        user_id: &str,
        source: TaskSource,
        repositories: &[String],
        config: Option<TaskConfig>,
        group_id: Option<&str>,
    ) -> LiaResult<Task> {
        let task = Task {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            status: TaskStatus::Pending,
            source,
            repositories: sqlx::types::Json(repositories.to_vec()),
            vm_id: None,
            cid: None,
            config: config.map(sqlx::types::Json),
            ip_address: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            error_message: None,
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, user_id, status, source, repositories, config, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(task.id)
        .bind(&task.user_id)
        .bind(task.status)
        .bind(task.source)
        .bind(&task.repositories)
        .bind(&task.config)
        .bind(task.created_at)
        .execute(&mut *tx)
        .await?;

        if let Some(group_id) = group_id {
            sqlx::query(
                "INSERT INTO task_groups (task_id, group_id, created_at) VALUES (?1, ?2, ?3)",
            )
            .bind(task.id)
            .bind(group_id)
            .bind(task.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(task)
    }

    /// Transition `pending → starting`, recording the VM id and context id.
    pub async fn mark_starting(&self, id: Uuid, vm_id: &str, cid: u32) -> LiaResult<Task> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, vm_id = ?2, cid = ?3 WHERE id = ?4 AND status = ?5",
        )
        .bind(TaskStatus::Starting)
        .bind(vm_id)
        .bind(cid)
        .bind(id)
        .bind(TaskStatus::Pending)
        .execute(&self.pool)
        .await?;

        self.assert_transitioned(id, result.rows_affected(), TaskStatus::Starting)
            .await
    }

    /// Transition `starting → running`, recording the assigned IP and the
    /// first-run timestamp.
    pub async fn mark_running(&self, id: Uuid, ip_address: &str) -> LiaResult<Task> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?1, ip_address = ?2, started_at = COALESCE(started_at, ?3)
            WHERE id = ?4 AND status = ?5
            "#,
        )
        .bind(TaskStatus::Running)
        .bind(ip_address)
        .bind(Utc::now())
        .bind(id)
        .bind(TaskStatus::Starting)
        .execute(&self.pool)
        .await?;

        self.assert_transitioned(id, result.rows_affected(), TaskStatus::Running)
            .await
    }

    /// Transition `running → suspended`.
    pub async fn mark_suspended(&self, id: Uuid) -> LiaResult<Task> {
        let result = sqlx::query("UPDATE tasks SET status = ?1 WHERE id = ?2 AND status = ?3")
            .bind(TaskStatus::Suspended)
            .bind(id)
            .bind(TaskStatus::Running)
            .execute(&self.pool)
            .await?;

        self.assert_transitioned(id, result.rows_affected(), TaskStatus::Suspended)
            .await
    }

    /// Transition `suspended → running`.
    pub async fn mark_resumed(&self, id: Uuid) -> LiaResult<Task> {
        let result = sqlx::query("UPDATE tasks SET status = ?1 WHERE id = ?2 AND status = ?3")
            .bind(TaskStatus::Running)
            .bind(id)
            .bind(TaskStatus::Suspended)
            .execute(&self.pool)
            .await?;

        self.assert_transitioned(id, result.rows_affected(), TaskStatus::Running)
            .await
    }

    /// Transition any non-terminal status to `terminated`, recording the exit
    /// code, error message, and completion timestamp.
    pub async fn mark_terminated(
        &self,
        id: Uuid,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> LiaResult<Task> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?1, exit_code = ?2, error_message = ?3, completed_at = ?4
            WHERE id = ?5 AND status != ?1
            "#,
        )
        .bind(TaskStatus::Terminated)
        .bind(exit_code)
        .bind(error_message)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.assert_transitioned(id, result.rows_affected(), TaskStatus::Terminated)
            .await
    }

    /// Fetches a task by id.
    pub async fn get(&self, id: Uuid) -> LiaResult<Task> {
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LiaError::TaskNotFound(id))
    }

    /// Lists tasks, newest first, optionally filtered by user and status.
    /// Returns the page plus the total row count for the filter.
    pub async fn list(
        &self,
        user_id: Option<&str>,
        status: Option<TaskStatus>,
        page: u32,
        per_page: u32,
    ) -> LiaResult<(Vec<Task>, i64)> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PER_PAGE);
        let offset = (page - 1) * per_page;

        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE (?1 IS NULL OR user_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at DESC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(user_id)
        .bind(status)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM tasks
            WHERE (?1 IS NULL OR user_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            "#,
        )
        .bind(user_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((tasks, total))
    }

    /// Lists every task currently in one of the given statuses.
    pub async fn list_in_statuses(&self, statuses: &[TaskStatus]) -> LiaResult<Vec<Task>> {
        let mut tasks = Vec::new();
        for status in statuses {
            let mut batch =
                sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE status = ?1")
                    .bind(status)
                    .fetch_all(&self.pool)
                    .await?;
            tasks.append(&mut batch);
        }
        Ok(tasks)
    }

    /// Returns the group id associated with a task, if any.
    pub async fn group_id_for(&self, task_id: Uuid) -> LiaResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT group_id FROM task_groups WHERE task_id = ?1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(group_id,)| group_id))
    }

    /// Distinguishes "row missing" from "row in the wrong status" after a
    /// guarded update touched zero rows.
    async fn assert_transitioned(
        &self,
        id: Uuid,
        rows_affected: u64,
        target: TaskStatus,
    ) -> LiaResult<Task> {
        if rows_affected == 0 {
            let task = self.get(id).await?;
            return Err(LiaError::InvalidState(format!(
                "task {} is {}, cannot transition to {}",
                id, task.status, target
            )));
        }
        self.get(id).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
