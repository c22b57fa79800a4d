//! Task queue operations: submission, the skip-locked claim, and the
//! reconciliation operations a manager return flows through.
//!
//! Every operation here is a short transactional database call; correctness
//! under concurrent access rests on the unique index on `record_id` (one task
//! per owning record) and on `FOR UPDATE SKIP LOCKED` row claims. No
//! application-level locks.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use super::{Database, DbError, DbResult, RecordId, TaskId, TaskRecord, TaskStatus};

/// A task submission: the owning record plus the opaque execution payload and
/// routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub record_id: RecordId,
    pub spec: serde_json::Value,
    pub program: String,
    pub procedure: Option<String>,
    pub tag: Option<String>,
    pub priority: i32,
}

/// Result of a batch submission. `ids` matches the input order, including
/// entries that resolved to an already-queued task; those input positions are
/// listed in `duplicates`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddedTasks {
    pub ids: Vec<TaskId>,
    pub duplicates: Vec<usize>,
}

/// Filterable task read. All filters optional; no status is excluded by
/// default.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub ids: Option<Vec<TaskId>>,
    pub record_ids: Option<Vec<RecordId>>,
    pub program: Option<String>,
    pub status: Option<TaskStatus>,
    pub tag: Option<String>,
    pub manager: Option<String>,
    pub limit: Option<i64>,
    pub skip: i64,
}

/// Bulk reset of tasks back to `waiting`. At least one flag and one filter
/// are required.
#[derive(Debug, Clone, Default)]
pub struct ResetTasks {
    pub ids: Option<Vec<TaskId>>,
    pub record_ids: Option<Vec<RecordId>>,
    pub manager: Option<String>,
    pub reset_running: bool,
    pub reset_error: bool,
}

/// Tag/priority update for tasks not currently running.
#[derive(Debug, Clone, Default)]
pub struct ModifyTasks {
    pub ids: Option<Vec<TaskId>>,
    pub record_ids: Option<Vec<RecordId>>,
    pub new_tag: Option<String>,
    pub new_priority: Option<i32>,
}

const TASK_COLUMNS: &str =
    "id, record_id, spec, program, procedure, tag, priority, status, manager, created_at, modified_at";

impl Database {
    // ========================================================================
    // Task Record Store
    // ========================================================================

    /// Queue a batch of tasks, one per owning record.
    ///
    /// A submission whose owning record already has a task resolves to that
    /// task's id and is reported in `duplicates` rather than inserting a
    /// second row. The whole batch runs in one transaction; the returned ids
    /// preserve input order, interleaved duplicates included.
    pub async fn add_tasks(&self, submissions: &[TaskSubmission]) -> DbResult<AddedTasks> {
        if submissions.is_empty() {
            return Ok(AddedTasks::default());
        }

        let mut tx = self.pool.begin().await?;
        let mut added = AddedTasks {
            ids: Vec::with_capacity(submissions.len()),
            duplicates: Vec::new(),
        };

        for (idx, sub) in submissions.iter().enumerate() {
            let existing: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM task_queue WHERE record_id = $1")
                    .bind(sub.record_id.0)
                    .fetch_optional(&mut *tx)
                    .await?;

            if let Some((id,)) = existing {
                added.duplicates.push(idx);
                added.ids.push(TaskId(id));
                continue;
            }

            let inserted: Option<(Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO task_queue (record_id, spec, program, procedure, tag, priority)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (record_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(sub.record_id.0)
            .bind(&sub.spec)
            .bind(sub.program.to_lowercase())
            .bind(sub.procedure.as_ref().map(|p| p.to_lowercase()))
            .bind(&sub.tag)
            .bind(sub.priority)
            .fetch_optional(&mut *tx)
            .await?;

            match inserted {
                Some((id,)) => added.ids.push(TaskId(id)),
                // Lost an insert race to a concurrent submitter; the
                // conflicting row is committed by now, so read it back.
                None => {
                    let (id,): (Uuid,) =
                        sqlx::query_as("SELECT id FROM task_queue WHERE record_id = $1")
                            .bind(sub.record_id.0)
                            .fetch_one(&mut *tx)
                            .await?;
                    added.duplicates.push(idx);
                    added.ids.push(TaskId(id));
                }
            }
        }

        tx.commit().await?;
        Ok(added)
    }

    /// Read tasks matching the filter, oldest first, with `limit`/`skip`
    /// pagination.
    pub async fn get_tasks(&self, filter: &TaskFilter) -> DbResult<Vec<TaskRecord>> {
        let ids: Option<Vec<Uuid>> = filter
            .ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.0).collect());
        let record_ids: Option<Vec<Uuid>> = filter
            .record_ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.0).collect());

        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM task_queue
            WHERE ($1::uuid[] IS NULL OR id = ANY($1))
              AND ($2::uuid[] IS NULL OR record_id = ANY($2))
              AND ($3::text IS NULL OR program = $3)
              AND ($4::text IS NULL OR status = $4)
              AND ($5::text IS NULL OR tag = $5)
              AND ($6::text IS NULL OR manager = $6)
            ORDER BY created_at
            OFFSET $7 LIMIT $8
            "#
        ))
        .bind(ids)
        .bind(record_ids)
        .bind(filter.program.as_ref().map(|p| p.to_lowercase()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.tag)
        .bind(&filter.manager)
        .bind(filter.skip)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(TaskRecord::from_row).collect()
    }

    /// Hard-delete tasks by id. Administrative cleanup only; normal
    /// completion goes through [`Database::mark_complete`].
    pub async fn delete_tasks(&self, ids: &[TaskId]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let result = sqlx::query("DELETE FROM task_queue WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Task Claim Protocol
    // ========================================================================

    /// Atomically hand up to `limit` compatible waiting tasks to a manager,
    /// marking them running.
    ///
    /// One claim statement runs per requested tag (a single unfiltered pass
    /// when `tags` is empty), each selecting candidates in
    /// `priority DESC, created_at ASC` order with `FOR UPDATE SKIP LOCKED`,
    /// so concurrent claims never block each other and never receive the
    /// same row. Each statement is its own transaction; locks are released
    /// as soon as the batch commits. Untagged tasks match any requested tag.
    ///
    /// Program and procedure matching is case-insensitive; tasks with no
    /// procedure are compatible with every manager.
    ///
    /// Returns the claimed tasks with their just-written status/manager/
    /// modified_at values, in scheduling order within each tag batch.
    pub async fn claim_tasks(
        &self,
        manager_name: &str,
        available_programs: &[String],
        available_procedures: &[String],
        limit: i64,
        tags: &[String],
    ) -> DbResult<Vec<TaskRecord>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let programs: Vec<String> = available_programs.iter().map(|p| p.to_lowercase()).collect();
        let procedures: Vec<String> = available_procedures
            .iter()
            .map(|p| p.to_lowercase())
            .collect();

        let mut claimed: Vec<TaskRecord> = Vec::new();

        if tags.is_empty() {
            let batch = self
                .claim_batch(manager_name, &programs, &procedures, None, limit)
                .await?;
            claimed.extend(batch);
        } else {
            for tag in tags {
                let remaining = limit - claimed.len() as i64;
                if remaining <= 0 {
                    break;
                }
                let batch = self
                    .claim_batch(manager_name, &programs, &procedures, Some(tag), remaining)
                    .await?;
                claimed.extend(batch);
            }
        }

        if !claimed.is_empty() {
            debug!(
                manager = manager_name,
                count = claimed.len(),
                "claimed tasks"
            );
            sqlx::query(
                "UPDATE managers SET submitted = submitted + $2, modified_at = NOW() WHERE name = $1",
            )
            .bind(manager_name)
            .bind(claimed.len() as i64)
            .execute(&self.pool)
            .await?;
        }

        Ok(claimed)
    }

    /// One tag's claim batch: lock, assign, and return in a single statement.
    async fn claim_batch(
        &self,
        manager_name: &str,
        programs: &[String],
        procedures: &[String],
        tag: Option<&str>,
        limit: i64,
    ) -> DbResult<Vec<TaskRecord>> {
        let rows = if let Some(tag) = tag {
            sqlx::query(
                r#"
                WITH claimable AS (
                    SELECT id
                    FROM task_queue
                    WHERE status = 'waiting'
                      AND program = ANY($2)
                      AND (procedure IS NULL OR procedure = ANY($3))
                      AND (tag IS NULL OR tag = $4)
                    ORDER BY priority DESC, created_at ASC
                    FOR UPDATE SKIP LOCKED
                    LIMIT $5
                )
                UPDATE task_queue t
                SET status = 'running', manager = $1, modified_at = NOW()
                FROM claimable
                WHERE t.id = claimable.id
                RETURNING t.id, t.record_id, t.spec, t.program, t.procedure, t.tag,
                          t.priority, t.status, t.manager, t.created_at, t.modified_at
                "#,
            )
            .bind(manager_name)
            .bind(programs)
            .bind(procedures)
            .bind(tag)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                WITH claimable AS (
                    SELECT id
                    FROM task_queue
                    WHERE status = 'waiting'
                      AND program = ANY($2)
                      AND (procedure IS NULL OR procedure = ANY($3))
                    ORDER BY priority DESC, created_at ASC
                    FOR UPDATE SKIP LOCKED
                    LIMIT $4
                )
                UPDATE task_queue t
                SET status = 'running', manager = $1, modified_at = NOW()
                FROM claimable
                WHERE t.id = claimable.id
                RETURNING t.id, t.record_id, t.spec, t.program, t.procedure, t.tag,
                          t.priority, t.status, t.manager, t.created_at, t.modified_at
                "#,
            )
            .bind(manager_name)
            .bind(programs)
            .bind(procedures)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        let mut batch: Vec<TaskRecord> = rows
            .iter()
            .map(TaskRecord::from_row)
            .collect::<DbResult<_>>()?;

        // UPDATE ... RETURNING does not preserve the CTE's ordering; restore
        // the scheduling order before handing the batch back.
        batch.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        Ok(batch)
    }

    // ========================================================================
    // Completion / Failure Reconciliation
    // ========================================================================

    /// Remove finished tasks from the queue.
    ///
    /// Deletion is how a task's lifecycle ends; the caller is responsible for
    /// having persisted the computed output on the owning record first. This
    /// operation never touches owning-record status.
    pub async fn mark_complete(&self, ids: &[TaskId]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let result = sqlx::query("DELETE FROM task_queue WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Park failed tasks in `error`, leaving the rows in place for
    /// inspection. Nothing is retried automatically; recovery is an explicit
    /// [`Database::reset_tasks`] call.
    pub async fn mark_error(&self, ids: &[TaskId]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let result = sqlx::query(
            "UPDATE task_queue SET status = 'error', modified_at = NOW() WHERE id = ANY($1)",
        )
        .bind(&ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Return matching tasks to the waiting pool.
    ///
    /// `reset_running` recovers in-flight tasks (manager shutdown or
    /// heartbeat timeout); `reset_error` restarts failed ones and moves their
    /// owning records back to `incomplete`. Both are idempotent: a second
    /// call matches zero rows. Requires at least one flag and at least one
    /// identifying filter; a blanket reset across the whole table is a
    /// caller error, not a supported operation.
    pub async fn reset_tasks(&self, reset: &ResetTasks) -> DbResult<u64> {
        if !reset.reset_running && !reset.reset_error {
            return Err(DbError::InvalidArgument(
                "reset_tasks requires reset_running and/or reset_error".into(),
            ));
        }
        if reset.ids.is_none() && reset.record_ids.is_none() && reset.manager.is_none() {
            return Err(DbError::InvalidArgument(
                "reset_tasks requires at least one of ids, record_ids, manager".into(),
            ));
        }

        let ids: Option<Vec<Uuid>> = reset
            .ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.0).collect());
        let record_ids: Option<Vec<Uuid>> = reset
            .record_ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.0).collect());

        let mut tx = self.pool.begin().await?;
        let mut total = 0u64;

        if reset.reset_running {
            let result = sqlx::query(
                r#"
                UPDATE task_queue
                SET status = 'waiting', manager = NULL, modified_at = NOW()
                WHERE status = 'running'
                  AND ($1::uuid[] IS NULL OR id = ANY($1))
                  AND ($2::uuid[] IS NULL OR record_id = ANY($2))
                  AND ($3::text IS NULL OR manager = $3)
                "#,
            )
            .bind(&ids)
            .bind(&record_ids)
            .bind(&reset.manager)
            .execute(&mut *tx)
            .await?;
            total += result.rows_affected();
        }

        if reset.reset_error {
            let reset_records: Vec<Uuid> = sqlx::query(
                r#"
                UPDATE task_queue
                SET status = 'waiting', manager = NULL, modified_at = NOW()
                WHERE status = 'error'
                  AND ($1::uuid[] IS NULL OR id = ANY($1))
                  AND ($2::uuid[] IS NULL OR record_id = ANY($2))
                  AND ($3::text IS NULL OR manager = $3)
                RETURNING record_id
                "#,
            )
            .bind(&ids)
            .bind(&record_ids)
            .bind(&reset.manager)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.get("record_id"))
            .collect();

            if !reset_records.is_empty() {
                sqlx::query(
                    "UPDATE base_records SET status = 'incomplete', modified_at = NOW() WHERE id = ANY($1)",
                )
                .bind(&reset_records)
                .execute(&mut *tx)
                .await?;
            }
            total += reset_records.len() as u64;
        }

        tx.commit().await?;
        Ok(total)
    }

    /// Update tag/priority on matching tasks.
    ///
    /// Tasks currently `running` are excluded: their routing metadata is
    /// frozen until they complete or are reset, so a manager never has a
    /// task change underneath it.
    pub async fn modify_tasks(&self, modify: &ModifyTasks) -> DbResult<u64> {
        if modify.new_tag.is_none() && modify.new_priority.is_none() {
            return Err(DbError::InvalidArgument(
                "modify_tasks requires new_tag and/or new_priority".into(),
            ));
        }
        if modify.ids.is_none() && modify.record_ids.is_none() {
            return Err(DbError::InvalidArgument(
                "modify_tasks requires at least one of ids, record_ids".into(),
            ));
        }

        let ids: Option<Vec<Uuid>> = modify
            .ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.0).collect());
        let record_ids: Option<Vec<Uuid>> = modify
            .record_ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.0).collect());

        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET tag = COALESCE($3, tag),
                priority = COALESCE($4, priority),
                modified_at = NOW()
            WHERE status != 'running'
              AND ($1::uuid[] IS NULL OR id = ANY($1))
              AND ($2::uuid[] IS NULL OR record_id = ANY($2))
            "#,
        )
        .bind(&ids)
        .bind(&record_ids)
        .bind(&modify.new_tag)
        .bind(modify.new_priority)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
