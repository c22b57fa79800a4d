//! Batch application of manager-reported outcomes.
//!
//! The return path for a claim: a manager reports, per task, either a
//! computed output or an error blob. Successes are persisted onto the owning
//! record (which leaves `complete`) and the queue row is deleted; failures
//! park both the record and the task in `error` for operator inspection.
//!
//! Rows are reconciled independently: one bad id, stale claim, or failed
//! write never aborts the rest of the batch. Whatever could not be applied
//! comes back in the summary.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Database, DbResult, RecordStatus, TaskId, TaskStatus};

/// One task outcome from a manager's return batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub success: bool,
    /// Computed output on success; error blob on failure. Opaque here.
    pub payload: serde_json::Value,
}

/// What happened to a return batch.
#[derive(Debug, Clone, Default)]
pub struct OutcomeSummary {
    pub completed: u64,
    pub failures: u64,
    /// Outcomes that could not be applied, with the reason.
    pub rejected: Vec<(TaskId, String)>,
}

impl Database {
    /// Apply a manager's reported outcomes to the queue and the owning
    /// records, then bump the manager's counters once for the whole batch.
    ///
    /// An outcome is rejected when its task no longer exists, is not
    /// `running`, or is held by a different manager - a stale return after a
    /// reset must not overwrite work that has been handed to someone else.
    pub async fn apply_outcomes(
        &self,
        manager_name: &str,
        outcomes: &[TaskOutcome],
    ) -> DbResult<OutcomeSummary> {
        let mut summary = OutcomeSummary::default();
        if outcomes.is_empty() {
            return Ok(summary);
        }

        for outcome in outcomes {
            match self.apply_one(manager_name, outcome).await {
                Ok(()) => {
                    if outcome.success {
                        summary.completed += 1;
                    } else {
                        summary.failures += 1;
                    }
                }
                Err(err) => {
                    warn!(
                        task_id = %outcome.task_id,
                        manager = manager_name,
                        error = %err,
                        "rejected task outcome"
                    );
                    summary.rejected.push((outcome.task_id, err.to_string()));
                }
            }
        }

        sqlx::query(
            r#"
            UPDATE managers
            SET returned = returned + $2,
                completed = completed + $3,
                failures = failures + $4,
                modified_at = NOW()
            WHERE name = $1
            "#,
        )
        .bind(manager_name)
        .bind(outcomes.len() as i64)
        .bind(summary.completed as i64)
        .bind(summary.failures as i64)
        .execute(&self.pool)
        .await?;

        Ok(summary)
    }

    async fn apply_one(&self, manager_name: &str, outcome: &TaskOutcome) -> DbResult<()> {
        use super::DbError;

        let tasks = self
            .get_tasks(&super::TaskFilter {
                ids: Some(vec![outcome.task_id]),
                ..Default::default()
            })
            .await?;
        let task = tasks
            .first()
            .ok_or_else(|| DbError::NotFound(format!("task {}", outcome.task_id)))?;

        if task.status != TaskStatus::Running {
            return Err(DbError::InvalidArgument(format!(
                "task {} is {}, not running",
                task.id,
                task.status.as_str()
            )));
        }
        if task.manager.as_deref() != Some(manager_name) {
            return Err(DbError::InvalidArgument(format!(
                "task {} is not held by manager {manager_name}",
                task.id
            )));
        }

        if outcome.success {
            let record = self.get_owning_ref(task.record_id).await?;
            self.store_record_output(&record, &outcome.payload).await?;
            self.mark_complete(&[task.id]).await?;
        } else {
            self.set_record_status(task.record_id, RecordStatus::Error, Some(&outcome.payload))
                .await?;
            self.mark_error(&[task.id]).await?;
        }

        Ok(())
    }
}
