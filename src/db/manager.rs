//! Manager registry: registration/heartbeat upserts, filterable reads, and
//! the shutdown/staleness recovery sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::info;

use super::{Database, DbError, DbResult, ManagerStatus, ResetTasks};

/// Registration/heartbeat payload. The counter fields are deltas added to
/// the stored monotonic counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerUpdate {
    pub name: String,
    pub cluster: Option<String>,
    pub hostname: Option<String>,
    pub status: ManagerStatus,
    pub tag: Option<String>,
    pub programs: Vec<String>,
    pub procedures: Vec<String>,
    pub submitted: i64,
    pub completed: i64,
    pub returned: i64,
    pub failures: i64,
}

impl ManagerUpdate {
    /// A bare active registration/heartbeat for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cluster: None,
            hostname: None,
            status: ManagerStatus::Active,
            tag: None,
            programs: Vec::new(),
            procedures: Vec::new(),
            submitted: 0,
            completed: 0,
            returned: 0,
            failures: 0,
        }
    }
}

/// A manager row as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerInfo {
    pub name: String,
    pub cluster: Option<String>,
    pub hostname: Option<String>,
    pub status: ManagerStatus,
    pub tag: Option<String>,
    pub programs: Vec<String>,
    pub procedures: Vec<String>,
    pub submitted: i64,
    pub completed: i64,
    pub returned: i64,
    pub failures: i64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ManagerInfo {
    fn from_row(row: &PgRow) -> DbResult<Self> {
        let status: String = row.get("status");
        let status = ManagerStatus::parse(&status)
            .ok_or_else(|| DbError::Corrupt(format!("unknown manager status {status:?}")))?;
        Ok(Self {
            name: row.get("name"),
            cluster: row.get("cluster"),
            hostname: row.get("hostname"),
            status,
            tag: row.get("tag"),
            programs: row.get("programs"),
            procedures: row.get("procedures"),
            submitted: row.get("submitted"),
            completed: row.get("completed"),
            returned: row.get("returned"),
            failures: row.get("failures"),
            created_at: row.get("created_at"),
            modified_at: row.get("modified_at"),
        })
    }
}

/// Outcome of a shutdown/staleness sweep.
#[derive(Debug, Clone, Default)]
pub struct ManagerShutdown {
    /// Names of managers moved to inactive.
    pub managers: Vec<String>,
    /// In-flight tasks returned to the waiting pool.
    pub tasks_reset: u64,
}

const MANAGER_COLUMNS: &str = "name, cluster, hostname, status, tag, programs, procedures, \
     submitted, completed, returned, failures, created_at, modified_at";

impl Database {
    /// Register a manager or apply a heartbeat update.
    ///
    /// Creates the row on first contact; afterwards applies the given status,
    /// folds the counter deltas into the stored totals, keeps previously
    /// advertised capabilities when the update omits them, and bumps
    /// `modified_at` (the heartbeat clock). Returns true if the row was
    /// newly created.
    pub async fn update_manager(&self, update: &ManagerUpdate) -> DbResult<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO managers
                (name, cluster, hostname, status, tag, programs, procedures,
                 submitted, completed, returned, failures)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (name) DO UPDATE SET
                cluster = COALESCE(EXCLUDED.cluster, managers.cluster),
                hostname = COALESCE(EXCLUDED.hostname, managers.hostname),
                status = EXCLUDED.status,
                tag = COALESCE(EXCLUDED.tag, managers.tag),
                programs = CASE WHEN cardinality(EXCLUDED.programs) > 0
                                THEN EXCLUDED.programs ELSE managers.programs END,
                procedures = CASE WHEN cardinality(EXCLUDED.procedures) > 0
                                  THEN EXCLUDED.procedures ELSE managers.procedures END,
                submitted = managers.submitted + EXCLUDED.submitted,
                completed = managers.completed + EXCLUDED.completed,
                returned = managers.returned + EXCLUDED.returned,
                failures = managers.failures + EXCLUDED.failures,
                modified_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&update.name)
        .bind(&update.cluster)
        .bind(&update.hostname)
        .bind(update.status.as_str())
        .bind(&update.tag)
        .bind(
            update
                .programs
                .iter()
                .map(|p| p.to_lowercase())
                .collect::<Vec<_>>(),
        )
        .bind(
            update
                .procedures
                .iter()
                .map(|p| p.to_lowercase())
                .collect::<Vec<_>>(),
        )
        .bind(update.submitted)
        .bind(update.completed)
        .bind(update.returned)
        .bind(update.failures)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("inserted"))
    }

    /// Read managers, optionally filtered by name, status, and last-heartbeat
    /// cutoff.
    pub async fn get_managers(
        &self,
        name: Option<&str>,
        status: Option<ManagerStatus>,
        modified_before: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<ManagerInfo>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MANAGER_COLUMNS}
            FROM managers
            WHERE ($1::text IS NULL OR name = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR modified_at < $3)
            ORDER BY name
            "#
        ))
        .bind(name)
        .bind(status.map(|s| s.as_str()))
        .bind(modified_before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(ManagerInfo::from_row).collect()
    }

    /// Shut down the named managers: return their running tasks to the
    /// waiting pool, then mark them inactive.
    ///
    /// Safe to repeat - tasks that already transitioned away from `running`
    /// are untouched, and already-inactive managers are not re-shut-down.
    pub async fn shutdown_managers(&self, names: &[String]) -> DbResult<ManagerShutdown> {
        let mut shutdown = ManagerShutdown::default();
        if names.is_empty() {
            return Ok(shutdown);
        }

        for name in names {
            shutdown.tasks_reset += self
                .reset_tasks(&ResetTasks {
                    manager: Some(name.clone()),
                    reset_running: true,
                    ..Default::default()
                })
                .await?;
        }

        let deactivated: Vec<String> = sqlx::query(
            r#"
            UPDATE managers
            SET status = 'inactive', modified_at = NOW()
            WHERE name = ANY($1) AND status = 'active'
            RETURNING name
            "#,
        )
        .bind(names)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.get("name"))
        .collect();

        if !deactivated.is_empty() {
            info!(
                managers = ?deactivated,
                tasks_reset = shutdown.tasks_reset,
                "managers shut down"
            );
        }
        shutdown.managers = deactivated;
        Ok(shutdown)
    }

    /// Deactivate every active manager whose last heartbeat predates
    /// `cutoff`, recovering its in-flight tasks. The liveness sweep's
    /// primitive; idempotent like [`Database::shutdown_managers`].
    pub async fn deactivate_stale_managers(
        &self,
        cutoff: DateTime<Utc>,
    ) -> DbResult<ManagerShutdown> {
        let stale: Vec<String> = sqlx::query(
            "SELECT name FROM managers WHERE status = 'active' AND modified_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.get("name"))
        .collect();

        self.shutdown_managers(&stale).await
    }
}
