//! Tests for the manager registry: registration/heartbeat upserts, reads,
//! shutdown recovery, and the staleness sweep primitive.

use std::env;

use anyhow::Result;
use chrono::Utc;
use serial_test::serial;

use qcqueue::{
    Database, ManagerStatus, ManagerUpdate, RecordKind, ResetTasks, TaskFilter, TaskStatus,
    TaskSubmission,
};

/// Helper to create a test database connection.
async fn setup_db() -> Option<Database> {
    let database_url = match env::var("QCQUEUE_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping test: QCQUEUE_DATABASE_URL not set");
            return None;
        }
    };

    let db = Database::connect(&database_url).await.ok()?;
    cleanup_database(&db).await.ok()?;
    Some(db)
}

async fn cleanup_database(db: &Database) -> Result<()> {
    sqlx::query("TRUNCATE task_queue, base_records, managers CASCADE")
        .execute(db.pool())
        .await?;
    Ok(())
}

fn registration(name: &str) -> ManagerUpdate {
    let mut update = ManagerUpdate::new(name);
    update.cluster = Some("hpc".to_string());
    update.hostname = Some("node-01".to_string());
    update.programs = vec!["psi4".to_string()];
    update
}

/// Queue `count` claimable tasks.
async fn submit_tasks(db: &Database, count: usize) -> Result<()> {
    for _ in 0..count {
        let record_id = db.add_record(RecordKind::Result).await?;
        db.add_tasks(&[TaskSubmission {
            record_id,
            spec: serde_json::json!({"function": "qcengine.compute"}),
            program: "psi4".to_string(),
            procedure: None,
            tag: None,
            priority: 0,
        }])
        .await?;
    }
    Ok(())
}

async fn count_waiting(db: &Database) -> Result<usize> {
    Ok(db
        .get_tasks(&TaskFilter {
            status: Some(TaskStatus::Waiting),
            ..Default::default()
        })
        .await?
        .len())
}

#[tokio::test]
#[serial]
async fn test_update_creates_then_heartbeats() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };

    assert!(db.update_manager(&registration("m1")).await?);

    let managers = db.get_managers(Some("m1"), None, None).await?;
    assert_eq!(managers.len(), 1);
    assert_eq!(managers[0].status, ManagerStatus::Active);
    assert_eq!(managers[0].programs, vec!["psi4".to_string()]);
    let first_heartbeat = managers[0].modified_at;

    // Second update is a heartbeat: same row, counters folded in,
    // modified_at advanced.
    let mut heartbeat = ManagerUpdate::new("m1");
    heartbeat.completed = 3;
    heartbeat.failures = 1;
    assert!(!db.update_manager(&heartbeat).await?);

    let managers = db.get_managers(Some("m1"), None, None).await?;
    assert_eq!(managers.len(), 1);
    assert_eq!(managers[0].completed, 3);
    assert_eq!(managers[0].failures, 1);
    assert!(managers[0].modified_at >= first_heartbeat);
    // A bare heartbeat does not erase advertised capabilities.
    assert_eq!(managers[0].programs, vec!["psi4".to_string()]);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_get_managers_filters() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };

    db.update_manager(&registration("m1")).await?;
    let mut inactive = registration("m2");
    inactive.status = ManagerStatus::Inactive;
    db.update_manager(&inactive).await?;

    let active = db
        .get_managers(None, Some(ManagerStatus::Active), None)
        .await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "m1");

    // Heartbeats just happened, so a cutoff in the past matches nothing and
    // one in the future matches everything.
    let past = Utc::now() - chrono::Duration::hours(1);
    assert!(db.get_managers(None, None, Some(past)).await?.is_empty());
    let future = Utc::now() + chrono::Duration::hours(1);
    assert_eq!(db.get_managers(None, None, Some(future)).await?.len(), 2);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_shutdown_recovers_orphaned_tasks() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };

    db.update_manager(&registration("m1")).await?;
    submit_tasks(&db, 3).await?;

    let claimed = db
        .claim_tasks("m1", &["psi4".to_string()], &[], 10, &[])
        .await?;
    assert_eq!(claimed.len(), 3);
    assert_eq!(count_waiting(&db).await?, 0);

    let shutdown = db.shutdown_managers(&["m1".to_string()]).await?;
    assert_eq!(shutdown.managers, vec!["m1".to_string()]);
    assert_eq!(shutdown.tasks_reset, 3);

    // All three are waiting again and claimable by a replacement manager.
    assert_eq!(count_waiting(&db).await?, 3);
    let reclaimed = db
        .claim_tasks("m2", &["psi4".to_string()], &[], 10, &[])
        .await?;
    assert_eq!(reclaimed.len(), 3);
    for task in &reclaimed {
        assert_eq!(task.manager.as_deref(), Some("m2"));
    }

    let managers = db
        .get_managers(Some("m1"), Some(ManagerStatus::Inactive), None)
        .await?;
    assert_eq!(managers.len(), 1);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_recovery_is_idempotent() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };

    db.update_manager(&registration("m1")).await?;
    submit_tasks(&db, 2).await?;
    db.claim_tasks("m1", &["psi4".to_string()], &[], 10, &[])
        .await?;

    let reset = ResetTasks {
        manager: Some("m1".to_string()),
        reset_running: true,
        ..Default::default()
    };
    assert_eq!(db.reset_tasks(&reset).await?, 2);
    // Repeating the recovery matches nothing.
    assert_eq!(db.reset_tasks(&reset).await?, 0);
    assert_eq!(count_waiting(&db).await?, 2);

    let shutdown = db.shutdown_managers(&["m1".to_string()]).await?;
    assert_eq!(shutdown.tasks_reset, 0);
    // Already inactive: a second shutdown deactivates nothing.
    let shutdown = db.shutdown_managers(&["m1".to_string()]).await?;
    assert!(shutdown.managers.is_empty());

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_deactivate_stale_managers() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };

    db.update_manager(&registration("m1")).await?;
    db.update_manager(&registration("m2")).await?;
    submit_tasks(&db, 2).await?;
    db.claim_tasks("m1", &["psi4".to_string()], &[], 10, &[])
        .await?;

    // Nobody is past a cutoff in the past.
    let past = Utc::now() - chrono::Duration::hours(1);
    let shutdown = db.deactivate_stale_managers(past).await?;
    assert!(shutdown.managers.is_empty());

    // A cutoff ahead of the last heartbeats catches both, recovering m1's
    // in-flight work.
    let future = Utc::now() + chrono::Duration::seconds(5);
    let shutdown = db.deactivate_stale_managers(future).await?;
    assert_eq!(shutdown.managers.len(), 2);
    assert_eq!(shutdown.tasks_reset, 2);
    assert_eq!(count_waiting(&db).await?, 2);

    let active = db
        .get_managers(None, Some(ManagerStatus::Active), None)
        .await?;
    assert!(active.is_empty());

    Ok(())
}
