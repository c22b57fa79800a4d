//! qcqueue - distributed compute task queue.
//!
//! A passive, Postgres-backed queue for dispatching long-running calculations
//! to remote compute managers: skip-locked batch claims with priority/FIFO
//! ordering, outcome reconciliation onto the owning records, and
//! heartbeat-based recovery of work orphaned by dead managers.

pub mod config;
pub mod db;
pub mod liveness;

pub use config::Config;
pub use db::{
    AddedTasks, Database, DbError, DbResult, ManagerInfo, ManagerShutdown, ManagerStatus,
    ManagerUpdate, ModifyTasks, OutcomeSummary, OwningRecordRef, RecordId, RecordKind,
    RecordStatus, ResetTasks, TaskFilter, TaskId, TaskOutcome, TaskRecord, TaskStatus,
    TaskSubmission,
};
pub use liveness::{HeartbeatMonitor, LivenessConfig};
