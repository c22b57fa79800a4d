//! Administrative CLI for the task queue.
//!
//! `monitor` runs the heartbeat sweep until interrupted; the remaining
//! subcommands are thin wrappers over the store operations for operator use.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qcqueue::{Config, Database, HeartbeatMonitor, ManagerStatus, ResetTasks, TaskFilter, TaskStatus};

#[derive(Parser)]
#[command(name = "qcqueue-admin", about = "Task queue administration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the heartbeat-timeout sweep until Ctrl+C
    Monitor,
    /// List registered managers
    Managers {
        /// Filter by status (active/inactive)
        #[arg(long)]
        status: Option<String>,
    },
    /// List queued tasks
    Tasks {
        /// Filter by status (waiting/running/error/complete)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Shut down a manager and return its in-flight tasks to the pool
    ResetManager { name: String },
    /// Restart all errored tasks for a manager
    RestartErrors { manager: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::from_env()?;
    let db = Arc::new(
        Database::connect_with_pool_size(&config.database_url, config.pool_size).await?,
    );

    match cli.command {
        Command::Monitor => {
            let monitor = HeartbeatMonitor::start(config.liveness_config(), Arc::clone(&db));
            info!("heartbeat monitor started, press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutdown signal received");
            monitor.shutdown().await?;
        }
        Command::Managers { status } => {
            let status = status.as_deref().map(parse_manager_status).transpose()?;
            let managers = db.get_managers(None, status, None).await?;
            for m in managers {
                println!(
                    "{}\t{}\tsubmitted={} completed={} returned={} failures={}\tlast heartbeat {}",
                    m.name,
                    m.status.as_str(),
                    m.submitted,
                    m.completed,
                    m.returned,
                    m.failures,
                    m.modified_at
                );
            }
        }
        Command::Tasks { status, limit } => {
            let status = status.as_deref().map(parse_task_status).transpose()?;
            let tasks = db
                .get_tasks(&TaskFilter {
                    status,
                    limit: Some(limit),
                    ..Default::default()
                })
                .await?;
            for t in tasks {
                println!(
                    "{}\t{}\t{}\tpriority={}\ttag={}\tmanager={}",
                    t.id,
                    t.status.as_str(),
                    t.program,
                    t.priority,
                    t.tag.as_deref().unwrap_or("-"),
                    t.manager.as_deref().unwrap_or("-")
                );
            }
        }
        Command::ResetManager { name } => {
            let shutdown = db.shutdown_managers(&[name]).await?;
            println!(
                "deactivated {} manager(s), returned {} task(s) to the pool",
                shutdown.managers.len(),
                shutdown.tasks_reset
            );
        }
        Command::RestartErrors { manager } => {
            let count = db
                .reset_tasks(&ResetTasks {
                    manager: Some(manager),
                    reset_error: true,
                    ..Default::default()
                })
                .await?;
            println!("restarted {count} errored task(s)");
        }
    }

    Ok(())
}

fn parse_manager_status(s: &str) -> Result<ManagerStatus> {
    ManagerStatus::parse(s).ok_or_else(|| anyhow::anyhow!("unknown manager status {s:?}"))
}

fn parse_task_status(s: &str) -> Result<TaskStatus> {
    TaskStatus::parse(s).ok_or_else(|| anyhow::anyhow!("unknown task status {s:?}"))
}
