//! Wiring for a SQLite-backed queue with the built-in workflows.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use verdant_infra::jobs::{JobQueue, SqliteJobStore};
use verdant_infra::workflow::{Collaborators, WorkflowEngine, builtin_registry};

use crate::config::SyncConfig;
use crate::offline::Connectivity;
use crate::scheduler::{Scheduler, SchedulerHandle};

/// A running queue: store, engine and scheduler task.
pub struct SyncRuntime {
    queue: Arc<JobQueue<SqliteJobStore>>,
    connectivity: Connectivity,
    scheduler: SchedulerHandle,
}

impl SyncRuntime {
    /// Open the database, register the built-in workflows and start the
    /// scheduler.
    pub async fn start(config: SyncConfig, collaborators: Collaborators, connectivity: Connectivity) -> Result<Self> {
        config.validate()?;
        let store = SqliteJobStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open job store at {}", config.db_path.display()))?;
        let path = store.path().to_path_buf();
        let queue = Arc::new(JobQueue::new(store, config.queue));
        let registry = builtin_registry(&collaborators).context("invalid built-in workflow definitions")?;
        let engine = Arc::new(WorkflowEngine::new(queue.clone(), registry, config.engine));
        let scheduler = Scheduler::new(engine, connectivity.clone(), config.scheduler).start();

        info!(path = %path.display(), "sync runtime started");
        Ok(Self {
            queue,
            connectivity,
            scheduler,
        })
    }

    pub fn queue(&self) -> &Arc<JobQueue<SqliteJobStore>> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Stop the scheduler and close the database.
    pub async fn shutdown(self) -> Result<()> {
        self.scheduler.shutdown().await.context("scheduler did not stop cleanly")?;
        self.queue.store().close().await;
        Ok(())
    }
}
