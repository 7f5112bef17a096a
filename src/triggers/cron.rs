//! Cron trigger layer.
//!
//! Schedules automatic (`Auto`) submissions of works and workflows. The
//! cron job only submits; from there the run is owned by the tick streams
//! like any other submission.

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::storage::InstanceType;

pub struct CronScheduler {
    scheduler: JobScheduler,
    engine: Arc<Engine>,
}

impl CronScheduler {
    pub async fn new(engine: Arc<Engine>) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| Error::Config(format!("Cron scheduler init failed: {:?}", e)))?;
        Ok(Self { scheduler, engine })
    }

    /// Schedule automatic runs of a work.
    pub async fn schedule_work(&self, work_id: &str, cron: &str) -> Result<()> {
        let engine = self.engine.clone();
        let id = work_id.to_string();
        let job = Job::new_async(cron, move |_job_id, _scheduler| {
            let engine = engine.clone();
            let id = id.clone();
            Box::pin(async move {
                if let Err(e) = engine.submit_work_with(&id, InstanceType::Auto).await {
                    error!(work = %id, error = %e, "Scheduled work submission failed");
                }
            })
        })
        .map_err(|e| Error::Config(format!("Invalid cron expression '{}': {:?}", cron, e)))?;
        self.scheduler
            .add(job)
            .await
            .map_err(|e| Error::Config(format!("Could not add cron job: {:?}", e)))?;
        info!(work = work_id, cron, "Work scheduled");
        Ok(())
    }

    /// Schedule automatic runs of a workflow.
    pub async fn schedule_workflow(&self, workflow_id: &str, cron: &str) -> Result<()> {
        let engine = self.engine.clone();
        let id = workflow_id.to_string();
        let job = Job::new_async(cron, move |_job_id, _scheduler| {
            let engine = engine.clone();
            let id = id.clone();
            Box::pin(async move {
                if let Err(e) = engine
                    .submit_workflow_with(&id, InstanceType::Auto, None)
                    .await
                {
                    error!(workflow = %id, error = %e, "Scheduled workflow submission failed");
                }
            })
        })
        .map_err(|e| Error::Config(format!("Invalid cron expression '{}': {:?}", cron, e)))?;
        self.scheduler
            .add(job)
            .await
            .map_err(|e| Error::Config(format!("Could not add cron job: {:?}", e)))?;
        info!(workflow = workflow_id, cron, "Workflow scheduled");
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler
            .start()
            .await
            .map_err(|e| Error::Config(format!("Cron scheduler start failed: {:?}", e)))
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| Error::Config(format!("Cron scheduler shutdown failed: {:?}", e)))
    }
}
