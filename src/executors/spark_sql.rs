//! Spark SQL executor: dispatches the work to a remote compute agent.
//!
//! This is the polling executor shape: one ledger-guarded submission, then
//! one status poll per tick until the remote application reaches a terminal
//! state. The remote handle is persisted immediately after submission so a
//! restarted process can keep polling the same application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::{AgentClient, AgentHandle, SubmitRequest};
use crate::engine::{StepLedger, WorkRunContext, STEP_EXECUTE};
use crate::error::{Error, Result};
use crate::storage::{InstanceStatus, SqliteStorage, WorkInstance};
use crate::workflow::WorkType;

use super::WorkExecutor;

pub struct SparkSqlExecutor {
    storage: SqliteStorage,
    ledger: StepLedger,
    agent: Arc<dyn AgentClient>,
}

impl SparkSqlExecutor {
    pub fn new(storage: SqliteStorage, agent: Arc<dyn AgentClient>) -> Self {
        let ledger = StepLedger::new(storage.clone());
        Self {
            storage,
            ledger,
            agent,
        }
    }
}

#[async_trait]
impl WorkExecutor for SparkSqlExecutor {
    fn work_type(&self) -> WorkType {
        WorkType::SparkSql
    }

    async fn execute(
        &self,
        ctx: &WorkRunContext,
        instance: &mut WorkInstance,
        abort: Arc<AtomicBool>,
    ) -> Result<InstanceStatus> {
        let sql = ctx
            .config
            .get("sql")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        if sql.is_empty() {
            return Err(Error::Execution("SQL is empty".into()));
        }

        // One-shot submission; every later tick falls through to polling.
        if self.ledger.advance_if_next(&ctx.event_id, STEP_EXECUTE).await? {
            instance.append_log("Submitting to compute agent");
            self.storage.save_work_instance(instance).await?;

            let request = SubmitRequest {
                instance_id: instance.id.clone(),
                payload: ctx.config.clone(),
            };
            let handle = self
                .agent
                .submit(&request)
                .await
                .map_err(|e| Error::Execution(format!("Agent submission failed: {}", e)))?;

            instance.remote_handle = Some(handle.app_id.clone());
            instance.append_log(&format!("Submitted as application {}", handle.app_id));
            self.storage.save_work_instance(instance).await?;
            return Ok(InstanceStatus::Running);
        }

        let Some(app_id) = instance.remote_handle.clone() else {
            // The ledger says we submitted but the handle never got
            // persisted; the application is unreachable.
            return Err(Error::Execution(
                "Remote handle is missing after a restart".into(),
            ));
        };
        let handle = AgentHandle { app_id };

        if abort.load(Ordering::SeqCst) {
            let _ = self.agent.kill(&handle).await;
            return Err(Error::Execution("Remote application was aborted".into()));
        }

        let status = self
            .agent
            .get_status(&handle)
            .await
            .map_err(|e| Error::Execution(format!("Agent status poll failed: {}", e)))?;

        if status.is_active() {
            return Ok(InstanceStatus::Running);
        }
        if status.is_success() {
            let log = self.agent.get_log(&handle).await.unwrap_or_default();
            instance.result_data = Some(log);
            instance.append_log("Remote application succeeded");
            self.storage.save_work_instance(instance).await?;
            return Ok(InstanceStatus::Success);
        }
        if status.is_killed() {
            return Err(Error::Execution("Remote application was killed".into()));
        }

        let log = self.agent.get_log(&handle).await.unwrap_or_default();
        Err(Error::Execution(format!(
            "Remote application failed: {}",
            log.trim()
        )))
    }

    async fn abort(&self, instance: &WorkInstance) -> Result<()> {
        if let Some(app_id) = instance.remote_handle.clone() {
            self.agent.kill(&AgentHandle { app_id }).await?;
        }
        Ok(())
    }
}
