//! Execution engine.
//!
//! The `Engine` facade owns the pieces of the run machinery: storage, the
//! distributed locker, the executor registry, the per-run abort signals and
//! the ticker. Submitting a work or workflow creates the persistent run
//! state and arms a tick stream; everything after that happens inside the
//! state machine in [`runner`].

mod abort;
mod context;
mod ledger;
mod locker;
mod runner;

pub use abort::AbortRegistry;
pub use context::{EventType, WorkRunContext};
pub use ledger::{StepLedger, PROCESS_FINISHED, STEP_EXECUTE, STEP_NOTIFY_START};
pub use locker::{LockHandle, Locker};
pub use runner::{RunScheduler, TickResult, WorkRunner};

pub(crate) use runner::flow_lock_name;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::agent::HttpAgentClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executors::{BashExecutor, ExecutorRegistry, SparkSqlExecutor};
use crate::notify::{LogSink, NotificationSink};
use crate::storage::{
    InstanceStatus, InstanceType, SqliteStorage, WorkEvent, WorkInstance, WorkflowInstance,
};
use crate::triggers::Ticker;
use crate::workflow::{dag, WorkDefinition, WorkflowDefinition};

pub struct Engine {
    storage: SqliteStorage,
    locker: Locker,
    executors: ExecutorRegistry,
    aborts: AbortRegistry,
    ticker: Ticker,
}

impl Engine {
    /// Assemble an engine from configuration: sqlite storage, the bash
    /// executor, and the Spark SQL executor when an agent endpoint is
    /// configured.
    pub fn open(config: Config) -> Result<Self> {
        let storage = match &config.database_path {
            Some(path) => SqliteStorage::open(path)?,
            None => SqliteStorage::open_in_memory()?,
        };
        let mut executors = ExecutorRegistry::new();
        executors.register(Arc::new(BashExecutor::new(storage.clone())));
        match &config.agent.endpoint {
            Some(endpoint) => {
                let agent = Arc::new(HttpAgentClient::new(endpoint, config.agent.timeout_seconds)?);
                executors.register(Arc::new(SparkSqlExecutor::new(storage.clone(), agent)));
            }
            None => warn!("No agent endpoint configured, remote work types are unavailable"),
        }
        Ok(Self::new(
            storage,
            executors,
            Arc::new(LogSink),
            Duration::from_secs(config.tick_interval_seconds),
        ))
    }

    /// Assemble an engine from explicit parts.
    pub fn new(
        storage: SqliteStorage,
        executors: ExecutorRegistry,
        notifier: Arc<dyn NotificationSink>,
        tick_interval: Duration,
    ) -> Self {
        let aborts = AbortRegistry::new();
        let runner = Arc::new(WorkRunner::new(
            storage.clone(),
            executors.clone(),
            notifier,
            aborts.clone(),
        ));
        let ticker = Ticker::new(storage.clone(), runner, tick_interval);
        let locker = Locker::new(storage.clone());
        Self {
            storage,
            locker,
            executors,
            aborts,
            ticker,
        }
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn ticker(&self) -> &Ticker {
        &self.ticker
    }

    /// Save a work definition.
    pub async fn save_work(&self, work: &WorkDefinition) -> Result<()> {
        self.storage.save_work(work).await
    }

    /// Save a workflow definition. Rejected unless the graph is a DAG with
    /// known edge endpoints.
    pub async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        workflow.validate()?;
        self.storage.save_workflow(workflow).await
    }

    /// Submit a standalone manual run of a work. Returns the run instance
    /// id.
    pub async fn submit_work(&self, work_id: &str) -> Result<String> {
        self.submit_work_with(work_id, InstanceType::Manual).await
    }

    /// Submit a standalone run with an explicit instance type (the cron
    /// layer submits `Auto` runs).
    pub async fn submit_work_with(
        &self,
        work_id: &str,
        instance_type: InstanceType,
    ) -> Result<String> {
        let work = self.storage.get_work(work_id).await?;
        if !self.executors.has(work.work_type) {
            return Err(Error::Work(format!(
                "No executor registered for work type '{}'",
                work.work_type
            )));
        }

        let instance = WorkInstance::pending(work_id, None, instance_type);
        self.storage.save_work_instance(&instance).await?;

        let ctx = WorkRunContext::standalone(
            &instance.id,
            &instance.id,
            work_id,
            work.work_type,
            work.config.clone(),
        );
        let event = WorkEvent::with_id(&ctx.event_id, serde_json::to_string(&ctx)?);
        self.storage.create_work_event_if_absent(&event).await?;
        self.ticker.register(&ctx).await;
        info!(work = work_id, instance = %instance.id, "Work submitted");
        Ok(instance.id)
    }

    /// Submit a manual run of a workflow. Returns the workflow run id.
    pub async fn submit_workflow(&self, workflow_id: &str) -> Result<String> {
        self.submit_workflow_with(workflow_id, InstanceType::Manual, None)
            .await
    }

    /// Submit a workflow run: one running flow instance, one pending member
    /// per node, tick streams armed for the start nodes only. A version id
    /// marks every member as a scheduled run gated on its own timer.
    pub async fn submit_workflow_with(
        &self,
        workflow_id: &str,
        instance_type: InstanceType,
        version_id: Option<&str>,
    ) -> Result<String> {
        let workflow = self.storage.get_workflow(workflow_id).await?;
        workflow.validate()?;

        // Resolve every node's work up front so a missing definition or
        // executor fails the submission, not a member mid-flight.
        let mut works = Vec::with_capacity(workflow.node_list.len());
        for node in &workflow.node_list {
            let work = self.storage.get_work(node).await?;
            if !self.executors.has(work.work_type) {
                return Err(Error::Work(format!(
                    "No executor registered for work type '{}'",
                    work.work_type
                )));
            }
            works.push(work);
        }

        let flow = WorkflowInstance::running(workflow_id, instance_type);
        self.storage.save_workflow_instance(&flow).await?;
        for node in &workflow.node_list {
            let mut member = WorkInstance::pending(node, Some(&flow.id), instance_type);
            member.version_id = version_id.map(|v| v.to_string());
            self.storage.save_work_instance(&member).await?;
        }

        let starts = dag::start_nodes(&workflow.node_mapping, &workflow.node_list);
        let ends = dag::end_nodes(&workflow.node_mapping, &workflow.node_list);
        for node in &starts {
            let member = self
                .storage
                .find_instance_by_work_and_flow(node, &flow.id)
                .await?;
            let work = works
                .iter()
                .find(|w| &w.id == node)
                .ok_or_else(|| Error::Internal(format!("start node '{}' has no work", node)))?;
            let ctx = WorkRunContext {
                event_id: member.id.clone(),
                instance_id: member.id.clone(),
                work_id: work.id.clone(),
                work_type: work.work_type,
                event_type: EventType::Workflow,
                flow_instance_id: Some(flow.id.clone()),
                version_id: member.version_id.clone(),
                config: work.config.clone(),
                node_list: workflow.node_list.clone(),
                node_mapping: workflow.node_mapping.clone(),
                dag_start_list: starts.clone(),
                dag_end_list: ends.clone(),
            };
            let event = WorkEvent::with_id(&ctx.event_id, serde_json::to_string(&ctx)?);
            self.storage.create_work_event_if_absent(&event).await?;
            self.ticker.register(&ctx).await;
        }
        info!(workflow = workflow_id, flow = %flow.id, "Workflow submitted");
        Ok(flow.id)
    }

    /// Release the timer gate of a scheduled run.
    pub async fn fire_work_timer(&self, instance_id: &str) -> Result<()> {
        let mut instance = self.storage.get_work_instance(instance_id).await?;
        if !instance.timer_fired {
            instance.timer_fired = true;
            self.storage.save_work_instance(&instance).await?;
        }
        Ok(())
    }

    /// Abort a single run. No-op when the run is already terminal. Every
    /// status write goes through the storage guard so a tick that settles
    /// the run concurrently keeps its verdict.
    pub async fn abort_work(&self, instance_id: &str) -> Result<()> {
        let instance = self.storage.get_work_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(());
        }

        if self
            .storage
            .set_instance_status_if(instance_id, &[InstanceStatus::Pending], InstanceStatus::Abort)
            .await?
        {
            let mut latest = self.storage.get_work_instance(instance_id).await?;
            latest.stamp_finished();
            latest.append_log("Aborted before start");
            self.storage.save_work_instance(&latest).await?;
            return Ok(());
        }

        if self
            .storage
            .set_instance_status_if(
                instance_id,
                &[InstanceStatus::Running, InstanceStatus::Aborting],
                InstanceStatus::Aborting,
            )
            .await?
        {
            let mut latest = self.storage.get_work_instance(instance_id).await?;
            latest.append_log("Abort requested");
            self.storage.save_work_instance(&latest).await?;

            self.aborts.request_abort(instance_id).await;
            self.abort_via_executor(&latest).await;
        }

        // The executor abort is best-effort; whoever sees Aborting first
        // (here or the next tick) writes the terminal state.
        if self
            .storage
            .set_instance_status_if(instance_id, &[InstanceStatus::Aborting], InstanceStatus::Abort)
            .await?
        {
            let mut latest = self.storage.get_work_instance(instance_id).await?;
            latest.stamp_finished();
            latest.append_log("Run aborted");
            self.storage.save_work_instance(&latest).await?;
        }
        info!(instance = instance_id, "Run aborted");
        Ok(())
    }

    /// Abort a workflow run: pending members break, running members abort,
    /// the flow gets its `Abort` verdict. Holds the run-group lock for the
    /// whole pass so no member can settle the flow concurrently.
    pub async fn abort_workflow(&self, flow_instance_id: &str) -> Result<()> {
        let lock = self.locker.lock(&flow_lock_name(flow_instance_id)).await?;
        let result = self.abort_workflow_locked(flow_instance_id).await;
        self.locker.unlock(lock).await?;
        result
    }

    async fn abort_workflow_locked(&self, flow_instance_id: &str) -> Result<()> {
        let mut flow = self.storage.get_workflow_instance(flow_instance_id).await?;
        if flow.status.is_terminal() {
            return Ok(());
        }
        flow.status = InstanceStatus::Aborting;
        self.storage.save_workflow_instance(&flow).await?;

        // Member writes go through the status guard: a member whose tick
        // settled it between the list read and here keeps its verdict.
        for member in self.storage.find_instances_by_flow(flow_instance_id).await? {
            match member.status {
                InstanceStatus::Pending => {
                    if self
                        .storage
                        .set_instance_status_if(
                            &member.id,
                            &[InstanceStatus::Pending],
                            InstanceStatus::Break,
                        )
                        .await?
                    {
                        let mut latest = self.storage.get_work_instance(&member.id).await?;
                        latest.stamp_finished();
                        latest.append_log("Broken by workflow abort");
                        self.storage.save_work_instance(&latest).await?;
                    }
                }
                InstanceStatus::Running | InstanceStatus::Aborting => {
                    self.aborts.request_abort(&member.id).await;
                    self.abort_via_executor(&member).await;
                    if self
                        .storage
                        .set_instance_status_if(
                            &member.id,
                            &[InstanceStatus::Running, InstanceStatus::Aborting],
                            InstanceStatus::Abort,
                        )
                        .await?
                    {
                        let mut latest = self.storage.get_work_instance(&member.id).await?;
                        latest.stamp_finished();
                        latest.append_log("Run aborted");
                        self.storage.save_work_instance(&latest).await?;
                    }
                }
                _ => {}
            }
        }

        let now = Utc::now();
        flow.status = InstanceStatus::Abort;
        flow.finished_at = Some(now);
        flow.duration_seconds = Some(
            flow.started_at
                .map(|s| (now - s).num_seconds())
                .unwrap_or(0),
        );
        let mut log = self.storage.workflow_log(flow_instance_id).await?;
        log.push_str(&format!("{} Workflow aborted\n", now.to_rfc3339()));
        flow.run_log = log;
        self.storage.save_workflow_instance(&flow).await?;
        info!(flow = flow_instance_id, "Workflow run aborted");
        Ok(())
    }

    async fn abort_via_executor(&self, instance: &WorkInstance) {
        let work = match self.storage.get_work(&instance.work_id).await {
            Ok(work) => work,
            Err(_) => return,
        };
        if let Ok(executor) = self.executors.get(work.work_type) {
            if let Err(e) = executor.abort(instance).await {
                warn!(instance = %instance.id, error = %e, "Executor abort failed");
            }
        }
    }

    /// Re-arm every persisted tick stream. Called once at startup so runs
    /// interrupted by a crash resume where their ledger left off.
    pub async fn recover(&self) -> Result<usize> {
        let events = self.storage.list_work_events().await?;
        let mut recovered = 0;
        for event in events {
            match serde_json::from_str::<WorkRunContext>(&event.context) {
                Ok(ctx) => {
                    self.ticker.register(&ctx).await;
                    recovered += 1;
                }
                Err(e) => {
                    warn!(event = %event.id, error = %e, "Skipping unreadable ledger context");
                }
            }
        }
        if recovered > 0 {
            info!(streams = recovered, "Recovered tick streams");
        }
        Ok(recovered)
    }

    /// Stop all tick streams after their current tick.
    pub async fn shutdown(&self) {
        self.ticker.shutdown().await;
    }
}
