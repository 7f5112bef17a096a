//! The run state machine.
//!
//! One `run_work` call is one tick. Ticks are re-entrant: every step either
//! short-circuits on persisted state (instance status, step ledger) or is
//! guarded by the run-group lock, so a duplicate or replayed tick converges
//! on the same terminal state without repeating side effects.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::executors::ExecutorRegistry;
use crate::notify::{NotificationSink, RunEvent};
use crate::storage::{InstanceStatus, InstanceType, SqliteStorage, WorkEvent, WorkInstance};
use crate::workflow::dag;

use super::abort::AbortRegistry;
use super::context::{EventType, WorkRunContext};
use super::ledger::{StepLedger, STEP_NOTIFY_START};
use super::locker::Locker;

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    /// The run needs more ticks.
    Continue,
    /// The tick stream is over: the driver deletes the ledger row and
    /// deregisters the trigger.
    Finished,
}

/// Seam to whatever drives tick streams, so the state machine can arm
/// children during fan-out without owning the trigger layer.
#[async_trait]
pub trait RunScheduler: Send + Sync {
    async fn arm(&self, ctx: &WorkRunContext);
}

/// Lock name guarding a workflow run group.
pub(crate) fn flow_lock_name(flow_instance_id: &str) -> String {
    format!("flow_{}", flow_instance_id)
}

enum StartOutcome {
    /// The run is past its start transition (or somebody else decided it).
    Proceed,
    /// Not startable yet; try again on the next tick.
    Retry,
}

pub struct WorkRunner {
    storage: SqliteStorage,
    locker: Locker,
    ledger: StepLedger,
    executors: ExecutorRegistry,
    notifier: Arc<dyn NotificationSink>,
    aborts: AbortRegistry,
}

impl WorkRunner {
    pub fn new(
        storage: SqliteStorage,
        executors: ExecutorRegistry,
        notifier: Arc<dyn NotificationSink>,
        aborts: AbortRegistry,
    ) -> Self {
        let locker = Locker::new(storage.clone());
        let ledger = StepLedger::new(storage.clone());
        Self {
            storage,
            locker,
            ledger,
            executors,
            notifier,
            aborts,
        }
    }

    /// Drive one run one tick forward.
    ///
    /// `Err` is fatal for the stream: the driver treats it like `Finished`.
    pub async fn run_work(
        &self,
        ctx: &WorkRunContext,
        scheduler: &dyn RunScheduler,
    ) -> Result<TickResult> {
        // A missing ledger row means the stream was finished elsewhere.
        self.storage.get_work_event(&ctx.event_id).await?;
        let instance = self.storage.get_work_instance(&ctx.instance_id).await?;

        if instance.status == InstanceStatus::Aborting {
            // An abort request got this far but crashed before the terminal
            // write; complete it here.
            let mut instance = instance;
            instance.status = InstanceStatus::Abort;
            instance.stamp_finished();
            instance.append_log("Run aborted");
            self.storage.save_work_instance(&instance).await?;
            return self.finalize(ctx, scheduler).await;
        }
        if instance.status.is_terminal() {
            // Lock contention or a crash left the run terminal with the
            // stream still armed; only the bookkeeping is left.
            return self.finalize(ctx, scheduler).await;
        }

        if instance.status == InstanceStatus::Pending {
            match self.start_run(ctx).await? {
                StartOutcome::Retry => return Ok(TickResult::Continue),
                StartOutcome::Proceed => {}
            }
        }

        let mut instance = self.storage.get_work_instance(&ctx.instance_id).await?;
        if instance.status.is_terminal() {
            // A parent's failure decided this run without executing it.
            return self.finalize(ctx, scheduler).await;
        }
        if instance.status != InstanceStatus::Running {
            return Ok(TickResult::Continue);
        }

        // Started notification, at most once per run.
        if self
            .ledger
            .advance_if_next(&ctx.event_id, STEP_NOTIFY_START)
            .await?
            && instance.instance_type == InstanceType::Auto
        {
            self.notifier.work_event(&instance, RunEvent::Started).await;
        }

        let executor = self.executors.get(ctx.work_type)?;
        let abort = self.aborts.register(&ctx.instance_id).await;
        let outcome = executor.execute(ctx, &mut instance, abort).await;

        match outcome {
            Ok(InstanceStatus::Running) => return Ok(TickResult::Continue),
            Ok(_) => {
                let mut latest = self.storage.get_work_instance(&ctx.instance_id).await?;
                // Abort may have landed while the executor ran; the status
                // write belongs to whoever got there first.
                if latest.status == InstanceStatus::Running {
                    if instance.result_data.is_some() {
                        latest.result_data = instance.result_data.clone();
                    }
                    latest.status = InstanceStatus::Success;
                    latest.stamp_finished();
                    latest.append_log("Run succeeded");
                    self.storage.save_work_instance(&latest).await?;
                    if latest.instance_type == InstanceType::Auto {
                        self.notifier.work_event(&latest, RunEvent::Succeeded).await;
                    }
                }
            }
            Err(e) => {
                let mut latest = self.storage.get_work_instance(&ctx.instance_id).await?;
                if latest.status == InstanceStatus::Running {
                    latest.status = InstanceStatus::Fail;
                    latest.stamp_finished();
                    latest.append_log(&e.to_string());
                    latest.append_log("Run failed");
                    self.storage.save_work_instance(&latest).await?;
                    if latest.instance_type == InstanceType::Auto {
                        self.notifier.work_event(&latest, RunEvent::Failed).await;
                    }
                }
            }
        }

        let instance = self.storage.get_work_instance(&ctx.instance_id).await?;
        if instance.status.is_terminal() {
            self.finalize(ctx, scheduler).await
        } else {
            Ok(TickResult::Continue)
        }
    }

    /// Pending -> Running transition (or a terminal verdict inherited from
    /// the parents).
    async fn start_run(&self, ctx: &WorkRunContext) -> Result<StartOutcome> {
        match ctx.event_type {
            EventType::Standalone => {
                let mut instance = self.storage.get_work_instance(&ctx.instance_id).await?;
                if instance.status != InstanceStatus::Pending {
                    return Ok(StartOutcome::Proceed);
                }
                self.mark_running(&mut instance).await?;
                Ok(StartOutcome::Proceed)
            }
            EventType::Workflow => {
                let flow_id = flow_id(ctx)?;
                let Some(lock) = self.locker.try_lock(&flow_lock_name(flow_id)).await? else {
                    debug!(flow = flow_id, work = %ctx.work_id, "Run group busy, deferring start");
                    return Ok(StartOutcome::Retry);
                };
                let outcome = self.start_flow_member(ctx, flow_id).await;
                self.locker.unlock(lock).await?;
                outcome
            }
        }
    }

    async fn start_flow_member(
        &self,
        ctx: &WorkRunContext,
        flow_id: &str,
    ) -> Result<StartOutcome> {
        // Double check under the lock; another tick may have started us.
        let mut instance = self.storage.get_work_instance(&ctx.instance_id).await?;
        if instance.status != InstanceStatus::Pending {
            return Ok(StartOutcome::Proceed);
        }

        // Scheduled runs wait for their own timer even when the parents are
        // already done.
        if instance.version_id.is_some() && !instance.timer_fired {
            return Ok(StartOutcome::Retry);
        }

        let parent_ids = dag::parents(&ctx.node_mapping, &ctx.work_id);
        if !parent_ids.is_empty() {
            let parents = self
                .storage
                .find_instances_by_works_and_flow(&parent_ids, flow_id)
                .await?;
            if parents.len() < parent_ids.len()
                || parents.iter().any(|p| !p.status.is_terminal())
            {
                return Ok(StartOutcome::Retry);
            }
            if parents
                .iter()
                .any(|p| matches!(p.status, InstanceStatus::Fail | InstanceStatus::Abort))
            {
                instance.status = InstanceStatus::Fail;
                instance.started_at = Some(Utc::now());
                instance.stamp_finished();
                instance.append_log("Parent failed, run will not start");
                self.storage.save_work_instance(&instance).await?;
                return Ok(StartOutcome::Proceed);
            }
            if parents.iter().any(|p| p.status == InstanceStatus::Break) {
                instance.status = InstanceStatus::Break;
                instance.started_at = Some(Utc::now());
                instance.stamp_finished();
                instance.append_log("Parent broken, run will not start");
                self.storage.save_work_instance(&instance).await?;
                return Ok(StartOutcome::Proceed);
            }
        }

        self.mark_running(&mut instance).await?;
        Ok(StartOutcome::Proceed)
    }

    async fn mark_running(&self, instance: &mut WorkInstance) -> Result<()> {
        instance.status = InstanceStatus::Running;
        instance.started_at = Some(Utc::now());
        instance.append_log("Run started");
        self.storage.save_work_instance(instance).await
    }

    /// Terminal bookkeeping: the ended notification (once), abort signal
    /// cleanup, and for workflow members the fan-out / fan-in pass.
    async fn finalize(
        &self,
        ctx: &WorkRunContext,
        scheduler: &dyn RunScheduler,
    ) -> Result<TickResult> {
        let instance = self.storage.get_work_instance(&ctx.instance_id).await?;
        if self.ledger.mark_finished(&ctx.event_id).await?
            && instance.instance_type == InstanceType::Auto
        {
            self.notifier.work_event(&instance, RunEvent::Ended).await;
        }
        self.aborts.unregister(&ctx.instance_id).await;

        if ctx.event_type == EventType::Standalone {
            return Ok(TickResult::Finished);
        }

        let flow_id = flow_id(ctx)?;
        let Some(lock) = self.locker.try_lock(&flow_lock_name(flow_id)).await? else {
            // Busy run group; retry the flow bookkeeping next tick.
            return Ok(TickResult::Continue);
        };
        let result = self.settle_flow(ctx, flow_id, scheduler).await;
        self.locker.unlock(lock).await?;
        result
    }

    /// Holding the run-group lock: either the whole flow is over (all end
    /// nodes terminal) and gets its verdict, or this node's children are
    /// armed.
    async fn settle_flow(
        &self,
        ctx: &WorkRunContext,
        flow_id: &str,
        scheduler: &dyn RunScheduler,
    ) -> Result<TickResult> {
        let mut flow = self.storage.get_workflow_instance(flow_id).await?;
        if flow.status.is_terminal() || flow.status == InstanceStatus::Aborting {
            // The abort flow (or an earlier settle) owns the verdict.
            return Ok(TickResult::Finished);
        }

        let end_ids = if ctx.dag_end_list.is_empty() {
            dag::end_nodes(&ctx.node_mapping, &ctx.node_list)
        } else {
            ctx.dag_end_list.clone()
        };
        let ends = self
            .storage
            .find_instances_by_works_and_flow(&end_ids, flow_id)
            .await?;
        let flow_over =
            ends.len() == end_ids.len() && ends.iter().all(|e| e.status.is_terminal());

        if flow_over {
            let failed = ends.iter().any(|e| e.status == InstanceStatus::Fail);
            flow.status = if failed {
                InstanceStatus::Fail
            } else {
                InstanceStatus::Success
            };
            let now = Utc::now();
            flow.finished_at = Some(now);
            flow.duration_seconds = Some(
                flow.started_at
                    .map(|s| (now - s).num_seconds())
                    .unwrap_or(0),
            );
            let mut log = self.storage.workflow_log(flow_id).await?;
            log.push_str(&format!(
                "{} Workflow {}\n",
                now.to_rfc3339(),
                if failed { "failed" } else { "succeeded" }
            ));
            flow.run_log = log;
            self.storage.save_workflow_instance(&flow).await?;
            if flow.instance_type == InstanceType::Auto {
                let event = if failed {
                    RunEvent::Failed
                } else {
                    RunEvent::Succeeded
                };
                self.notifier.workflow_event(&flow, event).await;
                self.notifier.workflow_event(&flow, RunEvent::Ended).await;
            }
            info!(flow = %flow.id, status = %flow.status, "Workflow run settled");
            return Ok(TickResult::Finished);
        }

        // Flow not over: arm the downstream frontier. A child that is already
        // terminal (aborted or broken before it ever started) owns no tick
        // stream of its own, so fan-out walks through it to its children
        // instead of stopping; otherwise everything below it would stay
        // pending forever. The child's own start pass re-checks its parents,
        // so a child armed by several parents is harmless.
        let mut frontier: VecDeque<String> =
            dag::children(&ctx.node_mapping, &ctx.work_id).into();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(child_work_id) = frontier.pop_front() {
            if !seen.insert(child_work_id.clone()) {
                continue;
            }
            let child = self
                .storage
                .find_instance_by_work_and_flow(&child_work_id, flow_id)
                .await?;
            if child.status.is_terminal() {
                frontier.extend(dag::children(&ctx.node_mapping, &child_work_id));
                continue;
            }
            let work = self.storage.get_work(&child_work_id).await?;
            let mut child_ctx =
                ctx.child(&child.id, &child.id, &work.id, work.work_type, work.config.clone());
            child_ctx.version_id = child.version_id.clone();
            let event = WorkEvent::with_id(&child.id, serde_json::to_string(&child_ctx)?);
            self.storage.create_work_event_if_absent(&event).await?;
            scheduler.arm(&child_ctx).await;
        }
        Ok(TickResult::Finished)
    }
}

fn flow_id(ctx: &WorkRunContext) -> Result<&str> {
    ctx.flow_instance_id.as_deref().ok_or_else(|| {
        Error::Workflow("Workflow event without a workflow instance id".into())
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    use super::*;
    use crate::engine::ledger::PROCESS_FINISHED;
    use crate::executors::BashExecutor;
    use crate::notify::testing::CollectingSink;
    use crate::storage::WorkflowInstance;
    use crate::workflow::{WorkDefinition, WorkType};

    #[derive(Clone, Default)]
    struct CollectingScheduler {
        armed: Arc<Mutex<Vec<WorkRunContext>>>,
    }

    impl CollectingScheduler {
        fn drain(&self) -> Vec<WorkRunContext> {
            self.armed.lock().unwrap().drain(..).collect()
        }
    }

    #[async_trait]
    impl RunScheduler for CollectingScheduler {
        async fn arm(&self, ctx: &WorkRunContext) {
            self.armed.lock().unwrap().push(ctx.clone());
        }
    }

    struct Harness {
        storage: SqliteStorage,
        runner: WorkRunner,
        sink: CollectingSink,
        scheduler: CollectingScheduler,
        locker: Locker,
    }

    fn harness() -> Harness {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut executors = ExecutorRegistry::new();
        executors.register(Arc::new(BashExecutor::new(storage.clone())));
        let sink = CollectingSink::new();
        let runner = WorkRunner::new(
            storage.clone(),
            executors,
            Arc::new(sink.clone()),
            AbortRegistry::new(),
        );
        let locker = Locker::new(storage.clone());
        Harness {
            storage,
            runner,
            sink,
            scheduler: CollectingScheduler::default(),
            locker,
        }
    }

    async fn standalone_run(h: &Harness, script: &str) -> WorkRunContext {
        let work_id = format!("w-{}", uuid::Uuid::new_v4());
        let instance = WorkInstance::pending(&work_id, None, InstanceType::Auto);
        h.storage.save_work_instance(&instance).await.unwrap();
        let ctx = WorkRunContext::standalone(
            &instance.id,
            &instance.id,
            &work_id,
            WorkType::Bash,
            serde_json::json!({ "script": script }),
        );
        let event = WorkEvent::with_id(&ctx.event_id, serde_json::to_string(&ctx).unwrap());
        h.storage.save_work_event(&event).await.unwrap();
        ctx
    }

    /// Build a workflow run: works, a running flow instance, pending member
    /// instances, and armed contexts for the start nodes.
    async fn workflow_run(
        h: &Harness,
        nodes: &[(&str, &str)],
        edges: &[(&str, &str)],
    ) -> (String, Vec<WorkRunContext>) {
        let node_list: Vec<String> = nodes.iter().map(|(id, _)| id.to_string()).collect();
        let mapping: Vec<(String, String)> = edges
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect();

        for (id, script) in nodes {
            let work = WorkDefinition {
                id: id.to_string(),
                name: id.to_string(),
                work_type: WorkType::Bash,
                config: serde_json::json!({ "script": script }),
            };
            h.storage.save_work(&work).await.unwrap();
        }

        let flow = WorkflowInstance::running("wf-1", InstanceType::Auto);
        h.storage.save_workflow_instance(&flow).await.unwrap();
        for id in &node_list {
            let member = WorkInstance::pending(id, Some(&flow.id), InstanceType::Auto);
            h.storage.save_work_instance(&member).await.unwrap();
        }

        let starts = dag::start_nodes(&mapping, &node_list);
        let ends = dag::end_nodes(&mapping, &node_list);
        let mut contexts = Vec::new();
        for id in &starts {
            let member = h
                .storage
                .find_instance_by_work_and_flow(id, &flow.id)
                .await
                .unwrap();
            let work = h.storage.get_work(id).await.unwrap();
            let ctx = WorkRunContext {
                event_id: member.id.clone(),
                instance_id: member.id.clone(),
                work_id: id.clone(),
                work_type: work.work_type,
                event_type: EventType::Workflow,
                flow_instance_id: Some(flow.id.clone()),
                version_id: None,
                config: work.config.clone(),
                node_list: node_list.clone(),
                node_mapping: mapping.clone(),
                dag_start_list: starts.clone(),
                dag_end_list: ends.clone(),
            };
            let event =
                WorkEvent::with_id(&ctx.event_id, serde_json::to_string(&ctx).unwrap());
            h.storage.save_work_event(&event).await.unwrap();
            contexts.push(ctx);
        }
        (flow.id, contexts)
    }

    /// Cooperative tick loop standing in for the ticker: requeues `Continue`
    /// streams, picks up contexts armed during fan-out, deletes finished
    /// ledger rows.
    async fn drive(h: &Harness, seeds: Vec<WorkRunContext>) {
        let mut queue: VecDeque<WorkRunContext> = seeds.into();
        let mut queued: HashSet<String> = queue.iter().map(|c| c.event_id.clone()).collect();
        let mut ticks = 0;
        while let Some(ctx) = queue.pop_front() {
            ticks += 1;
            assert!(ticks < 200, "tick loop did not converge");
            match h.runner.run_work(&ctx, &h.scheduler).await.unwrap() {
                TickResult::Continue => queue.push_back(ctx),
                TickResult::Finished => {
                    queued.remove(&ctx.event_id);
                    h.storage.delete_work_event(&ctx.event_id).await.unwrap();
                }
            }
            for armed in h.scheduler.drain() {
                if queued.insert(armed.event_id.clone()) {
                    queue.push_back(armed);
                }
            }
        }
    }

    async fn member(h: &Harness, work_id: &str, flow_id: &str) -> WorkInstance {
        h.storage
            .find_instance_by_work_and_flow(work_id, flow_id)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_standalone_run_succeeds_in_one_tick() {
        let h = harness();
        let ctx = standalone_run(&h, "echo hi").await;

        let result = h.runner.run_work(&ctx, &h.scheduler).await.unwrap();
        assert_eq!(result, TickResult::Finished);

        let instance = h.storage.get_work_instance(&ctx.instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Success);
        assert_eq!(instance.result_data.as_deref(), Some("hi\n"));
        assert!(instance.submit_log.contains("Run succeeded"));
        assert!(instance.duration_seconds.is_some());

        let event = h.storage.get_work_event(&ctx.event_id).await.unwrap();
        assert_eq!(event.process, PROCESS_FINISHED);
    }

    #[tokio::test]
    async fn test_double_tick_is_idempotent() {
        let h = harness();
        let ctx = standalone_run(&h, "echo once").await;

        assert_eq!(
            h.runner.run_work(&ctx, &h.scheduler).await.unwrap(),
            TickResult::Finished
        );
        // Replayed tick: already terminal, nothing repeats.
        assert_eq!(
            h.runner.run_work(&ctx, &h.scheduler).await.unwrap(),
            TickResult::Finished
        );

        let instance = h.storage.get_work_instance(&ctx.instance_id).await.unwrap();
        assert_eq!(
            instance.submit_log.matches("Running script").count(),
            1,
            "script must not run twice"
        );
        assert_eq!(h.sink.work_count(&ctx.instance_id, RunEvent::Started), 1);
        assert_eq!(h.sink.work_count(&ctx.instance_id, RunEvent::Succeeded), 1);
        assert_eq!(h.sink.work_count(&ctx.instance_id, RunEvent::Ended), 1);
    }

    #[tokio::test]
    async fn test_failed_run_records_the_error() {
        let h = harness();
        let ctx = standalone_run(&h, "echo nope >&2; exit 2").await;

        let result = h.runner.run_work(&ctx, &h.scheduler).await.unwrap();
        assert_eq!(result, TickResult::Finished);

        let instance = h.storage.get_work_instance(&ctx.instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Fail);
        assert!(instance.submit_log.contains("nope"));
        assert!(instance.submit_log.contains("Run failed"));
        assert_eq!(h.sink.work_count(&ctx.instance_id, RunEvent::Failed), 1);
    }

    #[tokio::test]
    async fn test_resume_after_crash_mid_run() {
        let h = harness();
        let ctx = standalone_run(&h, "echo resumed").await;

        // Simulate a process that died right after the start transition.
        let mut instance = h.storage.get_work_instance(&ctx.instance_id).await.unwrap();
        instance.status = InstanceStatus::Running;
        instance.started_at = Some(Utc::now());
        h.storage.save_work_instance(&instance).await.unwrap();

        let result = h.runner.run_work(&ctx, &h.scheduler).await.unwrap();
        assert_eq!(result, TickResult::Finished);
        let instance = h.storage.get_work_instance(&ctx.instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Success);
        assert_eq!(h.sink.work_count(&ctx.instance_id, RunEvent::Started), 1);
    }

    #[tokio::test]
    async fn test_aborting_run_is_completed_and_finished() {
        let h = harness();
        let ctx = standalone_run(&h, "echo never").await;

        let mut instance = h.storage.get_work_instance(&ctx.instance_id).await.unwrap();
        instance.status = InstanceStatus::Aborting;
        h.storage.save_work_instance(&instance).await.unwrap();

        let result = h.runner.run_work(&ctx, &h.scheduler).await.unwrap();
        assert_eq!(result, TickResult::Finished);
        let instance = h.storage.get_work_instance(&ctx.instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Abort);
        assert!(!instance.submit_log.contains("Run started"));
    }

    #[tokio::test]
    async fn test_diamond_fans_out_and_joins() {
        let h = harness();
        let (flow_id, seeds) = workflow_run(
            &h,
            &[
                ("A", "echo a"),
                ("B", "echo b"),
                ("C", "echo c"),
                ("D", "echo d"),
            ],
            &[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")],
        )
        .await;

        drive(&h, seeds).await;

        for node in ["A", "B", "C", "D"] {
            let instance = member(&h, node, &flow_id).await;
            assert_eq!(instance.status, InstanceStatus::Success, "node {}", node);
            assert_eq!(
                instance.submit_log.matches("Running script").count(),
                1,
                "node {} ran more than once",
                node
            );
        }
        let flow = h.storage.get_workflow_instance(&flow_id).await.unwrap();
        assert_eq!(flow.status, InstanceStatus::Success);
        assert!(flow.run_log.contains("Workflow succeeded"));
        assert!(flow.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_parent_failure_propagates_down_the_chain() {
        let h = harness();
        let (flow_id, seeds) = workflow_run(
            &h,
            &[("S", "echo s"), ("M", "exit 1"), ("E", "echo e")],
            &[("S", "M"), ("M", "E")],
        )
        .await;

        drive(&h, seeds).await;

        assert_eq!(member(&h, "S", &flow_id).await.status, InstanceStatus::Success);
        assert_eq!(member(&h, "M", &flow_id).await.status, InstanceStatus::Fail);
        let end = member(&h, "E", &flow_id).await;
        assert_eq!(end.status, InstanceStatus::Fail);
        assert!(end.submit_log.contains("Parent failed"));
        // The end node never executed.
        assert!(!end.submit_log.contains("Running script"));

        let flow = h.storage.get_workflow_instance(&flow_id).await.unwrap();
        assert_eq!(flow.status, InstanceStatus::Fail);
        assert!(flow.run_log.contains("Workflow failed"));
    }

    #[tokio::test]
    async fn test_member_aborted_before_start_does_not_strand_the_flow() {
        let h = harness();
        let (flow_id, seeds) = workflow_run(
            &h,
            &[("S", "echo s"), ("M", "echo m"), ("E", "echo e")],
            &[("S", "M"), ("M", "E")],
        )
        .await;

        // M is aborted while still pending, before it ever owned a tick
        // stream. Fan-out from S must walk through it and still reach E.
        let mut middle = member(&h, "M", &flow_id).await;
        middle.status = InstanceStatus::Abort;
        middle.stamp_finished();
        middle.append_log("Aborted before start");
        h.storage.save_work_instance(&middle).await.unwrap();

        drive(&h, seeds).await;

        assert_eq!(member(&h, "S", &flow_id).await.status, InstanceStatus::Success);
        assert_eq!(member(&h, "M", &flow_id).await.status, InstanceStatus::Abort);
        let end = member(&h, "E", &flow_id).await;
        assert_eq!(end.status, InstanceStatus::Fail);
        assert!(end.submit_log.contains("Parent failed"));

        let flow = h.storage.get_workflow_instance(&flow_id).await.unwrap();
        assert_eq!(flow.status, InstanceStatus::Fail);
        assert!(flow.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_busy_flow_lock_defers_start_and_finalization() {
        let h = harness();
        let (flow_id, seeds) = workflow_run(&h, &[("A", "echo a")], &[]).await;
        let ctx = seeds.into_iter().next().unwrap();

        // Somebody else holds the run group.
        let held = h
            .locker
            .try_lock(&flow_lock_name(&flow_id))
            .await
            .unwrap()
            .unwrap();

        // Start is deferred, nothing changes.
        assert_eq!(
            h.runner.run_work(&ctx, &h.scheduler).await.unwrap(),
            TickResult::Continue
        );
        let instance = h.storage.get_work_instance(&ctx.instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Pending);

        // Let the run execute, then grab the lock again before the
        // finalization tick.
        h.locker.unlock(held).await.unwrap();
        let mut instance = instance;
        instance.status = InstanceStatus::Running;
        instance.started_at = Some(Utc::now());
        h.storage.save_work_instance(&instance).await.unwrap();

        // Hold the lock while the run's terminal tick happens: execution
        // succeeds but the flow verdict must wait.
        let held = h
            .locker
            .try_lock(&flow_lock_name(&flow_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            h.runner.run_work(&ctx, &h.scheduler).await.unwrap(),
            TickResult::Continue
        );
        let instance = h.storage.get_work_instance(&ctx.instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Success);
        let flow = h.storage.get_workflow_instance(&flow_id).await.unwrap();
        assert_eq!(flow.status, InstanceStatus::Running);

        // Release and retry: the verdict lands, exactly one ended event.
        h.locker.unlock(held).await.unwrap();
        assert_eq!(
            h.runner.run_work(&ctx, &h.scheduler).await.unwrap(),
            TickResult::Finished
        );
        let flow = h.storage.get_workflow_instance(&flow_id).await.unwrap();
        assert_eq!(flow.status, InstanceStatus::Success);
        assert_eq!(h.sink.work_count(&ctx.instance_id, RunEvent::Ended), 1);
    }

    #[tokio::test]
    async fn test_version_gate_holds_until_timer_fires() {
        let h = harness();
        let (flow_id, seeds) = workflow_run(&h, &[("A", "echo a")], &[]).await;
        let ctx = seeds.into_iter().next().unwrap();

        let mut instance = h.storage.get_work_instance(&ctx.instance_id).await.unwrap();
        instance.version_id = Some("v1".into());
        h.storage.save_work_instance(&instance).await.unwrap();

        // Gated: the run stays pending tick after tick.
        for _ in 0..3 {
            assert_eq!(
                h.runner.run_work(&ctx, &h.scheduler).await.unwrap(),
                TickResult::Continue
            );
        }
        let instance = h.storage.get_work_instance(&ctx.instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Pending);

        // Timer fires; the run proceeds.
        let mut instance = instance;
        instance.timer_fired = true;
        h.storage.save_work_instance(&instance).await.unwrap();
        assert_eq!(
            h.runner.run_work(&ctx, &h.scheduler).await.unwrap(),
            TickResult::Finished
        );
        let instance = h.storage.get_work_instance(&ctx.instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Success);
        let flow = h.storage.get_workflow_instance(&flow_id).await.unwrap();
        assert_eq!(flow.status, InstanceStatus::Success);
    }

    #[tokio::test]
    async fn test_missing_event_row_is_fatal_for_the_stream() {
        let h = harness();
        let ctx = standalone_run(&h, "echo hi").await;
        h.storage.delete_work_event(&ctx.event_id).await.unwrap();

        let err = h.runner.run_work(&ctx, &h.scheduler).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
