//! Per-run tick trigger.
//!
//! Every armed run gets its own interval task that calls the state machine
//! once per period. A database advisory lock per stream keeps at most one
//! tick of a given run in flight, across tasks and across processes. The
//! stream ends when a tick reports `Finished` (or errors): the ledger row is
//! deleted and the task unwinds itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::{Locker, RunScheduler, TickResult, WorkRunContext, WorkRunner};
use crate::storage::SqliteStorage;

fn tick_lock_name(event_id: &str) -> String {
    format!("tick_{}", event_id)
}

#[derive(Clone)]
pub struct Ticker {
    inner: Arc<TickerInner>,
}

struct TickerInner {
    storage: SqliteStorage,
    locker: Locker,
    runner: Arc<WorkRunner>,
    interval: Duration,
    jobs: tokio::sync::Mutex<HashMap<String, TickJob>>,
}

struct TickJob {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Ticker {
    pub fn new(storage: SqliteStorage, runner: Arc<WorkRunner>, interval: Duration) -> Self {
        let locker = Locker::new(storage.clone());
        Self {
            inner: Arc::new(TickerInner {
                storage,
                locker,
                runner,
                interval,
                jobs: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Arm a tick stream for a run. A stream already live under the same id
    /// is left alone; a finished one is replaced. Streams stop themselves,
    /// never mid-tick, so an in-flight tick always completes its lock scope.
    pub async fn register(&self, ctx: &WorkRunContext) {
        let mut jobs = self.inner.jobs.lock().await;
        if let Some(job) = jobs.get(&ctx.event_id) {
            if !job.handle.is_finished() {
                return;
            }
        }
        let event_id = ctx.event_id.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let ticker = self.clone();
        let ctx = ctx.clone();
        let stop_flag = stop.clone();
        let handle = tokio::spawn(async move { ticker.drive(ctx, stop_flag).await });
        jobs.insert(event_id, TickJob { stop, handle });
        debug!(streams = jobs.len(), "Tick stream armed");
    }

    async fn drive(&self, ctx: WorkRunContext, stop: Arc<AtomicBool>) {
        let mut interval = tokio::time::interval(self.inner.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if stop.load(Ordering::SeqCst) {
                break;
            }
            if self.tick_once(&ctx).await == TickResult::Finished {
                break;
            }
        }
        self.inner.jobs.lock().await.remove(&ctx.event_id);
    }

    /// One advisory-locked tick. A busy advisory lock means another tick of
    /// this run is in flight somewhere; skip, never queue.
    pub async fn tick_once(&self, ctx: &WorkRunContext) -> TickResult {
        let guard = match self.inner.locker.try_lock(&tick_lock_name(&ctx.event_id)).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!(event = %ctx.event_id, "Tick already in flight, skipping");
                return TickResult::Continue;
            }
            Err(e) => {
                error!(event = %ctx.event_id, error = %e, "Tick lock failed");
                return TickResult::Continue;
            }
        };

        let result = match self.inner.runner.run_work(ctx, self).await {
            Ok(result) => result,
            Err(e) => {
                // A fatal tick closes the stream; leaving it armed would
                // retrigger the same error forever.
                error!(event = %ctx.event_id, error = %e, "Tick failed, closing the stream");
                TickResult::Finished
            }
        };
        if result == TickResult::Finished {
            if let Err(e) = self.inner.storage.delete_work_event(&ctx.event_id).await {
                error!(event = %ctx.event_id, error = %e, "Could not delete the ledger row");
            }
            info!(event = %ctx.event_id, "Tick stream finished");
        }
        if let Err(e) = self.inner.locker.unlock(guard).await {
            error!(event = %ctx.event_id, error = %e, "Could not release the tick lock");
        }
        result
    }

    /// Stop a stream. The current tick, if any, completes; no further ticks
    /// fire.
    pub async fn deregister(&self, event_id: &str) {
        if let Some(job) = self.inner.jobs.lock().await.remove(event_id) {
            job.stop.store(true, Ordering::SeqCst);
        }
    }

    /// Signal every stream to stop after its current tick.
    pub async fn shutdown(&self) {
        let mut jobs = self.inner.jobs.lock().await;
        for job in jobs.values() {
            job.stop.store(true, Ordering::SeqCst);
        }
        jobs.clear();
    }

    /// Number of live streams.
    pub async fn active_streams(&self) -> usize {
        self.inner.jobs.lock().await.len()
    }
}

#[async_trait]
impl RunScheduler for Ticker {
    async fn arm(&self, ctx: &WorkRunContext) {
        self.register(ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AbortRegistry, EventType, WorkRunContext};
    use crate::executors::{BashExecutor, ExecutorRegistry};
    use crate::notify::LogSink;
    use crate::storage::{InstanceStatus, InstanceType, WorkEvent, WorkInstance, WorkflowInstance};
    use crate::workflow::WorkType;

    fn ticker_over(storage: &SqliteStorage) -> Ticker {
        let mut executors = ExecutorRegistry::new();
        executors.register(Arc::new(BashExecutor::new(storage.clone())));
        let runner = Arc::new(WorkRunner::new(
            storage.clone(),
            executors,
            Arc::new(LogSink),
            AbortRegistry::new(),
        ));
        Ticker::new(storage.clone(), runner, Duration::from_millis(20))
    }

    async fn standalone_run(storage: &SqliteStorage, script: &str) -> WorkRunContext {
        let instance = WorkInstance::pending("w1", None, InstanceType::Manual);
        storage.save_work_instance(&instance).await.unwrap();
        let ctx = WorkRunContext::standalone(
            &instance.id,
            &instance.id,
            "w1",
            WorkType::Bash,
            serde_json::json!({ "script": script }),
        );
        let event = WorkEvent::with_id(&ctx.event_id, serde_json::to_string(&ctx).unwrap());
        storage.save_work_event(&event).await.unwrap();
        ctx
    }

    async fn wait_until<F, Fut>(mut probe: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..250 {
            if probe().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_registered_stream_runs_to_completion() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let ticker = ticker_over(&storage);
        let ctx = standalone_run(&storage, "echo done").await;

        ticker.register(&ctx).await;
        wait_until(|| {
            let storage = storage.clone();
            let id = ctx.instance_id.clone();
            async move {
                storage.get_work_instance(&id).await.unwrap().status == InstanceStatus::Success
            }
        })
        .await;

        // The stream cleans up after itself: ledger row gone, task gone.
        wait_until(|| {
            let storage = storage.clone();
            let ticker = ticker.clone();
            let id = ctx.event_id.clone();
            async move {
                !storage.work_event_exists(&id).await.unwrap()
                    && ticker.active_streams().await == 0
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_register_is_idempotent_while_live() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let ticker = ticker_over(&storage);
        let ctx = standalone_run(&storage, "sleep 0.3; echo once").await;

        ticker.register(&ctx).await;
        ticker.register(&ctx).await;
        ticker.register(&ctx).await;
        assert_eq!(ticker.active_streams().await, 1);

        wait_until(|| {
            let storage = storage.clone();
            let id = ctx.instance_id.clone();
            async move {
                storage.get_work_instance(&id).await.unwrap().status == InstanceStatus::Success
            }
        })
        .await;
        let instance = storage.get_work_instance(&ctx.instance_id).await.unwrap();
        assert_eq!(instance.submit_log.matches("Running script").count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_ticks_of_one_run_single_execution() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let ticker = ticker_over(&storage);
        let ctx = standalone_run(&storage, "sleep 0.5; echo once").await;

        // Two ticks of the same run in flight: the advisory lock lets one
        // through, the other skips.
        let first = {
            let ticker = ticker.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { ticker.tick_once(&ctx).await })
        };
        let second = {
            let ticker = ticker.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { ticker.tick_once(&ctx).await })
        };

        let results = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(
            results.iter().filter(|r| **r == TickResult::Finished).count(),
            1
        );
        assert_eq!(
            results.iter().filter(|r| **r == TickResult::Continue).count(),
            1
        );

        let instance = storage.get_work_instance(&ctx.instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Success);
        assert_eq!(instance.submit_log.matches("Running script").count(), 1);
    }

    #[tokio::test]
    async fn test_fatal_tick_closes_the_stream() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let ticker = ticker_over(&storage);

        // Context pointing at an instance that does not exist.
        let ctx = WorkRunContext::standalone(
            "ghost",
            "ghost",
            "w1",
            WorkType::Bash,
            serde_json::json!({ "script": "echo hi" }),
        );
        let event = WorkEvent::with_id("ghost", "{}".into());
        storage.save_work_event(&event).await.unwrap();

        ticker.register(&ctx).await;
        wait_until(|| {
            let storage = storage.clone();
            let ticker = ticker.clone();
            async move {
                !storage.work_event_exists("ghost").await.unwrap()
                    && ticker.active_streams().await == 0
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_deregister_stops_an_idle_stream() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let ticker = ticker_over(&storage);

        // A workflow member whose run group is held stays pending forever.
        let flow = WorkflowInstance::running("wf", InstanceType::Manual);
        storage.save_workflow_instance(&flow).await.unwrap();
        let member = WorkInstance::pending("w1", Some(&flow.id), InstanceType::Manual);
        storage.save_work_instance(&member).await.unwrap();
        let mut ctx = WorkRunContext::standalone(
            &member.id,
            &member.id,
            "w1",
            WorkType::Bash,
            serde_json::json!({ "script": "echo hi" }),
        );
        ctx.event_type = EventType::Workflow;
        ctx.flow_instance_id = Some(flow.id.clone());
        ctx.node_list = vec!["w1".into()];
        let event = WorkEvent::with_id(&ctx.event_id, "{}".into());
        storage.save_work_event(&event).await.unwrap();

        let locker = Locker::new(storage.clone());
        let held = locker
            .try_lock(&format!("flow_{}", flow.id))
            .await
            .unwrap()
            .unwrap();

        ticker.register(&ctx).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticker.active_streams().await, 1);

        ticker.deregister(&ctx.event_id).await;
        wait_until(|| {
            let ticker = ticker.clone();
            async move { ticker.active_streams().await == 0 }
        })
        .await;

        // Nothing ran; the run is still pending.
        let instance = storage.get_work_instance(&member.id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Pending);
        locker.unlock(held).await.unwrap();
    }
}
