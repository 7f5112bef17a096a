//! Per-work-type executor plug-ins.
//!
//! The run state machine never knows what a work actually does: it resolves
//! an executor from the registry by the work's type tag and interprets the
//! three possible outcomes of `execute` (still running, success, failure).

mod bash;
mod spark_sql;

pub use bash::BashExecutor;
pub use spark_sql::SparkSqlExecutor;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::WorkRunContext;
use crate::error::{Error, Result};
use crate::storage::{InstanceStatus, WorkInstance};
use crate::workflow::WorkType;

/// Trait that all work executors implement.
///
/// `execute` is invoked once per tick. Contract:
/// - `Ok(InstanceStatus::Running)`: the work is still in flight (e.g. a
///   remote submission being polled); keep ticking, touch nothing else.
/// - `Ok(InstanceStatus::Success)`: the work finished; the state machine
///   performs the terminal transition.
/// - `Err(Error::Execution(..))`: the work failed; the message goes to the
///   run log verbatim.
///
/// Executors use the step ledger for any externally visible side effect
/// (remote submission, notification) so repeated ticks stay idempotent, and
/// poll `abort` between long operations for cooperative cancellation.
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    /// The work type this executor handles.
    fn work_type(&self) -> WorkType;

    /// Drive the work one step forward.
    async fn execute(
        &self,
        ctx: &WorkRunContext,
        instance: &mut WorkInstance,
        abort: Arc<AtomicBool>,
    ) -> Result<InstanceStatus>;

    /// Best-effort cancellation of whatever the work started (kill the
    /// remote application, terminate the local process).
    async fn abort(&self, instance: &WorkInstance) -> Result<()>;
}

/// Registry of executors, keyed by work type. Resolved once at startup.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<WorkType, Arc<dyn WorkExecutor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor.
    pub fn register(&mut self, executor: Arc<dyn WorkExecutor>) {
        self.executors.insert(executor.work_type(), executor);
    }

    /// Resolve the executor for a work type.
    pub fn get(&self, work_type: WorkType) -> Result<Arc<dyn WorkExecutor>> {
        self.executors
            .get(&work_type)
            .cloned()
            .ok_or_else(|| Error::Work(format!("No executor registered for work type '{}'", work_type)))
    }

    /// Whether a work type has an executor.
    pub fn has(&self, work_type: WorkType) -> bool {
        self.executors.contains_key(&work_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopExecutor;

    #[async_trait]
    impl WorkExecutor for NoopExecutor {
        fn work_type(&self) -> WorkType {
            WorkType::Bash
        }

        async fn execute(
            &self,
            _ctx: &WorkRunContext,
            _instance: &mut WorkInstance,
            _abort: Arc<AtomicBool>,
        ) -> Result<InstanceStatus> {
            Ok(InstanceStatus::Success)
        }

        async fn abort(&self, _instance: &WorkInstance) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_resolution() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(NoopExecutor));

        assert!(registry.has(WorkType::Bash));
        assert!(registry.get(WorkType::Bash).is_ok());
        assert!(registry.get(WorkType::SparkSql).is_err());
    }
}
