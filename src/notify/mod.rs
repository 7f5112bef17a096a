//! Notification sink for run lifecycle events.
//!
//! Strictly fire-and-forget: the state machine calls the sink and moves on.
//! A sink that fails must swallow (and log) its own errors; a notification
//! failure never fails the run.

use async_trait::async_trait;
use tracing::info;

use crate::storage::{WorkInstance, WorkflowInstance};

/// Lifecycle moments the state machine reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Started,
    Succeeded,
    Failed,
    Ended,
}

impl std::fmt::Display for RunEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

/// Sink for run and workflow-run lifecycle notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn work_event(&self, instance: &WorkInstance, event: RunEvent);
    async fn workflow_event(&self, instance: &WorkflowInstance, event: RunEvent);
}

/// Default sink: structured log lines only.
#[derive(Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn work_event(&self, instance: &WorkInstance, event: RunEvent) {
        info!(
            instance_id = %instance.id,
            work_id = %instance.work_id,
            status = %instance.status,
            "Work run {}",
            event
        );
    }

    async fn workflow_event(&self, instance: &WorkflowInstance, event: RunEvent) {
        info!(
            workflow_instance_id = %instance.id,
            workflow_id = %instance.workflow_id,
            status = %instance.status,
            "Workflow run {}",
            event
        );
    }
}
