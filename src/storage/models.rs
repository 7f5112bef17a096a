//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a work or workflow run instance.
///
/// Legal transitions: `Pending -> Running -> {Success, Fail, Break, Abort}`,
/// plus `Aborting -> Abort` for externally requested cancellation. `Break`
/// means an ancestor in the DAG was cancelled or broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Success,
    Fail,
    Break,
    Aborting,
    Abort,
}

impl InstanceStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail | Self::Break | Self::Abort)
    }

    /// Still occupying a slot in the DAG: parents in these states block
    /// their children from dispatching.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Fail => write!(f, "fail"),
            Self::Break => write!(f, "break"),
            Self::Aborting => write!(f, "aborting"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "fail" => Ok(Self::Fail),
            "break" => Ok(Self::Break),
            "aborting" => Ok(Self::Aborting),
            "abort" => Ok(Self::Abort),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// How a run was requested. Auto runs come from the cron trigger layer and
/// are the only ones that fire notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceType {
    Manual,
    Auto,
}

impl std::fmt::Display for InstanceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl std::str::FromStr for InstanceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            _ => Err(format!("Unknown instance type: {}", s)),
        }
    }
}

/// One execution attempt of a work. Mutated exclusively by the run state
/// machine; one per (work, workflow run) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkInstance {
    pub id: String,
    pub work_id: String,
    /// Empty for a standalone run, else the owning workflow-run id.
    pub workflow_instance_id: Option<String>,
    pub status: InstanceStatus,
    pub instance_type: InstanceType,
    /// Scheduled-run gate: a versioned run may not start before its own
    /// timer has fired, even if its parents are already terminal.
    pub timer_fired: bool,
    /// Version id for scheduled runs; `None` for plain manual runs.
    pub version_id: Option<String>,
    /// Accumulated, timestamped transition log.
    pub submit_log: String,
    /// Result payload of a successful run.
    pub result_data: Option<String>,
    /// Remote application handle, when the work runs on a compute agent.
    pub remote_handle: Option<String>,
    /// Local process id, when the work runs as a local process.
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in seconds, stamped at terminal transition.
    pub duration_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkInstance {
    /// Fresh pending instance for a work.
    pub fn pending(work_id: &str, workflow_instance_id: Option<&str>, instance_type: InstanceType) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            work_id: work_id.to_string(),
            workflow_instance_id: workflow_instance_id.map(|s| s.to_string()),
            status: InstanceStatus::Pending,
            instance_type,
            timer_fired: false,
            version_id: None,
            submit_log: String::new(),
            result_data: None,
            remote_handle: None,
            pid: None,
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append one timestamped line to the submit log.
    pub fn append_log(&mut self, line: &str) {
        self.submit_log
            .push_str(&format!("{} {}\n", Utc::now().to_rfc3339(), line));
    }

    /// Stamp end time and duration from the recorded start time.
    pub fn stamp_finished(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_seconds = Some(
            self.started_at
                .map(|s| (now - s).num_seconds())
                .unwrap_or(0),
        );
    }
}

/// One execution of a workflow: the run group owning a set of work
/// instances. Its aggregate status mirrors the terminal end-node instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow_id: String,
    pub status: InstanceStatus,
    pub instance_type: InstanceType,
    /// Concatenation of all member runs' transition lines plus the final
    /// verdict. Only written while the flow lock is held.
    pub run_log: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn running(workflow_id: &str, instance_type: InstanceType) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            status: InstanceStatus::Running,
            instance_type,
            run_log: String::new(),
            started_at: Some(now),
            finished_at: None,
            duration_seconds: None,
            created_at: now,
        }
    }
}

/// Step ledger entry for one run's tick stream.
///
/// `process` is the highest step index committed so far. A step numbered N
/// is applied at most once: the ledger write is the commit point, checked
/// before any externally visible side effect is attempted a second time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkEvent {
    pub id: String,
    pub process: i64,
    /// Serialized `WorkRunContext` snapshot, everything a fresh process
    /// needs to resume the tick stream.
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkEvent {
    pub fn new(context: String) -> Self {
        Self::with_id(&uuid::Uuid::new_v4().to_string(), context)
    }

    /// Event keyed by a caller-chosen id. The engine uses the run instance
    /// id, which makes re-arming the same run naturally collapse onto one
    /// ledger row.
    pub fn with_id(id: &str, context: String) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            process: 0,
            context,
            created_at: now,
            updated_at: now,
        }
    }
}
