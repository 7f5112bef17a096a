//! Work and workflow definition types.
//!
//! Definitions are immutable descriptions created at design time and
//! read-only during execution. They are stored as YAML, the same way the
//! runtime accepts them from users.

use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::dag;

/// The kind of work a definition describes.
///
/// A closed enum rather than a free string: executors are resolved through a
/// registry keyed by this tag, once, at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    /// Local shell script.
    Bash,
    /// SQL submitted to a Spark compute agent.
    SparkSql,
}

impl std::fmt::Display for WorkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bash => write!(f, "bash"),
            Self::SparkSql => write!(f, "spark_sql"),
        }
    }
}

impl std::str::FromStr for WorkType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bash" => Ok(Self::Bash),
            "spark_sql" => Ok(Self::SparkSql),
            _ => Err(format!("Unknown work type: {}", s)),
        }
    }
}

/// Immutable description of one DAG node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkDefinition {
    pub id: String,
    pub name: String,
    pub work_type: WorkType,
    /// Type-specific configuration (script text, SQL, cluster reference...).
    /// Interpreted only by the matching executor.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A DAG of works: the ordered node list plus the edge list.
///
/// Edges run `(parent, child)`. Start and end nodes are derived, not stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    /// All node work ids, in user-declared order.
    pub node_list: Vec<String>,
    /// Dependency edges as `(parent, child)` pairs.
    #[serde(default)]
    pub node_mapping: Vec<(String, String)>,
}

impl WorkflowDefinition {
    /// Validate the definition: every edge endpoint must be a known node and
    /// the graph must be acyclic. Called at save time so the fan-out
    /// algorithm can assume a DAG at execution time.
    pub fn validate(&self) -> Result<()> {
        for (parent, child) in &self.node_mapping {
            if !self.node_list.contains(parent) {
                return Err(crate::Error::Workflow(format!(
                    "Edge references unknown node '{}'",
                    parent
                )));
            }
            if !self.node_list.contains(child) {
                return Err(crate::Error::Workflow(format!(
                    "Edge references unknown node '{}'",
                    child
                )));
            }
        }
        dag::validate_acyclic(&self.node_mapping, &self.node_list)
    }
}

/// Parse a work definition from YAML.
pub fn parse_work(yaml: &str) -> Result<WorkDefinition> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Parse a workflow definition from YAML.
pub fn parse_workflow(yaml: &str) -> Result<WorkflowDefinition> {
    let workflow: WorkflowDefinition = serde_yaml::from_str(yaml)?;
    workflow.validate()?;
    Ok(workflow)
}
