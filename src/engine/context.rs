//! The serialized context snapshot that rides a run's tick stream.

use serde::{Deserialize, Serialize};

use crate::workflow::WorkType;

/// Whether a run stands alone or belongs to a workflow run group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Standalone,
    Workflow,
}

/// Everything a tick needs to resume a run: identities, the work's
/// configuration, and the DAG metadata inherited by fan-out. Persisted as
/// the step ledger's context snapshot so a fresh process can pick the run
/// back up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRunContext {
    /// Step ledger entry id for this tick stream.
    pub event_id: String,
    /// Run instance being driven.
    pub instance_id: String,
    pub work_id: String,
    pub work_type: WorkType,
    pub event_type: EventType,
    /// Owning workflow-run id; `None` for standalone runs.
    pub flow_instance_id: Option<String>,
    /// Version id for scheduled runs; gates execution until the run's own
    /// timer has fired.
    pub version_id: Option<String>,
    /// Work configuration, interpreted by the matching executor.
    pub config: serde_json::Value,
    /// DAG metadata, inherited unchanged by every fan-out.
    pub node_list: Vec<String>,
    pub node_mapping: Vec<(String, String)>,
    pub dag_start_list: Vec<String>,
    pub dag_end_list: Vec<String>,
}

impl WorkRunContext {
    /// Context for a standalone run of one work.
    pub fn standalone(
        event_id: &str,
        instance_id: &str,
        work_id: &str,
        work_type: WorkType,
        config: serde_json::Value,
    ) -> Self {
        Self {
            event_id: event_id.to_string(),
            instance_id: instance_id.to_string(),
            work_id: work_id.to_string(),
            work_type,
            event_type: EventType::Standalone,
            flow_instance_id: None,
            version_id: None,
            config,
            node_list: Vec::new(),
            node_mapping: Vec::new(),
            dag_start_list: Vec::new(),
            dag_end_list: Vec::new(),
        }
    }

    /// Context for a child node, inheriting this run's DAG metadata.
    pub fn child(
        &self,
        event_id: &str,
        instance_id: &str,
        work_id: &str,
        work_type: WorkType,
        config: serde_json::Value,
    ) -> Self {
        Self {
            event_id: event_id.to_string(),
            instance_id: instance_id.to_string(),
            work_id: work_id.to_string(),
            work_type,
            event_type: EventType::Workflow,
            flow_instance_id: self.flow_instance_id.clone(),
            version_id: None,
            config,
            node_list: self.node_list.clone(),
            node_mapping: self.node_mapping.clone(),
            dag_start_list: self.dag_start_list.clone(),
            dag_end_list: self.dag_end_list.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_inherits_dag_metadata() {
        let mut parent = WorkRunContext::standalone(
            "e1",
            "i1",
            "A",
            WorkType::Bash,
            serde_json::json!({}),
        );
        parent.event_type = EventType::Workflow;
        parent.flow_instance_id = Some("f1".into());
        parent.node_list = vec!["A".into(), "B".into()];
        parent.node_mapping = vec![("A".into(), "B".into())];
        parent.dag_start_list = vec!["A".into()];
        parent.dag_end_list = vec!["B".into()];

        let child = parent.child("e2", "i2", "B", WorkType::Bash, serde_json::json!({}));
        assert_eq!(child.event_type, EventType::Workflow);
        assert_eq!(child.flow_instance_id.as_deref(), Some("f1"));
        assert_eq!(child.node_mapping, parent.node_mapping);
        assert_eq!(child.dag_end_list, parent.dag_end_list);
        assert!(child.version_id.is_none());
    }

    #[test]
    fn test_context_round_trips_through_json() {
        let ctx = WorkRunContext::standalone(
            "e1",
            "i1",
            "w1",
            WorkType::SparkSql,
            serde_json::json!({"sql": "select 1"}),
        );
        let json = serde_json::to_string(&ctx).unwrap();
        let back: WorkRunContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.work_type, WorkType::SparkSql);
        assert_eq!(back.config["sql"], "select 1");
    }
}
