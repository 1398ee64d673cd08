//! Per-instance execution state and the records the engine persists
//! alongside it.
//!
//! `ExecutionState` holds durable fields only. In-flight parallel work
//! (spawned branch tasks, join bookkeeping) lives in the executor's
//! transient branch scope and is torn down when `advance` returns; the
//! persisted `(status, current_element, variables, pending_joins,
//! branch_arrivals)` tuple plus the definition is always enough to
//! resume.

use crate::error::EngineError;
use crate::model::Process;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle status of a process instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUSPENDED_AT_USER_TASK")]
    SuspendedAtUserTask,
    #[serde(rename = "SUSPENDED_ADMIN")]
    SuspendedAdmin,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "TERMINATED")]
    Terminated,
    #[serde(rename = "FAILED")]
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::SuspendedAtUserTask => "SUSPENDED_AT_USER_TASK",
            InstanceStatus::SuspendedAdmin => "SUSPENDED_ADMIN",
            InstanceStatus::Completed => "COMPLETED",
            InstanceStatus::Terminated => "TERMINATED",
            InstanceStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(InstanceStatus::Running),
            "SUSPENDED_AT_USER_TASK" => Some(InstanceStatus::SuspendedAtUserTask),
            "SUSPENDED_ADMIN" => Some(InstanceStatus::SuspendedAdmin),
            "COMPLETED" => Some(InstanceStatus::Completed),
            "TERMINATED" => Some(InstanceStatus::Terminated),
            "FAILED" => Some(InstanceStatus::Failed),
            _ => None,
        }
    }

    /// No further progress is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Terminated)
    }

    /// The instance counts as live for `get_active_instances`.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Running
                | InstanceStatus::SuspendedAtUserTask
                | InstanceStatus::SuspendedAdmin
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result a parallel branch recorded when it reached its join while a
/// sibling branch was still suspended: the join it arrived at and the
/// variable delta it produced relative to the fork-time snapshot. Keyed
/// by `<fork_id>:<branch_target>` in [`ExecutionState::branch_arrivals`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchArrival {
    pub join_id: String,
    pub variables: BTreeMap<String, String>,
}

/// The durable, mutable record of one running process instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionState {
    pub instance_id: Uuid,
    pub process_id: String,
    /// The node the interpreter will execute next, or is paused at.
    pub current_element: String,
    /// Variable values are opaque strings; JSON payloads keep their
    /// serialized form.
    pub variables: BTreeMap<String, String>,
    pub status: InstanceStatus,
    /// Join gateway id → remaining branch count, mirrored from the
    /// executor's branch scope whenever state persists while branches
    /// are outstanding.
    pub pending_joins: BTreeMap<String, u32>,
    /// Branches that already reached their join while a sibling
    /// suspended. Re-entering the fork replays these instead of
    /// re-executing the branch (and re-invoking its delegates). Cleared
    /// when the suspension epoch resolves.
    pub branch_arrivals: BTreeMap<String, BranchArrival>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    /// Construct the initial state for a fresh instance, positioned at
    /// the definition's start event with the flattened init data.
    pub fn new(process: &Process, init_data: &str) -> Result<Self, EngineError> {
        Ok(Self {
            instance_id: Uuid::new_v4(),
            process_id: process.id().to_string(),
            current_element: process.start_event_id().to_string(),
            variables: flatten_init_data(init_data)?,
            status: InstanceStatus::Running,
            pending_joins: BTreeMap::new(),
            branch_arrivals: BTreeMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        })
    }
}

/// Flatten caller-provided init data into the variable map.
///
/// A JSON object contributes its top-level keys; any other JSON value is
/// stored whole under `init_data`. Non-string values keep their compact
/// JSON encoding.
pub fn flatten_init_data(init_data: &str) -> Result<BTreeMap<String, String>, EngineError> {
    let trimmed = init_data.trim();
    if trimmed.is_empty() {
        return Ok(BTreeMap::new());
    }
    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| EngineError::Validation(format!("init data is not valid JSON: {e}")))?;
    let mut variables = BTreeMap::new();
    match value {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                variables.insert(key, json_to_variable(&value));
            }
        }
        other => {
            variables.insert("init_data".to_string(), json_to_variable(&other));
        }
    }
    Ok(variables)
}

/// String-encode a JSON value for variable storage: strings stay raw,
/// everything else keeps its compact JSON form.
pub fn json_to_variable(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Status of a persisted user task row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "COMPLETED" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

/// One outstanding (or completed) user task. At most one `Pending` row
/// exists per `(instance_id, task_id)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserTaskRecord {
    pub instance_id: Uuid,
    pub task_id: String,
    pub form_key: String,
    pub status: TaskStatus,
    /// Snapshot of the instance variables at suspension time, for form
    /// prefill.
    pub variables_snapshot: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only error log entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub instance_id: Uuid,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Read-only UI form definition looked up by id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormDef {
    pub id: String,
    pub process_id: String,
    pub description: String,
    pub schema: String,
    pub uischema: String,
}
