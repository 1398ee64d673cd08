//! Durable store protocol.
//!
//! The executor and façade operate exclusively through this trait,
//! enabling pluggable backends (MemoryStore for tests and embedded use,
//! Postgres for production). Absence of a row is `None`, never an error;
//! `StoreError` is reserved for infrastructure failures. Operations that
//! span multiple rows are transactional inside the implementation.

use crate::error::StoreError;
use crate::state::{ErrorRecord, ExecutionState, FormDef, UserTaskRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use uuid::Uuid;

#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Definitions ──

    /// Deploy a definition; returns the new version (1 for the first
    /// deployment of a process id).
    async fn save_definition(&self, process_id: &str, bpmn_xml: &str) -> Result<i32, StoreError>;

    /// XML of the highest deployed version.
    async fn load_definition(&self, process_id: &str) -> Result<Option<String>, StoreError>;

    // ── Instances ──

    /// Upsert the instance row and replace its variables, atomically.
    async fn save_instance(&self, state: &ExecutionState) -> Result<(), StoreError>;

    async fn load_instance(&self, instance_id: Uuid)
        -> Result<Option<ExecutionState>, StoreError>;

    /// Instances whose status is RUNNING, SUSPENDED_AT_USER_TASK or
    /// SUSPENDED_ADMIN.
    async fn active_instances(&self) -> Result<Vec<Uuid>, StoreError>;

    // ── User tasks ──

    /// Record a pending user task with its variables snapshot. Idempotent:
    /// an existing PENDING row for `(instance_id, task_id)` is left
    /// untouched.
    async fn save_user_task(
        &self,
        instance_id: Uuid,
        task_id: &str,
        form_key: &str,
        variables_snapshot: &BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Mark the PENDING row completed. Returns false when no PENDING row
    /// exists.
    async fn complete_user_task(&self, instance_id: Uuid, task_id: &str)
        -> Result<bool, StoreError>;

    /// Mark the PENDING row completed and persist the updated instance
    /// state, in one transaction. Returns false (and persists nothing)
    /// when no PENDING row exists for `(state.instance_id, task_id)`.
    async fn complete_task_transition(
        &self,
        state: &ExecutionState,
        task_id: &str,
    ) -> Result<bool, StoreError>;

    async fn pending_tasks(&self, instance_id: Uuid) -> Result<Vec<UserTaskRecord>, StoreError>;

    /// Most recent task row for `(instance_id, task_id)`, pending rows
    /// first.
    async fn find_task(
        &self,
        instance_id: Uuid,
        task_id: &str,
    ) -> Result<Option<UserTaskRecord>, StoreError>;

    // ── Error log ──

    async fn append_error(&self, instance_id: Uuid, message: &str) -> Result<(), StoreError>;

    async fn load_errors(&self, instance_id: Uuid) -> Result<Vec<ErrorRecord>, StoreError>;

    // ── Forms ──

    async fn form_by_id(&self, form_id: &str) -> Result<Option<FormDef>, StoreError>;
}
