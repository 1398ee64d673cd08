//! The engine façade: coordinates parser, executor and store behind a
//! small, serialized API.
//!
//! At most one operation runs against a given instance at a time (a
//! per-instance mutex, created on demand); operations on different
//! instances run in parallel. Parsed definitions are cached by process
//! id and rehydrate from the store on miss, so a façade built over an
//! existing store picks up live instances after a restart.

#[cfg(feature = "postgres")]
use crate::config::DatabaseConfig;
use crate::delegate::DelegateRegistry;
use crate::error::EngineError;
use crate::executor::{AdvanceOutcome, ProcessExecutor};
use crate::expression::{ExpressionEvaluator, SimpleConditionEvaluator};
use crate::model::{ElementKind, Process};
use crate::parser;
use crate::state::{json_to_variable, ExecutionState, InstanceStatus, UserTaskRecord};
use crate::store::ProcessStore;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub struct BpmnEngine {
    store: Arc<dyn ProcessStore>,
    executor: ProcessExecutor,
    /// process id → parsed definition.
    definitions: RwLock<HashMap<String, Arc<Process>>>,
    /// instance id → per-instance serialization mutex.
    instance_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// instance id → cancellation signal for in-flight branches and
    /// delegates.
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl BpmnEngine {
    /// Engine with no delegates and the built-in condition evaluator.
    pub fn new(store: Arc<dyn ProcessStore>) -> Self {
        Self::with_components(
            store,
            Arc::new(DelegateRegistry::new()),
            Arc::new(SimpleConditionEvaluator),
        )
    }

    /// Engine with an explicit delegate registry and expression
    /// evaluator.
    pub fn with_components(
        store: Arc<dyn ProcessStore>,
        delegates: Arc<DelegateRegistry>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            executor: ProcessExecutor::new(store.clone(), delegates, evaluator),
            store,
            definitions: RwLock::new(HashMap::new()),
            instance_locks: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Bound on a single service-task delegate execution (default 30s).
    pub fn with_delegate_timeout(mut self, timeout: Duration) -> Self {
        self.executor = self.executor.with_delegate_timeout(timeout);
        self
    }

    /// Connect to PostgreSQL, apply the schema, and build an engine over
    /// the resulting store.
    #[cfg(feature = "postgres")]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, EngineError> {
        let store = crate::store_postgres::PostgresStore::connect(config).await?;
        Ok(Self::new(Arc::new(store)))
    }

    // ── Definitions ──

    /// Deploy a definition so instances can later be started by process
    /// id. Returns the process id and the deployed version.
    pub async fn deploy_process(&self, bpmn_xml: &str) -> Result<(String, i32), EngineError> {
        let process = self.parse_definition(bpmn_xml)?;
        let version = self.store.save_definition(process.id(), bpmn_xml).await?;
        info!(process_id = %process.id(), version, "process definition deployed");
        self.definitions
            .write()
            .await
            .insert(process.id().to_string(), process.clone());
        Ok((process.id().to_string(), version))
    }

    // ── Starting instances ──

    /// Parse and deploy the definition, then start an instance of it.
    pub async fn start_process(
        &self,
        bpmn_xml: &str,
        init_data: &str,
    ) -> Result<Uuid, EngineError> {
        let process = self.parse_definition(bpmn_xml)?;
        self.store.save_definition(process.id(), bpmn_xml).await?;
        self.definitions
            .write()
            .await
            .insert(process.id().to_string(), process.clone());
        self.launch(process, init_data).await
    }

    pub async fn start_process_from_file(
        &self,
        path: &Path,
        init_data: &str,
    ) -> Result<Uuid, EngineError> {
        let xml = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Validation(format!("cannot read {}: {e}", path.display()))
        })?;
        self.start_process(&xml, init_data).await
    }

    /// Start an instance of the latest deployed version of a process.
    pub async fn start_process_by_id(
        &self,
        process_id: &str,
        init_data: &str,
    ) -> Result<Uuid, EngineError> {
        let process = self.definition(process_id).await?;
        self.launch(process, init_data).await
    }

    // ── Task completion and signals ──

    /// Complete a pending user task: merge the result into the instance
    /// variables and drive the instance forward.
    pub async fn complete_task(
        &self,
        instance_id: &str,
        task_id: &str,
        data_json: &str,
    ) -> Result<(), EngineError> {
        let id = parse_instance_id(instance_id)?;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut state = self.load_required(id).await?;
        if state.status != InstanceStatus::SuspendedAtUserTask {
            return Err(EngineError::Conflict(format!(
                "cannot complete task {task_id}: instance {id} is {}",
                state.status
            )));
        }
        let process = self.definition(&state.process_id).await?;
        let element = process.element(task_id).ok_or_else(|| {
            EngineError::NotFound(format!("task not found in definition: {task_id}"))
        })?;
        if !matches!(element.kind, ElementKind::UserTask { .. }) {
            return Err(EngineError::Validation(format!(
                "{task_id} is not a user task"
            )));
        }
        let updates = parse_result_object(data_json)?;

        // The instance either paused directly on this task, or on the
        // fork whose branch contains it.
        let linear = state.current_element == task_id;
        let at_fork = process
            .element(&state.current_element)
            .map(|e| {
                matches!(e.kind, ElementKind::ParallelGateway)
                    && process.outgoing_count(&e.id) > 1
            })
            .unwrap_or(false);
        if !linear && !at_fork {
            return Err(EngineError::Conflict(format!(
                "instance {id} is not suspended at task {task_id}"
            )));
        }

        if linear {
            // Move past the task now so the re-advance starts on its
            // successor.
            let flows = process.outgoing_flows(task_id);
            state.current_element = match flows.as_slice() {
                [only] => only.target_ref.clone(),
                _ => {
                    let err = EngineError::MalformedProcess(format!(
                        "user task {task_id} must have exactly one outgoing sequence flow"
                    ));
                    self.store.append_error(id, &err.to_string()).await?;
                    state.status = InstanceStatus::Failed;
                    self.store.save_instance(&state).await?;
                    self.forget_instance(id).await;
                    return Err(err);
                }
            };
        }
        state.variables.extend(updates);
        state.status = InstanceStatus::Running;

        if !self.store.complete_task_transition(&state, task_id).await? {
            return Err(EngineError::NotFound(format!(
                "no pending task {task_id} for instance {id}"
            )));
        }
        info!(instance_id = %id, task = %task_id, "user task completed");

        self.drive(process, &mut state).await?;
        Ok(())
    }

    /// Extension point stub: persists the correlation data blob against
    /// the instance without advancing it.
    pub async fn signal_event(
        &self,
        instance_id: &str,
        event_id: &str,
        data_json: &str,
    ) -> Result<(), EngineError> {
        let id = parse_instance_id(instance_id)?;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut state = self.load_required(id).await?;
        state
            .variables
            .insert(format!("signal_{event_id}"), data_json.to_string());
        self.store.save_instance(&state).await?;
        info!(instance_id = %id, event = %event_id, "signal recorded");
        Ok(())
    }

    // ── Queries ──

    pub async fn get_process_state(
        &self,
        instance_id: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let id = parse_instance_id(instance_id)?;
        let state = self.load_required(id).await?;
        Ok(serde_json::json!({
            "instance_id": id.to_string(),
            "status": state.status.as_str(),
            "current_element": state.current_element,
            "variables": state.variables,
        }))
    }

    pub async fn get_active_tasks(
        &self,
        instance_id: &str,
    ) -> Result<Vec<UserTaskRecord>, EngineError> {
        let id = parse_instance_id(instance_id)?;
        self.load_required(id).await?;
        Ok(self.store.pending_tasks(id).await?)
    }

    pub async fn get_active_instances(&self) -> Result<Vec<String>, EngineError> {
        Ok(self
            .store
            .active_instances()
            .await?
            .into_iter()
            .map(|id| id.to_string())
            .collect())
    }

    pub async fn is_process_active(&self, instance_id: &str) -> Result<bool, EngineError> {
        let Ok(id) = Uuid::parse_str(instance_id) else {
            return Ok(false);
        };
        Ok(self
            .store
            .load_instance(id)
            .await?
            .map(|s| s.status.is_active())
            .unwrap_or(false))
    }

    /// Read-only lookup of a UI form definition. Schema and uischema are
    /// returned as parsed JSON when they hold valid JSON text.
    pub async fn get_form_by_id(&self, form_id: &str) -> Result<serde_json::Value, EngineError> {
        let form = self
            .store
            .form_by_id(form_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("form not found: {form_id}")))?;
        let schema = serde_json::from_str(&form.schema)
            .unwrap_or(serde_json::Value::String(form.schema.clone()));
        let uischema = serde_json::from_str(&form.uischema)
            .unwrap_or(serde_json::Value::String(form.uischema.clone()));
        Ok(serde_json::json!({
            "id": form.id,
            "processId": form.process_id,
            "description": form.description,
            "schema": schema,
            "uischema": uischema,
        }))
    }

    // ── Lifecycle control ──

    pub async fn suspend_process(&self, instance_id: &str) -> Result<(), EngineError> {
        let id = parse_instance_id(instance_id)?;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut state = self.load_required(id).await?;
        if state.status != InstanceStatus::Running {
            return Err(EngineError::Conflict(format!(
                "cannot suspend instance {id} in status {}",
                state.status
            )));
        }
        state.status = InstanceStatus::SuspendedAdmin;
        self.store.save_instance(&state).await?;
        info!(instance_id = %id, "process suspended");
        Ok(())
    }

    pub async fn resume_process(&self, instance_id: &str) -> Result<(), EngineError> {
        let id = parse_instance_id(instance_id)?;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut state = self.load_required(id).await?;
        if state.status != InstanceStatus::SuspendedAdmin {
            return Err(EngineError::Conflict(format!(
                "cannot resume instance {id} in status {}",
                state.status
            )));
        }
        state.status = InstanceStatus::Running;
        self.store.save_instance(&state).await?;
        info!(instance_id = %id, "process resumed");

        let process = self.definition(&state.process_id).await?;
        self.drive(process, &mut state).await?;
        Ok(())
    }

    /// Terminate an instance. Idempotent on already-terminal instances;
    /// in-flight branches and delegates are cancelled at their next
    /// cooperative checkpoint.
    pub async fn terminate_process(&self, instance_id: &str) -> Result<(), EngineError> {
        let id = parse_instance_id(instance_id)?;

        // Fire the cancellation before queueing on the instance lock so
        // an in-flight advance can reach a checkpoint and release it.
        if let Some(token) = self.cancellations.lock().await.get(&id) {
            token.cancel();
        }

        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut state = self.load_required(id).await?;
        if state.status.is_terminal() {
            return Ok(());
        }
        for task in self.store.pending_tasks(id).await? {
            self.store.complete_user_task(id, &task.task_id).await?;
        }
        state.status = InstanceStatus::Terminated;
        state.completed_at = Some(Utc::now());
        state.pending_joins.clear();
        state.branch_arrivals.clear();
        self.store.save_instance(&state).await?;
        info!(instance_id = %id, "process terminated");
        self.forget_instance(id).await;
        Ok(())
    }

    // ── Internals ──

    fn parse_definition(&self, bpmn_xml: &str) -> Result<Arc<Process>, EngineError> {
        if bpmn_xml.trim().is_empty() {
            return Err(EngineError::Validation(
                "process definition is empty".into(),
            ));
        }
        Ok(Arc::new(parser::parse_str(bpmn_xml)?))
    }

    async fn launch(
        &self,
        process: Arc<Process>,
        init_data: &str,
    ) -> Result<Uuid, EngineError> {
        let mut state = ExecutionState::new(&process, init_data)?;
        let instance_id = state.instance_id;

        let lock = self.lock_for(instance_id).await;
        let _guard = lock.lock().await;
        self.store.save_instance(&state).await?;

        self.drive(process, &mut state).await?;
        Ok(instance_id)
    }

    /// Run the executor and drop the per-instance bookkeeping once the
    /// instance can no longer advance: completed, or failed with the
    /// error already recorded against it. Store errors keep the entries,
    /// since the instance may still make progress on a later retry.
    async fn drive(
        &self,
        process: Arc<Process>,
        state: &mut ExecutionState,
    ) -> Result<AdvanceOutcome, EngineError> {
        let instance_id = state.instance_id;
        let cancel = self.cancellation_for(instance_id).await;
        let result = self.executor.advance(process, state, cancel).await;
        if matches!(result, Ok(AdvanceOutcome::Completed))
            || state.status == InstanceStatus::Failed
        {
            self.forget_instance(instance_id).await;
        }
        result
    }

    /// Definition cache with store rehydration, so a fresh façade over an
    /// existing store serves live instances.
    async fn definition(&self, process_id: &str) -> Result<Arc<Process>, EngineError> {
        if let Some(process) = self.definitions.read().await.get(process_id) {
            return Ok(process.clone());
        }
        let xml = self
            .store
            .load_definition(process_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("process definition not found: {process_id}"))
            })?;
        let process = Arc::new(parser::parse_str(&xml)?);
        self.definitions
            .write()
            .await
            .insert(process_id.to_string(), process.clone());
        Ok(process)
    }

    async fn load_required(&self, instance_id: Uuid) -> Result<ExecutionState, EngineError> {
        self.store
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("process instance not found: {instance_id}"))
            })
    }

    async fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.instance_locks.lock().await;
        locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn cancellation_for(&self, instance_id: Uuid) -> CancellationToken {
        let mut tokens = self.cancellations.lock().await;
        tokens
            .entry(instance_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    async fn forget_instance(&self, instance_id: Uuid) {
        self.instance_locks.lock().await.remove(&instance_id);
        self.cancellations.lock().await.remove(&instance_id);
    }
}

fn parse_instance_id(instance_id: &str) -> Result<Uuid, EngineError> {
    Uuid::parse_str(instance_id)
        .map_err(|_| EngineError::Validation(format!("not a valid instance id: {instance_id}")))
}

/// Top-level keys of a JSON object, string-encoded for variable storage.
/// Empty input contributes nothing.
fn parse_result_object(data_json: &str) -> Result<BTreeMap<String, String>, EngineError> {
    let trimmed = data_json.trim();
    if trimmed.is_empty() {
        return Ok(BTreeMap::new());
    }
    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| EngineError::Validation(format!("result data is not valid JSON: {e}")))?;
    match value {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, value)| (key, json_to_variable(&value)))
            .collect()),
        other => Err(EngineError::Validation(format!(
            "result data must be a JSON object, got: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    #[test]
    fn instance_id_parsing() {
        assert!(parse_instance_id("not-a-uuid").is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_instance_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn result_object_parsing() {
        assert!(parse_result_object("").unwrap().is_empty());
        assert!(parse_result_object("{}").unwrap().is_empty());
        let map = parse_result_object(r#"{"approved": true}"#).unwrap();
        assert_eq!(map.get("approved").map(String::as_str), Some("true"));
        assert!(matches!(
            parse_result_object("[1]"),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            parse_result_object("{oops"),
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unknown_instance_is_not_active() {
        let engine = BpmnEngine::new(Arc::new(MemoryStore::new()));
        assert!(!engine.is_process_active("garbage").await.unwrap());
        assert!(!engine
            .is_process_active(&Uuid::new_v4().to_string())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn queries_on_missing_instance_are_not_found() {
        let engine = BpmnEngine::new(Arc::new(MemoryStore::new()));
        let id = Uuid::new_v4().to_string();
        assert!(matches!(
            engine.get_process_state(&id).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.get_active_tasks(&id).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.terminate_process(&id).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
