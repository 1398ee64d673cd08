//! In-memory implementation of `ProcessStore` for tests and embedded use.

use crate::error::StoreError;
use crate::state::{ErrorRecord, ExecutionState, FormDef, TaskStatus, UserTaskRecord};
use crate::store::ProcessStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    /// process id → deployed XML versions, index 0 is version 1.
    definitions: HashMap<String, Vec<String>>,
    instances: HashMap<Uuid, ExecutionState>,
    tasks: Vec<UserTaskRecord>,
    errors: Vec<ErrorRecord>,
    forms: HashMap<String, FormDef>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Seed a form definition (the production store treats forms as
    /// read-only reference data).
    pub async fn insert_form(&self, form: FormDef) {
        let mut w = self.inner.write().await;
        w.forms.insert(form.id.clone(), form);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    // ── Definitions ──

    async fn save_definition(&self, process_id: &str, bpmn_xml: &str) -> Result<i32, StoreError> {
        let mut w = self.inner.write().await;
        let versions = w.definitions.entry(process_id.to_string()).or_default();
        versions.push(bpmn_xml.to_string());
        Ok(versions.len() as i32)
    }

    async fn load_definition(&self, process_id: &str) -> Result<Option<String>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.definitions
            .get(process_id)
            .and_then(|versions| versions.last().cloned()))
    }

    // ── Instances ──

    async fn save_instance(&self, state: &ExecutionState) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        w.instances.insert(state.instance_id, state.clone());
        Ok(())
    }

    async fn load_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<ExecutionState>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.instances.get(&instance_id).cloned())
    }

    async fn active_instances(&self) -> Result<Vec<Uuid>, StoreError> {
        let r = self.inner.read().await;
        let mut ids: Vec<(chrono::DateTime<Utc>, Uuid)> = r
            .instances
            .values()
            .filter(|s| s.status.is_active())
            .map(|s| (s.created_at, s.instance_id))
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    // ── User tasks ──

    async fn save_user_task(
        &self,
        instance_id: Uuid,
        task_id: &str,
        form_key: &str,
        variables_snapshot: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        let already_pending = w.tasks.iter().any(|t| {
            t.instance_id == instance_id && t.task_id == task_id && t.status == TaskStatus::Pending
        });
        if already_pending {
            return Ok(());
        }
        w.tasks.push(UserTaskRecord {
            instance_id,
            task_id: task_id.to_string(),
            form_key: form_key.to_string(),
            status: TaskStatus::Pending,
            variables_snapshot: variables_snapshot.clone(),
            created_at: Utc::now(),
            completed_at: None,
        });
        Ok(())
    }

    async fn complete_user_task(
        &self,
        instance_id: Uuid,
        task_id: &str,
    ) -> Result<bool, StoreError> {
        let mut w = self.inner.write().await;
        for task in w.tasks.iter_mut() {
            if task.instance_id == instance_id
                && task.task_id == task_id
                && task.status == TaskStatus::Pending
            {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(Utc::now());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn complete_task_transition(
        &self,
        state: &ExecutionState,
        task_id: &str,
    ) -> Result<bool, StoreError> {
        let mut w = self.inner.write().await;
        let Some(task) = w.tasks.iter_mut().find(|t| {
            t.instance_id == state.instance_id
                && t.task_id == task_id
                && t.status == TaskStatus::Pending
        }) else {
            return Ok(false);
        };
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        w.instances.insert(state.instance_id, state.clone());
        Ok(true)
    }

    async fn pending_tasks(&self, instance_id: Uuid) -> Result<Vec<UserTaskRecord>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.tasks
            .iter()
            .filter(|t| t.instance_id == instance_id && t.status == TaskStatus::Pending)
            .cloned()
            .collect())
    }

    async fn find_task(
        &self,
        instance_id: Uuid,
        task_id: &str,
    ) -> Result<Option<UserTaskRecord>, StoreError> {
        let r = self.inner.read().await;
        let matching = r
            .tasks
            .iter()
            .filter(|t| t.instance_id == instance_id && t.task_id == task_id);
        let mut found: Option<&UserTaskRecord> = None;
        for task in matching {
            // Pending rows win over historical completed ones.
            if task.status == TaskStatus::Pending {
                return Ok(Some(task.clone()));
            }
            found = Some(task);
        }
        Ok(found.cloned())
    }

    // ── Error log ──

    async fn append_error(&self, instance_id: Uuid, message: &str) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        w.errors.push(ErrorRecord {
            instance_id,
            message: message.to_string(),
            occurred_at: Utc::now(),
        });
        Ok(())
    }

    async fn load_errors(&self, instance_id: Uuid) -> Result<Vec<ErrorRecord>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.errors
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect())
    }

    // ── Forms ──

    async fn form_by_id(&self, form_id: &str) -> Result<Option<FormDef>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.forms.get(form_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InstanceStatus;

    fn make_state(id: Uuid) -> ExecutionState {
        ExecutionState {
            instance_id: id,
            process_id: "vacation_request".into(),
            current_element: "approve_request".into(),
            variables: BTreeMap::from([("days".to_string(), "5".to_string())]),
            status: InstanceStatus::SuspendedAtUserTask,
            pending_joins: BTreeMap::new(),
            branch_arrivals: BTreeMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn instance_round_trip() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.save_instance(&make_state(id)).await.unwrap();

        let loaded = store.load_instance(id).await.unwrap().unwrap();
        assert_eq!(loaded.instance_id, id);
        assert_eq!(loaded.current_element, "approve_request");
        assert_eq!(loaded.variables.get("days").map(String::as_str), Some("5"));
        assert_eq!(loaded.status, InstanceStatus::SuspendedAtUserTask);

        assert!(store.load_instance(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn definition_versions() {
        let store = MemoryStore::new();
        assert_eq!(store.save_definition("p", "<v1/>").await.unwrap(), 1);
        assert_eq!(store.save_definition("p", "<v2/>").await.unwrap(), 2);
        assert_eq!(
            store.load_definition("p").await.unwrap().as_deref(),
            Some("<v2/>")
        );
        assert!(store.load_definition("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_task_is_deduplicated() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let vars = BTreeMap::new();
        store.save_user_task(id, "approve", "form", &vars).await.unwrap();
        store.save_user_task(id, "approve", "form", &vars).await.unwrap();

        assert_eq!(store.pending_tasks(id).await.unwrap().len(), 1);

        assert!(store.complete_user_task(id, "approve").await.unwrap());
        assert!(!store.complete_user_task(id, "approve").await.unwrap());
        assert!(store.pending_tasks(id).await.unwrap().is_empty());

        // After completion a fresh pending row may be created again.
        store.save_user_task(id, "approve", "form", &vars).await.unwrap();
        assert_eq!(store.pending_tasks(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn find_task_prefers_pending() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let vars = BTreeMap::new();
        store.save_user_task(id, "review", "form", &vars).await.unwrap();
        store.complete_user_task(id, "review").await.unwrap();
        store.save_user_task(id, "review", "form", &vars).await.unwrap();

        let found = store.find_task(id, "review").await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Pending);

        assert!(store.find_task(id, "ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_log_is_append_only() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.append_error(id, "first").await.unwrap();
        store.append_error(id, "second").await.unwrap();

        let errors = store.load_errors(id).await.unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "first");
        assert_eq!(errors[1].message, "second");
    }

    #[tokio::test]
    async fn active_instances_filters_terminal() {
        let store = MemoryStore::new();
        let active = Uuid::new_v4();
        store.save_instance(&make_state(active)).await.unwrap();

        let mut done = make_state(Uuid::new_v4());
        done.status = InstanceStatus::Completed;
        done.completed_at = Some(Utc::now());
        store.save_instance(&done).await.unwrap();

        let ids = store.active_instances().await.unwrap();
        assert_eq!(ids, vec![active]);
    }

    #[tokio::test]
    async fn form_lookup() {
        let store = MemoryStore::new();
        store
            .insert_form(FormDef {
                id: "vacation_form".into(),
                process_id: "vacation_request".into(),
                description: "Vacation request form".into(),
                schema: r#"{"type":"object"}"#.into(),
                uischema: "{}".into(),
            })
            .await;

        let form = store.form_by_id("vacation_form").await.unwrap().unwrap();
        assert_eq!(form.process_id, "vacation_request");
        assert!(store.form_by_id("missing").await.unwrap().is_none());
    }
}
