//! Service-task delegate registry.
//!
//! A delegate is an externally registered piece of work executed on
//! behalf of a service task. The registry is explicit: it is handed to
//! the executor at construction (no global factory), keyed by the name
//! the service task selects through exactly one of `class`, `expression`
//! or `topic`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Read-only view of the instance handed to a delegate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub instance_id: Uuid,
    pub process_id: String,
    pub element_id: String,
    pub variables: BTreeMap<String, String>,
}

/// One unit of pluggable work. The returned JSON object's top-level keys
/// are merged into the instance variables by the executor.
///
/// Delegates must honor the cancellation token: when it fires the
/// instance is being terminated and the result will be discarded.
#[async_trait]
pub trait Delegate: Send + Sync {
    async fn execute(
        &self,
        snapshot: StateSnapshot,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value>;
}

/// Name → delegate lookup table, shared by all executors.
#[derive(Default)]
pub struct DelegateRegistry {
    delegates: HashMap<String, Arc<dyn Delegate>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delegate under a name. A second registration under the
    /// same name replaces the first.
    pub fn register(&mut self, name: impl Into<String>, delegate: Arc<dyn Delegate>) {
        self.delegates.insert(name.into(), delegate);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Delegate>> {
        self.delegates.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.delegates.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Delegate for Echo {
        async fn execute(
            &self,
            snapshot: StateSnapshot,
            _cancel: CancellationToken,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "echoed": snapshot.element_id }))
        }
    }

    #[tokio::test]
    async fn register_and_execute() {
        let mut registry = DelegateRegistry::new();
        registry.register("echo", Arc::new(Echo));
        assert!(registry.contains("echo"));
        assert!(!registry.contains("other"));

        let delegate = registry.get("echo").unwrap();
        let snapshot = StateSnapshot {
            instance_id: Uuid::new_v4(),
            process_id: "p".into(),
            element_id: "svc1".into(),
            variables: BTreeMap::new(),
        };
        let result = delegate
            .execute(snapshot, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result["echoed"], "svc1");
    }
}
