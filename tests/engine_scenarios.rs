//! End-to-end scenarios: exercise the full engine lifecycle through the
//! façade against the in-memory store.
//!
//! The transport layer is a thin wrapper around `BpmnEngine`, so driving
//! the façade with JSON payloads validates the whole stack: parse →
//! start → advance → suspend on user tasks → complete → terminal state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bpmn_engine::{
    BpmnEngine, Delegate, DelegateRegistry, EngineError, MemoryStore, ParseError, ProcessStore,
    SimpleConditionEvaluator, StateSnapshot,
};
use tokio_util::sync::CancellationToken;

/// start -> userTask[approve_request] -> end
const LINEAR_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="vacation_request" name="Vacation Request">
    <bpmn:startEvent id="start"/>
    <bpmn:userTask id="approve_request" name="Approve Vacation Request" formKey="vacation_form"/>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="approve_request"/>
    <bpmn:sequenceFlow id="f2" sourceRef="approve_request" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;

/// start -> userTask[decide] -> xor -> {endA if approved, endB default}
const EXCLUSIVE_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="approval_routing" name="Approval Routing">
    <bpmn:startEvent id="start"/>
    <bpmn:userTask id="decide" formKey="decision_form"/>
    <bpmn:exclusiveGateway id="xor" default="flow_b"/>
    <bpmn:endEvent id="end_a"/>
    <bpmn:endEvent id="end_b"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="decide"/>
    <bpmn:sequenceFlow id="f2" sourceRef="decide" targetRef="xor"/>
    <bpmn:sequenceFlow id="flow_a" sourceRef="xor" targetRef="end_a">
      <bpmn:conditionExpression>${approved == true}</bpmn:conditionExpression>
    </bpmn:sequenceFlow>
    <bpmn:sequenceFlow id="flow_b" sourceRef="xor" targetRef="end_b"/>
  </bpmn:process>
</bpmn:definitions>"#;

/// start -> fork -> (userA, userB) -> join -> end
const PARALLEL_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="dual_approval" name="Dual Approval">
    <bpmn:startEvent id="start"/>
    <bpmn:parallelGateway id="fork"/>
    <bpmn:userTask id="userA" formKey="form_a"/>
    <bpmn:userTask id="userB" formKey="form_b"/>
    <bpmn:parallelGateway id="join"/>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="fork"/>
    <bpmn:sequenceFlow id="f2" sourceRef="fork" targetRef="userA"/>
    <bpmn:sequenceFlow id="f3" sourceRef="fork" targetRef="userB"/>
    <bpmn:sequenceFlow id="f4" sourceRef="userA" targetRef="join"/>
    <bpmn:sequenceFlow id="f5" sourceRef="userB" targetRef="join"/>
    <bpmn:sequenceFlow id="f6" sourceRef="join" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;

/// start -> serviceTask[topic=compute] -> end
const SERVICE_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="computation" name="Computation">
    <bpmn:startEvent id="start"/>
    <bpmn:serviceTask id="svc" topic="compute"/>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="svc"/>
    <bpmn:sequenceFlow id="f2" sourceRef="svc" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;

/// Fork whose branches are service tasks writing disjoint keys.
const PARALLEL_SERVICE_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="parallel_compute" name="Parallel Compute">
    <bpmn:startEvent id="start"/>
    <bpmn:parallelGateway id="fork"/>
    <bpmn:serviceTask id="svc_left" topic="left"/>
    <bpmn:serviceTask id="svc_right" topic="right"/>
    <bpmn:parallelGateway id="join"/>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="fork"/>
    <bpmn:sequenceFlow id="f2" sourceRef="fork" targetRef="svc_left"/>
    <bpmn:sequenceFlow id="f3" sourceRef="fork" targetRef="svc_right"/>
    <bpmn:sequenceFlow id="f4" sourceRef="svc_left" targetRef="join"/>
    <bpmn:sequenceFlow id="f5" sourceRef="svc_right" targetRef="join"/>
    <bpmn:sequenceFlow id="f6" sourceRef="join" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;

/// Fork with one service-task branch and one user-task branch feeding
/// the same join.
const MIXED_PARALLEL_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="audited_review" name="Audited Review">
    <bpmn:startEvent id="start"/>
    <bpmn:parallelGateway id="fork"/>
    <bpmn:serviceTask id="svc_audit" topic="audit"/>
    <bpmn:userTask id="review" formKey="review_form"/>
    <bpmn:parallelGateway id="join"/>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="fork"/>
    <bpmn:sequenceFlow id="f2" sourceRef="fork" targetRef="svc_audit"/>
    <bpmn:sequenceFlow id="f3" sourceRef="fork" targetRef="review"/>
    <bpmn:sequenceFlow id="f4" sourceRef="svc_audit" targetRef="join"/>
    <bpmn:sequenceFlow id="f5" sourceRef="review" targetRef="join"/>
    <bpmn:sequenceFlow id="f6" sourceRef="join" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;

/// Definition with no start event.
const NO_START_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="broken" name="Broken">
    <bpmn:userTask id="only_task"/>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="only_task" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;

fn new_engine() -> BpmnEngine {
    BpmnEngine::new(Arc::new(MemoryStore::new()))
}

struct StaticDelegate(serde_json::Value);

#[async_trait]
impl Delegate for StaticDelegate {
    async fn execute(
        &self,
        _snapshot: StateSnapshot,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        Ok(self.0.clone())
    }
}

struct CountingDelegate {
    calls: Arc<AtomicUsize>,
    result: serde_json::Value,
}

#[async_trait]
impl Delegate for CountingDelegate {
    async fn execute(
        &self,
        _snapshot: StateSnapshot,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

struct FailingDelegate;

#[async_trait]
impl Delegate for FailingDelegate {
    async fn execute(
        &self,
        _snapshot: StateSnapshot,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        anyhow::bail!("external system unavailable")
    }
}

struct SlowDelegate;

#[async_trait]
impl Delegate for SlowDelegate {
    async fn execute(
        &self,
        _snapshot: StateSnapshot,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
            _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(serde_json::json!({})),
        }
    }
}

fn engine_with_delegates(pairs: Vec<(&str, Arc<dyn Delegate>)>) -> BpmnEngine {
    let mut registry = DelegateRegistry::new();
    for (name, delegate) in pairs {
        registry.register(name, delegate);
    }
    BpmnEngine::with_components(
        Arc::new(MemoryStore::new()),
        Arc::new(registry),
        Arc::new(SimpleConditionEvaluator),
    )
}

fn assert_canonical_uuid(id: &str) {
    assert_eq!(id.len(), 36, "instance id must be 36 chars: {id}");
    for (index, character) in id.char_indices() {
        match index {
            8 | 13 | 18 | 23 => assert_eq!(character, '-', "hyphen expected in {id}"),
            _ => assert!(
                character.is_ascii_hexdigit(),
                "hex digit expected at {index} in {id}"
            ),
        }
    }
}

/// Linear happy path through a user task.
#[tokio::test]
async fn linear_happy_path() {
    let engine = new_engine();

    let instance_id = engine
        .start_process(LINEAR_BPMN, r#"{"days": 5}"#)
        .await
        .unwrap()
        .to_string();
    assert_canonical_uuid(&instance_id);

    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "SUSPENDED_AT_USER_TASK");
    assert_eq!(state["current_element"], "approve_request");
    assert_eq!(state["variables"]["days"], "5");

    let tasks = engine.get_active_tasks(&instance_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_id, "approve_request");
    assert_eq!(tasks[0].form_key, "vacation_form");
    assert_eq!(
        tasks[0].variables_snapshot.get("days").map(String::as_str),
        Some("5")
    );

    engine
        .complete_task(&instance_id, "approve_request", r#"{"approved": true}"#)
        .await
        .unwrap();

    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "COMPLETED");
    assert_eq!(state["variables"]["days"], "5");
    assert_eq!(state["variables"]["approved"], "true");
    assert!(engine
        .get_active_tasks(&instance_id)
        .await
        .unwrap()
        .is_empty());
    assert!(!engine.is_process_active(&instance_id).await.unwrap());
}

/// Exclusive routing takes the conditional flow when it matches.
#[tokio::test]
async fn exclusive_routing_condition_matches() {
    let engine = new_engine();
    let instance_id = engine
        .start_process(EXCLUSIVE_BPMN, "{}")
        .await
        .unwrap()
        .to_string();

    engine
        .complete_task(&instance_id, "decide", r#"{"approved": true}"#)
        .await
        .unwrap();

    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "COMPLETED");
    assert_eq!(state["current_element"], "end_a");
}

/// Exclusive routing falls back to the default flow.
#[tokio::test]
async fn exclusive_routing_default_flow() {
    let engine = new_engine();
    let instance_id = engine
        .start_process(EXCLUSIVE_BPMN, "{}")
        .await
        .unwrap()
        .to_string();

    engine
        .complete_task(&instance_id, "decide", r#"{"approved": false}"#)
        .await
        .unwrap();

    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "COMPLETED");
    assert_eq!(state["current_element"], "end_b");
}

/// Parallel fan-out suspends on both branch tasks and joins after
/// both complete.
#[tokio::test]
async fn parallel_fork_join_in_order() {
    let engine = new_engine();
    let instance_id = engine
        .start_process(PARALLEL_BPMN, "{}")
        .await
        .unwrap()
        .to_string();

    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "SUSPENDED_AT_USER_TASK");
    assert_eq!(state["current_element"], "fork");

    let mut task_ids: Vec<String> = engine
        .get_active_tasks(&instance_id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.task_id)
        .collect();
    task_ids.sort();
    assert_eq!(task_ids, vec!["userA", "userB"]);

    engine
        .complete_task(&instance_id, "userA", r#"{"a_vote": "yes"}"#)
        .await
        .unwrap();
    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "SUSPENDED_AT_USER_TASK");
    let remaining = engine.get_active_tasks(&instance_id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].task_id, "userB");

    engine
        .complete_task(&instance_id, "userB", r#"{"b_vote": "no"}"#)
        .await
        .unwrap();
    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "COMPLETED");
    assert_eq!(state["variables"]["a_vote"], "yes");
    assert_eq!(state["variables"]["b_vote"], "no");
}

/// Completing the branch tasks in reverse order yields the same
/// terminal state.
#[tokio::test]
async fn parallel_fork_join_reverse_order() {
    let engine = new_engine();
    let instance_id = engine
        .start_process(PARALLEL_BPMN, "{}")
        .await
        .unwrap()
        .to_string();

    engine
        .complete_task(&instance_id, "userB", r#"{"b_vote": "no"}"#)
        .await
        .unwrap();
    engine
        .complete_task(&instance_id, "userA", r#"{"a_vote": "yes"}"#)
        .await
        .unwrap();

    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "COMPLETED");
    assert_eq!(state["variables"]["a_vote"], "yes");
    assert_eq!(state["variables"]["b_vote"], "no");
}

/// A service-task delegate's result is merged into the variables.
#[tokio::test]
async fn service_task_merges_output() {
    let engine = engine_with_delegates(vec![(
        "compute",
        Arc::new(StaticDelegate(serde_json::json!({"result": 42}))) as Arc<dyn Delegate>,
    )]);

    let instance_id = engine
        .start_process(SERVICE_BPMN, r#"{"input": 7}"#)
        .await
        .unwrap()
        .to_string();

    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "COMPLETED");
    assert_eq!(state["variables"]["result"], "42");
    assert_eq!(state["variables"]["input"], "7");
}

/// A service-task branch that reaches the join while its user-task
/// sibling is still pending is replayed, not re-executed, when the fork
/// resumes: the delegate runs exactly once across the suspend/complete
/// cycle, and its output still reaches the merged variables.
#[tokio::test]
async fn service_branch_runs_once_across_fork_suspension() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = DelegateRegistry::new();
    registry.register(
        "audit",
        Arc::new(CountingDelegate {
            calls: calls.clone(),
            result: serde_json::json!({"audited": true}),
        }),
    );
    let engine = BpmnEngine::with_components(
        Arc::new(MemoryStore::new()),
        Arc::new(registry),
        Arc::new(SimpleConditionEvaluator),
    );

    let instance_id = engine
        .start_process(MIXED_PARALLEL_BPMN, r#"{"case": "C-7"}"#)
        .await
        .unwrap()
        .to_string();

    // The service branch already ran and arrived at the join; only the
    // user task holds the instance open.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "SUSPENDED_AT_USER_TASK");
    let tasks = engine.get_active_tasks(&instance_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_id, "review");

    engine
        .complete_task(&instance_id, "review", r#"{"reviewed": true}"#)
        .await
        .unwrap();

    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "COMPLETED");
    assert_eq!(state["variables"]["case"], "C-7");
    assert_eq!(state["variables"]["audited"], "true");
    assert_eq!(state["variables"]["reviewed"], "true");
    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "delegate must not re-run when the fork re-enters"
    );
}

/// The recorded branch arrival is durable: a fresh façade over the same
/// store resumes the fork without re-invoking the delegate.
#[tokio::test]
async fn service_branch_arrival_survives_restart() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = DelegateRegistry::new();
    registry.register(
        "audit",
        Arc::new(CountingDelegate {
            calls: calls.clone(),
            result: serde_json::json!({"audited": true}),
        }),
    );
    let registry = Arc::new(registry);
    let store = Arc::new(MemoryStore::new());

    let instance_id = {
        let engine = BpmnEngine::with_components(
            store.clone(),
            registry.clone(),
            Arc::new(SimpleConditionEvaluator),
        );
        engine
            .start_process(MIXED_PARALLEL_BPMN, "{}")
            .await
            .unwrap()
            .to_string()
    };
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let engine =
        BpmnEngine::with_components(store, registry, Arc::new(SimpleConditionEvaluator));
    engine
        .complete_task(&instance_id, "review", r#"{"reviewed": true}"#)
        .await
        .unwrap();

    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "COMPLETED");
    assert_eq!(state["variables"]["audited"], "true");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Branch-local service results are merged at the join.
#[tokio::test]
async fn parallel_service_branches_merge_at_join() {
    let engine = engine_with_delegates(vec![
        (
            "left",
            Arc::new(StaticDelegate(serde_json::json!({"left_out": 1}))) as Arc<dyn Delegate>,
        ),
        (
            "right",
            Arc::new(StaticDelegate(serde_json::json!({"right_out": 2}))) as Arc<dyn Delegate>,
        ),
    ]);

    let instance_id = engine
        .start_process(PARALLEL_SERVICE_BPMN, "{}")
        .await
        .unwrap()
        .to_string();

    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "COMPLETED");
    assert_eq!(state["variables"]["left_out"], "1");
    assert_eq!(state["variables"]["right_out"], "2");
}

/// A definition without a start event is rejected before anything
/// is persisted.
#[tokio::test]
async fn malformed_definition_rejected() {
    let engine = new_engine();
    let result = engine.start_process(NO_START_BPMN, "{}").await;
    match result {
        Err(EngineError::Parse(ParseError::InvalidDefinition(msg))) => {
            assert!(msg.contains("no start event"))
        }
        other => panic!("expected InvalidDefinition, got {other:?}"),
    }
    assert!(engine.get_active_instances().await.unwrap().is_empty());
}

/// Empty input is a caller error, not a parse error.
#[tokio::test]
async fn empty_definition_rejected() {
    let engine = new_engine();
    assert!(matches!(
        engine.start_process("   ", "{}").await,
        Err(EngineError::Validation(_))
    ));
}

/// A fresh façade over the same store resumes a suspended instance.
#[tokio::test]
async fn restart_from_persisted_state() {
    let store = Arc::new(MemoryStore::new());

    let instance_id = {
        let engine = BpmnEngine::new(store.clone());
        engine
            .start_process(LINEAR_BPMN, r#"{"days": 5}"#)
            .await
            .unwrap()
            .to_string()
    };

    // Simulated restart: new façade, empty definition cache, same store.
    let engine = BpmnEngine::new(store);
    assert!(engine.is_process_active(&instance_id).await.unwrap());
    engine
        .complete_task(&instance_id, "approve_request", r#"{"approved": true}"#)
        .await
        .unwrap();

    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "COMPLETED");
    assert_eq!(state["variables"]["approved"], "true");
}

/// Deploy once, start by process id.
#[tokio::test]
async fn start_by_process_id() {
    let engine = new_engine();
    let (process_id, version) = engine.deploy_process(LINEAR_BPMN).await.unwrap();
    assert_eq!(process_id, "vacation_request");
    assert_eq!(version, 1);

    let instance_id = engine
        .start_process_by_id("vacation_request", r#"{"days": 3}"#)
        .await
        .unwrap()
        .to_string();
    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["current_element"], "approve_request");

    assert!(matches!(
        engine.start_process_by_id("unknown_process", "{}").await,
        Err(EngineError::NotFound(_))
    ));
}

/// Delegate errors mark the instance FAILED and keep it at the failing
/// node; the error log records the failure.
#[tokio::test]
async fn delegate_failure_marks_instance_failed() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = DelegateRegistry::new();
    registry.register("compute", Arc::new(FailingDelegate));
    let engine = BpmnEngine::with_components(
        store.clone(),
        Arc::new(registry),
        Arc::new(SimpleConditionEvaluator),
    );

    let result = engine.start_process(SERVICE_BPMN, "{}").await;
    match result {
        Err(EngineError::DelegateFailure(msg)) => {
            assert!(msg.contains("external system unavailable"))
        }
        other => panic!("expected DelegateFailure, got {other:?}"),
    }

    // FAILED is not an active status.
    assert!(store.active_instances().await.unwrap().is_empty());
}

/// An unregistered delegate is a delegate failure, not a crash.
#[tokio::test]
async fn unregistered_delegate_fails() {
    let engine = new_engine();
    let result = engine.start_process(SERVICE_BPMN, "{}").await;
    match result {
        Err(EngineError::DelegateFailure(msg)) => assert!(msg.contains("compute")),
        other => panic!("expected DelegateFailure, got {other:?}"),
    }
}

/// Delegates that overrun the configured timeout fail the instance.
#[tokio::test]
async fn delegate_timeout() {
    let mut registry = DelegateRegistry::new();
    registry.register("compute", Arc::new(SlowDelegate));
    let engine = BpmnEngine::with_components(
        Arc::new(MemoryStore::new()),
        Arc::new(registry),
        Arc::new(SimpleConditionEvaluator),
    )
    .with_delegate_timeout(Duration::from_millis(50));

    let result = engine.start_process(SERVICE_BPMN, "{}").await;
    match result {
        Err(EngineError::DelegateFailure(msg)) => assert!(msg.contains("timed out")),
        other => panic!("expected timeout failure, got {other:?}"),
    }
}

/// Completing a task on a completed instance is a conflict; completing a
/// nonexistent task is not found.
#[tokio::test]
async fn complete_task_conflicts() {
    let engine = new_engine();
    let instance_id = engine
        .start_process(LINEAR_BPMN, "{}")
        .await
        .unwrap()
        .to_string();

    assert!(matches!(
        engine.complete_task(&instance_id, "ghost_task", "{}").await,
        Err(EngineError::NotFound(_))
    ));

    engine
        .complete_task(&instance_id, "approve_request", "{}")
        .await
        .unwrap();

    assert!(matches!(
        engine
            .complete_task(&instance_id, "approve_request", "{}")
            .await,
        Err(EngineError::Conflict(_))
    ));
}

/// Terminate cancels the instance and is idempotent afterwards.
#[tokio::test]
async fn terminate_is_idempotent() {
    let engine = new_engine();
    let instance_id = engine
        .start_process(LINEAR_BPMN, "{}")
        .await
        .unwrap()
        .to_string();

    engine.terminate_process(&instance_id).await.unwrap();
    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "TERMINATED");
    assert!(engine
        .get_active_tasks(&instance_id)
        .await
        .unwrap()
        .is_empty());

    // Second terminate is a no-op, not an error.
    engine.terminate_process(&instance_id).await.unwrap();

    // Completing a task afterwards conflicts.
    assert!(matches!(
        engine
            .complete_task(&instance_id, "approve_request", "{}")
            .await,
        Err(EngineError::Conflict(_))
    ));
}

/// The signal stub persists its payload without advancing the instance.
#[tokio::test]
async fn signal_event_persists_blob() {
    let engine = new_engine();
    let instance_id = engine
        .start_process(LINEAR_BPMN, "{}")
        .await
        .unwrap()
        .to_string();

    engine
        .signal_event(&instance_id, "doc_uploaded", r#"{"doc_id": "D-1"}"#)
        .await
        .unwrap();

    let state = engine.get_process_state(&instance_id).await.unwrap();
    assert_eq!(state["status"], "SUSPENDED_AT_USER_TASK");
    assert_eq!(state["variables"]["signal_doc_uploaded"], r#"{"doc_id": "D-1"}"#);
}

/// Admin suspension only applies to RUNNING instances.
#[tokio::test]
async fn admin_suspend_requires_running() {
    let engine = new_engine();
    let instance_id = engine
        .start_process(LINEAR_BPMN, "{}")
        .await
        .unwrap()
        .to_string();

    // The instance is parked at a user task, not RUNNING.
    assert!(matches!(
        engine.suspend_process(&instance_id).await,
        Err(EngineError::Conflict(_))
    ));
    assert!(matches!(
        engine.resume_process(&instance_id).await,
        Err(EngineError::Conflict(_))
    ));
}

/// Form definitions are served as parsed JSON.
#[tokio::test]
async fn form_lookup() {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_form(bpmn_engine::FormDef {
            id: "vacation_form".into(),
            process_id: "vacation_request".into(),
            description: "Vacation request form".into(),
            schema: r#"{"type":"object","properties":{"days":{"type":"integer"}}}"#.into(),
            uischema: "{}".into(),
        })
        .await;
    let engine = BpmnEngine::new(store);

    let form = engine.get_form_by_id("vacation_form").await.unwrap();
    assert_eq!(form["processId"], "vacation_request");
    assert_eq!(form["schema"]["type"], "object");

    assert!(matches!(
        engine.get_form_by_id("missing").await,
        Err(EngineError::NotFound(_))
    ));
}

/// Active instance listing reflects lifecycle transitions.
#[tokio::test]
async fn active_instance_listing() {
    let engine = new_engine();
    let first = engine
        .start_process(LINEAR_BPMN, "{}")
        .await
        .unwrap()
        .to_string();
    let second = engine
        .start_process(LINEAR_BPMN, "{}")
        .await
        .unwrap()
        .to_string();

    let active = engine.get_active_instances().await.unwrap();
    assert!(active.contains(&first));
    assert!(active.contains(&second));

    engine
        .complete_task(&first, "approve_request", "{}")
        .await
        .unwrap();
    let active = engine.get_active_instances().await.unwrap();
    assert!(!active.contains(&first));
    assert!(active.contains(&second));
}
