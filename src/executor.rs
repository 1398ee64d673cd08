//! The process executor: interprets the graph against an execution state.
//!
//! `advance` is an eager, depth-first, advance-until-suspension loop.
//! Each node's persist is its own transaction, so a crash mid-advance
//! leaves the instance paused at the last persisted node, from where a
//! later `advance` resumes. Parallel gateway branches run as spawned
//! tasks with branch-local variable copies; the fork handler waits for
//! all of them and merges at the join, so no advance ever returns while
//! a branch is still in flight.

use crate::delegate::{DelegateRegistry, StateSnapshot};
use crate::error::EngineError;
use crate::expression::ExpressionEvaluator;
use crate::model::{Element, ElementKind, Process};
use crate::state::{json_to_variable, BranchArrival, ExecutionState, InstanceStatus, TaskStatus};
use crate::store::ProcessStore;
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

/// Bound on a single delegate execution.
pub const DEFAULT_DELEGATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Why `advance` returned without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Paused on one or more user tasks; progress resumes from
    /// `complete_task`.
    Suspended,
    /// An end event was reached.
    Completed,
    /// Cancellation was observed; the terminate operation owns the final
    /// status write.
    Terminated,
}

/// How one node execution left the loop.
enum NodeOutcome {
    Continue,
    Suspended,
    Completed,
    Terminated,
}

/// Result of one branch task between a fork and its join.
enum BranchOutcome {
    ReachedJoin {
        join_id: String,
        variables: BTreeMap<String, String>,
    },
    /// Paused on a user task; carries the arrivals any nested forks
    /// recorded before suspending.
    Suspended {
        arrivals: BTreeMap<String, BranchArrival>,
    },
    Completed,
    Terminated,
}

/// Result of a whole fork/join fan-out.
enum ForkOutcome {
    Released {
        join_id: String,
        variables: BTreeMap<String, String>,
    },
    /// At least one branch paused on a user task. `arrivals` holds the
    /// recorded results of the branches that already reached their join,
    /// so the next advance can replay them instead of re-executing.
    Suspended {
        pending: BTreeMap<String, u32>,
        arrivals: BTreeMap<String, BranchArrival>,
    },
    Completed,
    Terminated,
}

/// One slot in a fork fan-out: either replayed from a recorded arrival
/// or actually running.
enum BranchTask {
    Cached(BranchOutcome),
    Running(JoinHandle<Result<BranchOutcome, EngineError>>),
}

/// A delegate call either produced a value or was abandoned because the
/// instance is being terminated.
enum DelegateRun {
    Done(serde_json::Value),
    Cancelled,
}

#[derive(Clone)]
pub struct ProcessExecutor {
    store: Arc<dyn ProcessStore>,
    delegates: Arc<DelegateRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    delegate_timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        delegates: Arc<DelegateRegistry>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            store,
            delegates,
            evaluator,
            delegate_timeout: DEFAULT_DELEGATE_TIMEOUT,
        }
    }

    pub fn with_delegate_timeout(mut self, timeout: Duration) -> Self {
        self.delegate_timeout = timeout;
        self
    }

    /// Execute nodes starting at `state.current_element` until the
    /// instance suspends, completes, terminates, or fails.
    ///
    /// Execution failures (malformed process, delegate failure) are
    /// recorded against the instance (error log appended, status set to
    /// FAILED with `current_element` kept at the failing node) and then
    /// re-surfaced. Store errors surface directly without touching
    /// status.
    pub async fn advance(
        &self,
        process: Arc<Process>,
        state: &mut ExecutionState,
        cancel: CancellationToken,
    ) -> Result<AdvanceOutcome, EngineError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(AdvanceOutcome::Terminated);
            }
            let element = match process.element(&state.current_element) {
                Some(e) => e.clone(),
                None => {
                    let err = EngineError::MalformedProcess(format!(
                        "unknown element: {}",
                        state.current_element
                    ));
                    return self.fail(state, err).await;
                }
            };
            match self.execute_node(&process, &element, state, &cancel).await {
                Ok(NodeOutcome::Continue) => continue,
                Ok(NodeOutcome::Suspended) => return Ok(AdvanceOutcome::Suspended),
                Ok(NodeOutcome::Completed) => return Ok(AdvanceOutcome::Completed),
                Ok(NodeOutcome::Terminated) => return Ok(AdvanceOutcome::Terminated),
                Err(err) if err.is_execution_failure() => return self.fail(state, err).await,
                Err(err) => return Err(err),
            }
        }
    }

    async fn fail(
        &self,
        state: &mut ExecutionState,
        err: EngineError,
    ) -> Result<AdvanceOutcome, EngineError> {
        error!(
            instance_id = %state.instance_id,
            element_id = %state.current_element,
            "advance failed: {err}"
        );
        self.store
            .append_error(state.instance_id, &err.to_string())
            .await?;
        state.status = InstanceStatus::Failed;
        self.store.save_instance(state).await?;
        Err(err)
    }

    async fn execute_node(
        &self,
        process: &Arc<Process>,
        element: &Element,
        state: &mut ExecutionState,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome, EngineError> {
        match &element.kind {
            ElementKind::StartEvent => {
                info!(instance_id = %state.instance_id, "process instance started");
                state.current_element = single_outgoing(process, &element.id)?;
                self.store.save_instance(state).await?;
                Ok(NodeOutcome::Continue)
            }

            ElementKind::EndEvent => {
                info!(instance_id = %state.instance_id, "process instance completed");
                state.status = InstanceStatus::Completed;
                state.completed_at = Some(Utc::now());
                state.pending_joins.clear();
                state.branch_arrivals.clear();
                self.store.save_instance(state).await?;
                Ok(NodeOutcome::Completed)
            }

            ElementKind::UserTask { form_key, .. } => {
                info!(
                    instance_id = %state.instance_id,
                    task = %element.id,
                    "user task reached"
                );
                self.store
                    .save_user_task(state.instance_id, &element.id, form_key, &state.variables)
                    .await?;
                state.status = InstanceStatus::SuspendedAtUserTask;
                self.store.save_instance(state).await?;
                Ok(NodeOutcome::Suspended)
            }

            ElementKind::ServiceTask { .. } => {
                match self
                    .run_delegate(element, state.instance_id, &state.process_id, &state.variables, cancel)
                    .await?
                {
                    DelegateRun::Cancelled => Ok(NodeOutcome::Terminated),
                    DelegateRun::Done(result) => {
                        merge_delegate_result(&mut state.variables, result)?;
                        state.current_element = single_outgoing(process, &element.id)?;
                        self.store.save_instance(state).await?;
                        Ok(NodeOutcome::Continue)
                    }
                }
            }

            ElementKind::ExclusiveGateway { .. } => {
                state.current_element =
                    self.select_exclusive_flow(process, element, &state.variables)?;
                self.store.save_instance(state).await?;
                Ok(NodeOutcome::Continue)
            }

            ElementKind::ParallelGateway => {
                if process.outgoing_count(&element.id) > 1 {
                    let prior = Arc::new(state.branch_arrivals.clone());
                    let fork = self
                        .run_fork(
                            process.clone(),
                            state.instance_id,
                            state.process_id.clone(),
                            element,
                            state.variables.clone(),
                            prior,
                            cancel,
                        )
                        .await?;
                    match fork {
                        ForkOutcome::Released { join_id, variables } => {
                            let target = single_outgoing(process, &join_id)?;
                            state.variables = variables;
                            state.pending_joins.remove(&join_id);
                            // The suspension epoch this fork belonged to
                            // is over; recorded arrivals are consumed.
                            state.branch_arrivals.clear();
                            state.current_element = target;
                            self.store.save_instance(state).await?;
                            Ok(NodeOutcome::Continue)
                        }
                        ForkOutcome::Suspended { pending, arrivals } => {
                            state.status = InstanceStatus::SuspendedAtUserTask;
                            state.pending_joins = pending;
                            state.branch_arrivals = arrivals;
                            self.store.save_instance(state).await?;
                            Ok(NodeOutcome::Suspended)
                        }
                        ForkOutcome::Completed => {
                            state.status = InstanceStatus::Completed;
                            state.completed_at = Some(Utc::now());
                            state.pending_joins.clear();
                            state.branch_arrivals.clear();
                            self.store.save_instance(state).await?;
                            Ok(NodeOutcome::Completed)
                        }
                        ForkOutcome::Terminated => Ok(NodeOutcome::Terminated),
                    }
                } else if process.incoming_count(&element.id) > 1 {
                    Err(EngineError::MalformedProcess(format!(
                        "parallel join {} reached outside of a fork",
                        element.id
                    )))
                } else {
                    // Degenerate one-in-one-out gateway: pass through.
                    state.current_element = single_outgoing(process, &element.id)?;
                    self.store.save_instance(state).await?;
                    Ok(NodeOutcome::Continue)
                }
            }
        }
    }

    /// Fan out one branch task per outgoing flow and wait for all of
    /// them. Branch-local variables are deep copies of the fork-time
    /// state; branches never share variable storage while running. A
    /// branch whose arrival was recorded in an earlier advance is
    /// replayed from the record instead of re-executed, so its delegates
    /// do not run a second time.
    async fn run_fork(
        &self,
        process: Arc<Process>,
        instance_id: Uuid,
        process_id: String,
        fork: &Element,
        variables: BTreeMap<String, String>,
        prior_arrivals: Arc<BTreeMap<String, BranchArrival>>,
        cancel: &CancellationToken,
    ) -> Result<ForkOutcome, EngineError> {
        let targets: Vec<String> = process
            .outgoing_flows(&fork.id)
            .iter()
            .map(|f| f.target_ref.clone())
            .collect();
        info!(
            instance_id = %instance_id,
            gateway = %fork.id,
            branches = targets.len(),
            "parallel fork"
        );

        let mut tasks = Vec::with_capacity(targets.len());
        for target in &targets {
            if let Some(arrival) = prior_arrivals.get(&arrival_key(&fork.id, target)) {
                let mut branch_variables = variables.clone();
                branch_variables.extend(arrival.variables.clone());
                tasks.push(BranchTask::Cached(BranchOutcome::ReachedJoin {
                    join_id: arrival.join_id.clone(),
                    variables: branch_variables,
                }));
                continue;
            }
            let executor = self.clone();
            tasks.push(BranchTask::Running(tokio::spawn(executor.run_branch(
                process.clone(),
                instance_id,
                process_id.clone(),
                target.clone(),
                variables.clone(),
                prior_arrivals.clone(),
                cancel.child_token(),
            ))));
        }

        // wait_all: every branch settles before the fork resolves.
        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut first_error: Option<EngineError> = None;
        for (target, task) in targets.iter().zip(tasks) {
            match task {
                BranchTask::Cached(outcome) => outcomes.push((target.clone(), outcome)),
                BranchTask::Running(handle) => match handle.await {
                    Ok(Ok(outcome)) => outcomes.push((target.clone(), outcome)),
                    Ok(Err(err)) => {
                        first_error.get_or_insert(err);
                    }
                    Err(join_err) => {
                        first_error.get_or_insert(EngineError::MalformedProcess(format!(
                            "branch task of fork {} aborted: {join_err}",
                            fork.id
                        )));
                    }
                },
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        self.classify_fork(&process, fork, &variables, outcomes)
    }

    fn classify_fork(
        &self,
        process: &Process,
        fork: &Element,
        fork_variables: &BTreeMap<String, String>,
        outcomes: Vec<(String, BranchOutcome)>,
    ) -> Result<ForkOutcome, EngineError> {
        let mut reached: Vec<(String, String, BTreeMap<String, String>)> = Vec::new();
        let mut nested_arrivals: BTreeMap<String, BranchArrival> = BTreeMap::new();
        let mut any_suspended = false;
        let mut any_completed = false;
        for (target, outcome) in outcomes {
            match outcome {
                BranchOutcome::Terminated => return Ok(ForkOutcome::Terminated),
                BranchOutcome::Suspended { arrivals } => {
                    any_suspended = true;
                    nested_arrivals.extend(arrivals);
                }
                BranchOutcome::Completed => any_completed = true,
                BranchOutcome::ReachedJoin { join_id, variables } => {
                    reached.push((target, join_id, variables))
                }
            }
        }

        if any_suspended {
            // Persist both the remaining-arrival counters and the results
            // of the branches that already reached the join, so the next
            // advance replays them instead of re-executing.
            let mut counts: BTreeMap<String, u32> = BTreeMap::new();
            let mut arrivals = nested_arrivals;
            for (target, join_id, variables) in &reached {
                *counts.entry(join_id.clone()).or_insert(0) += 1;
                let mut delta = BTreeMap::new();
                for (key, value) in variables {
                    if fork_variables.get(key) != Some(value) {
                        delta.insert(key.clone(), value.clone());
                    }
                }
                arrivals.insert(
                    arrival_key(&fork.id, target),
                    BranchArrival {
                        join_id: join_id.clone(),
                        variables: delta,
                    },
                );
            }
            let pending = counts
                .into_iter()
                .map(|(join_id, count)| {
                    let expected = process.incoming_count(&join_id) as u32;
                    (join_id, expected.saturating_sub(count))
                })
                .collect();
            return Ok(ForkOutcome::Suspended { pending, arrivals });
        }

        if reached.is_empty() {
            // Every branch ran to its own end event.
            return Ok(if any_completed {
                ForkOutcome::Completed
            } else {
                ForkOutcome::Terminated
            });
        }

        if any_completed {
            return Err(EngineError::MalformedProcess(format!(
                "a branch of fork {} ended while its siblings wait at join {}",
                fork.id, reached[0].1
            )));
        }

        let join_id = reached[0].1.clone();
        if reached.iter().any(|(_, id, _)| *id != join_id) {
            return Err(EngineError::MalformedProcess(format!(
                "branches of fork {} arrived at different joins",
                fork.id
            )));
        }
        let expected = process.incoming_count(&join_id);
        if reached.len() != expected {
            return Err(EngineError::MalformedProcess(format!(
                "join {join_id} expects {expected} arrivals but fork {} produced {}",
                fork.id,
                reached.len()
            )));
        }

        info!(gateway = %join_id, "parallel join released");
        let branch_variables: Vec<BTreeMap<String, String>> =
            reached.into_iter().map(|(_, _, vars)| vars).collect();
        Ok(ForkOutcome::Released {
            join_id,
            variables: merge_branch_variables(fork_variables, &branch_variables),
        })
    }

    /// Execute one branch from its fork-outgoing target until it reaches
    /// a join, suspends on a user task, hits an end event, or is
    /// cancelled. Boxed because nested forks recurse through it.
    fn run_branch(
        self,
        process: Arc<Process>,
        instance_id: Uuid,
        process_id: String,
        start_element: String,
        mut variables: BTreeMap<String, String>,
        prior_arrivals: Arc<BTreeMap<String, BranchArrival>>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<BranchOutcome, EngineError>> + Send>> {
        Box::pin(async move {
            let mut current = start_element;
            loop {
                if cancel.is_cancelled() {
                    return Ok(BranchOutcome::Terminated);
                }
                let element = process
                    .element(&current)
                    .ok_or_else(|| {
                        EngineError::MalformedProcess(format!("unknown element: {current}"))
                    })?
                    .clone();
                match &element.kind {
                    ElementKind::StartEvent => {
                        return Err(EngineError::MalformedProcess(format!(
                            "start event {} inside a parallel branch",
                            element.id
                        )))
                    }

                    ElementKind::EndEvent => return Ok(BranchOutcome::Completed),

                    ElementKind::UserTask { form_key, .. } => {
                        match self.store.find_task(instance_id, &element.id).await? {
                            // Completed through an earlier complete_task
                            // call: the fork re-entry fast-forwards past
                            // it (its result is already merged into the
                            // instance variables).
                            Some(task) if task.status == TaskStatus::Completed => {
                                current = single_outgoing(&process, &element.id)?;
                            }
                            Some(_) => {
                                return Ok(BranchOutcome::Suspended {
                                    arrivals: BTreeMap::new(),
                                })
                            }
                            None => {
                                info!(
                                    instance_id = %instance_id,
                                    task = %element.id,
                                    "user task reached in branch"
                                );
                                self.store
                                    .save_user_task(
                                        instance_id,
                                        &element.id,
                                        form_key,
                                        &variables,
                                    )
                                    .await?;
                                return Ok(BranchOutcome::Suspended {
                                    arrivals: BTreeMap::new(),
                                });
                            }
                        }
                    }

                    ElementKind::ServiceTask { .. } => {
                        match self
                            .run_delegate(&element, instance_id, &process_id, &variables, &cancel)
                            .await?
                        {
                            DelegateRun::Cancelled => return Ok(BranchOutcome::Terminated),
                            DelegateRun::Done(result) => {
                                merge_delegate_result(&mut variables, result)?;
                                current = single_outgoing(&process, &element.id)?;
                            }
                        }
                    }

                    ElementKind::ExclusiveGateway { .. } => {
                        current = self.select_exclusive_flow(&process, &element, &variables)?;
                    }

                    ElementKind::ParallelGateway => {
                        if process.incoming_count(&element.id) > 1 {
                            return Ok(BranchOutcome::ReachedJoin {
                                join_id: element.id.clone(),
                                variables,
                            });
                        }
                        if process.outgoing_count(&element.id) > 1 {
                            // Nested fork: a new stack frame of branches.
                            let fork = self
                                .run_fork(
                                    process.clone(),
                                    instance_id,
                                    process_id.clone(),
                                    &element,
                                    variables.clone(),
                                    prior_arrivals.clone(),
                                    &cancel,
                                )
                                .await?;
                            match fork {
                                ForkOutcome::Released {
                                    join_id,
                                    variables: merged,
                                } => {
                                    variables = merged;
                                    current = single_outgoing(&process, &join_id)?;
                                }
                                ForkOutcome::Suspended { arrivals, .. } => {
                                    // Carry the nested arrivals up so they
                                    // reach the persisted state.
                                    return Ok(BranchOutcome::Suspended { arrivals });
                                }
                                ForkOutcome::Completed => return Ok(BranchOutcome::Completed),
                                ForkOutcome::Terminated => return Ok(BranchOutcome::Terminated),
                            }
                        } else {
                            current = single_outgoing(&process, &element.id)?;
                        }
                    }
                }
            }
        })
    }

    /// Evaluate outgoing conditions in document order; the declared
    /// default flow is skipped during evaluation and only taken when
    /// nothing matches.
    fn select_exclusive_flow(
        &self,
        process: &Process,
        gateway: &Element,
        variables: &BTreeMap<String, String>,
    ) -> Result<String, EngineError> {
        let flows = process.outgoing_flows(&gateway.id);
        if flows.is_empty() {
            return Err(EngineError::MalformedProcess(format!(
                "no outgoing sequence flow from exclusive gateway {}",
                gateway.id
            )));
        }
        let default_id = process.default_flow_of(&gateway.id);
        for flow in &flows {
            if Some(flow.id.as_str()) == default_id {
                continue;
            }
            let truthy = match &flow.condition_expression {
                None => true,
                Some(expr) => self
                    .evaluator
                    .evaluate(expr, variables)
                    .map_err(|e| {
                        EngineError::MalformedProcess(format!(
                            "condition on sequence flow {}: {e}",
                            flow.id
                        ))
                    })?,
            };
            if truthy {
                return Ok(flow.target_ref.clone());
            }
        }
        if let Some(default_id) = default_id {
            let flow = process.flow(default_id).ok_or_else(|| {
                EngineError::MalformedProcess(format!(
                    "default flow {default_id} of gateway {} does not exist",
                    gateway.id
                ))
            })?;
            return Ok(flow.target_ref.clone());
        }
        Err(EngineError::MalformedProcess(format!(
            "no matching sequence flow from exclusive gateway {}",
            gateway.id
        )))
    }

    async fn run_delegate(
        &self,
        element: &Element,
        instance_id: Uuid,
        process_id: &str,
        variables: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<DelegateRun, EngineError> {
        let ElementKind::ServiceTask {
            class_name,
            expression,
            topic,
        } = &element.kind
        else {
            return Err(EngineError::MalformedProcess(format!(
                "{} is not a service task",
                element.id
            )));
        };
        let name = delegate_name(class_name, expression, topic).ok_or_else(|| {
            EngineError::MalformedProcess(format!(
                "service task {} must set exactly one of class, expression or topic",
                element.id
            ))
        })?;
        let delegate = self.delegates.get(name).ok_or_else(|| {
            EngineError::DelegateFailure(format!("delegate not registered: {name}"))
        })?;
        info!(
            instance_id = %instance_id,
            task = %element.id,
            delegate = %name,
            "executing service task"
        );
        let snapshot = StateSnapshot {
            instance_id,
            process_id: process_id.to_string(),
            element_id: element.id.clone(),
            variables: variables.clone(),
        };
        let work = delegate.execute(snapshot, cancel.child_token());
        tokio::select! {
            _ = cancel.cancelled() => Ok(DelegateRun::Cancelled),
            result = tokio::time::timeout(self.delegate_timeout, work) => match result {
                Err(_) => Err(EngineError::DelegateFailure(format!(
                    "delegate {name} timed out after {:?}",
                    self.delegate_timeout
                ))),
                Ok(Ok(value)) => Ok(DelegateRun::Done(value)),
                Ok(Err(e)) => Err(EngineError::DelegateFailure(format!(
                    "delegate {name} failed: {e}"
                ))),
            },
        }
    }
}

/// The one non-empty selector of a service task, if exactly one is set.
fn delegate_name<'a>(
    class_name: &'a str,
    expression: &'a str,
    topic: &'a str,
) -> Option<&'a str> {
    let set: Vec<&str> = [class_name, expression, topic]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
    match set.as_slice() {
        [only] => Some(only),
        _ => None,
    }
}

/// Slot key identifying one branch of one fork in the arrival record.
fn arrival_key(fork_id: &str, branch_target: &str) -> String {
    format!("{fork_id}:{branch_target}")
}

/// Target of the element's single outgoing flow.
fn single_outgoing(process: &Process, element_id: &str) -> Result<String, EngineError> {
    let flows = process.outgoing_flows(element_id);
    match flows.as_slice() {
        [only] => Ok(only.target_ref.clone()),
        [] => Err(EngineError::MalformedProcess(format!(
            "no outgoing sequence flow from {element_id}"
        ))),
        _ => Err(EngineError::MalformedProcess(format!(
            "{element_id} must have exactly one outgoing sequence flow"
        ))),
    }
}

/// Merge a delegate's JSON object into the variable map.
fn merge_delegate_result(
    variables: &mut BTreeMap<String, String>,
    result: serde_json::Value,
) -> Result<(), EngineError> {
    match result {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                variables.insert(key, json_to_variable(&value));
            }
            Ok(())
        }
        other => Err(EngineError::DelegateFailure(format!(
            "delegate result must be a JSON object, got: {other}"
        ))),
    }
}

/// Merge branch variables into the fork-time snapshot. Branches are
/// overlaid in fork-outgoing order, so on a conflicting key the last
/// branch in that order wins; keys a branch left untouched do not
/// overwrite earlier branches' changes.
fn merge_branch_variables(
    snapshot: &BTreeMap<String, String>,
    branches: &[BTreeMap<String, String>],
) -> BTreeMap<String, String> {
    let mut merged = snapshot.clone();
    for branch in branches {
        for (key, value) in branch {
            if snapshot.get(key) != Some(value) {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}
