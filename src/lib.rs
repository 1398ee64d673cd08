//! # bpmn-engine
//!
//! A server-side BPMN 2.0 workflow execution engine: parse a process
//! definition (XML), start instances of it, and drive each instance to
//! completion while persisting state durably between steps.
//!
//! The engine pauses on user tasks and resumes when a client completes
//! them, fans out and joins parallel gateway branches, routes exclusive
//! gateways through a pluggable condition evaluator, and dispatches
//! service tasks to a registry of delegates.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bpmn_engine::{BpmnEngine, MemoryStore};
//!
//! # async fn demo() -> Result<(), bpmn_engine::EngineError> {
//! let engine = BpmnEngine::new(Arc::new(MemoryStore::new()));
//! let instance_id = engine
//!     .start_process(VACATION_BPMN, r#"{"days": 5}"#)
//!     .await?;
//! engine
//!     .complete_task(&instance_id.to_string(), "approve_request", r#"{"approved": true}"#)
//!     .await?;
//! # Ok(())
//! # }
//! # const VACATION_BPMN: &str = "";
//! ```

pub mod config;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expression;
pub mod model;
pub mod parser;
pub mod state;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;

pub use config::DatabaseConfig;
pub use delegate::{Delegate, DelegateRegistry, StateSnapshot};
pub use engine::BpmnEngine;
pub use error::{EngineError, ParseError, StoreError};
pub use executor::{AdvanceOutcome, ProcessExecutor};
pub use expression::{ExpressionEvaluator, SimpleConditionEvaluator};
pub use model::{Element, ElementKind, Process, SequenceFlow};
pub use state::{
    BranchArrival, ErrorRecord, ExecutionState, FormDef, InstanceStatus, TaskStatus,
    UserTaskRecord,
};
pub use store::ProcessStore;
pub use store_memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
