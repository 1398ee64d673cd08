//! Error taxonomy for the engine.
//!
//! Three layers: `ParseError` for everything the definition parser can
//! reject, `StoreError` for durable-store failures, and `EngineError` as
//! the union surfaced by the executor and the façade.

use thiserror::Error;

/// Errors produced while turning BPMN XML into a [`crate::model::Process`].
///
/// The parser never returns a partially built graph: any of these means
/// no `Process` was produced.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The input is not well-formed XML.
    #[error("malformed XML: {0}")]
    Xml(String),

    /// The document never declares the BPMN 2.0 model namespace.
    #[error("BPMN namespace declaration not found (expected {0})")]
    MissingNamespace(&'static str),

    /// The document contains no `process` element.
    #[error("no process definition found in document")]
    NoProcess,

    /// A process child element is not part of the supported subset.
    #[error("unsupported element <{0}> in process")]
    UnknownElement(String),

    /// Structural violation detected after the scan (missing start event,
    /// dangling flow reference, duplicate ids, ...).
    #[error("invalid process definition: {0}")]
    InvalidDefinition(String),
}

/// Durable-store failures. Infrastructure only: "row does not exist" is
/// expressed as `Option::None` by the store API, not as an error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

/// The engine-level error surfaced to callers of the façade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A runtime invariant of the process graph was violated: a node with
    /// no outgoing flow, a branch that cannot find its join, an exclusive
    /// gateway with no matching flow and no default.
    #[error("malformed process: {0}")]
    MalformedProcess(String),

    /// A service-task delegate returned an error or timed out.
    #[error("delegate failure: {0}")]
    DelegateFailure(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The referenced instance, task, definition or form does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not valid for the instance's current status.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Caller input is malformed (bad JSON, empty definition, ...).
    #[error("validation error: {0}")]
    Validation(String),
}

impl EngineError {
    /// True for errors that describe a failure of the process itself and
    /// therefore get recorded against the instance (error log + FAILED
    /// status). Store errors and caller errors are excluded: the former
    /// must not touch instance status, the latter never reach the
    /// executor.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            EngineError::MalformedProcess(_) | EngineError::DelegateFailure(_)
        )
    }
}
