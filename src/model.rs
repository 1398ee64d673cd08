//! The parsed process graph.
//!
//! A [`Process`] is immutable after parse and free of any executor state,
//! so it can be shared across instances behind an `Arc` without
//! synchronization. Flows reference their endpoints by element id, never
//! by pointer, keeping ownership acyclic; cross-links are pre-computed
//! id-keyed indices.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A node in the process graph with its type-specific payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ElementKind {
    StartEvent,
    EndEvent,
    UserTask {
        form_key: String,
        assignee: Option<String>,
        /// Form-field descriptors: field id → declared type.
        form_fields: BTreeMap<String, String>,
    },
    ServiceTask {
        class_name: String,
        expression: String,
        topic: String,
    },
    ParallelGateway,
    ExclusiveGateway {
        /// Flow id taken when no condition matches.
        default_flow: Option<String>,
    },
}

impl ElementKind {
    /// Short tag used in logs and error messages.
    pub fn tag(&self) -> &'static str {
        match self {
            ElementKind::StartEvent => "startEvent",
            ElementKind::EndEvent => "endEvent",
            ElementKind::UserTask { .. } => "userTask",
            ElementKind::ServiceTask { .. } => "serviceTask",
            ElementKind::ParallelGateway => "parallelGateway",
            ElementKind::ExclusiveGateway { .. } => "exclusiveGateway",
        }
    }
}

/// A flow element: id, display name, and the typed payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub name: String,
    pub kind: ElementKind,
}

/// A directed edge between two elements, optionally guarded by a
/// condition expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub name: String,
    pub source_ref: String,
    pub target_ref: String,
    pub condition_expression: Option<String>,
}

/// An immutable, validated process definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Process {
    id: String,
    name: String,
    start_event_id: String,
    elements: HashMap<String, Element>,
    flows: HashMap<String, SequenceFlow>,
    /// element id → outgoing flow ids, in document order.
    outgoing: HashMap<String, Vec<String>>,
    /// element id → incoming flow ids, in document order.
    incoming: HashMap<String, Vec<String>>,
}

impl Process {
    /// Assemble a process from validated parts, computing the flow
    /// indices. The parser is responsible for having checked id
    /// uniqueness and flow-reference resolution beforehand.
    pub(crate) fn assemble(
        id: String,
        name: String,
        start_event_id: String,
        elements: Vec<Element>,
        flows: Vec<SequenceFlow>,
    ) -> Self {
        let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
        for flow in &flows {
            outgoing
                .entry(flow.source_ref.clone())
                .or_default()
                .push(flow.id.clone());
            incoming
                .entry(flow.target_ref.clone())
                .or_default()
                .push(flow.id.clone());
        }
        Self {
            id,
            name,
            start_event_id,
            elements: elements.into_iter().map(|e| (e.id.clone(), e)).collect(),
            flows: flows.into_iter().map(|f| (f.id.clone(), f)).collect(),
            outgoing,
            incoming,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_event_id(&self) -> &str {
        &self.start_event_id
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flows.get(id)
    }

    /// Outgoing flows of an element, preserving XML document order.
    pub fn outgoing_flows(&self, element_id: &str) -> Vec<&SequenceFlow> {
        self.outgoing
            .get(element_id)
            .map(|ids| ids.iter().filter_map(|id| self.flows.get(id)).collect())
            .unwrap_or_default()
    }

    /// Incoming flows of an element, preserving XML document order.
    pub fn incoming_flows(&self, element_id: &str) -> Vec<&SequenceFlow> {
        self.incoming
            .get(element_id)
            .map(|ids| ids.iter().filter_map(|id| self.flows.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn incoming_count(&self, element_id: &str) -> usize {
        self.incoming.get(element_id).map(Vec::len).unwrap_or(0)
    }

    pub fn outgoing_count(&self, element_id: &str) -> usize {
        self.outgoing.get(element_id).map(Vec::len).unwrap_or(0)
    }

    /// Default flow of an exclusive gateway, if one is declared.
    pub fn default_flow_of(&self, gateway_id: &str) -> Option<&str> {
        match self.elements.get(gateway_id) {
            Some(Element {
                kind: ElementKind::ExclusiveGateway { default_flow },
                ..
            }) => default_flow.as_deref(),
            _ => None,
        }
    }

    pub fn user_tasks(&self) -> Vec<&Element> {
        self.elements
            .values()
            .filter(|e| matches!(e.kind, ElementKind::UserTask { .. }))
            .collect()
    }

    pub fn service_tasks(&self) -> Vec<&Element> {
        self.elements
            .values()
            .filter(|e| matches!(e.kind, ElementKind::ServiceTask { .. }))
            .collect()
    }
}
