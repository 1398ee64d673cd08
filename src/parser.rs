//! BPMN 2.0 definition parser.
//!
//! `parse_str` is a pure function over the input bytes: it either returns
//! a fully built, validated [`Process`] or an error, never a partially
//! populated graph. The first `process` element in the document wins; its
//! direct children become flow elements, while `sequenceFlow` elements
//! are collected document-wide (tooling sometimes emits them outside the
//! process body).

use crate::error::ParseError;
use crate::model::{Element, ElementKind, Process, SequenceFlow};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// The BPMN 2.0 model namespace the document must declare.
pub const BPMN_NAMESPACE: &str = "http://www.omg.org/spec/BPMN/20100524/MODEL";

/// Parse a BPMN file from disk.
pub fn parse_file(path: &Path) -> Result<Process, ParseError> {
    let xml = std::fs::read_to_string(path)
        .map_err(|e| ParseError::Xml(format!("cannot read {}: {e}", path.display())))?;
    parse_str(&xml)
}

/// Parse a BPMN definition from its XML text.
pub fn parse_str(xml: &str) -> Result<Process, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut scan = Scan::default();
    let mut depth = 0usize;

    loop {
        match reader.read_event() {
            Err(e) => return Err(ParseError::Xml(e.to_string())),
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                scan.open_element(&e, depth, false)?;
                depth += 1;
            }
            Ok(Event::Empty(e)) => scan.open_element(&e, depth, true)?,
            Ok(Event::End(e)) => {
                depth = depth.saturating_sub(1);
                scan.close_element(local_name(e.name().as_ref()), depth);
            }
            Ok(Event::Text(t)) => {
                if scan.in_condition {
                    let text = t
                        .unescape()
                        .map_err(|e| ParseError::Xml(e.to_string()))?;
                    scan.condition_buf.push_str(&text);
                }
            }
            Ok(Event::CData(t)) => {
                if scan.in_condition {
                    scan.condition_buf
                        .push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Ok(_) => {}
        }
    }

    scan.finish()
}

/// Mutable scan state for a single parse.
#[derive(Default)]
struct Scan {
    namespace_declared: bool,
    process_id: Option<String>,
    process_name: String,
    /// Depth of the captured process element; its children open at +1.
    process_depth: Option<usize>,
    in_process: bool,
    elements: Vec<Element>,
    flows: Vec<RawFlow>,
    /// Index into `flows` while inside a non-empty sequenceFlow element.
    open_flow: Option<usize>,
    /// Index into `elements` while inside a non-empty userTask element.
    open_task: Option<usize>,
    in_condition: bool,
    condition_buf: String,
}

struct RawFlow {
    id: String,
    name: String,
    source_ref: String,
    target_ref: String,
    condition: Option<String>,
}

impl Scan {
    fn open_element(
        &mut self,
        e: &BytesStart<'_>,
        depth: usize,
        is_empty: bool,
    ) -> Result<(), ParseError> {
        let local = local_name(e.name().as_ref());
        let attrs = self.read_attributes(e)?;

        if local == "process" && self.process_id.is_none() {
            let id = attrs
                .get("id")
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| {
                    ParseError::InvalidDefinition("process element has no id".into())
                })?;
            self.process_id = Some(id);
            self.process_name = attrs.get("name").cloned().unwrap_or_default();
            if !is_empty {
                self.process_depth = Some(depth);
                self.in_process = true;
            }
            return Ok(());
        }

        if local == "sequenceFlow" {
            let flow = RawFlow {
                id: require_attr(&attrs, "id", "sequenceFlow")?,
                name: attrs.get("name").cloned().unwrap_or_default(),
                source_ref: require_attr(&attrs, "sourceRef", "sequenceFlow")?,
                target_ref: require_attr(&attrs, "targetRef", "sequenceFlow")?,
                condition: None,
            };
            self.flows.push(flow);
            if !is_empty {
                self.open_flow = Some(self.flows.len() - 1);
            }
            return Ok(());
        }

        if self.open_flow.is_some() && local == "conditionExpression" && !is_empty {
            self.in_condition = true;
            self.condition_buf.clear();
            return Ok(());
        }

        // Form-field descriptors may sit anywhere below the open user task
        // (typically inside an extensionElements wrapper).
        if let Some(task_idx) = self.open_task {
            if local == "formField" {
                if let Some(field_id) = attrs.get("id") {
                    let field_type = attrs.get("type").cloned().unwrap_or_default();
                    if let ElementKind::UserTask { form_fields, .. } =
                        &mut self.elements[task_idx].kind
                    {
                        form_fields.insert(field_id.clone(), field_type);
                    }
                }
            }
            return Ok(());
        }

        // Direct children of the captured process element.
        if self.in_process && Some(depth) == self.process_depth.map(|d| d + 1) {
            let kind = match local.as_str() {
                "startEvent" => ElementKind::StartEvent,
                "endEvent" => ElementKind::EndEvent,
                "userTask" => ElementKind::UserTask {
                    form_key: attrs.get("formKey").cloned().unwrap_or_default(),
                    assignee: attrs.get("assignee").filter(|v| !v.is_empty()).cloned(),
                    form_fields: BTreeMap::new(),
                },
                "serviceTask" => ElementKind::ServiceTask {
                    class_name: attrs.get("class").cloned().unwrap_or_default(),
                    expression: attrs.get("expression").cloned().unwrap_or_default(),
                    topic: attrs.get("topic").cloned().unwrap_or_default(),
                },
                "parallelGateway" => ElementKind::ParallelGateway,
                "exclusiveGateway" => ElementKind::ExclusiveGateway {
                    default_flow: attrs.get("default").filter(|v| !v.is_empty()).cloned(),
                },
                other => return Err(ParseError::UnknownElement(other.to_string())),
            };
            let id = require_attr(&attrs, "id", &local)?;
            let is_user_task = matches!(kind, ElementKind::UserTask { .. });
            self.elements.push(Element {
                id,
                name: attrs.get("name").cloned().unwrap_or_default(),
                kind,
            });
            if is_user_task && !is_empty {
                self.open_task = Some(self.elements.len() - 1);
            }
        }

        Ok(())
    }

    fn close_element(&mut self, local: String, depth: usize) {
        match local.as_str() {
            "conditionExpression" if self.in_condition => {
                self.in_condition = false;
                if let Some(idx) = self.open_flow {
                    let text = self.condition_buf.trim();
                    if !text.is_empty() {
                        self.flows[idx].condition = Some(text.to_string());
                    }
                }
                self.condition_buf.clear();
            }
            "sequenceFlow" => self.open_flow = None,
            "userTask" => self.open_task = None,
            "process" if Some(depth) == self.process_depth => self.in_process = false,
            _ => {}
        }
    }

    fn read_attributes(&mut self, e: &BytesStart<'_>) -> Result<HashMap<String, String>, ParseError> {
        let mut attrs = HashMap::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|e| ParseError::Xml(e.to_string()))?;
            let value = attr
                .unescape_value()
                .map_err(|e| ParseError::Xml(e.to_string()))?
                .into_owned();
            let full_key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            if full_key.starts_with("xmlns") && value == BPMN_NAMESPACE {
                self.namespace_declared = true;
            }
            attrs.insert(local_name(attr.key.as_ref()), value);
        }
        Ok(attrs)
    }

    /// Validate the scan result and assemble the process graph.
    fn finish(self) -> Result<Process, ParseError> {
        if !self.namespace_declared {
            return Err(ParseError::MissingNamespace(BPMN_NAMESPACE));
        }
        let process_id = self.process_id.ok_or(ParseError::NoProcess)?;

        let mut element_ids = HashSet::new();
        for element in &self.elements {
            if !element_ids.insert(element.id.as_str()) {
                return Err(ParseError::InvalidDefinition(format!(
                    "duplicate element id: {}",
                    element.id
                )));
            }
        }

        let mut flow_ids = HashSet::new();
        let mut flows = Vec::with_capacity(self.flows.len());
        for raw in self.flows {
            if !flow_ids.insert(raw.id.clone()) {
                return Err(ParseError::InvalidDefinition(format!(
                    "duplicate sequence flow id: {}",
                    raw.id
                )));
            }
            for endpoint in [&raw.source_ref, &raw.target_ref] {
                if !element_ids.contains(endpoint.as_str()) {
                    return Err(ParseError::InvalidDefinition(format!(
                        "sequence flow {} references unknown element: {endpoint}",
                        raw.id
                    )));
                }
            }
            flows.push(SequenceFlow {
                id: raw.id,
                name: raw.name,
                source_ref: raw.source_ref,
                target_ref: raw.target_ref,
                condition_expression: raw.condition,
            });
        }

        let start_events: Vec<&Element> = self
            .elements
            .iter()
            .filter(|e| matches!(e.kind, ElementKind::StartEvent))
            .collect();
        let start_event_id = match start_events.as_slice() {
            [] => {
                return Err(ParseError::InvalidDefinition(
                    "process has no start event".into(),
                ))
            }
            [only] => only.id.clone(),
            _ => {
                return Err(ParseError::InvalidDefinition(
                    "process has more than one start event".into(),
                ))
            }
        };

        Ok(Process::assemble(
            process_id,
            self.process_name,
            start_event_id,
            self.elements,
            flows,
        ))
    }
}

fn local_name(qname: &[u8]) -> String {
    let name = match qname.iter().rposition(|&b| b == b':') {
        Some(pos) => &qname[pos + 1..],
        None => qname,
    };
    String::from_utf8_lossy(name).into_owned()
}

fn require_attr(
    attrs: &HashMap<String, String>,
    key: &str,
    element: &str,
) -> Result<String, ParseError> {
    attrs
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| {
            ParseError::InvalidDefinition(format!("{element} element is missing {key}"))
        })
}
