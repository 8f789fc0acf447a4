//! Turns API responses into cacheable edges.

use serde_json::{Map, Value};

use crate::domain::{LinkedNode, NewEdge, SyncSource};

pub const REL_UPSTREAM: &str = "upstream";
pub const REL_DOWNSTREAM: &str = "downstream";
pub const REL_PART_OF: &str = "part_of";
pub const REL_WAS_GENERATED_BY: &str = "was_generated_by";

const STUDY_TYPE: &str = "nmdc:Study";
const BIOSAMPLE_TYPE: &str = "nmdc:Biosample";
const DATA_OBJECT_TYPE: &str = "nmdc:DataObject";
const WORKFLOW_EXECUTION_TYPE: &str = "nmdc:WorkflowExecution";

/// Where a batch of edges comes from.
#[derive(Debug, Clone)]
pub enum ExtractionSource {
    /// Nodes returned by a linked-instances traversal rooted at `nexus_id`.
    TraversalResult {
        nexus_id: String,
        nodes: Vec<LinkedNode>,
    },
    /// One record from a collection endpoint (biosample, study, data object...).
    CollectionRecord(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub entity_id: String,
    pub entity_type: Option<String>,
    pub edges: Vec<NewEdge>,
    pub source: SyncSource,
}

/// Returns `None` only for collection records without an `id`.
pub fn extract_edges(source: &ExtractionSource) -> Option<Extraction> {
    match source {
        ExtractionSource::TraversalResult { nexus_id, nodes } => Some(Extraction {
            entity_id: nexus_id.clone(),
            entity_type: None,
            edges: traversal_edges(nexus_id, nodes),
            source: SyncSource::LinkedInstances,
        }),
        ExtractionSource::CollectionRecord(record) => {
            let entity_id = record
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())?;
            let entity_type = record.get("type").and_then(Value::as_str);
            Some(Extraction {
                entity_id: entity_id.to_string(),
                entity_type: entity_type.map(str::to_string),
                edges: record_edges(entity_id, entity_type, record),
                source: SyncSource::CollectionRecord,
            })
        }
    }
}

/// Markers naming a nexus other than `nexus_id` are ignored.
pub fn traversal_edges(nexus_id: &str, nodes: &[LinkedNode]) -> Vec<NewEdge> {
    let mut edges = Vec::new();
    for node in nodes {
        if node.id.is_empty() {
            continue;
        }
        if node.is_upstream_of(nexus_id) {
            let mut edge = NewEdge::new(&node.id, nexus_id, REL_UPSTREAM);
            edge.source_type = node.node_type.clone();
            edges.push(edge);
        }
        if node.is_downstream_of(nexus_id) {
            let mut edge = NewEdge::new(nexus_id, &node.id, REL_DOWNSTREAM);
            edge.target_type = node.node_type.clone();
            edges.push(edge);
        }
    }
    edges
}

fn record_edges(
    record_id: &str,
    record_type: Option<&str>,
    record: &Map<String, Value>,
) -> Vec<NewEdge> {
    let mut edges = Vec::new();

    if let Some(studies) = record.get("associated_studies") {
        for study_id in id_list(studies) {
            edges.push(
                NewEdge::new(record_id, study_id, REL_PART_OF)
                    .source_type(record_type.unwrap_or(BIOSAMPLE_TYPE))
                    .target_type(STUDY_TYPE),
            );
        }
    }

    if let Some(generator) = record.get("was_generated_by") {
        let generators = match generator {
            Value::Array(_) => id_list(generator),
            Value::String(id) if !id.trim().is_empty() => vec![id.trim().to_string()],
            _ => Vec::new(),
        };
        for workflow_id in generators {
            edges.push(
                NewEdge::new(record_id, workflow_id, REL_WAS_GENERATED_BY)
                    .source_type(record_type.unwrap_or(DATA_OBJECT_TYPE))
                    .target_type(WORKFLOW_EXECUTION_TYPE),
            );
        }
    }

    if let Some(parents) = record.get("part_of") {
        for parent_id in id_list(parents) {
            edges.push(
                NewEdge::new(record_id, parent_id, REL_PART_OF)
                    .source_type(record_type.unwrap_or(STUDY_TYPE))
                    .target_type(STUDY_TYPE),
            );
        }
    }

    edges
}

/// Accepts a JSON list of ids or a pipe-delimited string (as written by the
/// flattened exports).
fn id_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(joined) => joined
            .split('|')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
