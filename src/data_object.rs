use serde::Serialize;
use serde_json::Value;

use crate::collection::{CollectionSearch, Record};
use crate::domain::{Direction, LinkedNode};
use crate::error::NmdcError;
use crate::linked_instances::{DEFAULT_PAGE_SIZE, LinkedInstancesSearch};
use crate::transport::{NmdcTransport, remote_failure};

pub const DATA_OBJECT_COLLECTION: &str = "data_object_set";

/// Upstream lineage of a data object, bucketed by entity kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProvenanceChain {
    pub biosamples: Vec<LinkedNode>,
    pub studies: Vec<LinkedNode>,
    pub workflow_executions: Vec<LinkedNode>,
    pub data_generations: Vec<LinkedNode>,
    pub processed_samples: Vec<LinkedNode>,
    pub data_objects: Vec<LinkedNode>,
}

impl ProvenanceChain {
    /// Nodes of any other type are left out.
    pub fn from_nodes(nodes: Vec<LinkedNode>) -> Self {
        let mut chain = Self::default();
        for node in nodes {
            let kind = node.node_type.as_deref().unwrap_or("");
            let bucket = if kind == "nmdc:Biosample" {
                &mut chain.biosamples
            } else if kind == "nmdc:Study" {
                &mut chain.studies
            } else if kind.contains("WorkflowExecution") || kind.contains("Analysis") {
                &mut chain.workflow_executions
            } else if kind.contains("DataGeneration")
                || (kind.starts_with("nmdc:") && kind.ends_with("ometry"))
            {
                &mut chain.data_generations
            } else if kind == "nmdc:ProcessedSample" {
                &mut chain.processed_samples
            } else if kind == "nmdc:DataObject" {
                &mut chain.data_objects
            } else {
                continue;
            };
            bucket.push(node);
        }
        chain
    }

    pub fn total(&self) -> usize {
        self.biosamples.len()
            + self.studies.len()
            + self.workflow_executions.len()
            + self.data_generations.len()
            + self.processed_samples.len()
            + self.data_objects.len()
    }
}

pub struct DataObjectSearch<T: NmdcTransport> {
    collection: CollectionSearch<T>,
    linker: LinkedInstancesSearch<T>,
}

impl<T: NmdcTransport + Clone> DataObjectSearch<T> {
    pub fn new(transport: T) -> Self {
        Self {
            collection: CollectionSearch::new(transport.clone(), DATA_OBJECT_COLLECTION),
            linker: LinkedInstancesSearch::new(transport),
        }
    }
}

impl<T: NmdcTransport> DataObjectSearch<T> {
    pub fn collection(&self) -> &CollectionSearch<T> {
        &self.collection
    }

    /// `/data_objects/study/{id}`: the study's biosamples with their data objects.
    pub fn data_objects_for_study(
        &self,
        study_id: &str,
        max_page_size: u32,
    ) -> Result<Vec<Record>, NmdcError> {
        let path = format!("/data_objects/study/{study_id}");
        let body = self
            .collection
            .transport()
            .get_json(
                &path,
                &[("max_page_size".to_string(), max_page_size.to_string())],
            )
            .map_err(|err| remote_failure(err, "Failed to get data_objects from NMDC API"))?;
        let items = match body {
            Value::Array(items) => items,
            Value::Object(mut body) => match body.remove("resources") {
                Some(Value::Array(items)) => items,
                _ => vec![Value::Object(body)],
            },
            other => {
                return Err(NmdcError::RemoteRequestFailed(format!(
                    "unexpected data_objects response: {other}"
                )));
            }
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(record) => Some(record),
                _ => None,
            })
            .collect())
    }

    pub fn linked_biosamples(
        &self,
        data_object_id: &str,
        hydrate: bool,
    ) -> Result<Vec<LinkedNode>, NmdcError> {
        self.linker
            .linked_of_type(data_object_id, "nmdc:Biosample", hydrate)
    }

    pub fn linked_studies(
        &self,
        data_object_id: &str,
        hydrate: bool,
    ) -> Result<Vec<LinkedNode>, NmdcError> {
        self.linker
            .linked_of_type(data_object_id, "nmdc:Study", hydrate)
    }

    pub fn provenance_chain(
        &self,
        data_object_id: &str,
        hydrate: bool,
    ) -> Result<ProvenanceChain, NmdcError> {
        let mut groups = self.linker.group_by(
            &[data_object_id.to_string()],
            None,
            Direction::Upstream,
            hydrate,
            DEFAULT_PAGE_SIZE,
        )?;
        let upstream = groups
            .remove(Direction::Upstream.as_str())
            .unwrap_or_default();
        Ok(ProvenanceChain::from_nodes(upstream))
    }
}
