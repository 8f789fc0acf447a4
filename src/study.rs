use std::collections::BTreeMap;

use crate::collection::CollectionSearch;
use crate::domain::LinkedNode;
use crate::error::NmdcError;
use crate::linked_instances::LinkedInstancesSearch;
use crate::transport::NmdcTransport;

pub const STUDY_COLLECTION: &str = "study_set";

pub struct StudySearch<T: NmdcTransport> {
    collection: CollectionSearch<T>,
    linker: LinkedInstancesSearch<T>,
}

impl<T: NmdcTransport + Clone> StudySearch<T> {
    pub fn new(transport: T) -> Self {
        Self {
            collection: CollectionSearch::new(transport.clone(), STUDY_COLLECTION),
            linker: LinkedInstancesSearch::new(transport),
        }
    }
}

impl<T: NmdcTransport> StudySearch<T> {
    pub fn collection(&self) -> &CollectionSearch<T> {
        &self.collection
    }

    pub fn linked_biosamples(
        &self,
        study_id: &str,
        hydrate: bool,
    ) -> Result<Vec<LinkedNode>, NmdcError> {
        self.linker.linked_of_type(study_id, "nmdc:Biosample", hydrate)
    }

    pub fn all_linked_data_objects(
        &self,
        study_id: &str,
        hydrate: bool,
    ) -> Result<Vec<LinkedNode>, NmdcError> {
        self.linker.linked_of_type(study_id, "nmdc:DataObject", hydrate)
    }

    /// Data objects keyed by `data_object_type`. Slim results carry no type, so
    /// without hydration everything lands under `Unknown`.
    pub fn linked_data_objects_by_type(
        &self,
        study_id: &str,
        hydrate: bool,
    ) -> Result<BTreeMap<String, Vec<LinkedNode>>, NmdcError> {
        Ok(group_by_data_object_type(
            self.all_linked_data_objects(study_id, hydrate)?,
        ))
    }
}

pub fn group_by_data_object_type(nodes: Vec<LinkedNode>) -> BTreeMap<String, Vec<LinkedNode>> {
    let mut grouped: BTreeMap<String, Vec<LinkedNode>> = BTreeMap::new();
    for node in nodes {
        let kind = node
            .payload_str("data_object_type")
            .unwrap_or("Unknown")
            .to_string();
        grouped.entry(kind).or_default().push(node);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn untyped_data_objects_group_as_unknown() {
        let mut reads = LinkedNode::new("nmdc:dobj-1", "nmdc:DataObject");
        reads
            .payload
            .insert("data_object_type".to_string(), json!("Metagenome Raw Reads"));
        let bare = LinkedNode::new("nmdc:dobj-2", "nmdc:DataObject");

        let grouped = group_by_data_object_type(vec![reads, bare]);
        assert_eq!(grouped["Metagenome Raw Reads"].len(), 1);
        assert_eq!(grouped["Unknown"][0].id, "nmdc:dobj-2");
    }
}
