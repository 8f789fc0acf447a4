use tracing::warn;

use crate::collection::CollectionSearch;
use crate::domain::LinkedNode;
use crate::error::NmdcError;
use crate::linked_instances::LinkedInstancesSearch;
use crate::transport::NmdcTransport;

pub const BIOSAMPLE_COLLECTION: &str = "biosample_set";

pub struct BiosampleSearch<T: NmdcTransport> {
    collection: CollectionSearch<T>,
    linker: LinkedInstancesSearch<T>,
}

impl<T: NmdcTransport + Clone> BiosampleSearch<T> {
    pub fn new(transport: T) -> Self {
        Self {
            collection: CollectionSearch::new(transport.clone(), BIOSAMPLE_COLLECTION),
            linker: LinkedInstancesSearch::new(transport),
        }
    }
}

impl<T: NmdcTransport> BiosampleSearch<T> {
    pub fn collection(&self) -> &CollectionSearch<T> {
        &self.collection
    }

    pub fn linked_studies(
        &self,
        biosample_id: &str,
        hydrate: bool,
    ) -> Result<Vec<LinkedNode>, NmdcError> {
        self.linker
            .linked_of_type(biosample_id, "nmdc:Study", hydrate)
    }

    /// Data objects derived from the biosample. `data_object_types` can only be
    /// checked against hydrated records and is ignored otherwise.
    pub fn linked_data_objects(
        &self,
        biosample_id: &str,
        hydrate: bool,
        data_object_types: Option<&[String]>,
    ) -> Result<Vec<LinkedNode>, NmdcError> {
        let results = self
            .linker
            .linked_of_type(biosample_id, "nmdc:DataObject", hydrate)?;
        match data_object_types {
            Some(wanted) if !wanted.is_empty() && hydrate => Ok(results
                .into_iter()
                .filter(|node| {
                    node.payload_str("data_object_type")
                        .is_some_and(|kind| wanted.iter().any(|w| w == kind))
                })
                .collect()),
            Some(wanted) if !wanted.is_empty() => {
                warn!("data_object_types filter requires hydrate; returning all data objects");
                Ok(results)
            }
            _ => Ok(results),
        }
    }
}
