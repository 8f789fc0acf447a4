use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::NmdcError;

pub const UPSTREAM_OF: &str = "_upstream_of";
pub const DOWNSTREAM_OF: &str = "_downstream_of";

/// One item of a `linked_instances` response.
///
/// Slim responses carry only `id`, `type` and the direction markers; hydrated
/// responses keep every other field in `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedNode {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(
        rename = "_upstream_of",
        default,
        deserialize_with = "present_marker",
        skip_serializing_if = "Option::is_none"
    )]
    pub upstream_of: Option<Vec<String>>,
    #[serde(
        rename = "_downstream_of",
        default,
        deserialize_with = "present_marker",
        skip_serializing_if = "Option::is_none"
    )]
    pub downstream_of: Option<Vec<String>>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// A marker key that is present counts even when its value is `null`; only an
/// absent key leaves the marker unset.
fn present_marker<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let ids = Option::<Vec<String>>::deserialize(deserializer)?;
    Ok(Some(ids.unwrap_or_default()))
}

impl LinkedNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: Some(node_type.into()),
            upstream_of: None,
            downstream_of: None,
            payload: Map::new(),
        }
    }

    pub fn with_upstream_of(mut self, ids: &[&str]) -> Self {
        self.upstream_of = Some(ids.iter().map(|id| id.to_string()).collect());
        self
    }

    pub fn with_downstream_of(mut self, ids: &[&str]) -> Self {
        self.downstream_of = Some(ids.iter().map(|id| id.to_string()).collect());
        self
    }

    pub fn has_upstream_marker(&self) -> bool {
        self.upstream_of.is_some()
    }

    pub fn has_downstream_marker(&self) -> bool {
        self.downstream_of.is_some()
    }

    pub fn is_bidirectional(&self) -> bool {
        self.has_upstream_marker() && self.has_downstream_marker()
    }

    pub fn is_upstream_of(&self, nexus_id: &str) -> bool {
        self.upstream_of
            .as_ref()
            .is_some_and(|ids| ids.iter().any(|id| id == nexus_id))
    }

    pub fn is_downstream_of(&self, nexus_id: &str) -> bool {
        self.downstream_of
            .as_ref()
            .is_some_and(|ids| ids.iter().any(|id| id == nexus_id))
    }

    pub fn type_name(&self) -> &str {
        self.node_type.as_deref().unwrap_or("Unknown")
    }

    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(|value| value.as_str())
    }

    /// The node as a flat JSON object, as the API returned it.
    pub fn to_record(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Relationship direction relative to a traversal's nexus set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upstream,
    Downstream,
    Both,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
            Direction::Both => "both",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = NmdcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "upstream" => Ok(Direction::Upstream),
            "downstream" => Ok(Direction::Downstream),
            "both" => Ok(Direction::Both),
            other => Err(NmdcError::InvalidArgument(format!(
                "direction must be 'upstream', 'downstream', or 'both', got '{other}'"
            ))),
        }
    }
}

/// Which side of a cached edge an entity must sit on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EdgeDirection {
    Outgoing,
    Incoming,
    Both,
}

impl EdgeDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeDirection::Outgoing => "outgoing",
            EdgeDirection::Incoming => "incoming",
            EdgeDirection::Both => "both",
        }
    }
}

impl fmt::Display for EdgeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeDirection {
    type Err = NmdcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "outgoing" => Ok(EdgeDirection::Outgoing),
            "incoming" => Ok(EdgeDirection::Incoming),
            "both" => Ok(EdgeDirection::Both),
            other => Err(NmdcError::InvalidArgument(format!(
                "direction must be 'outgoing', 'incoming', or 'both', got '{other}'"
            ))),
        }
    }
}

/// Edge as handed to the cache; `cached_at` is assigned on write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEdge {
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: String,
    pub source_type: Option<String>,
    pub target_type: Option<String>,
}

impl NewEdge {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relationship_type: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            relationship_type: relationship_type.into(),
            source_type: None,
            target_type: None,
        }
    }

    pub fn source_type(mut self, value: impl Into<String>) -> Self {
        self.source_type = Some(value.into());
        self
    }

    pub fn target_type(mut self, value: impl Into<String>) -> Self {
        self.target_type = Some(value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEdge {
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: String,
    pub source_type: Option<String>,
    pub target_type: Option<String>,
    pub cached_at: DateTime<Utc>,
}

impl CachedEdge {
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.source_id, &self.target_id, &self.relationship_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    LinkedInstances,
    CollectionRecord,
    Manual,
}

impl SyncSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncSource::LinkedInstances => "linked_instances",
            SyncSource::CollectionRecord => "collection_record",
            SyncSource::Manual => "manual",
        }
    }
}

impl fmt::Display for SyncSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncSource {
    type Err = NmdcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "linked_instances" => Ok(SyncSource::LinkedInstances),
            "collection_record" => Ok(SyncSource::CollectionRecord),
            "manual" => Ok(SyncSource::Manual),
            other => Err(NmdcError::Store(format!("unknown sync source '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub entity_id: String,
    pub entity_type: Option<String>,
    pub last_synced: DateTime<Utc>,
    pub link_count: u64,
    pub sync_source: SyncSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_edges: u64,
    pub total_synced_entities: u64,
    pub counts_by_relationship_type: BTreeMap<String, u64>,
    pub oldest_sync: Option<DateTime<Utc>>,
    pub newest_sync: Option<DateTime<Utc>>,
    pub cache_path: String,
}
