//! Client for the `/nmdcschema/linked_instances` endpoint.
//!
//! The endpoint walks the NMDC relationship graph server-side and returns every
//! entity reachable from a set of nexus ids, annotated with `_upstream_of` /
//! `_downstream_of` markers naming the nexus ids it relates to.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{Direction, LinkedNode};
use crate::error::NmdcError;
use crate::transport::{NmdcTransport, QueryParams, remote_failure};

pub const LINKED_INSTANCES_PATH: &str = "/nmdcschema/linked_instances";
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

const FIRST_PAGE_FAILURE: &str = "Failed to get linked instances from NMDC API";
const NEXT_PAGE_FAILURE: &str = "Failed to fetch next page of linked instances";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalQuery {
    pub ids: Vec<String>,
    pub types: Option<Vec<String>>,
    pub hydrate: bool,
    pub page_size: u32,
    pub fetch_all_pages: bool,
}

impl TraversalQuery {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            types: None,
            hydrate: false,
            page_size: DEFAULT_PAGE_SIZE,
            fetch_all_pages: true,
        }
    }

    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: Vec<String> = types.into_iter().map(Into::into).collect();
        self.types = if types.is_empty() { None } else { Some(types) };
        self
    }

    pub fn hydrate(mut self, hydrate: bool) -> Self {
        self.hydrate = hydrate;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn first_page_only(mut self) -> Self {
        self.fetch_all_pages = false;
        self
    }

    fn validate(&self) -> Result<(), NmdcError> {
        if self.ids.is_empty() {
            return Err(NmdcError::InvalidArgument(
                "ids must be a non-empty list of NMDC ID strings".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(NmdcError::InvalidArgument(
                "max_page_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn params(&self, page_token: Option<&str>) -> QueryParams {
        let mut params = Vec::with_capacity(self.ids.len() + 4);
        for id in &self.ids {
            params.push(("ids".to_string(), id.clone()));
        }
        if let Some(types) = &self.types {
            for value in types {
                params.push(("types".to_string(), value.clone()));
            }
        }
        params.push(("hydrate".to_string(), self.hydrate.to_string()));
        params.push(("max_page_size".to_string(), self.page_size.to_string()));
        if let Some(token) = page_token {
            params.push(("page_token".to_string(), token.to_string()));
        }
        params
    }
}

/// A single decoded response page.
#[derive(Debug, Clone)]
pub struct Page {
    pub resources: Vec<LinkedNode>,
    pub next_page_token: Option<String>,
}

impl Page {
    pub fn from_json(body: Value) -> Result<Self, NmdcError> {
        let Value::Object(mut body) = body else {
            return Err(NmdcError::RemoteRequestFailed(
                "linked_instances response is not a JSON object".to_string(),
            ));
        };
        let resources = body.remove("resources").ok_or_else(|| {
            NmdcError::RemoteRequestFailed(
                "linked_instances response is missing 'resources'".to_string(),
            )
        })?;
        let resources: Vec<LinkedNode> = serde_json::from_value(resources).map_err(|err| {
            NmdcError::RemoteRequestFailed(format!("unexpected linked_instances payload: {err}"))
        })?;
        let next_page_token = body
            .get("next_page_token")
            .and_then(|value| value.as_str())
            .filter(|token| !token.is_empty())
            .map(|token| token.to_string());
        Ok(Self {
            resources,
            next_page_token,
        })
    }
}

/// Traversal results split by relationship direction.
pub type DirectionalGroups = BTreeMap<String, Vec<LinkedNode>>;

#[derive(Clone)]
pub struct LinkedInstancesSearch<T: NmdcTransport> {
    transport: T,
}

impl<T: NmdcTransport> LinkedInstancesSearch<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns every node reachable from `query.ids`, across all pages when
    /// `fetch_all_pages` is set.
    ///
    /// Pages are requested one after another and concatenated in arrival
    /// order. There is no cap on the number of pages. Any failure discards the
    /// pages collected so far.
    pub fn traverse(&self, query: &TraversalQuery) -> Result<Vec<LinkedNode>, NmdcError> {
        query.validate()?;

        let first = self.fetch_page(query, None)?;
        let mut results = first.resources;
        let mut next_token = first.next_page_token;

        if !query.fetch_all_pages {
            return Ok(results);
        }

        while let Some(token) = next_token {
            info!(token = %preview(&token), "fetching next page");
            let page = self.fetch_page(query, Some(&token))?;
            info!(
                fetched = page.resources.len(),
                total = results.len() + page.resources.len(),
                "fetched linked instances page"
            );
            results.extend(page.resources);
            next_token = page.next_page_token;
        }

        Ok(results)
    }

    /// Every node of `node_type` linked to `id`, all pages.
    pub fn linked_of_type(
        &self,
        id: &str,
        node_type: &str,
        hydrate: bool,
    ) -> Result<Vec<LinkedNode>, NmdcError> {
        self.traverse(
            &TraversalQuery::new([id])
                .types([node_type])
                .hydrate(hydrate),
        )
    }

    /// Traverses and buckets the result by direction; `direction` must be one of
    /// `upstream`, `downstream` or `both`.
    pub fn group_by_direction(
        &self,
        ids: &[String],
        types: Option<&[String]>,
        direction: &str,
        hydrate: bool,
        page_size: u32,
    ) -> Result<DirectionalGroups, NmdcError> {
        let direction: Direction = direction.parse()?;
        self.group_by(ids, types, direction, hydrate, page_size)
    }

    pub fn group_by(
        &self,
        ids: &[String],
        types: Option<&[String]>,
        direction: Direction,
        hydrate: bool,
        page_size: u32,
    ) -> Result<DirectionalGroups, NmdcError> {
        let mut query = TraversalQuery::new(ids.iter().cloned())
            .hydrate(hydrate)
            .page_size(page_size);
        if let Some(types) = types {
            query = query.types(types.iter().cloned());
        }
        let nodes = self.traverse(&query)?;
        Ok(select_direction(classify(nodes), direction))
    }

    fn fetch_page(
        &self,
        query: &TraversalQuery,
        page_token: Option<&str>,
    ) -> Result<Page, NmdcError> {
        let fallback = if page_token.is_some() {
            NEXT_PAGE_FAILURE
        } else {
            FIRST_PAGE_FAILURE
        };
        let body = self
            .transport
            .get_json(LINKED_INSTANCES_PATH, &query.params(page_token))
            .map_err(|err| remote_failure(err, fallback))?;
        let page = Page::from_json(body)?;
        debug!(
            resources = page.resources.len(),
            has_next = page.next_page_token.is_some(),
            "decoded linked instances page"
        );
        Ok(page)
    }
}

/// Buckets nodes by the markers the server attached.
///
/// A node carrying both markers lands in `both`, even when the markers name
/// different nexus ids. Nodes with neither marker are dropped.
#[derive(Debug, Default, Clone)]
pub struct Classified {
    pub upstream: Vec<LinkedNode>,
    pub downstream: Vec<LinkedNode>,
    pub both: Vec<LinkedNode>,
}

pub fn classify(nodes: Vec<LinkedNode>) -> Classified {
    let mut classified = Classified::default();
    for node in nodes {
        match (node.has_upstream_marker(), node.has_downstream_marker()) {
            (true, true) => classified.both.push(node),
            (true, false) => classified.upstream.push(node),
            (false, true) => classified.downstream.push(node),
            (false, false) => {}
        }
    }
    classified
}

pub fn select_direction(classified: Classified, direction: Direction) -> DirectionalGroups {
    let Classified {
        mut upstream,
        mut downstream,
        both,
    } = classified;
    let mut groups = DirectionalGroups::new();
    match direction {
        Direction::Both => {
            groups.insert(Direction::Upstream.to_string(), upstream);
            groups.insert(Direction::Downstream.to_string(), downstream);
            groups.insert(Direction::Both.to_string(), both);
        }
        Direction::Upstream => {
            upstream.extend(both);
            groups.insert(Direction::Upstream.to_string(), upstream);
        }
        Direction::Downstream => {
            downstream.extend(both);
            groups.insert(Direction::Downstream.to_string(), downstream);
        }
    }
    groups
}

pub fn group_by_type(nodes: &[LinkedNode]) -> BTreeMap<String, Vec<LinkedNode>> {
    let mut grouped: BTreeMap<String, Vec<LinkedNode>> = BTreeMap::new();
    for node in nodes {
        grouped
            .entry(node.type_name().to_string())
            .or_default()
            .push(node.clone());
    }
    grouped
}

fn preview(token: &str) -> String {
    let head: String = token.chars().take(20).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_repeat_ids_and_types() {
        let query = TraversalQuery::new(["nmdc:bsm-1", "nmdc:bsm-2"])
            .types(["nmdc:Study"])
            .hydrate(true)
            .page_size(10);
        let params = query.params(Some("tok"));
        assert_eq!(
            params,
            vec![
                ("ids".to_string(), "nmdc:bsm-1".to_string()),
                ("ids".to_string(), "nmdc:bsm-2".to_string()),
                ("types".to_string(), "nmdc:Study".to_string()),
                ("hydrate".to_string(), "true".to_string()),
                ("max_page_size".to_string(), "10".to_string()),
                ("page_token".to_string(), "tok".to_string()),
            ]
        );
    }

    #[test]
    fn empty_token_ends_pagination() {
        let page = Page::from_json(serde_json::json!({
            "resources": [],
            "next_page_token": ""
        }))
        .unwrap();
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn classify_by_markers() {
        let nodes = vec![
            LinkedNode::new("a", "nmdc:Study").with_upstream_of(&["x"]),
            LinkedNode::new("b", "nmdc:DataObject").with_downstream_of(&["x"]),
            LinkedNode::new("c", "nmdc:Biosample")
                .with_upstream_of(&["x"])
                .with_downstream_of(&["y"]),
            LinkedNode::new("d", "nmdc:Study"),
        ];
        let classified = classify(nodes);
        assert_eq!(classified.upstream.len(), 1);
        assert_eq!(classified.downstream.len(), 1);
        assert_eq!(classified.both[0].id, "c");
    }

    #[test]
    fn group_by_type_uses_unknown_for_untyped() {
        let mut untyped = LinkedNode::new("z", "ignored");
        untyped.node_type = None;
        let nodes = vec![LinkedNode::new("a", "nmdc:Study"), untyped];
        let grouped = group_by_type(&nodes);
        assert_eq!(grouped["nmdc:Study"].len(), 1);
        assert_eq!(grouped["Unknown"][0].id, "z");
    }
}
