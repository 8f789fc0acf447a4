use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::NmdcError;
use crate::filter::{attribute_filter, ids_filter};
use crate::transport::{NmdcTransport, QueryParams, remote_failure};

pub type Record = Map<String, Value>;

const COLLECTION_FAILURE: &str = "Failed to get collection from NMDC API";
const BY_ID_FAILURE: &str = "Failed to get collection by id from NMDC API";
const COLLECTION_NAME_FAILURE: &str = "Failed to get record from NMDC API";

/// Options shared by every listing call on a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub filter: String,
    pub max_page_size: u32,
    /// Comma separated projection; empty means all fields.
    pub fields: String,
    pub all_pages: bool,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            filter: String::new(),
            max_page_size: 100,
            fields: String::new(),
            all_pages: false,
        }
    }
}

impl RecordQuery {
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn max_page_size(mut self, max_page_size: u32) -> Self {
        self.max_page_size = max_page_size;
        self
    }

    pub fn fields(mut self, fields: impl Into<String>) -> Self {
        self.fields = fields.into();
        self
    }

    pub fn all_pages(mut self, all_pages: bool) -> Self {
        self.all_pages = all_pages;
        self
    }

    fn params(&self, page_token: Option<&str>) -> QueryParams {
        let mut params = vec![
            ("filter".to_string(), self.filter.clone()),
            ("max_page_size".to_string(), self.max_page_size.to_string()),
            ("projection".to_string(), self.fields.clone()),
        ];
        if let Some(token) = page_token {
            params.push(("page_token".to_string(), token.to_string()));
        }
        params
    }
}

/// Generic access to one `/nmdcschema/{collection}` endpoint.
#[derive(Clone)]
pub struct CollectionSearch<T: NmdcTransport> {
    transport: T,
    collection_name: String,
}

impl<T: NmdcTransport> CollectionSearch<T> {
    pub fn new(transport: T, collection_name: impl Into<String>) -> Self {
        Self {
            transport,
            collection_name: collection_name.into(),
        }
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn get_records(&self, query: &RecordQuery) -> Result<Vec<Record>, NmdcError> {
        if query.max_page_size == 0 {
            return Err(NmdcError::InvalidArgument(
                "max_page_size must be greater than zero".to_string(),
            ));
        }
        debug!(collection = %self.collection_name, filter = %query.filter, "get_records");
        let path = format!("/nmdcschema/{}", self.collection_name);

        let (mut records, mut next_token) = self.fetch_page(&path, query, None)?;
        if !query.all_pages {
            return Ok(records);
        }
        while let Some(token) = next_token {
            let (page, token) = self.fetch_page(&path, query, Some(&token))?;
            records.extend(page);
            next_token = token;
        }
        info!(collection = %self.collection_name, count = records.len(), "fetched records");
        Ok(records)
    }

    pub fn get_record_by_filter(
        &self,
        filter: &str,
        max_page_size: u32,
        fields: &str,
        all_pages: bool,
    ) -> Result<Vec<Record>, NmdcError> {
        self.get_records(
            &RecordQuery::default()
                .filter(filter)
                .max_page_size(max_page_size)
                .fields(fields)
                .all_pages(all_pages),
        )
    }

    pub fn get_record_by_attribute(
        &self,
        attribute_name: &str,
        attribute_value: &str,
        max_page_size: u32,
        fields: &str,
        all_pages: bool,
        exact_match: bool,
    ) -> Result<Vec<Record>, NmdcError> {
        let filter = attribute_filter(attribute_name, attribute_value, exact_match);
        debug!(filter = %filter, "get_record_by_attribute");
        self.get_record_by_filter(&filter, max_page_size, fields, all_pages)
    }

    pub fn get_record_by_id(&self, id: &str, fields: &str) -> Result<Record, NmdcError> {
        let path = format!("/nmdcschema/{}/{}", self.collection_name, id);
        let body = self
            .transport
            .get_json(&path, &[("projection".to_string(), fields.to_string())])
            .map_err(|err| remote_failure(err, BY_ID_FAILURE))?;
        match body {
            Value::Object(record) => Ok(record),
            other => Err(NmdcError::RemoteRequestFailed(format!(
                "expected a record object for {id}, got {other}"
            ))),
        }
    }

    /// Fails with `IdsNotFound` listing every id the collection does not hold.
    pub fn check_ids_exist(&self, ids: &[String]) -> Result<(), NmdcError> {
        let unique: Vec<String> = ids
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if unique.is_empty() {
            return Ok(());
        }
        let found = self.get_records(
            &RecordQuery::default()
                .filter(ids_filter(&unique))
                .max_page_size(unique.len() as u32)
                .fields("id"),
        )?;
        let found: BTreeSet<&str> = found
            .iter()
            .filter_map(|record| record.get("id").and_then(Value::as_str))
            .collect();
        let missing: Vec<String> = unique
            .iter()
            .filter(|id| !found.contains(id.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(NmdcError::IdsNotFound(missing))
        }
    }

    fn fetch_page(
        &self,
        path: &str,
        query: &RecordQuery,
        page_token: Option<&str>,
    ) -> Result<(Vec<Record>, Option<String>), NmdcError> {
        let body = self
            .transport
            .get_json(path, &query.params(page_token))
            .map_err(|err| remote_failure(err, COLLECTION_FAILURE))?;
        read_resources(body)
    }
}

/// Name of the collection holding `id`, e.g. `biosample_set`.
pub fn collection_name<T: NmdcTransport>(transport: &T, id: &str) -> Result<String, NmdcError> {
    if id.trim().is_empty() {
        return Err(NmdcError::InvalidArgument("id cannot be empty".to_string()));
    }
    let body = transport
        .get_json(&format!("/nmdcschema/ids/{id}/collection-name"), &[])
        .map_err(|err| remote_failure(err, COLLECTION_NAME_FAILURE))?;
    debug!(id, body = %body, "collection name lookup");
    body.get("collection_name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            NmdcError::RemoteRequestFailed(format!("no collection name returned for {id}"))
        })
}

/// Splits a paged response into its `resources` records and continuation token.
pub fn read_resources(body: Value) -> Result<(Vec<Record>, Option<String>), NmdcError> {
    let Value::Object(mut body) = body else {
        return Err(NmdcError::RemoteRequestFailed(
            "response is not a JSON object".to_string(),
        ));
    };
    let Some(Value::Array(resources)) = body.remove("resources") else {
        return Err(NmdcError::RemoteRequestFailed(
            "response is missing 'resources'".to_string(),
        ));
    };
    let records = resources
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(record) => Some(record),
            _ => None,
        })
        .collect();
    let next_token = body
        .get("next_page_token")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string);
    Ok((records, next_token))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn record_query_params() {
        let query = RecordQuery::default()
            .filter(r#"{"id":"x"}"#)
            .fields("id,name")
            .max_page_size(5);
        let params = query.params(Some("next"));
        assert_eq!(params[0], ("filter".to_string(), r#"{"id":"x"}"#.to_string()));
        assert_eq!(params[2], ("projection".to_string(), "id,name".to_string()));
        assert_eq!(params[3], ("page_token".to_string(), "next".to_string()));
    }

    #[test]
    fn resources_are_required() {
        assert_matches!(
            read_resources(json!({"results": []})),
            Err(NmdcError::RemoteRequestFailed(_))
        );
        let (records, token) =
            read_resources(json!({"resources": [{"id": "a"}], "next_page_token": null})).unwrap();
        assert_eq!(records.len(), 1);
        assert!(token.is_none());
    }
}
