//! Biosample search by functional annotation (PFAM, KEGG, COG, GO).
//!
//! The `/nmdcschema` API cannot filter on annotations, so this client talks to
//! the data portal's `/api/biosample/search` endpoint instead. The endpoint
//! ANDs its conditions natively; OR is one request per function, merged and
//! deduplicated by biosample id here.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::collection::Record;
use crate::error::NmdcError;
use crate::transport::{NmdcTransport, QueryParams, remote_failure};

pub const BIOSAMPLE_SEARCH_PATH: &str = "/api/biosample/search";
pub const DEFAULT_LIMIT: u32 = 100;

const SEARCH_FAILURE: &str = "Failed to search biosamples";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Pfam,
    Kegg,
    Cog,
    Go,
}

impl FunctionKind {
    /// Accepts the CURIE prefixes the portal knows; `KEGG` is taken as
    /// `KEGG.ORTHOLOGY`.
    pub fn from_prefix(prefix: &str) -> Result<Self, NmdcError> {
        match prefix {
            "PFAM" => Ok(FunctionKind::Pfam),
            "KEGG.ORTHOLOGY" | "KEGG" => Ok(FunctionKind::Kegg),
            "COG" => Ok(FunctionKind::Cog),
            "GO" => Ok(FunctionKind::Go),
            other => Err(NmdcError::InvalidArgument(format!(
                "unsupported function type '{other}', supported types: PFAM, KEGG.ORTHOLOGY, KEGG, COG, GO"
            ))),
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            FunctionKind::Pfam => "pfam_function",
            FunctionKind::Kegg => "kegg_function",
            FunctionKind::Cog => "cog_function",
            FunctionKind::Go => "go_function",
        }
    }
}

/// A parsed function identifier. The prefix is kept as written, so
/// `KEGG:K00001` stays `KEGG:K00001` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionId {
    pub prefix: String,
    pub id: String,
    pub kind: FunctionKind,
}

impl FunctionId {
    pub fn curie(&self) -> String {
        format!("{}:{}", self.prefix, self.id)
    }

    fn condition(&self) -> Value {
        json!({
            "op": "==",
            "field": "id",
            "value": self.curie(),
            "table": self.kind.table(),
        })
    }
}

impl FromStr for FunctionId {
    type Err = NmdcError;

    /// `PREFIX:ID`, or a bare id whose prefix is inferred: `PF…` (7+ chars) is
    /// PFAM, `K` + digits is KEGG orthology, `COG…` is COG and `GO…` is GO.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = match value.split_once(':') {
            Some((prefix, id)) => (prefix, id),
            None => (infer_prefix(value)?, value),
        };
        Ok(Self {
            kind: FunctionKind::from_prefix(prefix)?,
            prefix: prefix.to_string(),
            id: id.to_string(),
        })
    }
}

fn infer_prefix(value: &str) -> Result<&'static str, NmdcError> {
    if value.starts_with("PF") && value.chars().count() >= 7 {
        return Ok("PFAM");
    }
    if let Some(digits) = value.strip_prefix('K') {
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            return Ok("KEGG.ORTHOLOGY");
        }
    }
    if value.starts_with("COG") {
        return Ok("COG");
    }
    if value.starts_with("GO") {
        return Ok("GO");
    }
    Err(NmdcError::InvalidArgument(format!(
        "cannot parse function id '{value}', expected PREFIX:ID (e.g. PFAM:PF00005) or a recognizable id"
    )))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum MatchLogic {
    /// Biosamples carrying every function.
    #[default]
    #[serde(rename = "AND")]
    All,
    /// Biosamples carrying at least one function.
    #[serde(rename = "OR")]
    Any,
}

impl fmt::Display for MatchLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchLogic::All => write!(f, "AND"),
            MatchLogic::Any => write!(f, "OR"),
        }
    }
}

impl FromStr for MatchLogic {
    type Err = NmdcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "AND" => Ok(MatchLogic::All),
            "OR" => Ok(MatchLogic::Any),
            _ => Err(NmdcError::InvalidArgument(format!(
                "logic must be 'AND' or 'OR', got '{value}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchCriteria {
    pub function_ids: Vec<String>,
    pub limit: u32,
    pub offset: u32,
    pub logic: MatchLogic,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionSearchResult {
    /// Matching biosamples known to the portal (AND), or the number of unique
    /// biosamples merged across requests (OR).
    pub count: u64,
    pub results: Vec<Record>,
    pub search_criteria: SearchCriteria,
}

pub struct FunctionalBiosampleSearch<T: NmdcTransport> {
    transport: T,
}

impl<T: NmdcTransport> FunctionalBiosampleSearch<T> {
    /// `transport` must point at the data portal, see
    /// [`ClientConfig::data_for_env`](crate::config::ClientConfig::data_for_env).
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn search_by_functions(
        &self,
        function_ids: &[String],
        limit: u32,
        offset: u32,
        logic: MatchLogic,
    ) -> Result<FunctionSearchResult, NmdcError> {
        if function_ids.is_empty() {
            return Err(NmdcError::InvalidArgument(
                "function ids cannot be empty".to_string(),
            ));
        }
        let functions = function_ids
            .iter()
            .map(|id| id.parse::<FunctionId>())
            .collect::<Result<Vec<_>, _>>()?;
        let criteria = SearchCriteria {
            function_ids: functions.iter().map(FunctionId::curie).collect(),
            limit,
            offset,
            logic,
        };
        info!(logic = %logic, functions = ?criteria.function_ids, "searching biosamples by function");

        let (count, results) = match logic {
            MatchLogic::All => self.search_all(&functions, limit, offset)?,
            MatchLogic::Any => self.search_any(&functions, limit, offset)?,
        };
        Ok(FunctionSearchResult {
            count,
            results,
            search_criteria: criteria,
        })
    }

    pub fn search_by_pfam(
        &self,
        pfam_ids: &[String],
        limit: u32,
        require_all: bool,
    ) -> Result<FunctionSearchResult, NmdcError> {
        let ids = with_prefix(pfam_ids, "PFAM", |id| id.starts_with("PFAM:"));
        self.search_by_functions(&ids, limit, 0, logic_for(require_all))
    }

    pub fn search_by_kegg(
        &self,
        kegg_ids: &[String],
        limit: u32,
        require_all: bool,
    ) -> Result<FunctionSearchResult, NmdcError> {
        let ids = with_prefix(kegg_ids, "KEGG.ORTHOLOGY", |id| id.contains(':'));
        self.search_by_functions(&ids, limit, 0, logic_for(require_all))
    }

    pub fn search_by_cog(
        &self,
        cog_ids: &[String],
        limit: u32,
        require_all: bool,
    ) -> Result<FunctionSearchResult, NmdcError> {
        let ids = with_prefix(cog_ids, "COG", |id| id.starts_with("COG:"));
        self.search_by_functions(&ids, limit, 0, logic_for(require_all))
    }

    pub fn search_by_go(
        &self,
        go_ids: &[String],
        limit: u32,
        require_all: bool,
    ) -> Result<FunctionSearchResult, NmdcError> {
        let ids = with_prefix(go_ids, "GO", |id| id.starts_with("GO:"));
        self.search_by_functions(&ids, limit, 0, logic_for(require_all))
    }

    fn search_all(
        &self,
        functions: &[FunctionId],
        limit: u32,
        offset: u32,
    ) -> Result<(u64, Vec<Record>), NmdcError> {
        let conditions: Vec<Value> = functions.iter().map(FunctionId::condition).collect();
        let body = self
            .post(conditions, limit, offset)
            .map_err(|err| remote_failure(err, SEARCH_FAILURE))?;
        let count = body.get("count").and_then(Value::as_u64).unwrap_or(0);
        Ok((count, results_of(body)))
    }

    /// One request per function with a widened limit so the merged set can
    /// still fill `limit` after deduplication. A failed request is skipped
    /// unless every request fails.
    fn search_any(
        &self,
        functions: &[FunctionId],
        limit: u32,
        offset: u32,
    ) -> Result<(u64, Vec<Record>), NmdcError> {
        let per_query = limit.saturating_mul(functions.len() as u32);
        let mut seen = BTreeSet::new();
        let mut merged = Vec::new();
        let mut last_error = None;
        let mut answered = 0;

        for function in functions {
            let body = match self.post(vec![function.condition()], per_query, offset) {
                Ok(body) => body,
                Err(err) => {
                    warn!(function = %function.curie(), error = %err, "function query failed");
                    last_error = Some(err);
                    continue;
                }
            };
            answered += 1;
            for record in results_of(body) {
                let Some(id) = record.get("id").and_then(Value::as_str) else {
                    continue;
                };
                if seen.insert(id.to_string()) {
                    merged.push(record);
                }
            }
        }

        if answered == 0 {
            if let Some(err) = last_error {
                return Err(remote_failure(err, SEARCH_FAILURE));
            }
        }
        let count = merged.len() as u64;
        merged.truncate(limit as usize);
        Ok((count, merged))
    }

    fn post(&self, conditions: Vec<Value>, limit: u32, offset: u32) -> Result<Value, NmdcError> {
        let query: QueryParams = vec![
            ("limit".to_string(), limit.to_string()),
            ("offset".to_string(), offset.to_string()),
        ];
        let payload = json!({
            "data_object_filter": [],
            "conditions": conditions,
        });
        self.transport
            .post_json(BIOSAMPLE_SEARCH_PATH, &query, &payload)
    }
}

fn logic_for(require_all: bool) -> MatchLogic {
    if require_all {
        MatchLogic::All
    } else {
        MatchLogic::Any
    }
}

fn with_prefix(ids: &[String], prefix: &str, has_prefix: impl Fn(&str) -> bool) -> Vec<String> {
    ids.iter()
        .map(|id| {
            if has_prefix(id) {
                id.clone()
            } else {
                format!("{prefix}:{id}")
            }
        })
        .collect()
}

fn results_of(body: Value) -> Vec<Record> {
    match body {
        Value::Object(mut body) => match body.remove("results") {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(record) => Some(record),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}
