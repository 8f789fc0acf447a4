//! Flattening of nested NMDC records and file export.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use camino::Utf8Path;
use clap::ValueEnum;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::NmdcError;
use crate::fs_util::write_atomic;

pub const DEFAULT_SEPARATOR: &str = ".";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Auto,
    Csv,
    Tsv,
    Json,
}

impl ExportFormat {
    /// Picks the format from the file extension; unknown extensions get CSV.
    pub fn from_path(path: &Utf8Path) -> Self {
        match path.extension().map(|ext| ext.to_ascii_lowercase()).as_deref() {
            Some("tsv") | Some("tab") => ExportFormat::Tsv,
            Some("json") => ExportFormat::Json,
            _ => ExportFormat::Csv,
        }
    }

    pub fn resolve(self, path: &Utf8Path) -> Self {
        match self {
            ExportFormat::Auto => Self::from_path(path),
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Auto => "auto",
            ExportFormat::Csv => "csv",
            ExportFormat::Tsv => "tsv",
            ExportFormat::Json => "json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = NmdcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(ExportFormat::Auto),
            "csv" => Ok(ExportFormat::Csv),
            "tsv" => Ok(ExportFormat::Tsv),
            "json" => Ok(ExportFormat::Json),
            other => Err(NmdcError::InvalidArgument(format!(
                "unsupported format: {other}"
            ))),
        }
    }
}

/// Flattens a nested record into scalar columns.
///
/// * nested objects become `parent{sep}child` keys; an `nmdc:`-typed object
///   with exactly one other field drops its `type`
/// * lists of scalars are joined with `|` (nulls skipped)
/// * lists of objects become `{key}_count` and `{key}_ids`
/// * mixed lists are kept as JSON text, nulls and empty lists become `""`
pub fn flatten_record(record: &Map<String, Value>, sep: &str) -> Map<String, Value> {
    let mut flat = Map::new();
    flatten_into(record, "", sep, &mut flat);
    flat
}

pub fn flatten_records(records: &[Map<String, Value>], sep: &str) -> Vec<Map<String, Value>> {
    records
        .iter()
        .map(|record| flatten_record(record, sep))
        .collect()
}

fn flatten_into(data: &Map<String, Value>, parent: &str, sep: &str, out: &mut Map<String, Value>) {
    for (key, value) in data {
        let new_key = if parent.is_empty() {
            key.clone()
        } else {
            format!("{parent}{sep}{key}")
        };
        match value {
            Value::Object(inner) => {
                let nmdc_typed = inner
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|kind| kind.starts_with("nmdc:"));
                if nmdc_typed && inner.len() == 2 {
                    let useful: Map<String, Value> = inner
                        .iter()
                        .filter(|(field, _)| field.as_str() != "type")
                        .map(|(field, value)| (field.clone(), value.clone()))
                        .collect();
                    flatten_into(&useful, &new_key, sep, out);
                } else {
                    flatten_into(inner, &new_key, sep, out);
                }
            }
            Value::Array(items) => flatten_list(items, &new_key, out),
            Value::Null => {
                out.insert(new_key, Value::String(String::new()));
            }
            scalar => {
                out.insert(new_key, scalar.clone());
            }
        }
    }
}

fn flatten_list(items: &[Value], key: &str, out: &mut Map<String, Value>) {
    if items.is_empty() {
        out.insert(key.to_string(), Value::String(String::new()));
    } else if items.iter().all(|item| !item.is_object() && !item.is_array()) {
        let joined = items
            .iter()
            .filter(|item| !item.is_null())
            .map(scalar_text)
            .collect::<Vec<_>>()
            .join("|");
        out.insert(key.to_string(), Value::String(joined));
    } else if items.iter().all(Value::is_object) {
        let ids = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                item.get("id")
                    .or_else(|| item.get("name"))
                    .map(scalar_text)
                    .unwrap_or_else(|| index.to_string())
            })
            .collect::<Vec<_>>()
            .join("|");
        out.insert(format!("{key}_count"), Value::from(items.len()));
        out.insert(format!("{key}_ids"), Value::String(ids));
    } else {
        out.insert(
            key.to_string(),
            Value::String(Value::Array(items.to_vec()).to_string()),
        );
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Column order for a delimited export: every key seen, sorted, `id` first.
pub fn header_for(records: &[Map<String, Value>]) -> Vec<String> {
    let keys: BTreeSet<&str> = records
        .iter()
        .flat_map(|record| record.keys().map(String::as_str))
        .collect();
    let mut header: Vec<String> = Vec::with_capacity(keys.len());
    if keys.contains("id") {
        header.push("id".to_string());
    }
    header.extend(
        keys.into_iter()
            .filter(|key| *key != "id")
            .map(str::to_string),
    );
    header
}

/// Renders records as delimiter-separated text with minimal quoting.
pub fn to_delimited(records: &[Map<String, Value>], delimiter: char) -> String {
    let header = header_for(records);
    let mut out = String::new();
    push_row(&mut out, header.iter().map(String::as_str), delimiter);
    for record in records {
        let cells: Vec<String> = header
            .iter()
            .map(|column| record.get(column).map(scalar_text).unwrap_or_default())
            .collect();
        push_row(&mut out, cells.iter().map(String::as_str), delimiter);
    }
    out
}

fn push_row<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>, delimiter: char) {
    for (index, cell) in cells.enumerate() {
        if index > 0 {
            out.push(delimiter);
        }
        out.push_str(&quote_cell(cell, delimiter));
    }
    out.push_str("\r\n");
}

fn quote_cell(cell: &str, delimiter: char) -> String {
    let needs_quotes = cell.contains(delimiter)
        || cell.contains('"')
        || cell.contains('\n')
        || cell.contains('\r');
    if needs_quotes {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

/// Writes `records` to `path` and returns the format actually used.
///
/// With `flatten` set, delimited formats get flattened columns; JSON always
/// receives the records unchanged. An empty record list produces an empty file.
pub fn export_records(
    records: &[Map<String, Value>],
    path: &Utf8Path,
    format: ExportFormat,
    flatten: bool,
) -> Result<ExportFormat, NmdcError> {
    let format = format.resolve(path);
    let content = if records.is_empty() && format != ExportFormat::Json {
        String::new()
    } else {
        match format {
            ExportFormat::Json => serde_json::to_string_pretty(records)
                .map_err(|err| NmdcError::Filesystem(err.to_string()))?,
            ExportFormat::Tsv | ExportFormat::Csv | ExportFormat::Auto => {
                let delimiter = if format == ExportFormat::Tsv { '\t' } else { ',' };
                if flatten {
                    to_delimited(&flatten_records(records, DEFAULT_SEPARATOR), delimiter)
                } else {
                    to_delimited(records, delimiter)
                }
            }
        }
    };
    write_atomic(path, content.as_bytes())?;
    info!(path = %path, format = %format, count = records.len(), "exported records");
    Ok(format)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn flatten_handles_nested_and_typed_objects() {
        let record = map(json!({
            "id": "nmdc:bsm-1",
            "env_broad_scale": {
                "type": "nmdc:ControlledIdentifiedTermValue",
                "has_raw_value": "forest biome",
                "term": {"id": "ENVO:01000174", "type": "nmdc:OntologyClass"}
            },
            "depth": {"type": "nmdc:QuantityValue", "has_numeric_value": 0.5},
            "lat_lon": {"latitude": 1.5, "longitude": null}
        }));
        let flat = flatten_record(&record, ".");

        assert_eq!(flat["env_broad_scale.has_raw_value"], "forest biome");
        assert_eq!(flat["env_broad_scale.type"], "nmdc:ControlledIdentifiedTermValue");
        assert_eq!(flat["env_broad_scale.term.id"], "ENVO:01000174");
        assert!(!flat.contains_key("env_broad_scale.term.type"));
        assert_eq!(flat["depth.has_numeric_value"], 0.5);
        assert!(!flat.contains_key("depth.type"));
        assert_eq!(flat["lat_lon.longitude"], "");
    }

    #[test]
    fn flatten_lists() {
        let record = map(json!({
            "associated_studies": ["nmdc:sty-1", null, "nmdc:sty-2"],
            "has_output": [{"id": "a"}, {"name": "b"}, {"x": 1}],
            "mixed": [1, {"a": 2}],
            "empty": []
        }));
        let flat = flatten_record(&record, ".");

        assert_eq!(flat["associated_studies"], "nmdc:sty-1|nmdc:sty-2");
        assert_eq!(flat["has_output_count"], 3);
        assert_eq!(flat["has_output_ids"], "a|b|2");
        assert_eq!(flat["mixed"], r#"[1,{"a":2}]"#);
        assert_eq!(flat["empty"], "");
    }

    #[test]
    fn delimited_output_quotes_and_orders_columns() {
        let records = vec![
            map(json!({"name": "a, b", "id": "x"})),
            map(json!({"id": "y", "depth": 2, "note": "say \"hi\""})),
        ];
        let text = to_delimited(&records, ',');
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines[0], "id,depth,name,note");
        assert_eq!(lines[1], "x,,\"a, b\",");
        assert_eq!(lines[2], "y,2,,\"say \"\"hi\"\"\"");
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(ExportFormat::from_path(Utf8Path::new("a.TSV")), ExportFormat::Tsv);
        assert_eq!(ExportFormat::from_path(Utf8Path::new("a.tab")), ExportFormat::Tsv);
        assert_eq!(ExportFormat::from_path(Utf8Path::new("a.json")), ExportFormat::Json);
        assert_eq!(ExportFormat::from_path(Utf8Path::new("a.txt")), ExportFormat::Csv);
        assert_eq!(ExportFormat::from_path(Utf8Path::new("noext")), ExportFormat::Csv);
    }
}
