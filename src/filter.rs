//! MongoDB-style filter strings for the collection endpoints.

use std::str::FromStr;

use serde_json::{Map, Value, json};

use crate::error::NmdcError;

/// Normalizes a user-supplied filter to compact JSON.
///
/// Input starting with `{` is tried as JSON first; anything else (or JSON
/// that fails to parse) is read as YAML, so `ecosystem_category: Plants`
/// works as well as `{"ecosystem_category": "Plants"}`. Blank input means no
/// filter and yields an empty string.
pub fn parse_filter(input: &str) -> Result<String, NmdcError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(String::new());
    }

    if input.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(input) {
            return Ok(value.to_string());
        }
    }

    let parsed: serde_yaml::Value =
        serde_yaml::from_str(input).map_err(|err| NmdcError::InvalidFilter(err.to_string()))?;
    if !parsed.is_mapping() {
        return Err(NmdcError::InvalidFilter(format!(
            "filter must be a key-value mapping, got: {}",
            yaml_kind(&parsed)
        )));
    }
    let value = serde_json::to_value(parsed)
        .map_err(|err| NmdcError::InvalidFilter(err.to_string()))?;
    Ok(value.to_string())
}

fn yaml_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "bool",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "list",
        serde_yaml::Value::Mapping(_) => "mapping",
        serde_yaml::Value::Tagged(_) => "tagged value",
    }
}

/// Backslash-escapes every non-word character so the value matches literally
/// inside a `$regex`. Once serialized into the JSON filter the escapes appear
/// doubled (`GC\\-MS`).
pub fn escape_regex_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if !(ch.is_alphanumeric() || ch == '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Filter on a single attribute: exact equality, or a case-insensitive
/// substring regex.
pub fn attribute_filter(name: &str, value: &str, exact_match: bool) -> String {
    let condition = if exact_match {
        Value::String(value.to_string())
    } else {
        json!({ "$regex": escape_regex_value(value), "$options": "i" })
    };
    let mut filter = Map::new();
    filter.insert(name.to_string(), condition);
    Value::Object(filter).to_string()
}

/// Filter matching any of `ids`.
pub fn ids_filter(ids: &[String]) -> String {
    json!({ "id": { "$in": ids } }).to_string()
}

/// Shallow merge of two JSON filters; keys in `second` win.
pub fn merge_filters(first: &str, second: &str) -> Result<String, NmdcError> {
    let mut merged = filter_object(first)?;
    merged.extend(filter_object(second)?);
    Ok(Value::Object(merged).to_string())
}

fn filter_object(filter: &str) -> Result<Map<String, Value>, NmdcError> {
    if filter.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(filter) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(NmdcError::InvalidFilter(
            "filter must be a JSON object".to_string(),
        )),
        Err(err) => Err(NmdcError::InvalidFilter(err.to_string())),
    }
}

/// Geographic bounding box over `lat_lon`, parsed from
/// `min_lat,min_lon,max_lat,max_lon`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub min_longitude: f64,
    pub max_latitude: f64,
    pub max_longitude: f64,
}

impl BoundingBox {
    pub fn new(
        min_latitude: f64,
        min_longitude: f64,
        max_latitude: f64,
        max_longitude: f64,
    ) -> Result<Self, NmdcError> {
        check_range("min_latitude", min_latitude, 90.0)?;
        check_range("max_latitude", max_latitude, 90.0)?;
        check_range("min_longitude", min_longitude, 180.0)?;
        check_range("max_longitude", max_longitude, 180.0)?;
        Ok(Self {
            min_latitude,
            min_longitude,
            max_latitude,
            max_longitude,
        })
    }

    pub fn to_filter(&self) -> String {
        json!({
            "lat_lon.latitude": { "$gte": self.min_latitude, "$lte": self.max_latitude },
            "lat_lon.longitude": { "$gte": self.min_longitude, "$lte": self.max_longitude },
        })
        .to_string()
    }
}

fn check_range(name: &str, value: f64, limit: f64) -> Result<(), NmdcError> {
    if (-limit..=limit).contains(&value) {
        Ok(())
    } else {
        Err(NmdcError::InvalidFilter(format!(
            "{name} must be between -{limit} and {limit}, got {value}"
        )))
    }
}

impl FromStr for BoundingBox {
    type Err = NmdcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| NmdcError::InvalidFilter(format!("invalid bounding box: {err}")))?;
        match parts.as_slice() {
            [min_lat, min_lon, max_lat, max_lon] => {
                Self::new(*min_lat, *min_lon, *max_lat, *max_lon)
            }
            _ => Err(NmdcError::InvalidFilter(
                "bounding box must have exactly 4 values: min_lat,min_lon,max_lat,max_lon"
                    .to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn yaml_and_json_normalize_alike() {
        let from_yaml = parse_filter("ecosystem_category: Plants").unwrap();
        let from_json = parse_filter(r#"{ "ecosystem_category" : "Plants" }"#).unwrap();
        assert_eq!(from_yaml, r#"{"ecosystem_category":"Plants"}"#);
        assert_eq!(from_yaml, from_json);
        assert_eq!(parse_filter("   ").unwrap(), "");
    }

    #[test]
    fn scalar_yaml_is_rejected() {
        assert_matches!(parse_filter("just text"), Err(NmdcError::InvalidFilter(_)));
        assert_matches!(parse_filter("- a\n- b"), Err(NmdcError::InvalidFilter(_)));
    }

    #[test]
    fn regex_escaping() {
        assert_eq!(escape_regex_value("GC-MS (2009)"), r"GC\-MS\ \(2009\)");
        let filter = attribute_filter("name", "GC-MS", false);
        assert_eq!(filter, r#"{"name":{"$options":"i","$regex":"GC\\-MS"}}"#);
        assert_eq!(
            attribute_filter("name", "GC-MS", true),
            r#"{"name":"GC-MS"}"#
        );
    }

    #[test]
    fn bounding_box_merges_into_filter() {
        let bbox: BoundingBox = "32.5,-124.5,42.0,-114.0".parse().unwrap();
        let merged = merge_filters(r#"{"ecosystem_category":"Terrestrial"}"#, &bbox.to_filter())
            .unwrap();
        let value: Value = serde_json::from_str(&merged).unwrap();
        assert_eq!(value["ecosystem_category"], "Terrestrial");
        assert_eq!(value["lat_lon.latitude"]["$gte"], 32.5);

        assert_matches!("95,0,10,10".parse::<BoundingBox>(), Err(NmdcError::InvalidFilter(_)));
        assert_matches!("1,2,3".parse::<BoundingBox>(), Err(NmdcError::InvalidFilter(_)));
    }
}
