//! Query Normalizer
//!
//! Canonical cache keys for filter maps. Two filters that mean the same thing
//! produce the same key regardless of field order, letter case of
//! case-insensitive values, element order in sets, or presence of empty
//! fields.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::cache::fx_hash;
use crate::error::{Error, Result};

/// Normalizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Fields whose string values keep their case
    pub case_sensitive_fields: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            case_sensitive_fields: vec!["id".to_string(), "slug".to_string()],
        }
    }
}

/// Builds canonical cache keys from filter maps
#[derive(Debug, Clone)]
pub struct Normalizer {
    case_sensitive: HashSet<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(&NormalizerConfig::default())
    }
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        Self {
            case_sensitive: config.case_sensitive_fields.iter().cloned().collect(),
        }
    }

    /// Canonical key `namespace:{field:value,...}` for `filter`
    pub fn normalize(&self, namespace: &str, filter: &Map<String, Value>) -> String {
        let body = self
            .canonical_object(filter, false)
            .unwrap_or_else(|| "{}".to_string());
        format!("{}:{}", namespace, body)
    }

    fn canonical_object(&self, object: &Map<String, Value>, keep_case: bool) -> Option<String> {
        let mut fields = BTreeMap::new();
        for (name, value) in object {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let keep_case = keep_case || self.case_sensitive.contains(name);
            if let Some(rendered) = self.canonical_value(value, keep_case) {
                fields.insert(escape(name), rendered);
            }
        }
        if fields.is_empty() {
            return None;
        }

        let body: Vec<String> = fields
            .into_iter()
            .map(|(name, value)| format!("{}:{}", name, value))
            .collect();
        Some(format!("{{{}}}", body.join(",")))
    }

    /// None for values that carry no constraint
    fn canonical_value(&self, value: &Value, keep_case: bool) -> Option<String> {
        match value {
            Value::Null | Value::Bool(false) => None,
            Value::Bool(true) => Some("true".to_string()),
            Value::Number(n) => canonical_number(n),
            Value::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    None
                } else if keep_case {
                    Some(escape(s))
                } else {
                    Some(escape(&s.to_lowercase()))
                }
            }
            // Arrays are sets
            Value::Array(items) => {
                let set: BTreeSet<String> = items
                    .iter()
                    .filter_map(|item| self.canonical_value(item, keep_case))
                    .collect();
                if set.is_empty() {
                    None
                } else {
                    Some(format!("[{}]", set.into_iter().collect::<Vec<_>>().join(",")))
                }
            }
            Value::Object(object) => self.canonical_object(object, keep_case),
        }
    }
}

fn canonical_number(n: &Number) -> Option<String> {
    if let Some(i) = n.as_i64() {
        return (i != 0).then(|| i.to_string());
    }
    if let Some(u) = n.as_u64() {
        return Some(u.to_string());
    }
    let f = n.as_f64()?;
    if f == 0.0 {
        None
    } else if f.fract() == 0.0 && f.abs() < 1e15 {
        // 100.0 and 100 are the same constraint
        Some((f as i64).to_string())
    } else {
        Some(f.to_string())
    }
}

fn escape(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

/// Normalize with the default configuration
pub fn normalize(namespace: &str, filter: &Map<String, Value>) -> String {
    Normalizer::default().normalize(namespace, filter)
}

/// Stable 64-bit hex digest, used for ETags
pub fn fingerprint(data: impl AsRef<[u8]>) -> String {
    format!("{:016x}", fx_hash(data.as_ref()))
}

/// Parse `?location=Galle&amenities=wifi,pool&capacity_min=50` into a filter
/// map.
///
/// Comma-separated values become arrays, `<field>_min` / `<field>_max` become
/// a `{min, max}` object under `<field>`, repeated keys are merged into an
/// array, and numeric or boolean literals are typed except in text fields.
pub fn parse_query_string(query: &str) -> Result<Map<String, Value>> {
    let mut filter = Map::new();

    for pair in query.trim_start_matches('?').split('&') {
        if pair.is_empty() {
            continue;
        }
        let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(raw_key)?;
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let raw_value = decode_component(raw_value)?;

        if let Some((field, bound)) = range_bound(key) {
            let value = parse_value(&raw_value, true);
            let slot = filter
                .entry(field.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match slot {
                Value::Object(range) => {
                    range.insert(bound.to_string(), value);
                }
                _ => {
                    return Err(Error::InvalidRequest(format!(
                        "'{}' given both as a value and as a range",
                        field
                    )))
                }
            }
            continue;
        }

        let value = parse_value(&raw_value, !TEXT_FIELDS.contains(&key));
        match filter.get_mut(key) {
            None => {
                filter.insert(key.to_string(), value);
            }
            Some(Value::Object(_)) => {
                return Err(Error::InvalidRequest(format!(
                    "'{}' given both as a value and as a range",
                    key
                )))
            }
            Some(existing) => {
                let mut merged = match existing.take() {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                match value {
                    Value::Array(items) => merged.extend(items),
                    other => merged.push(other),
                }
                *existing = Value::Array(merged);
            }
        }
    }

    Ok(filter)
}

fn decode_component(raw: &str) -> Result<String> {
    urlencoding::decode(&raw.replace('+', " "))
        .map(|decoded| decoded.into_owned())
        .map_err(|e| Error::InvalidRequest(format!("malformed query string: {}", e)))
}

fn range_bound(key: &str) -> Option<(&str, &'static str)> {
    key.strip_suffix("_min")
        .map(|field| (field, "min"))
        .or_else(|| key.strip_suffix("_max").map(|field| (field, "max")))
        .filter(|(field, _)| !field.is_empty())
}

/// Fields whose values stay strings even when they look like literals
const TEXT_FIELDS: &[&str] = &[
    "location", "category", "q", "search", "sort", "fields", "amenities", "features",
];

fn parse_value(raw: &str, typed: bool) -> Value {
    let scalar = |s: &str| {
        if typed {
            parse_scalar(s)
        } else {
            Value::String(s.to_string())
        }
    };
    if raw.contains(',') {
        Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(scalar)
                .collect(),
        )
    } else {
        scalar(raw.trim())
    }
}

fn parse_scalar(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = Number::from_f64(f).filter(|_| f.is_finite()) {
            return Value::Number(n);
        }
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_field_order_and_case_ignored() {
        let a = normalize("venues", &map(json!({"location": "Colombo", "capacity": 100})));
        let b = normalize("venues", &map(json!({"capacity": 100, "location": "colombo"})));
        assert_eq!(a, b);
        assert_eq!(a, "venues:{capacity:100,location:colombo}");
    }

    #[test]
    fn test_empty_and_zero_fields_omitted() {
        let key = normalize(
            "venues",
            &map(json!({
                "location": "Galle",
                "capacity": 0,
                "category": "  ",
                "amenities": [],
                "price": {"min": null},
                "featured": false,
                "vendor": null
            })),
        );
        assert_eq!(key, "venues:{location:galle}");
        assert_eq!(normalize("venues", &Map::new()), "venues:{}");
    }

    #[test]
    fn test_arrays_are_sets() {
        let a = normalize("venues", &map(json!({"amenities": ["Pool", "wifi", "pool"]})));
        let b = normalize("venues", &map(json!({"amenities": ["WiFi", "pool"]})));
        assert_eq!(a, b);
        assert_eq!(a, "venues:{amenities:[pool,wifi]}");
    }

    #[test]
    fn test_nested_objects_and_numbers() {
        let a = normalize("venues", &map(json!({"capacity": {"max": 200, "min": 50.0}})));
        let b = normalize("venues", &map(json!({"capacity": {"min": 50, "max": 200}})));
        assert_eq!(a, b);
        assert_eq!(a, "venues:{capacity:{max:200,min:50}}");
        assert_eq!(
            normalize("packages", &map(json!({"price": 12.5}))),
            "packages:{price:12.5}"
        );
    }

    #[test]
    fn test_case_sensitive_fields() {
        let a = normalize("vendors", &map(json!({"slug": "Blue-Lotus"})));
        let b = normalize("vendors", &map(json!({"slug": "blue-lotus"})));
        assert_ne!(a, b);

        let custom = Normalizer::new(&NormalizerConfig {
            case_sensitive_fields: vec![],
        });
        assert_eq!(
            custom.normalize("vendors", &map(json!({"slug": "Blue-Lotus"}))),
            custom.normalize("vendors", &map(json!({"slug": "blue-lotus"})))
        );
    }

    #[test]
    fn test_reserved_characters_escaped() {
        let a = normalize("venues", &map(json!({"location": "a,b:c"})));
        let b = normalize("venues", &map(json!({"location": ["a", "b:c"]})));
        assert_ne!(a, b);
        assert_eq!(
            normalize("venues", &map(json!({"location": "Mount Lavinia"}))),
            "venues:{location:mount%20lavinia}"
        );
    }

    #[test]
    fn test_namespaces_separate_keys() {
        let filter = map(json!({"location": "Galle"}));
        assert_ne!(normalize("venues", &filter), normalize("vendors", &filter));
    }

    #[test]
    fn test_fingerprint_stable() {
        assert_eq!(fingerprint("venues:{}"), fingerprint(b"venues:{}"));
        assert_ne!(fingerprint("venues:{}"), fingerprint("vendors:{}"));
        assert_eq!(fingerprint("x").len(), 16);
    }

    #[test]
    fn test_parse_query_string() {
        let filter =
            parse_query_string("?location=Galle&amenities=wifi,pool&capacity_min=50&capacity_max=300")
                .unwrap();
        assert_eq!(filter["location"], json!("Galle"));
        assert_eq!(filter["amenities"], json!(["wifi", "pool"]));
        assert_eq!(filter["capacity"], json!({"min": 50, "max": 300}));
    }

    #[test]
    fn test_parse_query_string_decoding_and_merging() {
        let filter =
            parse_query_string("location=Mount+Lavinia&q=sea%20view&amenities=wifi&amenities=pool&featured=true&price_max=99.5")
                .unwrap();
        assert_eq!(filter["location"], json!("Mount Lavinia"));
        assert_eq!(filter["q"], json!("sea view"));
        assert_eq!(filter["amenities"], json!(["wifi", "pool"]));
        assert_eq!(filter["featured"], json!(true));
        assert_eq!(filter["price"], json!({"max": 99.5}));
        assert!(parse_query_string("").unwrap().is_empty());
    }

    #[test]
    fn test_text_fields_keep_literal_text() {
        let filter =
            parse_query_string("location=007&category=true&amenities=24,7&capacity=007&limit=10")
                .unwrap();
        assert_eq!(filter["location"], json!("007"));
        assert_eq!(filter["category"], json!("true"));
        assert_eq!(filter["amenities"], json!(["24", "7"]));
        assert_eq!(filter["capacity"], json!(7));
        assert_eq!(filter["limit"], json!(10));
        assert_eq!(
            normalize("venues", &filter),
            "venues:{amenities:[24,7],capacity:7,category:true,limit:10,location:007}"
        );
    }

    #[test]
    fn test_parse_query_string_errors() {
        assert_matches!(
            parse_query_string("capacity=100&capacity_min=50"),
            Err(Error::InvalidRequest(_))
        );
        assert_matches!(parse_query_string("location=%FF%FE"), Err(Error::InvalidRequest(_)));
    }

    #[test]
    fn test_query_string_and_json_filters_agree() {
        let from_query = parse_query_string("location=Galle&capacity_min=50").unwrap();
        let from_json = map(json!({"capacity": {"min": 50}, "location": "galle"}));
        assert_eq!(normalize("venues", &from_query), normalize("venues", &from_json));
    }

    proptest! {
        #[test]
        fn prop_normalize_ignores_order_and_case(
            fields in proptest::collection::btree_map("[a-z]{1,8}", "[a-zA-Z ]{0,12}", 0..8),
            tags in proptest::collection::vec("[a-z]{1,6}", 0..6),
        ) {
            let normalizer = Normalizer::new(&NormalizerConfig { case_sensitive_fields: vec![] });

            let mut forward = Map::new();
            for (k, v) in &fields {
                forward.insert(k.clone(), Value::String(v.clone()));
            }
            forward.insert("set_tags".into(), json!(tags));

            let mut reversed = Map::new();
            reversed.insert("set_tags".into(), json!(tags.iter().rev().map(|t| t.to_uppercase()).collect::<Vec<_>>()));
            for (k, v) in fields.iter().rev() {
                reversed.insert(k.clone(), Value::String(v.to_uppercase()));
            }

            prop_assert_eq!(
                normalizer.normalize("venues", &forward),
                normalizer.normalize("venues", &reversed)
            );
        }

        #[test]
        fn prop_normalize_is_deterministic(
            fields in proptest::collection::btree_map("[a-z]{1,8}", any::<i32>(), 0..8),
        ) {
            let mut filter = Map::new();
            for (k, v) in &fields {
                filter.insert(k.clone(), Value::from(*v));
            }
            prop_assert_eq!(normalize("vendors", &filter), normalize("vendors", &filter.clone()));
        }
    }
}
