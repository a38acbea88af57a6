//! Query Optimizer
//!
//! Maps the catalog filter DSL to a backing-store predicate plus the minimal
//! field projection. Identical filters always produce structurally identical
//! queries.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Collection;
use crate::error::{Error, Result};

/// Fields searched by free-text queries
const SEARCH_FIELDS: [&str; 3] = ["name", "description", "location"];

/// Inclusive numeric range; open on a missing side
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Range {
    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Sort order: `price` ascending, `-price` descending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (field, descending) = match raw.strip_prefix('-') {
            Some(field) => (field, true),
            None => (raw, false),
        };
        (!field.is_empty()).then(|| SortKey {
            field: field.to_string(),
            descending,
        })
    }
}

/// Typed catalog filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogFilter {
    /// Case-insensitive substring of the location
    pub location: Option<String>,
    pub capacity: Range,
    pub price: Range,
    /// Every listed amenity must be present
    pub amenities: Vec<String>,
    /// Every listed feature must be present
    pub features: Vec<String>,
    pub category: Option<String>,
    /// Free-text search over name, description, and location
    pub search: Option<String>,
    pub sort: Option<SortKey>,
    pub limit: Option<usize>,
    pub offset: usize,
    /// Requested projection; empty means the collection default
    pub fields: Vec<String>,
}

impl CatalogFilter {
    /// Interpret a filter map.
    ///
    /// A scalar `capacity` is a minimum (seats needed); a scalar `price` is a
    /// maximum (budget). Both also accept `{min, max}`.
    pub fn from_map(filter: &Map<String, Value>) -> Result<Self> {
        let mut out = CatalogFilter::default();

        for (name, value) in filter {
            if value.is_null() {
                continue;
            }
            match name.as_str() {
                "location" => out.location = text(name, value)?,
                "category" => out.category = text(name, value)?,
                "q" | "search" => out.search = text(name, value)?,
                "capacity" => out.capacity = range(name, value, true)?,
                "price" => out.price = range(name, value, false)?,
                "amenities" => out.amenities = string_set(name, value)?,
                "features" => out.features = string_set(name, value)?,
                "fields" => out.fields = string_set(name, value)?,
                "sort" => {
                    out.sort = match value {
                        Value::String(s) if s.trim().is_empty() => None,
                        Value::String(s) => Some(SortKey::parse(s).ok_or_else(|| {
                            Error::InvalidFilter(format!("invalid sort '{}'", s))
                        })?),
                        _ => return Err(invalid_type(name, "a string")),
                    }
                }
                "limit" => {
                    let limit = count(name, value)?;
                    out.limit = (limit > 0).then_some(limit);
                }
                "offset" => out.offset = count(name, value)?,
                other => {
                    return Err(Error::InvalidFilter(format!("unknown filter field '{}'", other)))
                }
            }
        }

        Ok(out)
    }
}

fn invalid_type(field: &str, expected: &str) -> Error {
    Error::InvalidFilter(format!("'{}' must be {}", field, expected))
}

fn text(field: &str, value: &Value) -> Result<Option<String>> {
    match value {
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            Ok((!s.is_empty()).then_some(s))
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(invalid_type(field, "a string")),
    }
}

fn number(field: &str, value: &Value) -> Result<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Some)
            .ok_or_else(|| invalid_type(field, "a number")),
        _ => Err(invalid_type(field, "a number")),
    }
}

fn range(field: &str, value: &Value, scalar_is_min: bool) -> Result<Range> {
    let range = match value {
        Value::Object(bounds) => {
            if let Some(extra) = bounds.keys().find(|k| *k != "min" && *k != "max") {
                return Err(Error::InvalidFilter(format!(
                    "'{}' range has unknown bound '{}'",
                    field, extra
                )));
            }
            Range {
                min: bounds.get("min").map(|v| number(field, v)).transpose()?.flatten(),
                max: bounds.get("max").map(|v| number(field, v)).transpose()?.flatten(),
            }
        }
        scalar => {
            let n = number(field, scalar)?;
            if scalar_is_min {
                Range { min: n, max: None }
            } else {
                Range { min: None, max: n }
            }
        }
    };

    // Zero bounds carry no constraint
    let range = Range {
        min: range.min.filter(|v| *v != 0.0),
        max: range.max.filter(|v| *v != 0.0),
    };
    if let (Some(min), Some(max)) = (range.min, range.max) {
        if min > max {
            return Err(Error::InvalidFilter(format!(
                "'{}' range min {} exceeds max {}",
                field, min, max
            )));
        }
    }
    Ok(range)
}

fn string_set(field: &str, value: &Value) -> Result<Vec<String>> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    let mut set = BTreeSet::new();
    for item in items {
        match item {
            Value::String(s) => {
                let s = s.trim();
                if !s.is_empty() {
                    set.insert(s.to_string());
                }
            }
            Value::Null => {}
            _ => return Err(invalid_type(field, "a string or list of strings")),
        }
    }
    Ok(set.into_iter().collect())
}

fn count(field: &str, value: &Value) -> Result<usize> {
    match number(field, value)? {
        None => Ok(0),
        Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
        Some(_) => Err(invalid_type(field, "a non-negative integer")),
    }
}

/// Backing-store predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Matches every record
    All,
    And { clauses: Vec<Predicate> },
    /// Case-insensitive substring match on a string field
    Contains { field: String, value: String },
    /// Case-insensitive equality on a string field
    Equals { field: String, value: String },
    /// Numeric field within an inclusive range
    Range {
        field: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    /// Array field holds every value (case-insensitive)
    ContainsAll { field: String, values: Vec<String> },
    /// Any of the fields contains the value
    AnyContains { fields: Vec<String>, value: String },
}

impl Predicate {
    /// Evaluate against one record
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            Predicate::All => true,
            Predicate::And { clauses } => clauses.iter().all(|c| c.matches(record)),
            Predicate::Contains { field, value } => record
                .get(field)
                .and_then(Value::as_str)
                .map_or(false, |s| s.to_lowercase().contains(value.as_str())),
            Predicate::Equals { field, value } => record
                .get(field)
                .and_then(Value::as_str)
                .map_or(false, |s| s.to_lowercase() == *value),
            Predicate::Range { field, min, max } => record
                .get(field)
                .and_then(Value::as_f64)
                .map_or(false, |v| Range { min: *min, max: *max }.contains(v)),
            Predicate::ContainsAll { field, values } => match record.get(field) {
                Some(Value::Array(items)) => {
                    let present: BTreeSet<String> = items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_lowercase)
                        .collect();
                    values.iter().all(|v| present.contains(v))
                }
                _ => false,
            },
            Predicate::AnyContains { fields, value } => fields.iter().any(|field| {
                match record.get(field) {
                    Some(Value::String(s)) => s.to_lowercase().contains(value.as_str()),
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|s| s.to_lowercase().contains(value.as_str())),
                    _ => false,
                }
            }),
        }
    }

    /// Fields the predicate reads
    pub fn fields(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::All => {}
            Predicate::And { clauses } => clauses.iter().for_each(|c| c.collect_fields(out)),
            Predicate::Contains { field, .. }
            | Predicate::Equals { field, .. }
            | Predicate::Range { field, .. }
            | Predicate::ContainsAll { field, .. } => {
                out.insert(field.as_str());
            }
            Predicate::AnyContains { fields, .. } => out.extend(fields.iter().map(String::as_str)),
        }
    }
}

/// Build the predicate for `filter`. Clause order is fixed.
pub fn build_predicate(filter: &CatalogFilter) -> Predicate {
    let mut clauses = Vec::new();

    if let Some(location) = &filter.location {
        clauses.push(Predicate::Contains {
            field: "location".into(),
            value: location.to_lowercase(),
        });
    }
    if let Some(category) = &filter.category {
        clauses.push(Predicate::Equals {
            field: "category".into(),
            value: category.to_lowercase(),
        });
    }
    for (field, range) in [("capacity", filter.capacity), ("price", filter.price)] {
        if !range.is_unbounded() {
            clauses.push(Predicate::Range {
                field: field.into(),
                min: range.min,
                max: range.max,
            });
        }
    }
    for (field, values) in [("amenities", &filter.amenities), ("features", &filter.features)] {
        if !values.is_empty() {
            let values: BTreeSet<String> = values.iter().map(|v| v.to_lowercase()).collect();
            clauses.push(Predicate::ContainsAll {
                field: field.into(),
                values: values.into_iter().collect(),
            });
        }
    }
    if let Some(search) = &filter.search {
        clauses.push(Predicate::AnyContains {
            fields: SEARCH_FIELDS.iter().map(|f| f.to_string()).collect(),
            value: search.to_lowercase(),
        });
    }

    match clauses.len() {
        0 => Predicate::All,
        1 => clauses.remove(0),
        _ => Predicate::And { clauses },
    }
}

/// Optimizer limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub default_page_size: usize,
    /// Hard cap on records per page
    pub max_page_size: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

/// Query ready for the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedQuery {
    pub collection: Collection,
    pub predicate: Predicate,
    /// Fields to materialize, `id` first
    pub projection: Vec<String>,
    pub sort: Option<SortKey>,
    pub limit: usize,
    pub offset: usize,
}

impl OptimizedQuery {
    /// Filter, sort, page, and project `records`
    pub fn execute<'a>(&self, records: impl IntoIterator<Item = &'a Value>) -> Vec<Value> {
        let mut matched: Vec<&Value> = records
            .into_iter()
            .filter(|r| self.predicate.matches(r))
            .collect();

        if let Some(sort) = &self.sort {
            matched.sort_by(|a, b| compare_field(a.get(&sort.field), b.get(&sort.field), sort.descending));
        }

        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .map(|record| self.project(record))
            .collect()
    }

    fn project(&self, record: &Value) -> Value {
        match record {
            Value::Object(fields) => Value::Object(
                self.projection
                    .iter()
                    .filter_map(|f| fields.get(f).map(|v| (f.clone(), v.clone())))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Missing values sort last in either direction
fn compare_field(a: Option<&Value>, b: Option<&Value>, descending: bool) -> Ordering {
    let ordering = match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().unwrap_or(0.0).total_cmp(&y.as_f64().unwrap_or(0.0))
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.to_lowercase().cmp(&y.to_lowercase()),
        (Some(_), None) => return Ordering::Less,
        (None, Some(_)) => return Ordering::Greater,
        _ => Ordering::Equal,
    };
    if descending {
        ordering.reverse()
    } else {
        ordering
    }
}

/// Builds backing-store queries
#[derive(Debug, Clone, Default)]
pub struct QueryOptimizer {
    config: OptimizerConfig,
}

impl QueryOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Build the query for `filter` on `collection`.
    ///
    /// Filters and projections must name fields the collection carries.
    pub fn build_query(&self, collection: Collection, filter: &CatalogFilter) -> Result<OptimizedQuery> {
        let known = collection.fields();
        let predicate = build_predicate(filter);

        if let Some(field) = predicate
            .fields()
            .into_iter()
            .filter(|f| !SEARCH_FIELDS.contains(f))
            .find(|f| !known.contains(f))
        {
            return Err(Error::InvalidFilter(format!(
                "{} cannot be filtered by '{}'",
                collection, field
            )));
        }

        let projection = if filter.fields.is_empty() {
            collection.default_projection().iter().map(|f| f.to_string()).collect()
        } else {
            if let Some(field) = filter.fields.iter().find(|f| !known.contains(&f.as_str())) {
                return Err(Error::InvalidFilter(format!(
                    "{} has no field '{}'",
                    collection, field
                )));
            }
            let rest: BTreeSet<&str> = filter
                .fields
                .iter()
                .map(String::as_str)
                .filter(|f| *f != "id")
                .collect();
            std::iter::once("id")
                .chain(rest)
                .map(str::to_string)
                .collect()
        };

        if let Some(sort) = &filter.sort {
            if !known.contains(&sort.field.as_str()) {
                return Err(Error::InvalidFilter(format!(
                    "{} cannot be sorted by '{}'",
                    collection, sort.field
                )));
            }
        }

        let limit = filter
            .limit
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size.max(1));

        Ok(OptimizedQuery {
            collection,
            predicate,
            projection,
            sort: filter.sort.clone(),
            limit,
            offset: filter.offset,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn filter(value: Value) -> CatalogFilter {
        match value {
            Value::Object(m) => CatalogFilter::from_map(&m).unwrap(),
            _ => panic!("not an object"),
        }
    }

    fn venues() -> Vec<Value> {
        vec![
            json!({"id": "v1", "name": "Lighthouse Hall", "location": "Galle Fort", "capacity": 250,
                   "price": 1200, "amenities": ["WiFi", "Parking"], "description": "sea view"}),
            json!({"id": "v2", "name": "Lotus Garden", "location": "Colombo 07", "capacity": 100,
                   "price": 800, "amenities": ["wifi"]}),
            json!({"id": "v3", "name": "Hill Lodge", "location": "Kandy", "capacity": 60,
                   "price": 400, "amenities": ["parking", "pool"]}),
        ]
    }

    #[test]
    fn test_from_map() {
        let f = filter(json!({
            "location": " Galle ",
            "capacity": 100,
            "price": {"min": 500, "max": 1500},
            "amenities": ["WiFi", "parking", "WiFi"],
            "sort": "-price",
            "limit": 5
        }));
        assert_eq!(f.location.as_deref(), Some("galle"));
        assert_eq!(f.capacity, Range { min: Some(100.0), max: None });
        assert_eq!(f.price, Range { min: Some(500.0), max: Some(1500.0) });
        assert_eq!(f.amenities, vec!["WiFi".to_string(), "parking".to_string()]);
        assert_eq!(f.sort, Some(SortKey { field: "price".into(), descending: true }));
        assert_eq!(f.limit, Some(5));
    }

    #[test]
    fn test_from_map_errors() {
        let parse = |v: Value| match v {
            Value::Object(m) => CatalogFilter::from_map(&m),
            _ => unreachable!(),
        };
        assert_matches!(parse(json!({"colour": "red"})), Err(Error::InvalidFilter(_)));
        assert_matches!(parse(json!({"capacity": "lots"})), Err(Error::InvalidFilter(_)));
        assert_matches!(
            parse(json!({"price": {"min": 900, "max": 100}})),
            Err(Error::InvalidFilter(_))
        );
        assert_matches!(parse(json!({"limit": -1})), Err(Error::InvalidFilter(_)));
        assert_matches!(parse(json!({"amenities": [1, 2]})), Err(Error::InvalidFilter(_)));
    }

    #[test]
    fn test_predicate_is_deterministic() {
        let a = build_predicate(&filter(json!({"amenities": ["pool", "WiFi"], "location": "Galle"})));
        let b = build_predicate(&filter(json!({"location": "galle", "amenities": ["wifi", "Pool"]})));
        assert_eq!(a, b);
        assert_eq!(build_predicate(&CatalogFilter::default()), Predicate::All);
    }

    #[test]
    fn test_predicate_matches() {
        let records = venues();
        let p = build_predicate(&filter(json!({"location": "galle"})));
        assert!(p.matches(&records[0]));
        assert!(!p.matches(&records[1]));

        let p = build_predicate(&filter(json!({"capacity": {"min": 80, "max": 200}})));
        assert!(!p.matches(&records[0]));
        assert!(p.matches(&records[1]));

        let p = build_predicate(&filter(json!({"amenities": ["wifi", "parking"]})));
        assert!(p.matches(&records[0]));
        assert!(!p.matches(&records[1]));

        let p = build_predicate(&filter(json!({"q": "SEA"})));
        assert!(p.matches(&records[0]));
        assert!(!p.matches(&records[2]));
    }

    #[test]
    fn test_build_query_projection() {
        let optimizer = QueryOptimizer::default();
        let q = optimizer
            .build_query(Collection::Venues, &filter(json!({"fields": ["name", "capacity", "name"]})))
            .unwrap();
        assert_eq!(q.projection, vec!["id", "capacity", "name"]);

        let q = optimizer.build_query(Collection::Venues, &CatalogFilter::default()).unwrap();
        assert_eq!(q.projection, Collection::Venues.default_projection());
        assert_eq!(q.limit, 20);
    }

    #[test]
    fn test_build_query_rejects_unknown_fields() {
        let optimizer = QueryOptimizer::default();
        assert_matches!(
            optimizer.build_query(Collection::Venues, &filter(json!({"fields": ["password"]}))),
            Err(Error::InvalidFilter(_))
        );
        assert_matches!(
            optimizer.build_query(Collection::Vendors, &filter(json!({"amenities": ["wifi"]}))),
            Err(Error::InvalidFilter(_))
        );
        assert_matches!(
            optimizer.build_query(Collection::Venues, &filter(json!({"sort": "secret"}))),
            Err(Error::InvalidFilter(_))
        );
    }

    #[test]
    fn test_page_size_capped() {
        let optimizer = QueryOptimizer::new(OptimizerConfig {
            default_page_size: 10,
            max_page_size: 50,
        });
        let q = optimizer
            .build_query(Collection::Venues, &filter(json!({"limit": 5000})))
            .unwrap();
        assert_eq!(q.limit, 50);
    }

    #[test]
    fn test_execute_sorts_pages_and_projects() {
        let optimizer = QueryOptimizer::default();
        let q = optimizer
            .build_query(
                Collection::Venues,
                &filter(json!({"sort": "-capacity", "limit": 2, "fields": ["capacity"]})),
            )
            .unwrap();
        let records = venues();
        let out = q.execute(&records);
        assert_eq!(out, vec![json!({"id": "v1", "capacity": 250}), json!({"id": "v2", "capacity": 100})]);

        let q = optimizer
            .build_query(
                Collection::Venues,
                &filter(json!({"sort": "price", "offset": 1, "fields": ["price"]})),
            )
            .unwrap();
        let out = q.execute(&records);
        assert_eq!(out, vec![json!({"id": "v2", "price": 800}), json!({"id": "v1", "price": 1200})]);
    }

    #[test]
    fn test_query_serializes() {
        let q = QueryOptimizer::default()
            .build_query(Collection::Venues, &filter(json!({"location": "galle"})))
            .unwrap();
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["collection"], json!("venues"));
        assert_eq!(json["predicate"]["op"], json!("contains"));
        let back: OptimizedQuery = serde_json::from_value(json).unwrap();
        assert_eq!(back, q);
    }
}
