//! The scalar filter DSL: a tree of predicate/boolean/sorter nodes matched
//! against a record's field map.
//!
//! The `{"op": ..., "field": ..., ...}` JSON tree and nested `and`/`or`
//! combinators are reimplemented here as a typed, serde-tagged enum
//! instead of an untyped dict tree.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::schema::{FieldMap, ScalarValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CondValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Must {
        field: String,
        conds: Vec<CondValue>,
        #[serde(default, rename = "para")]
        para: Option<String>,
    },
    MustNot {
        field: String,
        conds: Vec<CondValue>,
    },
    Range {
        field: String,
        #[serde(default)]
        gt: Option<f64>,
        #[serde(default)]
        gte: Option<f64>,
        #[serde(default)]
        lt: Option<f64>,
        #[serde(default)]
        lte: Option<f64>,
    },
    RangeOut {
        field: String,
        #[serde(default)]
        gte: Option<f64>,
        #[serde(default)]
        lte: Option<f64>,
    },
    Prefix {
        field: String,
        prefix: String,
    },
    Contains {
        field: String,
        substring: String,
    },
    Regex {
        field: String,
        pattern: String,
    },
    TimeRange {
        field: String,
        #[serde(default)]
        gte: Option<String>,
        #[serde(default)]
        lte: Option<String>,
    },
    GeoRange {
        field: String,
        center: String,
        radius: String,
    },
    And {
        conds: Vec<Filter>,
    },
    Or {
        conds: Vec<Filter>,
    },
    #[serde(rename = "sorter.sort")]
    SorterSort {
        field: String,
        order: SortOrder,
        topk: usize,
    },
    #[serde(rename = "sorter.count")]
    SorterCount {
        #[serde(default)]
        field: Option<String>,
        #[serde(default)]
        gt: Option<f64>,
        #[serde(default)]
        gte: Option<f64>,
        #[serde(default)]
        lt: Option<f64>,
        #[serde(default)]
        lte: Option<f64>,
    },
}

/// Parses the `para:"-d=N"` depth-limit parameter used by `must` on `path`
/// fields.
fn parse_depth_para(para: &str) -> Option<usize> {
    para.strip_prefix("-d=").and_then(|n| n.parse::<usize>().ok())
}

fn normalize_path_segments(path: &str) -> Vec<&str> {
    path.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

fn path_prefix_match(path: &str, prefix: &str, depth: Option<usize>) -> bool {
    let path_segs = normalize_path_segments(path);
    let prefix_segs = normalize_path_segments(prefix);
    if path_segs.len() < prefix_segs.len() {
        return false;
    }
    if path_segs[..prefix_segs.len()] != prefix_segs[..] {
        return false;
    }
    match depth {
        Some(d) => (path_segs.len() - prefix_segs.len()) <= d,
        None => true,
    }
}

/// Applies `f` to every element of a list-typed value, or to the scalar
/// itself otherwise; this is how `list<T>` fields "match when any element
/// matches".
fn any_element<F: Fn(&ScalarValue) -> bool>(value: &ScalarValue, f: F) -> bool {
    match value {
        ScalarValue::ListString(items) => items.iter().any(|s| f(&ScalarValue::String(s.clone()))),
        ScalarValue::ListInt64(items) => items.iter().any(|i| f(&ScalarValue::Int64(*i))),
        other => f(other),
    }
}

fn cond_eq(value: &ScalarValue, cond: &CondValue) -> bool {
    match (value, cond) {
        (ScalarValue::String(s), CondValue::Str(c)) => s == c,
        (ScalarValue::Path(s), CondValue::Str(c)) => s == c,
        (ScalarValue::Int64(i), CondValue::Int(c)) => i == c,
        (ScalarValue::Bool(b), CondValue::Bool(c)) => b == c,
        _ => false,
    }
}

fn as_f64(value: &ScalarValue) -> Option<f64> {
    match value {
        ScalarValue::Int64(i) => Some(*i as f64),
        ScalarValue::Float32(f) => Some(*f as f64),
        ScalarValue::DateTimeNs(ns) => Some(*ns as f64),
        _ => None,
    }
}

fn in_range(v: f64, gt: Option<f64>, gte: Option<f64>, lt: Option<f64>, lte: Option<f64>) -> bool {
    if let Some(b) = gt {
        if !(v > b) {
            return false;
        }
    }
    if let Some(b) = gte {
        if !(v >= b) {
            return false;
        }
    }
    if let Some(b) = lt {
        if !(v < b) {
            return false;
        }
    }
    if let Some(b) = lte {
        if !(v <= b) {
            return false;
        }
    }
    true
}

fn parse_iso_ns(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s).ok().and_then(|dt| dt.timestamp_nanos_opt())
}

fn haversine_meters(a: (f64, f64), b: (f64, f64)) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

fn parse_radius_meters(radius: &str) -> Option<f64> {
    let radius = radius.trim();
    if let Some(km) = radius.strip_suffix("km") {
        return km.trim().parse::<f64>().ok().map(|v| v * 1000.0);
    }
    if let Some(m) = radius.strip_suffix('m') {
        return m.trim().parse::<f64>().ok();
    }
    radius.parse::<f64>().ok()
}

impl Filter {
    /// Evaluate this filter node against a record's scalar field map.
    /// Sorter nodes are not predicates; they always pass (they are picked
    /// up separately by `find_sorter`).
    pub fn matches(&self, fields: &FieldMap) -> bool {
        match self {
            Filter::Must { field, conds, para } => {
                let Some(value) = fields.get(field) else { return false };
                if let ScalarValue::Path(p) = value {
                    let depth = para.as_deref().and_then(parse_depth_para);
                    conds.iter().any(|c| match c {
                        CondValue::Str(prefix) => path_prefix_match(p, prefix, depth),
                        _ => false,
                    })
                } else {
                    any_element(value, |v| conds.iter().any(|c| cond_eq(v, c)))
                }
            }
            Filter::MustNot { field, conds } => !Filter::Must {
                field: field.clone(),
                conds: conds.clone(),
                para: None,
            }
            .matches(fields),
            Filter::Range { field, gt, gte, lt, lte } => fields
                .get(field)
                .and_then(as_f64)
                .map(|v| in_range(v, *gt, *gte, *lt, *lte))
                .unwrap_or(false),
            Filter::RangeOut { field, gte, lte } => !fields
                .get(field)
                .and_then(as_f64)
                .map(|v| in_range(v, None, *gte, None, *lte))
                .unwrap_or(false),
            Filter::Prefix { field, prefix } => fields
                .get(field)
                .map(|v| any_element(v, |v| match v {
                    ScalarValue::String(s) | ScalarValue::Path(s) => s.starts_with(prefix.as_str()),
                    _ => false,
                }))
                .unwrap_or(false),
            Filter::Contains { field, substring } => fields
                .get(field)
                .map(|v| any_element(v, |v| match v {
                    ScalarValue::String(s) | ScalarValue::Path(s) => s.contains(substring.as_str()),
                    _ => false,
                }))
                .unwrap_or(false),
            Filter::Regex { field, pattern } => {
                let Ok(re) = Regex::new(pattern) else { return false };
                fields
                    .get(field)
                    .map(|v| any_element(v, |v| match v {
                        ScalarValue::String(s) | ScalarValue::Path(s) => re.is_match(s),
                        _ => false,
                    }))
                    .unwrap_or(false)
            }
            Filter::TimeRange { field, gte, lte } => {
                let Some(ScalarValue::DateTimeNs(ns)) = fields.get(field) else { return false };
                let gte_ns = gte.as_deref().and_then(parse_iso_ns).map(|v| v as f64);
                let lte_ns = lte.as_deref().and_then(parse_iso_ns).map(|v| v as f64);
                in_range(*ns as f64, None, gte_ns, None, lte_ns)
            }
            Filter::GeoRange { field, center, radius } => {
                let Some(ScalarValue::GeoPoint(lat, lon)) = fields.get(field) else { return false };
                let Some((clat, clon)) = parse_center(center) else { return false };
                let Some(max_m) = parse_radius_meters(radius) else { return false };
                haversine_meters((*lat, *lon), (clat, clon)) <= max_m
            }
            Filter::And { conds } => conds.iter().all(|c| c.matches(fields)),
            Filter::Or { conds } => conds.iter().any(|c| c.matches(fields)),
            Filter::SorterSort { .. } | Filter::SorterCount { .. } => true,
        }
    }

    /// Find a `sorter.sort`/`sorter.count` node anywhere in the tree, if
    /// present (these are leaves in practice, but scanning handles a
    /// sorter nested under `and`/`or` too).
    pub fn find_sorter(&self) -> Option<&Filter> {
        match self {
            Filter::SorterSort { .. } | Filter::SorterCount { .. } => Some(self),
            Filter::And { conds } | Filter::Or { conds } => conds.iter().find_map(Filter::find_sorter),
            _ => None,
        }
    }
}

fn parse_center(center: &str) -> Option<(f64, f64)> {
    let parts: Vec<&str> = center.split(',').map(|p| p.trim()).collect();
    if parts.len() != 2 {
        return None;
    }
    Some((parts[0].parse().ok()?, parts[1].parse().ok()?))
}
