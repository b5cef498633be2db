//! Collection schema: field types, the schema itself, and value coercion.
//!
//! This crate uses a closed, tagged `ScalarValue` enum rather than a
//! generic diffable value, because the data model is itself a closed set
//! of scalar kinds, not an arbitrary user type.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int64,
    Float32,
    Bool,
    String,
    DateTime,
    GeoPoint,
    Path,
    ListString,
    ListInt64,
    Vector,
    SparseVector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub required: bool,
    /// Fixed dimensionality, meaningful only for `FieldType::Vector`.
    pub dim: Option<usize>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldSpec {
            name: name.into(),
            field_type,
            is_primary_key: false,
            required: false,
            dim: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.required = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = Some(dim);
        self
    }
}

/// Immutable (bar description/additive fields) schema for a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub name: String,
    pub fields: Vec<FieldSpec>,
    pub description: String,
    /// Default TTL in seconds applied when an upsert omits one; 0 means
    /// "no expiration".
    pub default_ttl_seconds: u64,
    /// True when the schema declares vectorization should be performed by
    /// an external embedder when the caller omits vectors.
    pub auto_vectorize: bool,
    /// The scalar string field whose value is handed to the embedder as
    /// the text to vectorize. Required when `auto_vectorize` is set.
    pub vectorize_field: Option<String>,
}

impl CollectionMeta {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Result<Self> {
        let meta = CollectionMeta {
            name: name.into(),
            fields,
            description: String::new(),
            default_ttl_seconds: 0,
            auto_vectorize: false,
            vectorize_field: None,
        };
        meta.validate()?;
        Ok(meta)
    }

    pub fn validate(&self) -> Result<()> {
        let pk_count = self.fields.iter().filter(|f| f.is_primary_key).count();
        if pk_count != 1 {
            return Err(Error::SchemaInvalid(format!(
                "exactly one field must be the primary key, found {}",
                pk_count
            )));
        }
        let dense_count = self
            .fields
            .iter()
            .filter(|f| f.field_type == FieldType::Vector)
            .count();
        if dense_count > 1 {
            return Err(Error::SchemaInvalid(
                "at most one field may be the dense vector field".into(),
            ));
        }
        let sparse_count = self
            .fields
            .iter()
            .filter(|f| f.field_type == FieldType::SparseVector)
            .count();
        if sparse_count > 1 {
            return Err(Error::SchemaInvalid(
                "at most one field may be the sparse vector field".into(),
            ));
        }
        for f in self.fields.iter() {
            if f.field_type == FieldType::Vector && f.dim.is_none() {
                return Err(Error::SchemaInvalid(format!(
                    "vector field '{}' must declare Dim",
                    f.name
                )));
            }
        }
        if self.auto_vectorize {
            match self.vectorize_field.as_ref().and_then(|name| self.field(name)) {
                Some(f) if f.field_type == FieldType::String => {}
                _ => {
                    return Err(Error::SchemaInvalid(
                        "auto_vectorize requires vectorize_field to name a declared string field".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn primary_key_field(&self) -> &FieldSpec {
        self.fields
            .iter()
            .find(|f| f.is_primary_key)
            .expect("validated schema always has exactly one primary key field")
    }

    pub fn dense_field(&self) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.field_type == FieldType::Vector)
    }

    pub fn sparse_field(&self) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|f| f.field_type == FieldType::SparseVector)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// True when the primary key is auto-generated (i.e. no user field is
    /// marked as the PK other than the reserved auto-id field).
    pub fn pk_is_auto(&self) -> bool {
        self.primary_key_field().name == crate::id::AUTO_ID_FIELD
    }
}

/// A single scalar value as stored in a record's field map. Closed set;
/// serialization stays JSON-compatible to keep the delta log portable.
///
/// Adjacently tagged (`t`/`v`) rather than untagged: `DateTimeNs(i64)` and
/// `Int64(i64)` would otherwise serialize to the same bare JSON number, and
/// `Path(String)`/`String(String)` to the same bare JSON string, so an
/// untagged reload would silently pick the first matching variant and drop
/// the original type — breaking `date_time`/`path` filtering after a
/// delta-log replay or snapshot recover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum ScalarValue {
    Null,
    Int64(i64),
    Float32(f32),
    Bool(bool),
    String(String),
    /// date_time, stored canonicalized to epoch-nanoseconds.
    DateTimeNs(i64),
    /// geo_point, stored canonicalized to (lat, lon).
    GeoPoint(f64, f64),
    Path(String),
    ListString(Vec<String>),
    ListInt64(Vec<i64>),
}

pub type FieldMap = BTreeMap<String, ScalarValue>;

/// Coerce a raw JSON value into the declared field type, applying the
/// schema's coercion and validation rules.
pub fn coerce(field: &FieldSpec, raw: &serde_json::Value) -> Result<ScalarValue> {
    if raw.is_null() {
        if field.required {
            return Err(Error::RecordInvalid(format!(
                "field '{}' is required but null",
                field.name
            )));
        }
        return Ok(ScalarValue::Null);
    }
    match field.field_type {
        FieldType::Int64 => coerce_int64(field, raw),
        FieldType::Float32 => coerce_float32(field, raw),
        FieldType::Bool => coerce_bool(field, raw),
        FieldType::String => coerce_string(field, raw),
        FieldType::DateTime => coerce_date_time(field, raw),
        FieldType::GeoPoint => coerce_geo_point(field, raw),
        FieldType::Path => coerce_string(field, raw).map(|v| match v {
            ScalarValue::String(s) => ScalarValue::Path(s),
            other => other,
        }),
        FieldType::ListString => coerce_list_string(field, raw),
        FieldType::ListInt64 => coerce_list_int64(field, raw),
        FieldType::Vector | FieldType::SparseVector => Err(Error::RecordInvalid(format!(
            "field '{}' is a vector field, not a scalar",
            field.name
        ))),
    }
}

fn coerce_int64(field: &FieldSpec, raw: &serde_json::Value) -> Result<ScalarValue> {
    if let Some(n) = raw.as_i64() {
        return Ok(ScalarValue::Int64(n));
    }
    if let Some(s) = raw.as_str() {
        return s
            .parse::<i64>()
            .map(ScalarValue::Int64)
            .map_err(|_| Error::RecordInvalid(format!("field '{}': '{}' is not an int64", field.name, s)));
    }
    Err(Error::RecordInvalid(format!(
        "field '{}': cannot coerce {} to int64",
        field.name, raw
    )))
}

fn coerce_float32(field: &FieldSpec, raw: &serde_json::Value) -> Result<ScalarValue> {
    if let Some(f) = raw.as_f64() {
        return Ok(ScalarValue::Float32(f as f32));
    }
    if let Some(s) = raw.as_str() {
        return s
            .parse::<f32>()
            .map(ScalarValue::Float32)
            .map_err(|_| Error::RecordInvalid(format!("field '{}': '{}' is not a float32", field.name, s)));
    }
    Err(Error::RecordInvalid(format!(
        "field '{}': cannot coerce {} to float32",
        field.name, raw
    )))
}

fn coerce_bool(field: &FieldSpec, raw: &serde_json::Value) -> Result<ScalarValue> {
    if let Some(b) = raw.as_bool() {
        return Ok(ScalarValue::Bool(b));
    }
    if let Some(n) = raw.as_i64() {
        return match n {
            0 => Ok(ScalarValue::Bool(false)),
            1 => Ok(ScalarValue::Bool(true)),
            _ => Err(Error::RecordInvalid(format!(
                "field '{}': {} is not a valid bool (expect 0/1)",
                field.name, n
            ))),
        };
    }
    Err(Error::RecordInvalid(format!(
        "field '{}': cannot coerce {} to bool",
        field.name, raw
    )))
}

fn coerce_string(field: &FieldSpec, raw: &serde_json::Value) -> Result<ScalarValue> {
    raw.as_str()
        .map(|s| ScalarValue::String(s.to_string()))
        .ok_or_else(|| Error::RecordInvalid(format!("field '{}': expected a string", field.name)))
}

fn coerce_date_time(field: &FieldSpec, raw: &serde_json::Value) -> Result<ScalarValue> {
    let s = raw
        .as_str()
        .ok_or_else(|| Error::RecordInvalid(format!("field '{}': date_time must be a string", field.name)))?;
    let dt = DateTime::parse_from_rfc3339(s)
        .map_err(|e| Error::RecordInvalid(format!("field '{}': invalid ISO-8601 '{}': {}", field.name, s, e)))?;
    Ok(ScalarValue::DateTimeNs(dt.timestamp_nanos_opt().unwrap_or(0)))
}

fn coerce_geo_point(field: &FieldSpec, raw: &serde_json::Value) -> Result<ScalarValue> {
    let s = raw
        .as_str()
        .ok_or_else(|| Error::RecordInvalid(format!("field '{}': geo_point must be \"lat,lon\"", field.name)))?;
    let parts: Vec<&str> = s.split(',').map(|p| p.trim()).collect();
    if parts.len() != 2 {
        return Err(Error::RecordInvalid(format!(
            "field '{}': geo_point '{}' must have exactly one comma",
            field.name, s
        )));
    }
    let lat: f64 = parts[0]
        .parse()
        .map_err(|_| Error::RecordInvalid(format!("field '{}': invalid latitude '{}'", field.name, parts[0])))?;
    let lon: f64 = parts[1]
        .parse()
        .map_err(|_| Error::RecordInvalid(format!("field '{}': invalid longitude '{}'", field.name, parts[1])))?;
    if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
        return Err(Error::RecordInvalid(format!(
            "field '{}': geo_point '{}' out of range",
            field.name, s
        )));
    }
    Ok(ScalarValue::GeoPoint(lat, lon))
}

fn coerce_list_string(field: &FieldSpec, raw: &serde_json::Value) -> Result<ScalarValue> {
    let arr = raw
        .as_array()
        .ok_or_else(|| Error::RecordInvalid(format!("field '{}': expected a list", field.name)))?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        out.push(
            item.as_str()
                .ok_or_else(|| Error::RecordInvalid(format!("field '{}': list element not a string", field.name)))?
                .to_string(),
        );
    }
    Ok(ScalarValue::ListString(out))
}

fn coerce_list_int64(field: &FieldSpec, raw: &serde_json::Value) -> Result<ScalarValue> {
    let arr = raw
        .as_array()
        .ok_or_else(|| Error::RecordInvalid(format!("field '{}': expected a list", field.name)))?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        out.push(
            item.as_i64()
                .ok_or_else(|| Error::RecordInvalid(format!("field '{}': list element not an int64", field.name)))?,
        );
    }
    Ok(ScalarValue::ListInt64(out))
}
