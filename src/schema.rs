//! Column naming and type inference for free-form device attributes.
//!
//! Attribute paths such as `bms_bmsStatus.actSoc` become column names like
//! `eco_bms_bmsstatus_actsoc`; the same transform is used when creating
//! columns and when inserting values, so field lists always line up with the
//! table layout.

use crate::error::InferError;
use crate::sample::{is_integral, Value, SERIAL_NUMBER_ATTR, TIMESTAMP_ATTR};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

pub const COLUMN_PREFIX: &str = "eco_";
pub const TEXT_LENGTH: u32 = 255;
pub const NESTED_LENGTH: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text(u32),
    Integer,
    Decimal,
    Timestamp,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKind::Text(len) => write!(f, "text({len})"),
            ColumnKind::Integer => f.write_str("integer"),
            ColumnKind::Decimal => f.write_str("decimal"),
            ColumnKind::Timestamp => f.write_str("timestamp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Maps an attribute path onto its column name.
///
/// Lowercases, replaces `.` with `_` and adds the `eco_` prefix. The synthetic
/// `timestamp` and `serial_number` attributes keep their bare names. Already
/// normalized names are returned unchanged, so a source field `eco_x` and a
/// field `x` share the column `eco_x`; [`infer_columns`] keeps the first.
pub fn normalize_name(attribute: &str) -> String {
    let lowered = attribute.to_lowercase().replace('.', "_");
    if lowered == TIMESTAMP_ATTR || lowered == SERIAL_NUMBER_ATTR {
        return lowered;
    }
    if lowered.starts_with(COLUMN_PREFIX) {
        return lowered;
    }
    format!("{COLUMN_PREFIX}{lowered}")
}

/// Derives the column for an attribute from its name and current value.
pub fn infer_column(attribute: &str, value: &Value) -> Result<ColumnSpec, InferError> {
    let name = normalize_name(attribute);
    if name == TIMESTAMP_ATTR {
        return Ok(ColumnSpec::new(name, ColumnKind::Timestamp));
    }
    let kind = match value {
        Value::Text(_) => ColumnKind::Text(TEXT_LENGTH),
        Value::Timestamp(_) => ColumnKind::Timestamp,
        Value::Integer(_) => ColumnKind::Integer,
        Value::Decimal(f) if !f.is_finite() => {
            return Err(InferError::NonFinite {
                name: attribute.to_string(),
                value: *f,
            })
        }
        Value::Decimal(f) if is_integral(*f) => ColumnKind::Integer,
        Value::Decimal(_) => ColumnKind::Decimal,
        Value::Nested(json) => ColumnKind::Text(nested_length(&json.to_string())),
    };
    Ok(ColumnSpec::new(name, kind))
}

/// Fixed-growth sizing for serialized nested values.
pub fn nested_length(serialized: &str) -> u32 {
    let len = serialized.chars().count() as u32;
    if len > NESTED_LENGTH {
        NESTED_LENGTH + len
    } else {
        NESTED_LENGTH
    }
}

/// Infers a column for every attribute, keyed and ordered by column name.
/// Attributes without a column kind are logged and left out; when two paths
/// collapse onto the same column the first one (in path order) wins.
pub fn infer_columns<'a>(
    attributes: &'a BTreeMap<String, Value>,
) -> BTreeMap<String, (ColumnSpec, &'a Value)> {
    let mut out = BTreeMap::new();
    for (attribute, value) in attributes {
        match infer_column(attribute, value) {
            Ok(spec) => {
                if out.contains_key(&spec.name) {
                    warn!(attribute = %attribute, column = %spec.name, "column name collision; attribute skipped");
                    continue;
                }
                out.insert(spec.name.clone(), (spec, value));
            }
            Err(e) => warn!(attribute = %attribute, error = %e, "type inference failed; attribute skipped"),
        }
    }
    out
}
