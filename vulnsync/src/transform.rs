//! Source transforms and the static source registry.
//!
//! Every source ships a pure transform mapping a raw record to the prefixed
//! field set it contributes to the unified entity. Transforms are modeled as a
//! capability trait selected through static configuration, not discovered at
//! runtime; determinism is required because static sources are diffed by
//! content hash.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::types::{FieldMap, Record, is_placeholder};

/// A pure, deterministic mapping from a raw source record to the fields it
/// contributes to the unified entity.
///
/// Returning an empty map means the record contributes nothing and is skipped.
pub trait SourceTransform: Send + Sync {
    fn apply(&self, record: &Record) -> FieldMap;
}

/// How a field value is coerced before it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// Keep the value as-is.
    None,
    /// Parse into a number; unparseable values are dropped.
    Number,
    /// Render into a trimmed string.
    Text,
}

/// One output field of a [`RenameTransform`]: the final (source-prefixed)
/// attribute name and the raw field name variants it may arrive under.
#[derive(Debug, Clone)]
pub struct FieldRename {
    output: String,
    sources: Vec<String>,
    coercion: Coercion,
}

impl FieldRename {
    pub fn new(output: impl Into<String>, sources: &[&str]) -> Self {
        Self {
            output: output.into(),
            sources: sources.iter().map(|s| (*s).to_string()).collect(),
            coercion: Coercion::None,
        }
    }

    pub fn number(mut self) -> Self {
        self.coercion = Coercion::Number;
        self
    }

    pub fn text(mut self) -> Self {
        self.coercion = Coercion::Text;
        self
    }
}

/// The one transform shape nearly every source needs: select fields under
/// their known name variants, rename them into the source's prefixed
/// namespace, and coerce scalars. Null and empty values are dropped rather
/// than emitted, so a rename never erases an attribute another pass wrote.
#[derive(Debug, Clone)]
pub struct RenameTransform {
    fields: Vec<FieldRename>,
}

impl RenameTransform {
    pub fn new(fields: Vec<FieldRename>) -> Self {
        Self { fields }
    }
}

impl SourceTransform for RenameTransform {
    fn apply(&self, record: &Record) -> FieldMap {
        let mut out = FieldMap::new();

        for field in &self.fields {
            let Some(value) = field
                .sources
                .iter()
                .filter_map(|source| record.get(source))
                .find(|value| !is_placeholder(value))
            else {
                continue;
            };

            let Some(coerced) = coerce(value, field.coercion) else {
                continue;
            };

            out.insert(field.output.clone(), coerced);
        }

        out
    }
}

fn coerce(value: &Value, coercion: Coercion) -> Option<Value> {
    match coercion {
        Coercion::None => Some(value.clone()),
        Coercion::Number => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            _ => None,
        },
        Coercion::Text => match value {
            Value::String(s) => Some(Value::String(s.trim().to_string())),
            other => Some(Value::String(other.to_string())),
        },
    }
}

/// Whether a source carries a reliable modification marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// The source stamps each record with a modification marker; incremental
    /// scans can be bounded by a watermark on that field.
    Dynamic { marker_field: String },
    /// No modification marker exists; changes are detected by content-hash
    /// diffing against a baseline. `volatile_fields` are excluded from the
    /// hash so trivially-churning fields do not mark every record changed.
    Static { volatile_fields: Vec<String> },
}

/// Static configuration of one source collection.
#[derive(Clone)]
pub struct SourceSpec {
    /// Source name used for watermarks, baselines, logs and metrics.
    pub name: String,
    /// Key-value table holding the raw source records.
    pub table: String,
    /// Field names to try first when resolving the join key.
    pub join_key_fields: Vec<String>,
    pub kind: SourceKind,
    pub transform: Arc<dyn SourceTransform>,
}

impl SourceSpec {
    /// Declares a dynamic source whose `marker_field` bounds incremental scans.
    pub fn dynamic(
        name: impl Into<String>,
        table: impl Into<String>,
        join_key_field: impl Into<String>,
        marker_field: impl Into<String>,
        transform: Arc<dyn SourceTransform>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            join_key_fields: vec![join_key_field.into()],
            kind: SourceKind::Dynamic {
                marker_field: marker_field.into(),
            },
            transform,
        }
    }

    /// Declares a static source diffed by content hash.
    pub fn fixed(
        name: impl Into<String>,
        table: impl Into<String>,
        join_key_field: impl Into<String>,
        volatile_fields: &[&str],
        transform: Arc<dyn SourceTransform>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            join_key_fields: vec![join_key_field.into()],
            kind: SourceKind::Static {
                volatile_fields: volatile_fields.iter().map(|f| (*f).to_string()).collect(),
            },
            transform,
        }
    }

    /// The source's modification marker field, when it has one.
    pub fn marker_field(&self) -> Option<&str> {
        match &self.kind {
            SourceKind::Dynamic { marker_field } => Some(marker_field),
            SourceKind::Static { .. } => None,
        }
    }
}

impl fmt::Debug for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSpec")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("join_key_fields", &self.join_key_fields)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn epss_transform() -> RenameTransform {
        RenameTransform::new(vec![
            FieldRename::new("epss_value", &["epss", "EPSS", "score"]).number(),
            FieldRename::new("epss_percentile", &["percentile", "Percentile"]).number(),
        ])
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        let mut record = Record::new();
        for (field, value) in pairs {
            record.insert((*field).to_string(), value.clone());
        }
        record
    }

    #[test]
    fn renames_first_present_variant() {
        let out = epss_transform().apply(&record(&[
            ("EPSS", json!("0.97")),
            ("percentile", json!(0.999)),
        ]));

        assert_eq!(out["epss_value"], json!(0.97));
        assert_eq!(out["epss_percentile"], json!(0.999));
    }

    #[test]
    fn missing_fields_are_absent_not_null() {
        let out = epss_transform().apply(&record(&[("EPSS", json!(0.5))]));

        assert_eq!(out.len(), 1);
        assert!(!out.contains_key("epss_percentile"));
    }

    #[test]
    fn unparseable_numbers_are_dropped() {
        let out = epss_transform().apply(&record(&[("epss", json!("not a number"))]));
        assert!(out.is_empty());
    }

    #[test]
    fn placeholder_values_are_skipped_in_favor_of_later_variants() {
        let out = epss_transform().apply(&record(&[
            ("epss", json!("")),
            ("EPSS", json!(0.42)),
        ]));

        assert_eq!(out["epss_value"], json!(0.42));
    }

    #[test]
    fn transform_is_deterministic() {
        let rec = record(&[("epss", json!(0.1)), ("percentile", json!(0.2))]);
        let transform = epss_transform();

        assert_eq!(transform.apply(&rec), transform.apply(&rec));
    }

    #[test]
    fn text_coercion_trims() {
        let transform = RenameTransform::new(vec![
            FieldRename::new("cisa_product", &["product"]).text(),
        ]);
        let out = transform.apply(&record(&[("product", json!("  Widget  "))]));

        assert_eq!(out["cisa_product"], json!("Widget"));
    }
}
