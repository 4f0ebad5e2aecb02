//! Partial-update expression builder.
//!
//! The key-value store rejects requests that name attributes from its reserved
//! vocabulary directly, so every field reference goes through `#n{i}` name
//! placeholders and every value through `:v{i}` value placeholders. The
//! placeholder scheme lives entirely in this module; join logic only hands a
//! field map to the builder.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::types::{FieldMap, is_placeholder};

/// An opaque partial-update request.
///
/// Holds a `SET` expression over placeholders plus the name and value
/// substitution tables. Guaranteed to never reference the excluded identifier
/// attribute and to never assign a null or empty placeholder value, so applying
/// it cannot erase fields the source record did not provide.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateExpression {
    expression: String,
    names: BTreeMap<String, String>,
    values: BTreeMap<String, Value>,
}

impl UpdateExpression {
    /// Starts building an expression that will never assign `key_attr`.
    pub fn builder(key_attr: impl Into<String>) -> UpdateExpressionBuilder {
        UpdateExpressionBuilder {
            excluded: vec![key_attr.into()],
            fields: FieldMap::new(),
        }
    }

    /// Returns whether the expression assigns no fields at all.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of assigned fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// The rendered `SET` expression over placeholders.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Resolves the placeholders back into `(field, value)` pairs.
    ///
    /// Store adapters use this to apply the update; field order is
    /// deterministic (sorted by field name).
    pub fn assignments(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.names.iter().filter_map(|(name_ph, field)| {
            let value_ph = format!(":v{}", &name_ph[2..]);
            self.values
                .get(&value_ph)
                .map(|value| (field.as_str(), value))
        })
    }
}

/// Builder collecting fields for an [`UpdateExpression`].
#[derive(Debug)]
pub struct UpdateExpressionBuilder {
    excluded: Vec<String>,
    fields: FieldMap,
}

impl UpdateExpressionBuilder {
    /// Excludes an additional attribute from the expression, e.g. the source's
    /// modification marker.
    pub fn exclude(mut self, field: impl Into<String>) -> Self {
        self.excluded.push(field.into());
        self
    }

    /// Adds every eligible field from the map.
    ///
    /// Excluded attributes and null or empty placeholder values are dropped:
    /// absence means "leave the existing value alone", not "erase it".
    pub fn set_fields(mut self, fields: FieldMap) -> Self {
        for (field, value) in fields {
            if self.excluded.iter().any(|excluded| *excluded == field) {
                continue;
            }
            if is_placeholder(&value) {
                continue;
            }
            self.fields.insert(field, value);
        }
        self
    }

    /// Renders the collected fields into an [`UpdateExpression`].
    pub fn build(self) -> UpdateExpression {
        let mut parts = Vec::with_capacity(self.fields.len());
        let mut names = BTreeMap::new();
        let mut values = BTreeMap::new();

        // FieldMap iterates in key order, so placeholder numbering is stable
        // for a given field set and the expression is safe to retry or compare.
        for (index, (field, value)) in self.fields.into_iter().enumerate() {
            let name_ph = format!("#n{index}");
            let value_ph = format!(":v{index}");

            parts.push(format!("{name_ph} = {value_ph}"));
            names.insert(name_ph, field);
            values.insert(value_ph, value);
        }

        let expression = if parts.is_empty() {
            String::new()
        } else {
            format!("SET {}", parts.join(", "))
        };

        UpdateExpression {
            expression,
            names,
            values,
        }
    }
}
