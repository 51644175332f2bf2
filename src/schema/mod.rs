//! Field kinds and the schema that names them.

mod field;
mod operator;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use field::{
    BooleanField, CategoricalField, DateField, Field, FieldType, NumericField, NumericKind,
    TextField,
};
pub use operator::Operator;

use crate::error::{FramewiseError, Result};

/// Ordered set of named fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: BTreeMap<String, FieldType>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn add(&mut self, name: impl Into<String>, field: FieldType) -> Result<()> {
        let name = name.into();
        if self.fields.contains_key(&name) {
            return Err(FramewiseError::FieldExists { field: name });
        }
        self.fields.insert(name, field);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldType)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Indexed text fields; these become unstructured storage fields.
    #[must_use]
    pub fn unstructured_fields(&self) -> Vec<String> {
        self.iter()
            .filter(|(_, f)| f.indexed() && !f.categorical())
            .map(|(name, _)| name.to_owned())
            .collect()
    }

    /// Indexed categorical fields; these become structured storage fields.
    #[must_use]
    pub fn structured_fields(&self) -> Vec<String> {
        self.iter()
            .filter(|(_, f)| f.indexed() && f.categorical())
            .map(|(name, _)| name.to_owned())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: BTreeMap<String, FieldType>,
}

impl SchemaBuilder {
    pub fn add_field(mut self, name: impl Into<String>, field: FieldType) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn add_text_field(self, name: impl Into<String>) -> Self {
        self.add_field(name, FieldType::text())
    }

    pub fn add_categorical_field(self, name: impl Into<String>) -> Self {
        self.add_field(name, FieldType::categorical())
    }

    pub fn build(self) -> Schema {
        Schema {
            fields: self.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_structured_and_unstructured() {
        let schema = Schema::builder()
            .add_text_field("body")
            .add_text_field("notes")
            .add_field("draft", FieldType::text().with_indexed(false))
            .add_categorical_field("author")
            .add_field("year", FieldType::numeric(NumericKind::Integer))
            .build();
        assert_eq!(schema.unstructured_fields(), vec!["body", "notes"]);
        assert_eq!(schema.structured_fields(), vec!["author", "year"]);
    }

    #[test]
    fn add_rejects_duplicates() {
        let mut schema = Schema::new();
        schema.add("body", FieldType::text()).unwrap();
        let err = schema.add("body", FieldType::categorical()).unwrap_err();
        assert!(matches!(err, FramewiseError::FieldExists { .. }));
        assert_eq!(schema.len(), 1);
    }
}
