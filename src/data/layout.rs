//! Record layouts.
//!
//! A layout names and types every column of one event kind. Nested records
//! are represented pre-flattened: leaf fields carry dot-separated paths
//! (`id.orig_h`) and the *flat index* of a field is its position in the
//! field vector.

use super::value::ValueType;
use serde::{Deserialize, Serialize};

/// The attribute marking a field that must not be indexed.
pub const ATTR_SKIP: &str = "skip";

/// The attribute marking the event timestamp field.
pub const ATTR_TIMESTAMP: &str = "timestamp";

/// A string attribute attached to a field or layout, e.g. `skip` or
/// `default=uniform(0,100)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Attribute {
    pub fn new(key: impl Into<String>) -> Self {
        Attribute {
            key: key.into(),
            value: None,
        }
    }

    pub fn with_value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Attribute {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// One leaf column of a layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: ValueType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<Attribute>,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Field {
            name: name.into(),
            ty,
            attrs: Vec::new(),
        }
    }

    pub fn with_attr(mut self, attr: Attribute) -> Self {
        self.attrs.push(attr);
        self
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attrs.iter().any(|a| a.key == key)
    }

    pub fn attr(&self, key: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.key == key)
    }
}

/// An ordered, named sequence of leaf fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub name: String,
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<Attribute>,
}

impl Layout {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Layout {
            name: name.into(),
            fields,
            attrs: Vec::new(),
        }
    }

    /// Resolves a field path to its flat index and field.
    pub fn field(&self, path: &str) -> Option<(usize, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == path)
    }

    /// Matches a query field path against this layout. The path matches a
    /// field whose qualified name (`<layout>.<field>`) ends with it on a
    /// dot boundary, so `id.orig_h` finds `conn.id.orig_h`.
    pub fn match_path<'a>(&'a self, path: &str) -> Vec<(usize, &'a Field)> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| {
                let qualified = format!("{}.{}", self.name, f.name);
                qualified == path
                    || f.name == path
                    || qualified.ends_with(&format!(".{}", path))
            })
            .collect()
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }
}
