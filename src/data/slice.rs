//! Event slices.
//!
//! A slice is a batch of rows sharing one layout, stored column-major for
//! the indexing path. Its `offset` is the global event ID of row 0 and is
//! stamped by the importer before the slice fans out.

use super::layout::Layout;
use super::value::Value;
use crate::error::{Error, Result};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Slice {
    layout: Arc<Layout>,
    offset: u64,
    rows: usize,
    /// One vector per leaf field, each `rows` long.
    columns: Vec<Vec<Value>>,
}

impl Slice {
    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn column(&self, k: usize) -> &[Value] {
        &self.columns[k]
    }

    pub fn value(&self, row: usize, k: usize) -> &Value {
        &self.columns[k][row]
    }
}

/// Accumulates rows into a slice.
pub struct SliceBuilder {
    layout: Arc<Layout>,
    columns: Vec<Vec<Value>>,
    rows: usize,
}

impl SliceBuilder {
    pub fn new(layout: Arc<Layout>) -> Self {
        let columns = (0..layout.arity()).map(|_| Vec::new()).collect();
        SliceBuilder {
            layout,
            columns,
            rows: 0,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Appends one row. The row must match the layout's arity and every
    /// value must conform to its field type.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.layout.arity() {
            return Err(Error::Format(format!(
                "row arity {} does not match layout {} ({} fields)",
                row.len(),
                self.layout.name,
                self.layout.arity()
            )));
        }
        for (value, field) in row.iter().zip(&self.layout.fields) {
            if !value.conforms_to(&field.ty) {
                return Err(Error::Format(format!(
                    "value {} does not conform to field {}: {}",
                    value, field.name, field.ty
                )));
            }
        }
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.push(value);
        }
        self.rows += 1;
        Ok(())
    }

    /// Finishes the slice with an unset offset; the importer stamps it.
    pub fn finish(self) -> Slice {
        Slice {
            layout: self.layout,
            offset: 0,
            rows: self.rows,
            columns: self.columns,
        }
    }
}
