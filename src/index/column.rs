//! Column index: one value index for one column of one partition.
//!
//! Event IDs are dense within a partition but carry a global base, so the
//! value index stores partition-relative offsets (`id - base`). The base
//! is captured in the column file header.

use crate::bitmap::Bitmap;
use crate::data::{Field, Slice, ValueType, ATTR_SKIP};
use crate::error::{Error, Result};
use crate::query::expr::RelOp;
use crate::vindex::{self, wire, Options, ValueIndex};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnIndex {
    field: Field,
    /// The owning partition's `min_id`.
    base: u64,
    index: ValueIndex,
}

impl ColumnIndex {
    /// Creates the column index for a field. Fields with the `skip`
    /// attribute get the none variant and never match anything.
    pub fn new(field: Field, base: u64, options: &Options) -> Result<Self> {
        let index = if field.has_attr(ATTR_SKIP) {
            ValueIndex::None { len: 0 }
        } else {
            vindex::make_index(&field.ty, options)?
        };
        Ok(ColumnIndex { field, base, index })
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Re-anchors the column to the partition's first event ID. Only
    /// valid before any row was appended.
    pub fn rebase(&mut self, base: u64) {
        debug_assert!(self.is_empty());
        self.base = base;
    }

    /// Logical length; equals the partition's row count between slices.
    pub fn len(&self) -> u64 {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Streams column `k` of a slice in, row by row.
    pub fn add(&mut self, slice: &Slice, k: usize) -> Result<()> {
        for row in 0..slice.rows() {
            let id = slice.offset() + row as u64 - self.base;
            let value = slice.value(row, k);
            if value.is_null() {
                self.index.append_null(id);
            } else {
                self.index.append(value, id)?;
            }
        }
        Ok(())
    }

    /// Advances the column past `rows` rows without values. Used when a
    /// slice of another layout lands in the partition.
    pub fn pad(&mut self, upto: u64) {
        if upto > 0 {
            self.index.append_null(upto - 1);
        }
    }

    pub fn lookup(&self, op: RelOp, operand: &crate::data::Value) -> Result<Bitmap> {
        self.index.lookup(op, operand)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        let mut tag = Vec::new();
        self.field.ty.encode(&mut tag);
        wire::put_bytes(&mut buf, &tag);
        wire::put_u64(&mut buf, self.base);
        let mut payload = Vec::new();
        self.index.serialize(&mut payload);
        wire::put_bytes(&mut buf, &payload);
        fs::write(path, buf)?;
        Ok(())
    }

    pub fn read_from(path: &Path, field: Field) -> Result<Self> {
        let buf = fs::read(path)?;
        let mut cur = wire::Cursor::new(&buf);
        let tag = cur.bytes()?;
        let (ty, used) = ValueType::decode(tag)
            .ok_or_else(|| Error::corruption("bad column type tag"))?;
        if used != tag.len() {
            return Err(Error::corruption("trailing bytes in column type tag"));
        }
        if ty != field.ty {
            return Err(Error::corruption(format!(
                "column {} has type {} on disk but {} in layout",
                field.name, ty, field.ty
            )));
        }
        let base = cur.u64()?;
        let payload = cur.bytes()?;
        if !cur.is_exhausted() {
            return Err(Error::corruption("trailing bytes after column payload"));
        }
        let index = ValueIndex::deserialize(payload)?;
        Ok(ColumnIndex { field, base, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Attribute, Layout, SliceBuilder, Value};
    use std::sync::Arc;

    fn int_slice(values: &[i64], offset: u64) -> Slice {
        let layout = Arc::new(Layout::new(
            "test",
            vec![Field::new("x", ValueType::Int)],
        ));
        let mut builder = SliceBuilder::new(layout);
        for &v in values {
            builder.push_row(vec![Value::Int(v)]).unwrap();
        }
        let mut slice = builder.finish();
        slice.set_offset(offset);
        slice
    }

    #[test]
    fn test_add_and_lookup() {
        let mut col = ColumnIndex::new(
            Field::new("x", ValueType::Int),
            0,
            &Options::new(),
        )
        .unwrap();
        col.add(&int_slice(&[1, 2, 3, 1, 2, 3, 1, 2, 3], 0), 0).unwrap();
        assert_eq!(col.len(), 9);
        assert_eq!(
            col.lookup(RelOp::Eq, &Value::Int(1)).unwrap(),
            Bitmap::from_positions(9, &[0, 3, 6])
        );
    }

    #[test]
    fn test_base_offset_applied() {
        let mut col = ColumnIndex::new(
            Field::new("x", ValueType::Int),
            1000,
            &Options::new(),
        )
        .unwrap();
        col.add(&int_slice(&[7, 8], 1000), 0).unwrap();
        col.add(&int_slice(&[7], 1002), 0).unwrap();
        assert_eq!(col.len(), 3);
        assert_eq!(
            col.lookup(RelOp::Eq, &Value::Int(7)).unwrap(),
            Bitmap::from_positions(3, &[0, 2])
        );
    }

    #[test]
    fn test_skip_field_matches_nothing() {
        let field = Field::new("x", ValueType::Int)
            .with_attr(Attribute::new(ATTR_SKIP));
        let mut col = ColumnIndex::new(field, 0, &Options::new()).unwrap();
        col.add(&int_slice(&[1, 1, 1], 0), 0).unwrap();
        assert_eq!(col.len(), 3);
        let hits = col.lookup(RelOp::Eq, &Value::Int(1)).unwrap();
        assert_eq!(hits.count_ones(), 0);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.col");
        let field = Field::new("x", ValueType::Int);
        let mut col =
            ColumnIndex::new(field.clone(), 50, &Options::new()).unwrap();
        col.add(&int_slice(&[4, 5, 6], 50), 0).unwrap();
        col.write_to(&path).unwrap();

        let loaded = ColumnIndex::read_from(&path, field).unwrap();
        assert_eq!(loaded, col);
        assert_eq!(loaded.base(), 50);
    }

    #[test]
    fn test_corrupt_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.col");
        fs::write(&path, b"not a column index").unwrap();
        let err =
            ColumnIndex::read_from(&path, Field::new("x", ValueType::Int))
                .unwrap_err();
        assert_eq!(err.kind().to_string(), "corruption");
    }

    #[test]
    fn test_type_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.col");
        let field = Field::new("x", ValueType::Int);
        let col = ColumnIndex::new(field, 0, &Options::new()).unwrap();
        col.write_to(&path).unwrap();
        let err = ColumnIndex::read_from(
            &path,
            Field::new("x", ValueType::String),
        )
        .unwrap_err();
        assert_eq!(err.kind().to_string(), "corruption");
    }
}
