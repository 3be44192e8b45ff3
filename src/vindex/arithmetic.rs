//! Bit-plane index for ordered numeric types.
//!
//! Each value is decomposed into an order-preserving unsigned key; one
//! bitmap per key bit records which rows have that bit set. Range lookups
//! compose the planes with the bit-sliced comparison: walking from the
//! most significant plane down, rows diverging below the operand on a bit
//! where the operand has a one are strictly smaller.

use super::wire::{self, Cursor};
use crate::bitmap::Bitmap;
use crate::data::{Value, ValueType};
use crate::error::{Error, Result};
use crate::query::expr::RelOp;

#[derive(Debug, Clone, PartialEq)]
pub struct ArithmeticIndex {
    ty: ValueType,
    width: u32,
    /// `planes[i]` holds bit `i` (LSB first) of every row's key.
    planes: Vec<Bitmap>,
    /// Rows with a non-null value.
    mask: Bitmap,
    len: u64,
}

impl ArithmeticIndex {
    pub fn new(ty: ValueType) -> Self {
        Self::with_width(ty, 64)
    }

    /// An index over keys narrower than 64 bits (port numbers use 16).
    pub fn with_width(ty: ValueType, width: u32) -> Self {
        ArithmeticIndex {
            ty,
            width,
            planes: (0..width).map(|_| Bitmap::new()).collect(),
            mask: Bitmap::new(),
            len: 0,
        }
    }

    pub fn value_type(&self) -> &ValueType {
        &self.ty
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maps a value to its order-preserving unsigned key, or a type clash
    /// if the value does not fit this index's type.
    fn key_of(&self, value: &Value) -> Result<u64> {
        let key = match (&self.ty, value) {
            (ValueType::Bool, Value::Bool(b)) => Some(*b as u64),
            (ValueType::Int, _) => value.as_int().map(order_key_i64),
            (ValueType::Count, _) => value.as_count(),
            (ValueType::Real, Value::Real(v)) => Some(real_order(*v)),
            (ValueType::Time, Value::Time(v)) => Some(order_key_i64(*v)),
            (ValueType::Duration, Value::Duration(v)) => Some(order_key_i64(*v)),
            _ => None,
        };
        key.ok_or_else(|| Error::TypeClash {
            expected: self.ty.to_string(),
            operand: value.to_string(),
        })
    }

    pub fn append(&mut self, value: &Value, id: u64) -> Result<()> {
        let key = self.key_of(value)?;
        if id < self.len {
            // Identical re-append of the last row is a no-op.
            return Ok(());
        }
        self.append_key(key, id);
        Ok(())
    }

    pub(crate) fn append_key(&mut self, key: u64, id: u64) {
        for (i, plane) in self.planes.iter_mut().enumerate() {
            plane.pad_to(id);
            plane.append(key >> i & 1 == 1, 1);
        }
        self.mask.pad_to(id);
        self.mask.append(true, 1);
        self.len = id + 1;
    }

    /// Records a null at `id`: advances every plane without setting bits.
    pub fn append_null(&mut self, id: u64) {
        if id < self.len {
            return;
        }
        for plane in &mut self.planes {
            plane.pad_to(id + 1);
        }
        self.mask.pad_to(id + 1);
        self.len = id + 1;
    }

    pub fn lookup(&self, op: RelOp, operand: &Value) -> Result<Bitmap> {
        let key = self.key_of(operand)?;
        let result = match op {
            RelOp::Eq => self.eq_key(key),
            RelOp::Ne => !&self.eq_key(key),
            RelOp::Lt => self.lt_key(key),
            RelOp::Le => self.le_key(key),
            RelOp::Gt => &self.mask & &!&self.le_key(key),
            RelOp::Ge => &self.mask & &!&self.lt_key(key),
            RelOp::In | RelOp::Ni | RelOp::Match => {
                return Err(Error::TypeClash {
                    expected: self.ty.to_string(),
                    operand: format!("{} {}", op, operand),
                })
            }
        };
        Ok(result)
    }

    pub(crate) fn eq_key(&self, key: u64) -> Bitmap {
        let mut acc = self.mask.clone();
        for (i, plane) in self.planes.iter().enumerate() {
            let mut plane = plane.clone();
            plane.pad_to(self.len);
            if key >> i & 1 == 1 {
                acc = &acc & &plane;
            } else {
                acc = &acc & &!&plane;
            }
        }
        acc
    }

    fn lt_key(&self, key: u64) -> Bitmap {
        self.compare(key, false)
    }

    fn le_key(&self, key: u64) -> Bitmap {
        self.compare(key, true)
    }

    fn compare(&self, key: u64, or_equal: bool) -> Bitmap {
        let mut below = Bitmap::filled(self.len, false);
        let mut equal = self.mask.clone();
        for i in (0..self.width).rev() {
            let mut plane = self.planes[i as usize].clone();
            plane.pad_to(self.len);
            if key >> i & 1 == 1 {
                below = &below | &(&equal & &!&plane);
                equal = &equal & &plane;
            } else {
                equal = &equal & &!&plane;
            }
        }
        if or_equal {
            &below | &equal
        } else {
            below
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        let mut tag = Vec::new();
        self.ty.encode(&mut tag);
        wire::put_bytes(buf, &tag);
        wire::put_u32(buf, self.width);
        wire::put_u64(buf, self.len);
        wire::put_bitmap(buf, &self.mask);
        for plane in &self.planes {
            wire::put_bitmap(buf, plane);
        }
    }

    pub fn deserialize(cur: &mut Cursor<'_>) -> Result<Self> {
        let tag = cur.bytes()?;
        let (ty, used) = ValueType::decode(tag)
            .ok_or_else(|| Error::corruption("bad arithmetic type tag"))?;
        if used != tag.len() {
            return Err(Error::corruption("trailing bytes in type tag"));
        }
        let width = cur.u32()?;
        if width == 0 || width > 64 {
            return Err(Error::corruption(format!("bad plane width {}", width)));
        }
        let len = cur.u64()?;
        let mask = cur.bitmap()?;
        let mut planes = Vec::with_capacity(width as usize);
        for _ in 0..width {
            planes.push(cur.bitmap()?);
        }
        Ok(ArithmeticIndex {
            ty,
            width,
            planes,
            mask,
            len,
        })
    }
}

/// Order-preserving map from i64 to u64 (flips the sign bit).
fn order_key_i64(v: i64) -> u64 {
    (v as u64) ^ (1 << 63)
}

/// Order-preserving map from f64 to u64: negative values flip entirely,
/// non-negative values flip the sign bit.
fn real_order(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest(values: &[i64]) -> ArithmeticIndex {
        let mut idx = ArithmeticIndex::new(ValueType::Int);
        for (i, &v) in values.iter().enumerate() {
            idx.append(&Value::Int(v), i as u64).unwrap();
        }
        idx
    }

    #[test]
    fn test_eq_lookup() {
        let idx = ingest(&[1, 2, 3, 1, 2, 3, 1, 2, 3]);
        assert_eq!(
            idx.lookup(RelOp::Eq, &Value::Int(1)).unwrap(),
            Bitmap::from_positions(9, &[0, 3, 6])
        );
        assert_eq!(
            idx.lookup(RelOp::Eq, &Value::Int(4)).unwrap().count_ones(),
            0
        );
    }

    #[test]
    fn test_range_lookups() {
        let idx = ingest(&[-5, 0, 5, 10]);
        assert_eq!(
            idx.lookup(RelOp::Lt, &Value::Int(5)).unwrap(),
            Bitmap::from_positions(4, &[0, 1])
        );
        assert_eq!(
            idx.lookup(RelOp::Le, &Value::Int(5)).unwrap(),
            Bitmap::from_positions(4, &[0, 1, 2])
        );
        assert_eq!(
            idx.lookup(RelOp::Gt, &Value::Int(0)).unwrap(),
            Bitmap::from_positions(4, &[2, 3])
        );
        assert_eq!(
            idx.lookup(RelOp::Ge, &Value::Int(-5)).unwrap().count_ones(),
            4
        );
    }

    #[test]
    fn test_ne_covers_universe() {
        let idx = ingest(&[1, 2]);
        let ne = idx.lookup(RelOp::Ne, &Value::Int(1)).unwrap();
        assert_eq!(ne, Bitmap::from_positions(2, &[1]));
    }

    #[test]
    fn test_nulls_excluded_from_ranges() {
        let mut idx = ArithmeticIndex::new(ValueType::Int);
        idx.append(&Value::Int(1), 0).unwrap();
        idx.append_null(1);
        idx.append(&Value::Int(3), 2).unwrap();
        assert_eq!(idx.len(), 3);
        // The null row matches neither side of a range split.
        let lt = idx.lookup(RelOp::Lt, &Value::Int(2)).unwrap();
        let ge = idx.lookup(RelOp::Ge, &Value::Int(2)).unwrap();
        assert_eq!(lt, Bitmap::from_positions(3, &[0]));
        assert_eq!(ge, Bitmap::from_positions(3, &[2]));
        // But ne is complement over the whole universe.
        let ne = idx.lookup(RelOp::Ne, &Value::Int(1)).unwrap();
        assert_eq!(ne, Bitmap::from_positions(3, &[1, 2]));
    }

    #[test]
    fn test_real_ordering() {
        let mut idx = ArithmeticIndex::new(ValueType::Real);
        for (i, v) in [-2.5, -0.5, 0.0, 0.5, 2.5].iter().enumerate() {
            idx.append(&Value::Real(*v), i as u64).unwrap();
        }
        assert_eq!(
            idx.lookup(RelOp::Lt, &Value::Real(0.0)).unwrap(),
            Bitmap::from_positions(5, &[0, 1])
        );
        assert_eq!(
            idx.lookup(RelOp::Ge, &Value::Real(0.5)).unwrap(),
            Bitmap::from_positions(5, &[3, 4])
        );
    }

    #[test]
    fn test_widened_operand() {
        let idx = ingest(&[1, 2, 3]);
        // A count operand against an int column widens with a sign check.
        assert_eq!(
            idx.lookup(RelOp::Eq, &Value::Count(2)).unwrap(),
            Bitmap::from_positions(3, &[1])
        );
        // A string operand is a type clash.
        assert!(idx.lookup(RelOp::Eq, &Value::Str("2".into())).is_err());
    }

    #[test]
    fn test_duplicate_append_is_idempotent() {
        let mut idx = ArithmeticIndex::new(ValueType::Int);
        idx.append(&Value::Int(7), 0).unwrap();
        idx.append(&Value::Int(7), 0).unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(
            idx.lookup(RelOp::Eq, &Value::Int(7)).unwrap().count_ones(),
            1
        );
    }

    #[test]
    fn test_serialize_roundtrip() {
        let idx = ingest(&[5, -3, 99, 0]);
        let mut buf = Vec::new();
        idx.serialize(&mut buf);
        let decoded = ArithmeticIndex::deserialize(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, idx);
        assert_eq!(
            decoded.lookup(RelOp::Eq, &Value::Int(-3)).unwrap(),
            idx.lookup(RelOp::Eq, &Value::Int(-3)).unwrap()
        );
    }
}
