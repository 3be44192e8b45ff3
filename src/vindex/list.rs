//! List index: per-element-value bitmaps.
//!
//! Bit-plane indexes cannot hold two values for one row, so list columns
//! keep one bitmap per distinct element value instead, keyed by the
//! element's canonical byte encoding. `in` and `ni` union the element
//! matches of the queried literal.

use super::wire::{self, Cursor};
use crate::bitmap::Bitmap;
use crate::data::{Value, ValueType};
use crate::error::{Error, Result};
use crate::query::expr::RelOp;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ListIndex {
    elem_ty: ValueType,
    /// Element canonical key -> rows whose list contains that element.
    elements: BTreeMap<Vec<u8>, Bitmap>,
    mask: Bitmap,
    len: u64,
}

impl ListIndex {
    pub fn new(elem_ty: ValueType) -> Self {
        ListIndex {
            elem_ty,
            elements: BTreeMap::new(),
            mask: Bitmap::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, value: &Value, id: u64) -> Result<()> {
        let elems = match value {
            Value::List(xs) => xs,
            other => {
                return Err(Error::TypeClash {
                    expected: format!("list<{}>", self.elem_ty),
                    operand: other.to_string(),
                })
            }
        };
        if id < self.len {
            return Ok(());
        }
        for elem in elems {
            if !elem.conforms_to(&self.elem_ty) {
                return Err(Error::TypeClash {
                    expected: self.elem_ty.to_string(),
                    operand: elem.to_string(),
                });
            }
            let bm = self.elements.entry(elem.index_key()).or_default();
            // Repeated elements of one list touch the same bitmap once.
            if bm.len() <= id {
                bm.pad_to(id);
                bm.append(true, 1);
            }
        }
        self.mask.pad_to(id);
        self.mask.append(true, 1);
        self.len = id + 1;
        Ok(())
    }

    pub fn append_null(&mut self, id: u64) {
        if id < self.len {
            return;
        }
        self.mask.pad_to(id + 1);
        self.len = id + 1;
    }

    pub fn lookup(&self, op: RelOp, operand: &Value) -> Result<Bitmap> {
        match op {
            RelOp::In | RelOp::Ni => {
                let contained = match operand {
                    Value::List(xs) => {
                        let mut acc = Bitmap::filled(self.len, false);
                        for elem in xs {
                            acc = &acc | &self.contains(elem)?;
                        }
                        acc
                    }
                    scalar => self.contains(scalar)?,
                };
                if op == RelOp::In {
                    Ok(contained)
                } else {
                    Ok(!&contained)
                }
            }
            _ => Err(Error::TypeClash {
                expected: format!("list<{}>", self.elem_ty),
                operand: format!("{} {}", op, operand),
            }),
        }
    }

    fn contains(&self, elem: &Value) -> Result<Bitmap> {
        if !elem.conforms_to(&self.elem_ty) {
            return Err(Error::TypeClash {
                expected: self.elem_ty.to_string(),
                operand: elem.to_string(),
            });
        }
        Ok(match self.elements.get(&elem.index_key()) {
            Some(bm) => {
                let mut bm = bm.clone();
                bm.pad_to(self.len);
                bm
            }
            None => Bitmap::filled(self.len, false),
        })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        let mut tag = Vec::new();
        self.elem_ty.encode(&mut tag);
        wire::put_bytes(buf, &tag);
        wire::put_u64(buf, self.len);
        wire::put_bitmap(buf, &self.mask);
        wire::put_u64(buf, self.elements.len() as u64);
        for (key, bm) in &self.elements {
            wire::put_bytes(buf, key);
            wire::put_bitmap(buf, bm);
        }
    }

    pub fn deserialize(cur: &mut Cursor<'_>) -> Result<Self> {
        let tag = cur.bytes()?;
        let (elem_ty, used) = ValueType::decode(tag)
            .ok_or_else(|| Error::corruption("bad list element tag"))?;
        if used != tag.len() {
            return Err(Error::corruption("trailing bytes in list element tag"));
        }
        let len = cur.u64()?;
        let mask = cur.bitmap()?;
        let mut elements = BTreeMap::new();
        for _ in 0..cur.u64()? {
            let key = cur.bytes()?.to_vec();
            elements.insert(key, cur.bitmap()?);
        }
        Ok(ListIndex {
            elem_ty,
            elements,
            mask,
            len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(xs: &[i64]) -> Value {
        Value::List(xs.iter().map(|&v| Value::Int(v)).collect())
    }

    fn ingest() -> ListIndex {
        let mut idx = ListIndex::new(ValueType::Int);
        idx.append(&ints(&[1, 2]), 0).unwrap();
        idx.append(&ints(&[2, 3]), 1).unwrap();
        idx.append(&ints(&[]), 2).unwrap();
        idx.append(&ints(&[1, 1, 1]), 3).unwrap();
        idx
    }

    #[test]
    fn test_contains_scalar() {
        let idx = ingest();
        assert_eq!(
            idx.lookup(RelOp::In, &Value::Int(1)).unwrap(),
            Bitmap::from_positions(4, &[0, 3])
        );
        assert_eq!(
            idx.lookup(RelOp::In, &Value::Int(9)).unwrap().count_ones(),
            0
        );
    }

    #[test]
    fn test_in_list_literal_unions() {
        let idx = ingest();
        assert_eq!(
            idx.lookup(RelOp::In, &ints(&[1, 3])).unwrap(),
            Bitmap::from_positions(4, &[0, 1, 3])
        );
    }

    #[test]
    fn test_ni_complements() {
        let idx = ingest();
        assert_eq!(
            idx.lookup(RelOp::Ni, &Value::Int(2)).unwrap(),
            Bitmap::from_positions(4, &[2, 3])
        );
    }

    #[test]
    fn test_other_ops_clash() {
        let idx = ingest();
        assert!(idx.lookup(RelOp::Eq, &ints(&[1, 2])).is_err());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let idx = ingest();
        let mut buf = Vec::new();
        idx.serialize(&mut buf);
        let decoded = ListIndex::deserialize(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, idx);
    }
}
