//! Subnet index: per-value bitmaps, equality only.

use super::wire::{self, Cursor};
use crate::bitmap::Bitmap;
use crate::data::{Subnet, Value};
use crate::error::{Error, Result};
use crate::query::expr::RelOp;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct SubnetIndex {
    /// (network bits, prefix) -> rows holding that subnet.
    values: BTreeMap<(u128, u8), Bitmap>,
    mask: Bitmap,
    len: u64,
}

impl SubnetIndex {
    pub fn new() -> Self {
        SubnetIndex {
            values: BTreeMap::new(),
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

    fn as_subnet(&self, value: &Value) -> Result<Subnet> {
        match value {
            Value::Subnet(s) => Ok(*s),
            other => Err(Error::TypeClash {
                expected: "subnet".into(),
                operand: other.to_string(),
            }),
        }
    }

    pub fn append(&mut self, value: &Value, id: u64) -> Result<()> {
        let subnet = self.as_subnet(value)?;
        if id < self.len {
            return Ok(());
        }
        let key = (subnet.network().bits(), subnet.prefix());
        let bm = self.values.entry(key).or_default();
        bm.pad_to(id);
        bm.append(true, 1);
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
        let subnet = self.as_subnet(operand)?;
        let key = (subnet.network().bits(), subnet.prefix());
        let eq = match self.values.get(&key) {
            Some(bm) => {
                let mut bm = bm.clone();
                bm.pad_to(self.len);
                bm
            }
            None => Bitmap::filled(self.len, false),
        };
        match op {
            RelOp::Eq => Ok(eq),
            RelOp::Ne => Ok(!&eq),
            _ => Err(Error::TypeClash {
                expected: "subnet".into(),
                operand: format!("{} {}", op, operand),
            }),
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        wire::put_u64(buf, self.len);
        wire::put_bitmap(buf, &self.mask);
        wire::put_u64(buf, self.values.len() as u64);
        for (&(bits, prefix), bm) in &self.values {
            wire::put_u64(buf, (bits >> 64) as u64);
            wire::put_u64(buf, bits as u64);
            wire::put_u8(buf, prefix);
            wire::put_bitmap(buf, bm);
        }
    }

    pub fn deserialize(cur: &mut Cursor<'_>) -> Result<Self> {
        let len = cur.u64()?;
        let mask = cur.bitmap()?;
        let mut values = BTreeMap::new();
        for _ in 0..cur.u64()? {
            let high = cur.u64()? as u128;
            let low = cur.u64()? as u128;
            let prefix = cur.u8()?;
            if prefix > 128 {
                return Err(Error::corruption(format!("bad prefix {}", prefix)));
            }
            values.insert((high << 64 | low, prefix), cur.bitmap()?);
        }
        Ok(SubnetIndex { values, mask, len })
    }
}

impl Default for SubnetIndex {
    fn default() -> Self {
        Self::new()
    }
}
