//! Bit-plane index for IP addresses.
//!
//! One bitmap per bit of the canonical 128-bit form. Equality intersects
//! all planes, subnet containment only the planes covering the prefix,
//! and ranges use the same bit-sliced comparison as the arithmetic index
//! on the numeric value of the address.

use super::wire::{self, Cursor};
use crate::bitmap::Bitmap;
use crate::data::{Address, Subnet, Value};
use crate::error::{Error, Result};
use crate::query::expr::RelOp;

const BITS: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct AddressIndex {
    /// `planes[i]` holds bit `i` (LSB first) of every row's address.
    planes: Vec<Bitmap>,
    mask: Bitmap,
    len: u64,
}

impl AddressIndex {
    pub fn new() -> Self {
        AddressIndex {
            planes: (0..BITS).map(|_| Bitmap::new()).collect(),
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

    fn as_addr(&self, value: &Value) -> Result<Address> {
        match value {
            Value::Addr(a) => Ok(*a),
            other => Err(Error::TypeClash {
                expected: "addr".into(),
                operand: other.to_string(),
            }),
        }
    }

    pub fn append(&mut self, value: &Value, id: u64) -> Result<()> {
        let addr = self.as_addr(value)?;
        if id < self.len {
            return Ok(());
        }
        let bits = addr.bits();
        for (i, plane) in self.planes.iter_mut().enumerate() {
            plane.pad_to(id);
            plane.append(bits >> i & 1 == 1, 1);
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
        for plane in &mut self.planes {
            plane.pad_to(id + 1);
        }
        self.mask.pad_to(id + 1);
        self.len = id + 1;
    }

    pub fn lookup(&self, op: RelOp, operand: &Value) -> Result<Bitmap> {
        match op {
            RelOp::In | RelOp::Ni => {
                let subnet = match operand {
                    Value::Subnet(s) => *s,
                    other => {
                        return Err(Error::TypeClash {
                            expected: "subnet".into(),
                            operand: other.to_string(),
                        })
                    }
                };
                let contained = self.in_subnet(subnet);
                if op == RelOp::In {
                    Ok(contained)
                } else {
                    Ok(!&contained)
                }
            }
            RelOp::Eq => Ok(self.eq_addr(self.as_addr(operand)?)),
            RelOp::Ne => Ok(!&self.eq_addr(self.as_addr(operand)?)),
            RelOp::Lt => Ok(self.lt_addr(self.as_addr(operand)?)),
            RelOp::Le => {
                let a = self.as_addr(operand)?;
                Ok(&self.lt_addr(a) | &self.eq_addr(a))
            }
            RelOp::Gt => {
                let a = self.as_addr(operand)?;
                let le = &self.lt_addr(a) | &self.eq_addr(a);
                Ok(&self.mask & &!&le)
            }
            RelOp::Ge => {
                let a = self.as_addr(operand)?;
                Ok(&self.mask & &!&self.lt_addr(a))
            }
            RelOp::Match => Err(Error::TypeClash {
                expected: "addr".into(),
                operand: operand.to_string(),
            }),
        }
    }

    fn eq_addr(&self, addr: Address) -> Bitmap {
        self.match_prefix(addr.bits(), 128)
    }

    fn in_subnet(&self, subnet: Subnet) -> Bitmap {
        self.match_prefix(subnet.network().bits(), subnet.prefix() as usize)
    }

    /// Rows whose top `prefix` bits equal those of `bits`.
    fn match_prefix(&self, bits: u128, prefix: usize) -> Bitmap {
        let mut acc = self.mask.clone();
        for i in (BITS - prefix..BITS).rev() {
            let mut plane = self.planes[i].clone();
            plane.pad_to(self.len);
            if bits >> i & 1 == 1 {
                acc = &acc & &plane;
            } else {
                acc = &acc & &!&plane;
            }
        }
        acc
    }

    fn lt_addr(&self, addr: Address) -> Bitmap {
        let bits = addr.bits();
        let mut below = Bitmap::filled(self.len, false);
        let mut equal = self.mask.clone();
        for i in (0..BITS).rev() {
            let mut plane = self.planes[i].clone();
            plane.pad_to(self.len);
            if bits >> i & 1 == 1 {
                below = &below | &(&equal & &!&plane);
                equal = &equal & &plane;
            } else {
                equal = &equal & &!&plane;
            }
        }
        below
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        wire::put_u64(buf, self.len);
        wire::put_bitmap(buf, &self.mask);
        for plane in &self.planes {
            wire::put_bitmap(buf, plane);
        }
    }

    pub fn deserialize(cur: &mut Cursor<'_>) -> Result<Self> {
        let len = cur.u64()?;
        let mask = cur.bitmap()?;
        let mut planes = Vec::with_capacity(BITS);
        for _ in 0..BITS {
            planes.push(cur.bitmap()?);
        }
        Ok(AddressIndex { planes, mask, len })
    }
}

impl Default for AddressIndex {
    fn default() -> Self {
        Self::new()
    }
}
