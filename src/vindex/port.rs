//! Port index: arithmetic on the 16-bit number plus per-protocol bitmaps.
//!
//! Equality intersects the number planes with the protocol bitmap unless
//! the queried protocol is `unknown`, which matches any protocol. Range
//! predicates order by number alone.

use super::arithmetic::ArithmeticIndex;
use super::wire::{self, Cursor};
use crate::bitmap::Bitmap;
use crate::data::{Port, PortProto, Value, ValueType};
use crate::error::{Error, Result};
use crate::query::expr::RelOp;

#[derive(Debug, Clone, PartialEq)]
pub struct PortIndex {
    number: ArithmeticIndex,
    /// One bitmap per protocol tag (unknown, tcp, udp, icmp).
    protos: Vec<Bitmap>,
    len: u64,
}

impl PortIndex {
    pub fn new() -> Self {
        PortIndex {
            number: ArithmeticIndex::with_width(ValueType::Count, 16),
            protos: (0..4).map(|_| Bitmap::new()).collect(),
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn as_port(&self, value: &Value) -> Result<Port> {
        match value {
            Value::Port(p) => Ok(*p),
            other => Err(Error::TypeClash {
                expected: "port".into(),
                operand: other.to_string(),
            }),
        }
    }

    pub fn append(&mut self, value: &Value, id: u64) -> Result<()> {
        let port = self.as_port(value)?;
        if id < self.len {
            return Ok(());
        }
        self.number
            .append(&Value::Count(port.number as u64), id)?;
        for (tag, bm) in self.protos.iter_mut().enumerate() {
            bm.pad_to(id);
            bm.append(tag as u8 == port.proto.tag(), 1);
        }
        self.len = id + 1;
        Ok(())
    }

    pub fn append_null(&mut self, id: u64) {
        if id < self.len {
            return;
        }
        self.number.append_null(id);
        for bm in &mut self.protos {
            bm.pad_to(id + 1);
        }
        self.len = id + 1;
    }

    pub fn lookup(&self, op: RelOp, operand: &Value) -> Result<Bitmap> {
        let port = self.as_port(operand)?;
        let number = Value::Count(port.number as u64);
        let result = match op {
            RelOp::Eq => {
                let eq = self.number.lookup(RelOp::Eq, &number)?;
                self.narrow_by_proto(eq, port.proto)
            }
            RelOp::Ne => {
                let eq = self.number.lookup(RelOp::Eq, &number)?;
                !&self.narrow_by_proto(eq, port.proto)
            }
            RelOp::Lt | RelOp::Le | RelOp::Gt | RelOp::Ge => {
                self.number.lookup(op, &number)?
            }
            RelOp::In | RelOp::Ni | RelOp::Match => {
                return Err(Error::TypeClash {
                    expected: "port".into(),
                    operand: format!("{} {}", op, operand),
                })
            }
        };
        Ok(result)
    }

    fn narrow_by_proto(&self, bm: Bitmap, proto: PortProto) -> Bitmap {
        if proto == PortProto::Unknown {
            return bm;
        }
        let mut proto_bm = self.protos[proto.tag() as usize].clone();
        proto_bm.pad_to(self.len);
        &bm & &proto_bm
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        wire::put_u64(buf, self.len);
        let mut number = Vec::new();
        self.number.serialize(&mut number);
        wire::put_bytes(buf, &number);
        for bm in &self.protos {
            wire::put_bitmap(buf, bm);
        }
    }

    pub fn deserialize(cur: &mut Cursor<'_>) -> Result<Self> {
        let len = cur.u64()?;
        let number_bytes = cur.bytes()?;
        let number = ArithmeticIndex::deserialize(&mut Cursor::new(number_bytes))?;
        let mut protos = Vec::with_capacity(4);
        for _ in 0..4 {
            protos.push(cur.bitmap()?);
        }
        Ok(PortIndex {
            number,
            protos,
            len,
        })
    }
}

impl Default for PortIndex {
    fn default() -> Self {
        Self::new()
    }
}
