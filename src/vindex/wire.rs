//! Little-endian binary encoding helpers for index payloads.
//!
//! Column files are written with these primitives; every read path returns
//! a corruption error instead of panicking on truncated or malformed input.

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};

pub fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    put_u64(buf, v.len() as u64);
    buf.extend_from_slice(v);
}

pub fn put_bitmap(buf: &mut Vec<u8>, bm: &Bitmap) {
    put_u64(buf, bm.len());
    let runs: Vec<_> = bm.runs().collect();
    put_u64(buf, runs.len() as u64);
    for run in runs {
        put_u8(buf, run.bit as u8);
        put_u64(buf, run.len);
    }
}

/// Sequential reader over a byte buffer.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::corruption(format!(
                "truncated payload: wanted {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u64()? as usize;
        self.take(len)
    }

    pub fn bitmap(&mut self) -> Result<Bitmap> {
        let len = self.u64()?;
        let runs = self.u64()?;
        let mut bm = Bitmap::new();
        for _ in 0..runs {
            let bit = match self.u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(Error::corruption(format!(
                        "invalid run bit {}",
                        other
                    )))
                }
            };
            bm.append(bit, self.u64()?);
        }
        if bm.len() != len {
            return Err(Error::corruption(format!(
                "bitmap length mismatch: header says {}, runs sum to {}",
                len,
                bm.len()
            )));
        }
        Ok(bm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut buf = Vec::new();
        put_u8(&mut buf, 7);
        put_u16(&mut buf, 300);
        put_u32(&mut buf, 70_000);
        put_u64(&mut buf, u64::MAX - 1);
        put_bytes(&mut buf, b"hello");
        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.u8().unwrap(), 7);
        assert_eq!(cur.u16().unwrap(), 300);
        assert_eq!(cur.u32().unwrap(), 70_000);
        assert_eq!(cur.u64().unwrap(), u64::MAX - 1);
        assert_eq!(cur.bytes().unwrap(), b"hello");
        assert!(cur.is_exhausted());
    }

    #[test]
    fn test_bitmap_roundtrip() {
        let bm = Bitmap::from_positions(100, &[0, 17, 99]);
        let mut buf = Vec::new();
        put_bitmap(&mut buf, &bm);
        let decoded = Cursor::new(&buf).bitmap().unwrap();
        assert_eq!(decoded, bm);
    }

    #[test]
    fn test_truncated_read_is_corruption() {
        let mut buf = Vec::new();
        put_u64(&mut buf, 42);
        buf.truncate(4);
        let err = Cursor::new(&buf).u64().unwrap_err();
        assert_eq!(err.kind().to_string(), "corruption");
    }
}
