//! Positional string index.
//!
//! Holds one bitmap per observed string length and one bitmap per
//! (position, byte) pair up to a configured maximum length. Equality
//! intersects the length bitmap with the positional bitmaps; glob matching
//! runs the pattern NFA over the positional bitmaps per observed length,
//! which stays exact for every string within the indexed prefix.

use super::wire::{self, Cursor};
use crate::bitmap::Bitmap;
use crate::data::Value;
use crate::error::{Error, Result};
use crate::query::expr::RelOp;
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_MAX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct StringIndex {
    max_length: usize,
    /// Observed length -> rows of that length.
    lengths: BTreeMap<u64, Bitmap>,
    /// `chars[p][b]` = rows whose byte at position `p` is `b`.
    chars: Vec<HashMap<u8, Bitmap>>,
    /// Rows with a non-null value.
    mask: Bitmap,
    len: u64,
}

impl StringIndex {
    pub fn new(max_length: usize) -> Self {
        StringIndex {
            max_length: max_length.max(1),
            lengths: BTreeMap::new(),
            chars: Vec::new(),
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

    fn as_str<'a>(&self, value: &'a Value) -> Result<&'a str> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(Error::TypeClash {
                expected: "string".into(),
                operand: other.to_string(),
            }),
        }
    }

    pub fn append(&mut self, value: &Value, id: u64) -> Result<()> {
        let s = self.as_str(value)?.to_owned();
        if id < self.len {
            return Ok(());
        }
        let bytes = s.as_bytes();
        set_bit(self.lengths.entry(bytes.len() as u64).or_default(), id);
        for (pos, &byte) in bytes.iter().take(self.max_length).enumerate() {
            if self.chars.len() <= pos {
                self.chars.push(HashMap::new());
            }
            set_bit(self.chars[pos].entry(byte).or_default(), id);
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
        let s = self.as_str(operand)?;
        let mut result = match op {
            RelOp::Eq => self.eq_str(s),
            RelOp::Ne => {
                let mut eq = self.eq_str(s);
                eq.pad_to(self.len);
                !&eq
            }
            RelOp::Lt => self.lt_str(s),
            RelOp::Le => &self.lt_str(s) | &self.eq_str(s),
            RelOp::Gt => {
                let le = &self.lt_str(s) | &self.eq_str(s);
                &self.mask & &!&padded(le, self.len)
            }
            RelOp::Ge => &self.mask & &!&padded(self.lt_str(s), self.len),
            RelOp::Match => self.glob(s),
            RelOp::In | RelOp::Ni => {
                return Err(Error::TypeClash {
                    expected: "string".into(),
                    operand: format!("{} {}", op, operand),
                })
            }
        };
        // Per-value bitmaps only reach their last set bit; lookups always
        // cover the full universe.
        result.pad_to(self.len);
        Ok(result)
    }

    fn eq_str(&self, s: &str) -> Bitmap {
        let bytes = s.as_bytes();
        let Some(length) = self.lengths.get(&(bytes.len() as u64)) else {
            return Bitmap::filled(self.len, false);
        };
        let mut acc = length.clone();
        for (pos, &byte) in bytes.iter().take(self.max_length).enumerate() {
            match self.chars.get(pos).and_then(|m| m.get(&byte)) {
                Some(bm) => acc = &acc & bm,
                None => return Bitmap::filled(self.len, false),
            }
        }
        acc
    }

    /// Rows lexicographically below `s`: either diverging with a smaller
    /// byte at some position, or a proper prefix of `s`.
    fn lt_str(&self, s: &str) -> Bitmap {
        let bytes = s.as_bytes();
        let mut result = Bitmap::new();
        let mut prefix_eq = self.mask.clone();
        for (pos, &byte) in bytes.iter().take(self.max_length).enumerate() {
            // Proper prefixes of s end exactly here.
            if let Some(length) = self.lengths.get(&(pos as u64)) {
                result = &result | &(&prefix_eq & length);
            }
            if let Some(position) = self.chars.get(pos) {
                let mut smaller = Bitmap::new();
                for (&b, bm) in position.iter() {
                    if b < byte {
                        smaller = &smaller | bm;
                    }
                }
                result = &result | &(&prefix_eq & &smaller);
                match position.get(&byte) {
                    Some(bm) => prefix_eq = &prefix_eq & bm,
                    None => return result,
                }
            } else {
                return result;
            }
        }
        result
    }

    /// Anchored glob with `*` and `?`, case-sensitive. Runs the pattern
    /// NFA over the positional bitmaps once per observed length.
    fn glob(&self, pattern: &str) -> Bitmap {
        if !pattern.contains('*') && !pattern.contains('?') {
            return self.eq_str(pattern);
        }
        let pat = pattern.as_bytes();
        let mut result = Bitmap::new();
        for (&length, length_bm) in &self.lengths {
            let length = length as usize;
            if length > self.max_length {
                // Positions past the indexed prefix are unconstrained.
                if glob_can_match_length(pat, length) {
                    result = &result | length_bm;
                }
                continue;
            }
            // states[q] = rows whose first `pos` bytes can leave the NFA
            // in pattern position q.
            let mut states: Vec<Option<Bitmap>> = vec![None; pat.len() + 1];
            states[0] = Some(self.mask.clone());
            close_stars(pat, &mut states);
            for pos in 0..length {
                let mut next: Vec<Option<Bitmap>> = vec![None; pat.len() + 1];
                for q in 0..pat.len() {
                    let Some(reach) = &states[q] else { continue };
                    match pat[q] {
                        b'*' => merge(&mut next[q], reach.clone()),
                        b'?' => merge(&mut next[q + 1], reach.clone()),
                        byte => {
                            if let Some(bm) =
                                self.chars.get(pos).and_then(|m| m.get(&byte))
                            {
                                merge(&mut next[q + 1], reach & bm);
                            }
                        }
                    }
                }
                close_stars(pat, &mut next);
                states = next;
            }
            if let Some(accept) = &states[pat.len()] {
                result = &result | &(accept & length_bm);
            }
        }
        result
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        wire::put_u64(buf, self.max_length as u64);
        wire::put_u64(buf, self.len);
        wire::put_bitmap(buf, &self.mask);
        wire::put_u64(buf, self.lengths.len() as u64);
        for (&length, bm) in &self.lengths {
            wire::put_u64(buf, length);
            wire::put_bitmap(buf, bm);
        }
        wire::put_u64(buf, self.chars.len() as u64);
        for position in &self.chars {
            let mut bytes: Vec<_> = position.iter().collect();
            bytes.sort_by_key(|(b, _)| **b);
            wire::put_u64(buf, bytes.len() as u64);
            for (&byte, bm) in bytes {
                wire::put_u8(buf, byte);
                wire::put_bitmap(buf, bm);
            }
        }
    }

    pub fn deserialize(cur: &mut Cursor<'_>) -> Result<Self> {
        let max_length = cur.u64()? as usize;
        let len = cur.u64()?;
        let mask = cur.bitmap()?;
        let mut lengths = BTreeMap::new();
        for _ in 0..cur.u64()? {
            let length = cur.u64()?;
            lengths.insert(length, cur.bitmap()?);
        }
        let positions = cur.u64()? as usize;
        if positions > max_length {
            return Err(Error::corruption(format!(
                "{} positions exceed max length {}",
                positions, max_length
            )));
        }
        let mut chars = Vec::with_capacity(positions);
        for _ in 0..positions {
            let mut position = HashMap::new();
            for _ in 0..cur.u64()? {
                let byte = cur.u8()?;
                position.insert(byte, cur.bitmap()?);
            }
            chars.push(position);
        }
        Ok(StringIndex {
            max_length,
            lengths,
            chars,
            mask,
            len,
        })
    }
}

fn set_bit(bm: &mut Bitmap, id: u64) {
    if bm.len() <= id {
        bm.pad_to(id);
        bm.append(true, 1);
    }
}

fn padded(mut bm: Bitmap, len: u64) -> Bitmap {
    bm.pad_to(len);
    bm
}

fn merge(slot: &mut Option<Bitmap>, bm: Bitmap) {
    *slot = Some(match slot.take() {
        Some(existing) => &existing | &bm,
        None => bm,
    });
}

/// Epsilon closure: a `*` at position q lets rows flow q -> q+1 without
/// consuming input.
fn close_stars(pat: &[u8], states: &mut [Option<Bitmap>]) {
    for q in 0..pat.len() {
        if pat[q] == b'*' {
            if let Some(reach) = states[q].clone() {
                merge(&mut states[q + 1], reach);
            }
        }
    }
}

/// Whether a glob can match any string of the given length at all.
fn glob_can_match_length(pat: &[u8], length: usize) -> bool {
    let literal = pat.iter().filter(|&&b| b != b'*').count();
    if pat.contains(&b'*') {
        length >= literal
    } else {
        length == literal
    }
}
