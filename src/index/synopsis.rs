//! Per-column synopses for partition pruning.
//!
//! A synopsis answers predicates with three-valued logic: `Yes` means the
//! partition definitely holds a match, `No` means it definitely does not,
//! `Maybe` means it must be scanned. Ordered types keep exact min/max
//! bounds; strings and addresses keep a Bloom filter over value keys.

use crate::data::{Field, Value, ValueType, ATTR_SKIP};
use crate::query::expr::RelOp;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;

/// Three-valued pruning verdict, folded with the Kleene rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tri {
    Yes,
    Maybe,
    No,
}

impl Tri {
    pub fn and(self, other: Tri) -> Tri {
        match (self, other) {
            (Tri::No, _) | (_, Tri::No) => Tri::No,
            (Tri::Yes, Tri::Yes) => Tri::Yes,
            _ => Tri::Maybe,
        }
    }

    pub fn or(self, other: Tri) -> Tri {
        match (self, other) {
            (Tri::Yes, _) | (_, Tri::Yes) => Tri::Yes,
            (Tri::No, Tri::No) => Tri::No,
            _ => Tri::Maybe,
        }
    }

    /// Whether the partition must be scheduled for this verdict.
    pub fn qualifies(self) -> bool {
        self != Tri::No
    }
}

/// Bloom filter over canonical value keys.
///
/// Probe positions come from two fxhash streams of the key under distinct
/// fixed seeds; each probe rotates the running state and folds in the
/// second stream, so successive positions never collapse into one linear
/// family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_hashes: u32,
    num_bits: usize,
    count: usize,
}

/// Seeds for the two hash streams (hex digits of pi).
const PROBE_SEED_LO: u64 = 0x243f_6a88_85a3_08d3;
const PROBE_SEED_HI: u64 = 0x1319_8a2e_0370_7344;

impl BloomFilter {
    /// Sizes the filter with the standard relation between capacity and
    /// false positive rate: `bits/item = -ln p / ln(2)^2` and
    /// `k = ln 2 * bits/item`, rounded up to whole 64-bit words.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let ln2 = std::f64::consts::LN_2;
        let bits_per_item = -false_positive_rate.ln() / (ln2 * ln2);
        let items = expected_items.max(1) as f64;
        let words = ((items * bits_per_item) / 64.0).ceil().max(1.0) as usize;
        let num_hashes = (bits_per_item * ln2).round().clamp(1.0, 12.0) as u32;
        BloomFilter {
            bits: vec![0u64; words],
            num_hashes,
            num_bits: words * 64,
            count: 0,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        for idx in probe_sequence(key, self.num_hashes, self.num_bits) {
            self.bits[idx / 64] |= 1u64 << (idx % 64);
        }
        self.count += 1;
    }

    /// False means definitely absent; true means possibly present.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        probe_sequence(key, self.num_hashes, self.num_bits)
            .all(|idx| self.bits[idx / 64] & (1u64 << (idx % 64)) != 0)
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

fn seeded_hash(seed: u64, key: &[u8]) -> u64 {
    let mut hasher = fxhash::FxHasher64::default();
    hasher.write_u64(seed);
    hasher.write(key);
    hasher.finish()
}

/// Walks `num_hashes` bit positions for a key: the state starts at the
/// low stream and each step rotates it and mixes in the high stream.
fn probe_sequence(
    key: &[u8],
    num_hashes: u32,
    num_bits: usize,
) -> impl Iterator<Item = usize> {
    let hi = seeded_hash(PROBE_SEED_HI, key);
    (0..num_hashes).scan(seeded_hash(PROBE_SEED_LO, key), move |state, _| {
        *state = state.rotate_left(21) ^ hi;
        Some((*state % num_bits as u64) as usize)
    })
}

/// Expected distinct values per partition column; drives the Bloom sizing.
const BLOOM_CAPACITY: usize = 1 << 16;
const BLOOM_FP_RATE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Synopsis {
    /// No sketch: `skip` fields and types without one.
    None,
    MinMax {
        bounds: Option<(Value, Value)>,
    },
    Bloom(BloomFilter),
}

impl Synopsis {
    /// Picks the synopsis kind for a field.
    pub fn for_field(field: &Field) -> Synopsis {
        if field.has_attr(ATTR_SKIP) {
            return Synopsis::None;
        }
        match &field.ty {
            ty if ty.is_ordered() => Synopsis::MinMax { bounds: None },
            ValueType::String | ValueType::Addr => {
                Synopsis::Bloom(BloomFilter::new(BLOOM_CAPACITY, BLOOM_FP_RATE))
            }
            _ => Synopsis::None,
        }
    }

    pub fn add(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        match self {
            Synopsis::None => {}
            Synopsis::MinMax { bounds } => match bounds {
                Some((min, max)) => {
                    if *value < *min {
                        *min = value.clone();
                    }
                    if *value > *max {
                        *max = value.clone();
                    }
                }
                None => *bounds = Some((value.clone(), value.clone())),
            },
            Synopsis::Bloom(filter) => filter.insert(&value.index_key()),
        }
    }

    pub fn check(&self, op: RelOp, operand: &Value) -> Tri {
        match self {
            Synopsis::None => Tri::Maybe,
            Synopsis::MinMax { bounds } => check_min_max(bounds.as_ref(), op, operand),
            Synopsis::Bloom(filter) => match op {
                RelOp::Eq => {
                    if filter.might_contain(&operand.index_key()) {
                        Tri::Maybe
                    } else {
                        Tri::No
                    }
                }
                RelOp::Ne => {
                    if filter.might_contain(&operand.index_key()) {
                        Tri::Maybe
                    } else {
                        Tri::Yes
                    }
                }
                _ => Tri::Maybe,
            },
        }
    }
}

fn check_min_max(bounds: Option<&(Value, Value)>, op: RelOp, operand: &Value) -> Tri {
    let Some((min, max)) = bounds else {
        // No values were ever added; only ne can match (via nulls).
        return match op {
            RelOp::Ne => Tri::Maybe,
            _ => Tri::No,
        };
    };
    // Incomparable operands cannot prune.
    let (Some(lo), Some(hi)) = (operand.partial_cmp(min), operand.partial_cmp(max))
    else {
        return Tri::Maybe;
    };
    use std::cmp::Ordering::*;
    match op {
        RelOp::Eq => {
            if lo == Less || hi == Greater {
                Tri::No
            } else {
                Tri::Maybe
            }
        }
        RelOp::Ne => {
            if lo == Less || hi == Greater {
                Tri::Yes
            } else if min == max && lo == Equal {
                // Every value equals the operand, but null rows still
                // satisfy ne.
                Tri::Maybe
            } else {
                Tri::Yes
            }
        }
        RelOp::Lt => {
            // Some value is below the operand iff min is.
            if lo == Greater {
                Tri::Yes
            } else {
                Tri::No
            }
        }
        RelOp::Le => {
            if lo == Greater || lo == Equal {
                Tri::Yes
            } else {
                Tri::No
            }
        }
        RelOp::Gt => {
            if hi == Less {
                Tri::Yes
            } else {
                Tri::No
            }
        }
        RelOp::Ge => {
            if hi == Less || hi == Equal {
                Tri::Yes
            } else {
                Tri::No
            }
        }
        RelOp::In | RelOp::Ni | RelOp::Match => Tri::Maybe,
    }
}
