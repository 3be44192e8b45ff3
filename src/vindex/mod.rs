//! Value indexes: per-column data structures mapping values to bitmaps.
//!
//! One variant exists per semantic type family; the tagged union gives
//! every variant the same surface (`append`, `append_null`, `lookup`,
//! `serialize`). Construction goes through a process-wide registry of
//! constructors keyed by variant tag, initialized once and read-only
//! afterwards.

pub mod address;
pub mod arithmetic;
pub mod list;
pub mod port;
pub mod string;
pub mod subnet;
pub mod wire;

use crate::bitmap::Bitmap;
use crate::data::{Value, ValueType};
use crate::error::{Error, Result};
use crate::query::expr::RelOp;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub use address::AddressIndex;
pub use arithmetic::ArithmeticIndex;
pub use list::ListIndex;
pub use port::PortIndex;
pub use string::StringIndex;
pub use subnet::SubnetIndex;

/// Construction options, e.g. `base` or `max-length`. Unknown keys are
/// accepted and ignored; known keys with invalid values are rejected.
pub type Options = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub enum ValueIndex {
    /// Placeholder for `skip` fields: tracks length, matches nothing.
    None { len: u64 },
    Arithmetic(ArithmeticIndex),
    String(StringIndex),
    Address(AddressIndex),
    Subnet(SubnetIndex),
    Port(PortIndex),
    List(ListIndex),
}

impl ValueIndex {
    /// Logical length: one slot per row covered, nulls included.
    pub fn len(&self) -> u64 {
        match self {
            ValueIndex::None { len } => *len,
            ValueIndex::Arithmetic(idx) => idx.len(),
            ValueIndex::String(idx) => idx.len(),
            ValueIndex::Address(idx) => idx.len(),
            ValueIndex::Subnet(idx) => idx.len(),
            ValueIndex::Port(idx) => idx.len(),
            ValueIndex::List(idx) => idx.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&mut self, value: &Value, id: u64) -> Result<()> {
        if value.is_null() {
            self.append_null(id);
            return Ok(());
        }
        match self {
            ValueIndex::None { len } => {
                *len = (*len).max(id + 1);
                Ok(())
            }
            ValueIndex::Arithmetic(idx) => idx.append(value, id),
            ValueIndex::String(idx) => idx.append(value, id),
            ValueIndex::Address(idx) => idx.append(value, id),
            ValueIndex::Subnet(idx) => idx.append(value, id),
            ValueIndex::Port(idx) => idx.append(value, id),
            ValueIndex::List(idx) => idx.append(value, id),
        }
    }

    pub fn append_null(&mut self, id: u64) {
        match self {
            ValueIndex::None { len } => *len = (*len).max(id + 1),
            ValueIndex::Arithmetic(idx) => idx.append_null(id),
            ValueIndex::String(idx) => idx.append_null(id),
            ValueIndex::Address(idx) => idx.append_null(id),
            ValueIndex::Subnet(idx) => idx.append_null(id),
            ValueIndex::Port(idx) => idx.append_null(id),
            ValueIndex::List(idx) => idx.append_null(id),
        }
    }

    /// Looks up a predicate. Type clashes between operand and index are
    /// errors here; the evaluation layer maps them to empty results.
    pub fn lookup(&self, op: RelOp, operand: &Value) -> Result<Bitmap> {
        match self {
            ValueIndex::None { len } => Ok(Bitmap::filled(*len, false)),
            ValueIndex::Arithmetic(idx) => idx.lookup(op, operand),
            ValueIndex::String(idx) => idx.lookup(op, operand),
            ValueIndex::Address(idx) => idx.lookup(op, operand),
            ValueIndex::Subnet(idx) => idx.lookup(op, operand),
            ValueIndex::Port(idx) => idx.lookup(op, operand),
            ValueIndex::List(idx) => idx.lookup(op, operand),
        }
    }

    fn variant_tag(&self) -> u8 {
        match self {
            ValueIndex::None { .. } => 0,
            ValueIndex::Arithmetic(_) => 1,
            ValueIndex::String(_) => 2,
            ValueIndex::Address(_) => 3,
            ValueIndex::Subnet(_) => 4,
            ValueIndex::Port(_) => 5,
            ValueIndex::List(_) => 6,
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        wire::put_u8(buf, self.variant_tag());
        match self {
            ValueIndex::None { len } => wire::put_u64(buf, *len),
            ValueIndex::Arithmetic(idx) => idx.serialize(buf),
            ValueIndex::String(idx) => idx.serialize(buf),
            ValueIndex::Address(idx) => idx.serialize(buf),
            ValueIndex::Subnet(idx) => idx.serialize(buf),
            ValueIndex::Port(idx) => idx.serialize(buf),
            ValueIndex::List(idx) => idx.serialize(buf),
        }
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let mut cur = wire::Cursor::new(buf);
        let index = match cur.u8()? {
            0 => ValueIndex::None { len: cur.u64()? },
            1 => ValueIndex::Arithmetic(ArithmeticIndex::deserialize(&mut cur)?),
            2 => ValueIndex::String(StringIndex::deserialize(&mut cur)?),
            3 => ValueIndex::Address(AddressIndex::deserialize(&mut cur)?),
            4 => ValueIndex::Subnet(SubnetIndex::deserialize(&mut cur)?),
            5 => ValueIndex::Port(PortIndex::deserialize(&mut cur)?),
            6 => ValueIndex::List(ListIndex::deserialize(&mut cur)?),
            tag => {
                return Err(Error::corruption(format!(
                    "unknown value index variant {}",
                    tag
                )))
            }
        };
        if !cur.is_exhausted() {
            return Err(Error::corruption("trailing bytes after value index"));
        }
        Ok(index)
    }
}

type Constructor = fn(&ValueType, &Options) -> Result<ValueIndex>;

/// Write-once registry of value index constructors, keyed by variant tag.
pub struct Registry {
    constructors: BTreeMap<&'static str, Constructor>,
}

impl Registry {
    /// Maps a semantic type to its variant tag.
    pub fn variant_for(ty: &ValueType) -> &'static str {
        match ty {
            ValueType::Bool
            | ValueType::Int
            | ValueType::Count
            | ValueType::Real
            | ValueType::Time
            | ValueType::Duration => "arithmetic",
            ValueType::String => "string",
            ValueType::Addr => "address",
            ValueType::Subnet => "subnet",
            ValueType::Port => "port",
            ValueType::List(_) => "list",
        }
    }

    pub fn construct(&self, ty: &ValueType, options: &Options) -> Result<ValueIndex> {
        let variant = Self::variant_for(ty);
        let constructor = self.constructors.get(variant).ok_or_else(|| {
            Error::Unspecified(format!("no constructor registered for {}", variant))
        })?;
        constructor(ty, options)
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry, initialized on first use.
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let mut constructors = BTreeMap::new();
        constructors.insert("arithmetic", make_arithmetic as Constructor);
        constructors.insert("string", make_string as Constructor);
        constructors.insert("address", make_address as Constructor);
        constructors.insert("subnet", make_subnet as Constructor);
        constructors.insert("port", make_port as Constructor);
        constructors.insert("list", make_list as Constructor);
        Registry { constructors }
    })
}

/// Constructs a value index for a semantic type via the registry.
pub fn make_index(ty: &ValueType, options: &Options) -> Result<ValueIndex> {
    registry().construct(ty, options)
}

fn validate_base(options: &Options) -> Result<()> {
    if let Some(base) = options.get("base") {
        if base != "binary" && base != "decimal" {
            return Err(Error::Parse(format!(
                "invalid base {:?}: expected binary or decimal",
                base
            )));
        }
    }
    Ok(())
}

fn make_arithmetic(ty: &ValueType, options: &Options) -> Result<ValueIndex> {
    validate_base(options)?;
    let width = if *ty == ValueType::Bool { 1 } else { 64 };
    Ok(ValueIndex::Arithmetic(ArithmeticIndex::with_width(
        ty.clone(),
        width,
    )))
}

fn make_string(_ty: &ValueType, options: &Options) -> Result<ValueIndex> {
    let max_length = match options.get("max-length") {
        Some(raw) => raw.parse::<usize>().map_err(|_| {
            Error::Parse(format!("invalid max-length {:?}", raw))
        })?,
        None => string::DEFAULT_MAX_LENGTH,
    };
    Ok(ValueIndex::String(StringIndex::new(max_length)))
}

fn make_address(_ty: &ValueType, _options: &Options) -> Result<ValueIndex> {
    Ok(ValueIndex::Address(AddressIndex::new()))
}

fn make_subnet(_ty: &ValueType, _options: &Options) -> Result<ValueIndex> {
    Ok(ValueIndex::Subnet(SubnetIndex::new()))
}

fn make_port(_ty: &ValueType, _options: &Options) -> Result<ValueIndex> {
    Ok(ValueIndex::Port(PortIndex::new()))
}

fn make_list(ty: &ValueType, _options: &Options) -> Result<ValueIndex> {
    match ty {
        ValueType::List(elem) => Ok(ValueIndex::List(ListIndex::new((**elem).clone()))),
        other => Err(Error::Unspecified(format!(
            "list constructor given {}",
            other
        ))),
    }
}
