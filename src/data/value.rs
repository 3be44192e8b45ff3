//! Semantic value types for telemetry events.
//!
//! Every column of a layout carries one of the types in the closed set
//! below. Addresses are kept in their canonical 128-bit form with IPv4
//! mapped per the `::ffff:a.b.c.d` convention so that subnet masks work
//! uniformly across both families.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Semantic type of a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Count,
    Real,
    Time,
    Duration,
    String,
    Addr,
    Subnet,
    Port,
    List(Box<ValueType>),
}

impl ValueType {
    /// Types with a total order, eligible for min/max synopses and range
    /// predicates.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            ValueType::Int
                | ValueType::Count
                | ValueType::Real
                | ValueType::Time
                | ValueType::Duration
        )
    }

    /// Single-byte tag used in column file headers. List types append the
    /// element tag recursively.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            ValueType::Bool => buf.push(0x01),
            ValueType::Int => buf.push(0x02),
            ValueType::Count => buf.push(0x03),
            ValueType::Real => buf.push(0x04),
            ValueType::Time => buf.push(0x05),
            ValueType::Duration => buf.push(0x06),
            ValueType::String => buf.push(0x07),
            ValueType::Addr => buf.push(0x08),
            ValueType::Subnet => buf.push(0x09),
            ValueType::Port => buf.push(0x0a),
            ValueType::List(elem) => {
                buf.push(0x0b);
                elem.encode(buf);
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Option<(ValueType, usize)> {
        let (&tag, rest) = buf.split_first()?;
        let ty = match tag {
            0x01 => ValueType::Bool,
            0x02 => ValueType::Int,
            0x03 => ValueType::Count,
            0x04 => ValueType::Real,
            0x05 => ValueType::Time,
            0x06 => ValueType::Duration,
            0x07 => ValueType::String,
            0x08 => ValueType::Addr,
            0x09 => ValueType::Subnet,
            0x0a => ValueType::Port,
            0x0b => {
                let (elem, used) = ValueType::decode(rest)?;
                return Some((ValueType::List(Box::new(elem)), 1 + used));
            }
            _ => return None,
        };
        Some((ty, 1))
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Bool => write!(f, "bool"),
            ValueType::Int => write!(f, "int"),
            ValueType::Count => write!(f, "count"),
            ValueType::Real => write!(f, "real"),
            ValueType::Time => write!(f, "time"),
            ValueType::Duration => write!(f, "duration"),
            ValueType::String => write!(f, "string"),
            ValueType::Addr => write!(f, "addr"),
            ValueType::Subnet => write!(f, "subnet"),
            ValueType::Port => write!(f, "port"),
            ValueType::List(elem) => write!(f, "list<{}>", elem),
        }
    }
}

/// Canonical 128-bit address. IPv4 occupies the low 32 bits under the
/// `::ffff:0:0/96` mapping.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Address(u128);

const V4_MAPPED_PREFIX: u128 = 0xffff << 32;

impl Address {
    pub fn from_v4(addr: Ipv4Addr) -> Self {
        Address(V4_MAPPED_PREFIX | u32::from(addr) as u128)
    }

    pub fn from_v6(addr: Ipv6Addr) -> Self {
        Address(u128::from(addr))
    }

    pub fn from_ip(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::from_v4(v4),
            IpAddr::V6(v6) => Self::from_v6(v6),
        }
    }

    pub fn from_bits(bits: u128) -> Self {
        Address(bits)
    }

    pub fn bits(self) -> u128 {
        self.0
    }

    pub fn is_v4(self) -> bool {
        self.0 >> 32 == 0xffff
    }

    pub fn to_ip(self) -> IpAddr {
        if self.is_v4() {
            IpAddr::V4(Ipv4Addr::from(self.0 as u32))
        } else {
            IpAddr::V6(Ipv6Addr::from(self.0))
        }
    }
}

impl std::str::FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<IpAddr>().map(Address::from_ip)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip())
    }
}

/// A network prefix: canonical address plus prefix length in the 128-bit
/// space (IPv4 prefixes are stored shifted by 96).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Subnet {
    network: Address,
    prefix: u8,
}

impl Subnet {
    /// Builds a subnet, masking out host bits of `network`.
    pub fn new(network: Address, prefix: u8) -> Self {
        let prefix = prefix.min(128);
        Subnet {
            network: Address(mask_bits(network.0, prefix)),
            prefix,
        }
    }

    /// Builds from an IPv4 network and an IPv4 prefix length (0..=32).
    pub fn from_v4(network: Ipv4Addr, prefix: u8) -> Self {
        Subnet::new(Address::from_v4(network), prefix.min(32) + 96)
    }

    pub fn network(self) -> Address {
        self.network
    }

    pub fn prefix(self) -> u8 {
        self.prefix
    }

    pub fn contains(self, addr: Address) -> bool {
        mask_bits(addr.0, self.prefix) == self.network.0
    }
}

fn mask_bits(bits: u128, prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        bits & (u128::MAX << (128 - prefix as u32))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.network.is_v4() {
            write!(f, "{}/{}", self.network, self.prefix.saturating_sub(96))
        } else {
            write!(f, "{}/{}", self.network, self.prefix)
        }
    }
}

/// Transport protocol of a port.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PortProto {
    Unknown,
    Tcp,
    Udp,
    Icmp,
}

impl PortProto {
    pub fn tag(self) -> u8 {
        match self {
            PortProto::Unknown => 0,
            PortProto::Tcp => 1,
            PortProto::Udp => 2,
            PortProto::Icmp => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PortProto::Unknown),
            1 => Some(PortProto::Tcp),
            2 => Some(PortProto::Udp),
            3 => Some(PortProto::Icmp),
            _ => None,
        }
    }
}

/// A transport-layer port: 16-bit number plus protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Port {
    pub number: u16,
    pub proto: PortProto,
}

impl Port {
    pub fn new(number: u16, proto: PortProto) -> Self {
        Port { number, proto }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.proto {
            PortProto::Unknown => "?",
            PortProto::Tcp => "tcp",
            PortProto::Udp => "udp",
            PortProto::Icmp => "icmp",
        };
        write!(f, "{}/{}", self.number, proto)
    }
}

/// A single cell value. `Time` and `Duration` are nanoseconds (since epoch
/// for `Time`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Count(u64),
    Real(f64),
    Time(i64),
    Duration(i64),
    Str(String),
    Addr(Address),
    Subnet(Subnet),
    Port(Port),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value can feed a column of `ty`, allowing the int/count
    /// widening with an explicit sign check.
    pub fn conforms_to(&self, ty: &ValueType) -> bool {
        match (self, ty) {
            (Value::Null, _) => true,
            (Value::Bool(_), ValueType::Bool) => true,
            (Value::Int(_), ValueType::Int) => true,
            (Value::Int(v), ValueType::Count) => *v >= 0,
            (Value::Count(_), ValueType::Count) => true,
            (Value::Count(v), ValueType::Int) => *v <= i64::MAX as u64,
            (Value::Real(_), ValueType::Real) => true,
            (Value::Time(_), ValueType::Time) => true,
            (Value::Duration(_), ValueType::Duration) => true,
            (Value::Str(_), ValueType::String) => true,
            (Value::Addr(_), ValueType::Addr) => true,
            (Value::Subnet(_), ValueType::Subnet) => true,
            (Value::Port(_), ValueType::Port) => true,
            (Value::List(xs), ValueType::List(elem)) => {
                xs.iter().all(|x| x.conforms_to(elem))
            }
            _ => false,
        }
    }

    pub fn as_count(&self) -> Option<u64> {
        match self {
            Value::Count(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Count(v) if *v <= i64::MAX as u64 => Some(*v as i64),
            _ => None,
        }
    }

    /// Canonical byte encoding used as a hash key for per-value bitmaps.
    /// Distinct values produce distinct keys within one column type.
    pub fn index_key(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_key(&mut buf);
        buf
    }

    fn write_key(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => buf.push(0x00),
            Value::Bool(b) => {
                buf.push(0x01);
                buf.push(*b as u8);
            }
            Value::Int(v) => {
                buf.push(0x02);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Count(v) => {
                buf.push(0x03);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Real(v) => {
                buf.push(0x04);
                buf.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Time(v) => {
                buf.push(0x05);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Duration(v) => {
                buf.push(0x06);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Str(s) => {
                buf.push(0x07);
                buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Addr(a) => {
                buf.push(0x08);
                buf.extend_from_slice(&a.bits().to_le_bytes());
            }
            Value::Subnet(s) => {
                buf.push(0x09);
                buf.extend_from_slice(&s.network().bits().to_le_bytes());
                buf.push(s.prefix());
            }
            Value::Port(p) => {
                buf.push(0x0a);
                buf.extend_from_slice(&p.number.to_le_bytes());
                buf.push(p.proto.tag());
            }
            Value::List(xs) => {
                buf.push(0x0b);
                buf.extend_from_slice(&(xs.len() as u64).to_le_bytes());
                for x in xs {
                    x.write_key(buf);
                }
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Count(a), Value::Count(b)) => a == b,
            (Value::Int(a), Value::Count(b)) => *a >= 0 && *a as u64 == *b,
            (Value::Count(a), Value::Int(b)) => *b >= 0 && *b as u64 == *a,
            (Value::Real(a), Value::Real(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Addr(a), Value::Addr(b)) => a == b,
            (Value::Subnet(a), Value::Subnet(b)) => a == b,
            (Value::Port(a), Value::Port(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Count(a), Value::Count(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Count(b)) => {
                if *a < 0 {
                    Some(Ordering::Less)
                } else {
                    (*a as u64).partial_cmp(b)
                }
            }
            (Value::Count(a), Value::Int(b)) => {
                if *b < 0 {
                    Some(Ordering::Greater)
                } else {
                    a.partial_cmp(&(*b as u64))
                }
            }
            (Value::Real(a), Value::Real(b)) => a.partial_cmp(b),
            (Value::Time(a), Value::Time(b)) => a.partial_cmp(b),
            (Value::Duration(a), Value::Duration(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
            (Value::Addr(a), Value::Addr(b)) => a.partial_cmp(b),
            (Value::Port(a), Value::Port(b)) => a.number.partial_cmp(&b.number),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{:+}", v),
            Value::Count(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "@{}", v),
            Value::Duration(v) => write!(f, "{}ns", v),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Addr(a) => write!(f, "{}", a),
            Value::Subnet(s) => write!(f, "{}", s),
            Value::Port(p) => write!(f, "{}", p),
            Value::List(xs) => {
                write!(f, "[")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", x)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_mapping() {
        let a: Address = "192.168.1.103".parse().unwrap();
        assert!(a.is_v4());
        assert_eq!(a.bits() >> 32, 0xffff);
        assert_eq!(a.to_ip().to_string(), "192.168.1.103");
    }

    #[test]
    fn test_subnet_contains_v4() {
        let net = Subnet::from_v4("192.168.1.0".parse().unwrap(), 24);
        assert_eq!(net.prefix(), 120);
        assert!(net.contains("192.168.1.103".parse().unwrap()));
        assert!(!net.contains("192.168.2.1".parse().unwrap()));
        assert!(!net.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_subnet_zero_prefix() {
        let all = Subnet::new("::".parse().unwrap(), 0);
        assert!(all.contains("10.0.0.1".parse().unwrap()));
        assert!(all.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_int_count_widening() {
        assert_eq!(Value::Int(3), Value::Count(3));
        assert_ne!(Value::Int(-1), Value::Count(u64::MAX));
        assert!(Value::Int(-1) < Value::Count(0));
        assert!(Value::Int(5).conforms_to(&ValueType::Count));
        assert!(!Value::Int(-5).conforms_to(&ValueType::Count));
    }

    #[test]
    fn test_index_keys_distinct() {
        let keys = [
            Value::Int(1).index_key(),
            Value::Count(1).index_key(),
            Value::Str("1".into()).index_key(),
            Value::Bool(true).index_key(),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_type_tag_roundtrip() {
        let ty = ValueType::List(Box::new(ValueType::Addr));
        let mut buf = Vec::new();
        ty.encode(&mut buf);
        let (decoded, used) = ValueType::decode(&buf).unwrap();
        assert_eq!(decoded, ty);
        assert_eq!(used, buf.len());
    }
}
