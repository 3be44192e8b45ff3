pub mod layout;
pub mod slice;
pub mod value;

pub use layout::{Attribute, Field, Layout, ATTR_SKIP, ATTR_TIMESTAMP};
pub use slice::{Slice, SliceBuilder};
pub use value::{Address, Port, PortProto, Subnet, Value, ValueType};
