//! Runtime field values: what a [`crate::def::Definition`] holds and what
//! [`crate::io::reader::Reader`] hands back to callers.
//!
//! Generalizes a flat primitive/array value enum with `Struct` and
//! `Variant` variants, since this crate's declarations nest arbitrarily.

use internment::Intern;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// The preferred base (radix) to use when displaying an integer's instances.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum PreferredDisplayBase {
    Binary,
    Octal,
    #[default]
    Decimal,
    Hexadecimal,
}

/// A fully-resolved runtime value produced by reading a [`crate::decl::Declaration`]
/// or supplied by a caller to populate one before writing.
#[derive(Clone, PartialEq, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum Value {
    UnsignedInteger(u64, PreferredDisplayBase),
    SignedInteger(i64, PreferredDisplayBase),
    F32(OrderedFloat<f32>),
    F64(OrderedFloat<f64>),
    /// An enumeration's raw integer value, its display base, and the set of
    /// labels whose mapped ranges contain it (empty if none match, more than
    /// one element if the enum declaration has overlapping ranges; see
    /// `Declaration::Enum::labels_for_value`).
    Enumeration(i64, PreferredDisplayBase, Vec<Intern<String>>),
    String(String),
    /// Static or dynamic array of homogeneous elements.
    Array(Vec<Value>),
    /// Ordered, named members of a structure.
    Struct(Vec<(Intern<String>, Value)>),
    /// The label of the option that was selected and its value.
    Variant(Intern<String>, Box<Value>),
}

impl Value {
    /// Returns the enumeration label chosen for serialization/display when
    /// exactly one label maps the value (the common, non-overlapping case).
    pub fn enum_label(&self) -> Option<Intern<String>> {
        match self {
            Value::Enumeration(_, _, labels) => labels.first().copied(),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            Value::UnsignedInteger(v, _) => Some(*v),
            Value::Enumeration(v, _, _) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_signed(&self) -> Option<i64> {
        match self {
            Value::SignedInteger(v, _) => Some(*v),
            Value::Enumeration(v, _, _) => Some(*v),
            _ => None,
        }
    }

    pub fn as_struct_members(&self) -> Option<&[(Intern<String>, Value)]> {
        match self {
            Value::Struct(members) => Some(members),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(elems) => Some(elems),
            _ => None,
        }
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::UnsignedInteger(v.into(), PreferredDisplayBase::default())
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::UnsignedInteger(v.into(), PreferredDisplayBase::default())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UnsignedInteger(v.into(), PreferredDisplayBase::default())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UnsignedInteger(v, PreferredDisplayBase::default())
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::SignedInteger(v.into(), PreferredDisplayBase::default())
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SignedInteger(v.into(), PreferredDisplayBase::default())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::SignedInteger(v.into(), PreferredDisplayBase::default())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::SignedInteger(v, PreferredDisplayBase::default())
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(OrderedFloat(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(OrderedFloat(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}
