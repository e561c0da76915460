use std::rc::Rc;

use crate::sig::{BitmaskSig, EnumSig, StructSig};

/// One decoded argument or return value.
///
/// The variant set is closed; consumers dispatch with an exhaustive
/// `match`. Struct and array nodes own their children, blobs own their
/// bytes, and enum/bitmask/struct nodes share their signature through
/// `Rc`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    SInt(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    String(String),
    /// Wide string captured from UTF-16 APIs, transcoded at capture time.
    WString(String),
    Enum(Rc<EnumSig>, i64),
    Bitmask(Rc<BitmaskSig>, u64),
    Struct(Rc<StructSig>, Vec<Value>),
    Array(Vec<Value>),
    Blob(Vec<u8>),
    /// Raw pointer captured from the traced process; late-bound to a live
    /// object by replay tooling.
    Pointer(u64),
    /// Pairs a human-readable rendering with the machine value it stands
    /// for.
    Repr(Box<Value>, Box<Value>),
}

impl Value {
    /// Truthiness of the value. `None` for variants with no sensible
    /// boolean reading.
    pub fn to_bool(&self) -> Option<bool> {
        match self {
            Value::Null => Some(false),
            Value::Bool(b) => Some(*b),
            Value::SInt(v) => Some(*v != 0),
            Value::UInt(v) => Some(*v != 0),
            Value::Float(v) => Some(*v != 0.0),
            Value::Double(v) => Some(*v != 0.0),
            Value::Enum(_, v) => Some(*v != 0),
            Value::Bitmask(_, v) => Some(*v != 0),
            Value::Pointer(p) => Some(*p != 0),
            Value::Repr(_, machine) => machine.to_bool(),
            _ => None,
        }
    }

    pub fn to_sint(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::SInt(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Float(v) => Some(*v as i64),
            Value::Double(v) => Some(*v as i64),
            Value::Enum(_, v) => Some(*v),
            Value::Repr(_, machine) => machine.to_sint(),
            _ => None,
        }
    }

    pub fn to_uint(&self) -> Option<u64> {
        match self {
            Value::Bool(b) => Some(*b as u64),
            Value::SInt(v) => u64::try_from(*v).ok(),
            Value::UInt(v) => Some(*v),
            Value::Enum(_, v) => u64::try_from(*v).ok(),
            Value::Bitmask(_, v) => Some(*v),
            Value::Repr(_, machine) => machine.to_uint(),
            _ => None,
        }
    }

    pub fn to_float(&self) -> Option<f32> {
        match self {
            Value::Bool(b) => Some(*b as u8 as f32),
            Value::SInt(v) => Some(*v as f32),
            Value::UInt(v) => Some(*v as f32),
            Value::Float(v) => Some(*v),
            Value::Double(v) => Some(*v as f32),
            Value::Repr(_, machine) => machine.to_float(),
            _ => None,
        }
    }

    pub fn to_double(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(*b as u8 as f64),
            Value::SInt(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Repr(_, machine) => machine.to_double(),
            _ => None,
        }
    }

    /// String content for string-like variants only; symbolic rendering of
    /// enums is [`EnumSig::lookup`]'s job, not a conversion.
    pub fn to_string_value(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::WString(s) => Some(s),
            Value::Repr(_, machine) => machine.to_string_value(),
            _ => None,
        }
    }

    pub fn to_pointer(&self) -> Option<u64> {
        match self {
            Value::Null => Some(0),
            Value::UInt(v) => Some(*v),
            Value::SInt(v) => u64::try_from(*v).ok(),
            Value::Pointer(p) => Some(*p),
            Value::Repr(_, machine) => machine.to_pointer(),
            _ => None,
        }
    }
}
