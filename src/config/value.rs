//! Typed setting values and their bus-variant codec.

use anyhow::{bail, Result};
use zbus::zvariant::{OwnedValue, Value as Variant};

/// A setting value: one of four scalar types or a homogeneous list thereof.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Int(i32),
    Double(f64),
    Bool(bool),
    StringList(Vec<String>),
    IntList(Vec<i32>),
    DoubleList(Vec<f64>),
    BoolList(Vec<bool>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Int(_) => "int32",
            Self::Double(_) => "double",
            Self::Bool(_) => "bool",
            Self::StringList(_) => "string list",
            Self::IntList(_) => "int32 list",
            Self::DoubleList(_) => "double list",
            Self::BoolList(_) => "bool list",
        }
    }

    /// Two values are of the same kind when one may replace the other in the
    /// store.
    pub fn same_kind(&self, other: &Self) -> bool {
        self.type_name() == other.type_name()
    }

    /// Encode for the wire.
    pub fn to_variant(&self) -> Result<OwnedValue> {
        let variant = match self {
            Self::String(s) => Variant::from(s.as_str()),
            Self::Int(i) => Variant::from(*i),
            Self::Double(d) => Variant::from(*d),
            Self::Bool(b) => Variant::from(*b),
            Self::StringList(l) => Variant::from(l.clone()),
            Self::IntList(l) => Variant::from(l.clone()),
            Self::DoubleList(l) => Variant::from(l.clone()),
            Self::BoolList(l) => Variant::from(l.clone()),
        };
        variant.try_to_owned().map_err(Into::into)
    }

    /// Decode from the wire. Nested variants are unwrapped one level, which
    /// is how a `v`-typed method argument arrives.
    pub fn from_variant(variant: &Variant<'_>) -> Result<Self> {
        let variant = match variant {
            Variant::Value(inner) => inner.as_ref(),
            other => other,
        };
        match variant {
            Variant::Str(s) => Ok(Self::String(s.to_string())),
            Variant::I32(i) => Ok(Self::Int(*i)),
            Variant::F64(d) => Ok(Self::Double(*d)),
            Variant::Bool(b) => Ok(Self::Bool(*b)),
            Variant::Array(array) => {
                // An empty array still knows its element type.
                match array.element_signature().to_string().as_str() {
                    "s" => {
                        let mut list = Vec::with_capacity(array.len());
                        for item in array.iter() {
                            match item {
                                Variant::Str(s) => list.push(s.to_string()),
                                other => bail!("non-string element in string list: {other:?}"),
                            }
                        }
                        Ok(Self::StringList(list))
                    }
                    "i" => {
                        let mut list = Vec::with_capacity(array.len());
                        for item in array.iter() {
                            match item {
                                Variant::I32(i) => list.push(*i),
                                other => bail!("non-int32 element in int32 list: {other:?}"),
                            }
                        }
                        Ok(Self::IntList(list))
                    }
                    "d" => {
                        let mut list = Vec::with_capacity(array.len());
                        for item in array.iter() {
                            match item {
                                Variant::F64(d) => list.push(*d),
                                other => bail!("non-double element in double list: {other:?}"),
                            }
                        }
                        Ok(Self::DoubleList(list))
                    }
                    "b" => {
                        let mut list = Vec::with_capacity(array.len());
                        for item in array.iter() {
                            match item {
                                Variant::Bool(b) => list.push(*b),
                                other => bail!("non-bool element in bool list: {other:?}"),
                            }
                        }
                        Ok(Self::BoolList(list))
                    }
                    sig => bail!("unsupported list element type {sig:?}"),
                }
            }
            other => bail!("unsupported setting type {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let variant = value.to_variant().unwrap();
        let back = Value::from_variant(&variant).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(Value::String("devmode".into()));
        round_trip(Value::Int(-42));
        round_trip(Value::Double(2.5));
        round_trip(Value::Bool(true));
    }

    #[test]
    fn lists_round_trip() {
        round_trip(Value::StringList(vec!["a".into(), "b".into()]));
        round_trip(Value::IntList(vec![1, 2, 3]));
        round_trip(Value::DoubleList(vec![0.5, -1.0]));
        round_trip(Value::BoolList(vec![true, false]));
    }

    #[test]
    fn empty_lists_keep_their_type() {
        round_trip(Value::StringList(vec![]));
        round_trip(Value::IntList(vec![]));
        round_trip(Value::DoubleList(vec![]));
        round_trip(Value::BoolList(vec![]));
    }

    #[test]
    fn rejects_unsupported_types() {
        let variant = Variant::from(7u8);
        assert!(Value::from_variant(&variant).is_err());
    }

    #[test]
    fn kind_comparison() {
        assert!(Value::Int(1).same_kind(&Value::Int(2)));
        assert!(!Value::Int(1).same_kind(&Value::Double(1.0)));
        assert!(!Value::StringList(vec![]).same_kind(&Value::String(String::new())));
    }
}
