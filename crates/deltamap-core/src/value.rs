//! Module: value
//! Responsibility: scalar wire values exchanged with the store and the
//! coercion rules applied when store-generated values are read back.
//! Does not own: row shapes, flags, or identifier linkage (see `result`).
//!
//! Invariants:
//! - `Value` equality and hashing are total; floats compare by bit pattern.
//! - Coercion never widens lossily without a range check.

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
};
use thiserror::Error as ThisError;

///
/// CoercionError
///
/// Raised while aligning a store-returned value with the declared type of
/// the member it back-propagates into.
///

#[derive(Debug, ThisError)]
pub enum CoercionError {
    #[error("returned value {value} cannot be converted to {target}")]
    UnexpectedType { value: Value, target: ValueType },

    #[error("returned value {value} is out of range for {target}")]
    OutOfRange { value: Value, target: ValueType },
}

///
/// ValueType
///
/// Declared type of a field in the conceptual or storage model.
///

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ValueType {
    Bool,
    Int,
    Uint,
    Float,
    Text,
    Bytes,
}

impl ValueType {
    /// Default (placeholder) value for this type.
    #[must_use]
    pub const fn default_value(self) -> Value {
        match self {
            Self::Bool => Value::Bool(false),
            Self::Int => Value::Int(0),
            Self::Uint => Value::Uint(0),
            Self::Float => Value::Float(0.0),
            Self::Text => Value::Text(String::new()),
            Self::Bytes => Value::Bytes(Vec::new()),
        }
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Float => "float",
            Self::Text => "text",
            Self::Bytes => "bytes",
        };
        write!(f, "{label}")
    }
}

///
/// Value
///
/// One scalar cell. `Null` stands for the absence of a value; structural
/// rows are built from these in the `result` module.
///

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Align this value with the declared type of the member receiving it.
    ///
    /// Numeric families convert with range checks; everything else must
    /// already match. `Null` is passed through unchanged (nullability is
    /// checked by the caller, which knows the member).
    pub fn coerce_to(&self, target: ValueType) -> Result<Self, CoercionError> {
        let out = match (self, target) {
            (Self::Null, _) => Self::Null,
            (Self::Bool(b), ValueType::Bool) => Self::Bool(*b),
            (Self::Text(s), ValueType::Text) => Self::Text(s.clone()),
            (Self::Bytes(b), ValueType::Bytes) => Self::Bytes(b.clone()),

            (Self::Int(i), ValueType::Int) => Self::Int(*i),
            (Self::Int(i), ValueType::Uint) => Self::Uint(Self::range_checked(
                i.to_u64(),
                self,
                target,
            )?),
            (Self::Int(i), ValueType::Float) => Self::Float(Self::range_checked(
                i.to_f64(),
                self,
                target,
            )?),

            (Self::Uint(u), ValueType::Uint) => Self::Uint(*u),
            (Self::Uint(u), ValueType::Int) => Self::Int(Self::range_checked(
                u.to_i64(),
                self,
                target,
            )?),
            (Self::Uint(u), ValueType::Float) => Self::Float(Self::range_checked(
                u.to_f64(),
                self,
                target,
            )?),

            (Self::Float(f), ValueType::Float) => Self::Float(*f),

            _ => {
                return Err(CoercionError::UnexpectedType {
                    value: self.clone(),
                    target,
                });
            }
        };

        Ok(out)
    }

    fn range_checked<T>(
        converted: Option<T>,
        value: &Self,
        target: ValueType,
    ) -> Result<T, CoercionError> {
        converted.ok_or_else(|| CoercionError::OutOfRange {
            value: value.clone(),
            target,
        })
    }

    // Stable discriminant used by ordering and hashing.
    const fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Uint(_) => 3,
            Self::Float(_) => 4,
            Self::Text(_) => 5,
            Self::Bytes(_) => 6,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Uint(a), Self::Uint(b)) => a == b,
            // Bit equality keeps Eq/Hash lawful; NaN equals itself here.
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Uint(u) => u.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::Text(s) => s.hash(state),
            Self::Bytes(b) => b.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;

        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Uint(a), Self::Uint(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => {
                a.partial_cmp(b).unwrap_or_else(|| a.to_bits().cmp(&b.to_bits()))
            }
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()).then(Ordering::Equal),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Uint(u) => write!(f, "{u}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Bytes(b) => write!(f, "0x{}", b.iter().fold(String::new(), |mut acc, byte| {
                use fmt::Write;
                let _ = write!(acc, "{byte:02x}");
                acc
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_coercion_round_trips_within_range() {
        let v = Value::Uint(42).coerce_to(ValueType::Int).unwrap();
        assert_eq!(v, Value::Int(42));

        let v = Value::Int(7).coerce_to(ValueType::Uint).unwrap();
        assert_eq!(v, Value::Uint(7));
    }

    #[test]
    fn negative_to_uint_is_out_of_range() {
        let err = Value::Int(-1).coerce_to(ValueType::Uint).unwrap_err();
        assert!(matches!(err, CoercionError::OutOfRange { .. }));
    }

    #[test]
    fn text_to_int_is_unexpected_type() {
        let err = Value::Text("abc".into())
            .coerce_to(ValueType::Int)
            .unwrap_err();
        assert!(matches!(err, CoercionError::UnexpectedType { .. }));
    }

    #[test]
    fn null_passes_through_any_target() {
        for target in [
            ValueType::Bool,
            ValueType::Int,
            ValueType::Uint,
            ValueType::Float,
            ValueType::Text,
            ValueType::Bytes,
        ] {
            assert_eq!(Value::Null.coerce_to(target).unwrap(), Value::Null);
        }
    }

    #[test]
    fn float_equality_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }
}
