//! Value bridge between guest JavaScript values and host Rust values.
//!
//! Guest values cross the isolate boundary as JSON: the bootstrap serializes
//! arguments with `JSON.stringify` and the host sees a [`serde_json::Value`].
//! [`FromGuest`] narrows such a value to a declared host shape, following
//! JavaScript coercion rules where the guest would expect them (string
//! conversion, truthiness) and rejecting values that have no sensible
//! mapping. `null` and `undefined` always map to the shape's zero value.
//!
//! The reverse direction is [`to_guest`], which accepts anything
//! `Serialize`.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A guest value could not be converted to the requested host shape.
///
/// Surfaced to the guest as a catchable `TypeError`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    /// The guest value has the wrong type for the host shape.
    #[error("expected {expected}, got {found}")]
    TypeMismatch {
        /// Host shape that was requested.
        expected: &'static str,
        /// JavaScript type of the supplied value.
        found: &'static str,
    },

    /// An array element is not a byte (integer in 0..=255).
    #[error("byte value out of range: {0}")]
    ByteOutOfRange(String),

    /// The call site supplied the wrong number of arguments.
    #[error("expected {expected} argument(s), got {actual}")]
    Arity {
        /// Declared parameter count.
        expected: usize,
        /// Supplied argument count.
        actual: usize,
    },

    /// A positional argument failed to convert.
    #[error("argument {index}: {source}")]
    Argument {
        /// Zero-based argument position.
        index: usize,
        /// Underlying conversion failure.
        #[source]
        source: Box<ConversionError>,
    },

    /// The argument payload was not a JSON array.
    #[error("malformed argument list: {0}")]
    MalformedArguments(String),

    /// A host value has no JSON representation.
    #[error("host value cannot be represented in the guest: {0}")]
    Unrepresentable(String),
}

/// Host types that can be produced from a guest value.
pub trait FromGuest: Sized {
    /// Name of the host shape, used in error messages.
    const SHAPE: &'static str;

    /// Convert a guest value. `null` yields the zero value.
    fn from_guest(value: &Value) -> Result<Self, ConversionError>;
}

/// JavaScript `typeof`-style name of a JSON value (arrays reported separately).
pub fn guest_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `String(value)` as the guest would compute it.
pub fn guest_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => number_string(n),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => guest_string(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

/// JavaScript truthiness of a JSON value.
pub fn guest_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn number_string(n: &serde_json::Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e21 => format!("{f:.0}"),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

fn mismatch<T: FromGuest>(value: &Value) -> ConversionError {
    ConversionError::TypeMismatch {
        expected: T::SHAPE,
        found: guest_type_name(value),
    }
}

impl FromGuest for String {
    const SHAPE: &'static str = "string";

    fn from_guest(value: &Value) -> Result<Self, ConversionError> {
        if value.is_null() {
            return Ok(String::new());
        }
        Ok(guest_string(value))
    }
}

impl FromGuest for bool {
    const SHAPE: &'static str = "boolean";

    fn from_guest(value: &Value) -> Result<Self, ConversionError> {
        Ok(guest_truthy(value))
    }
}

impl FromGuest for f64 {
    const SHAPE: &'static str = "number";

    fn from_guest(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Null => Ok(0.0),
            Value::Number(n) => n.as_f64().ok_or_else(|| mismatch::<Self>(value)),
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

impl FromGuest for i64 {
    const SHAPE: &'static str = "integer";

    fn from_guest(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Null => Ok(0),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(i),
                // Truncates toward zero and saturates at the i64 bounds.
                None => n.as_f64().map(|f| f as i64).ok_or_else(|| mismatch::<Self>(value)),
            },
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

impl FromGuest for u64 {
    const SHAPE: &'static str = "unsigned integer";

    fn from_guest(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Null => Ok(0),
            Value::Number(n) => match n.as_u64() {
                Some(u) => Ok(u),
                None => n.as_f64().map(|f| f as u64).ok_or_else(|| mismatch::<Self>(value)),
            },
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

impl FromGuest for Value {
    const SHAPE: &'static str = "any";

    fn from_guest(value: &Value) -> Result<Self, ConversionError> {
        Ok(value.clone())
    }
}

impl<T: FromGuest> FromGuest for Option<T> {
    const SHAPE: &'static str = T::SHAPE;

    fn from_guest(value: &Value) -> Result<Self, ConversionError> {
        if value.is_null() {
            return Ok(None);
        }
        T::from_guest(value).map(Some)
    }
}

impl<T: FromGuest> FromGuest for Vec<T> {
    const SHAPE: &'static str = "array";

    fn from_guest(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => items.iter().map(T::from_guest).collect(),
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

impl<T: FromGuest> FromGuest for HashMap<String, T> {
    const SHAPE: &'static str = "object";

    fn from_guest(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Null => Ok(HashMap::new()),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), T::from_guest(v)?)))
                .collect(),
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

impl<T: FromGuest> FromGuest for BTreeMap<String, T> {
    const SHAPE: &'static str = "object";

    fn from_guest(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Null => Ok(BTreeMap::new()),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), T::from_guest(v)?)))
                .collect(),
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

/// Binary payload. Accepts a string (its UTF-8 bytes) or an array of byte values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bytes(pub Vec<u8>);

impl Bytes {
    /// Guest representation: a string when the bytes are valid UTF-8,
    /// otherwise an array of byte values.
    pub fn to_guest_value(&self) -> Value {
        match std::str::from_utf8(&self.0) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::Array(self.0.iter().map(|b| Value::from(*b)).collect()),
        }
    }
}

impl FromGuest for Bytes {
    const SHAPE: &'static str = "bytes";

    fn from_guest(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Null => Ok(Bytes::default()),
            Value::String(s) => Ok(Bytes(s.as_bytes().to_vec())),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| ConversionError::ByteOutOfRange(item.to_string()))
                })
                .collect::<Result<Vec<u8>, _>>()
                .map(Bytes),
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

/// Convert a host value into a guest value.
pub fn to_guest<T: Serialize + ?Sized>(value: &T) -> Result<Value, ConversionError> {
    serde_json::to_value(value).map_err(|e| ConversionError::Unrepresentable(e.to_string()))
}

/// Positional arguments of one host-method invocation.
///
/// The arity check runs before any element is converted, so a call with the
/// wrong number of arguments never reaches the host method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuestArgs(Vec<Value>);

impl GuestArgs {
    /// Parse a JSON array produced by `JSON.stringify(args)`.
    pub fn parse(json: &str) -> Result<Self, ConversionError> {
        match serde_json::from_str::<Value>(json) {
            Ok(Value::Array(items)) => Ok(Self(items)),
            Ok(other) => Err(ConversionError::MalformedArguments(format!(
                "expected array, got {}",
                guest_type_name(&other)
            ))),
            Err(e) => Err(ConversionError::MalformedArguments(e.to_string())),
        }
    }

    /// Wrap already-decoded values.
    pub fn from_values(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Number of supplied arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no arguments were supplied.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fail when fewer than `expected` arguments were supplied. Extra
    /// arguments are ignored, as JavaScript callers expect.
    pub fn require(&self, expected: usize) -> Result<(), ConversionError> {
        if self.0.len() < expected {
            return Err(ConversionError::Arity {
                expected,
                actual: self.0.len(),
            });
        }
        Ok(())
    }

    /// Convert argument `index` to `T`.
    pub fn get<T: FromGuest>(&self, index: usize) -> Result<T, ConversionError> {
        let value = self.0.get(index).unwrap_or(&Value::Null);
        T::from_guest(value).map_err(|e| ConversionError::Argument {
            index,
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_maps_to_zero_values() {
        assert_eq!(String::from_guest(&Value::Null).unwrap(), "");
        assert_eq!(i64::from_guest(&Value::Null).unwrap(), 0);
        assert_eq!(f64::from_guest(&Value::Null).unwrap(), 0.0);
        assert!(!bool::from_guest(&Value::Null).unwrap());
        assert!(Vec::<String>::from_guest(&Value::Null).unwrap().is_empty());
        assert!(HashMap::<String, i64>::from_guest(&Value::Null)
            .unwrap()
            .is_empty());
        assert_eq!(Bytes::from_guest(&Value::Null).unwrap(), Bytes::default());
        assert_eq!(Option::<String>::from_guest(&Value::Null).unwrap(), None);
    }

    #[test]
    fn strings_follow_js_coercion() {
        assert_eq!(String::from_guest(&json!(42)).unwrap(), "42");
        assert_eq!(String::from_guest(&json!(2.5)).unwrap(), "2.5");
        assert_eq!(String::from_guest(&json!(true)).unwrap(), "true");
        assert_eq!(String::from_guest(&json!([1, null, "a"])).unwrap(), "1,,a");
        assert_eq!(
            String::from_guest(&json!({"a": 1})).unwrap(),
            "[object Object]"
        );
    }

    #[test]
    fn integral_floats_print_without_fraction() {
        let v: Value = serde_json::from_str("3.0").unwrap();
        assert_eq!(guest_string(&v), "3");
    }

    #[test]
    fn truthiness_matches_js() {
        assert!(!guest_truthy(&json!(0)));
        assert!(!guest_truthy(&json!("")));
        assert!(guest_truthy(&json!("0")));
        assert!(guest_truthy(&json!([])));
        assert!(guest_truthy(&json!({})));
        assert!(guest_truthy(&json!(-1.5)));
    }

    #[test]
    fn numbers_reject_non_numeric() {
        let err = i64::from_guest(&json!("12")).unwrap_err();
        assert_eq!(
            err,
            ConversionError::TypeMismatch {
                expected: "integer",
                found: "string"
            }
        );
        assert!(f64::from_guest(&json!({})).is_err());
    }

    #[test]
    fn integers_truncate_toward_zero() {
        assert_eq!(i64::from_guest(&json!(7.9)).unwrap(), 7);
        assert_eq!(i64::from_guest(&json!(-7.9)).unwrap(), -7);
        assert_eq!(u64::from_guest(&json!(3.2)).unwrap(), 3);
    }

    #[test]
    fn nested_containers_convert_recursively() {
        let v = json!({"a": [1, 2], "b": [3]});
        let map = HashMap::<String, Vec<i64>>::from_guest(&v).unwrap();
        assert_eq!(map["a"], vec![1, 2]);
        assert_eq!(map["b"], vec![3]);

        let err = Vec::<i64>::from_guest(&json!([1, "x"])).unwrap_err();
        assert!(matches!(err, ConversionError::TypeMismatch { .. }));
    }

    #[test]
    fn bytes_from_string_or_array() {
        assert_eq!(Bytes::from_guest(&json!("hi")).unwrap().0, b"hi".to_vec());
        assert_eq!(Bytes::from_guest(&json!([0, 255])).unwrap().0, vec![0, 255]);
        assert!(matches!(
            Bytes::from_guest(&json!([256])),
            Err(ConversionError::ByteOutOfRange(_))
        ));
        assert!(Bytes::from_guest(&json!(5)).is_err());
    }

    #[test]
    fn bytes_to_guest_prefers_text() {
        assert_eq!(Bytes(b"abc".to_vec()).to_guest_value(), json!("abc"));
        assert_eq!(Bytes(vec![0xff, 0x00]).to_guest_value(), json!([255, 0]));
    }

    #[test]
    fn arity_checked_before_conversion() {
        let args = GuestArgs::parse(r#"["only-one"]"#).unwrap();
        assert_eq!(
            args.require(2),
            Err(ConversionError::Arity {
                expected: 2,
                actual: 1
            })
        );
        assert!(args.require(1).is_ok());
        assert!(args.require(0).is_ok());
        assert_eq!(args.get::<String>(0).unwrap(), "only-one");
    }

    #[test]
    fn argument_errors_carry_position() {
        let args = GuestArgs::from_values(vec![json!("a"), json!({})]);
        let err = args.get::<i64>(1).unwrap_err();
        assert_eq!(err.to_string(), "argument 1: expected integer, got object");
    }

    #[test]
    fn malformed_argument_payload() {
        assert!(matches!(
            GuestArgs::parse("{}"),
            Err(ConversionError::MalformedArguments(_))
        ));
        assert!(GuestArgs::parse("not json").is_err());
    }

    #[test]
    fn to_guest_serializes_host_values() {
        #[derive(Serialize)]
        struct Info {
            name: &'static str,
            accounts: u32,
        }
        let v = to_guest(&Info {
            name: "main",
            accounts: 2,
        })
        .unwrap();
        assert_eq!(v, json!({"name": "main", "accounts": 2}));
    }
}
