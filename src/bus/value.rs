//! Typed values carried in message bodies.
//!
//! `Value` mirrors the type grammar from [`super::signature`]. Outgoing
//! arguments are packed against a declared signature before they are sent,
//! incoming bodies are checked against the declared output signature and
//! unpacked into [`Unpacked`].

use super::signature::{parse_signature, render_signature, SignatureError, Type};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Variant(Box<Value>),
    Array {
        element: Type,
        items: Vec<Value>,
    },
    Struct(Vec<Value>),
    Dict {
        key: Type,
        value: Type,
        entries: Vec<(Value, Value)>,
    },
}

/// Marshalling errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("expected a value of type {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("expected {expected} argument(s) for signature {signature:?}, found {found}")]
    ArgumentCount {
        signature: String,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Signature(#[from] SignatureError),
}

impl ValueError {
    fn mismatch(expected: &Type, found: &Value) -> Self {
        ValueError::TypeMismatch {
            expected: expected.to_string(),
            found: found.signature(),
        }
    }
}

impl Value {
    /// Returns the type of this value.
    pub fn value_type(&self) -> Type {
        match self {
            Value::Bool(_) => Type::Bool,
            Value::Byte(_) => Type::Byte,
            Value::Int16(_) => Type::Int16,
            Value::UInt16(_) => Type::UInt16,
            Value::Int32(_) => Type::Int32,
            Value::UInt32(_) => Type::UInt32,
            Value::Int64(_) => Type::Int64,
            Value::UInt64(_) => Type::UInt64,
            Value::Double(_) => Type::Double,
            Value::Str(_) => Type::Str,
            Value::ObjectPath(_) => Type::ObjectPath,
            Value::Signature(_) => Type::Signature,
            Value::Variant(_) => Type::Variant,
            Value::Array { element, .. } => Type::Array(Box::new(element.clone())),
            Value::Struct(fields) => Type::Struct(fields.iter().map(Value::value_type).collect()),
            Value::Dict { key, value, .. } => {
                Type::Dict(Box::new(key.clone()), Box::new(value.clone()))
            }
        }
    }

    /// Returns the signature string of this value.
    pub fn signature(&self) -> String {
        self.value_type().to_string()
    }

    /// Wrap this value into a variant.
    pub fn variant(self) -> Value {
        Value::Variant(Box::new(self))
    }

    /// Strip any number of variant wrappers.
    pub fn unwrap_variant(self) -> Value {
        match self {
            Value::Variant(inner) => inner.unwrap_variant(),
            other => other,
        }
    }

    /// Returns true if the value is of the given type.
    pub fn conforms(&self, ty: &Type) -> bool {
        match (self, ty) {
            (Value::Array { element, items }, Type::Array(inner)) => {
                element == inner.as_ref() && items.iter().all(|item| item.conforms(inner))
            }
            (Value::Dict { key, value, entries }, Type::Dict(kt, vt)) => {
                key == kt.as_ref()
                    && value == vt.as_ref()
                    && entries.iter().all(|(k, v)| k.conforms(kt) && v.conforms(vt))
            }
            (Value::Struct(fields), Type::Struct(types)) => {
                fields.len() == types.len()
                    && fields.iter().zip(types).all(|(f, t)| f.conforms(t))
            }
            (value, ty) => &value.value_type() == ty,
        }
    }

    /// Coerce a value into the given type.
    ///
    /// Values destined for a `v` slot are wrapped; containers are coerced
    /// element by element. Anything else must already have the right type.
    pub fn pack(self, ty: &Type) -> Result<Value, ValueError> {
        match (self, ty) {
            (value @ Value::Variant(_), Type::Variant) => Ok(value),
            (value, Type::Variant) => Ok(value.variant()),
            (Value::Array { items, .. }, Type::Array(inner)) => {
                let items = items
                    .into_iter()
                    .map(|item| item.pack(inner))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array {
                    element: inner.as_ref().clone(),
                    items,
                })
            }
            (Value::Dict { entries, .. }, Type::Dict(kt, vt)) => {
                let entries = entries
                    .into_iter()
                    .map(|(k, v)| Ok((k.pack(kt)?, v.pack(vt)?)))
                    .collect::<Result<Vec<_>, ValueError>>()?;
                Ok(Value::Dict {
                    key: kt.as_ref().clone(),
                    value: vt.as_ref().clone(),
                    entries,
                })
            }
            (Value::Struct(fields), Type::Struct(types)) if fields.len() == types.len() => {
                let fields = fields
                    .into_iter()
                    .zip(types)
                    .map(|(f, t)| f.pack(t))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Struct(fields))
            }
            (value, ty) => {
                if value.conforms(ty) {
                    Ok(value)
                } else {
                    Err(ValueError::mismatch(ty, &value))
                }
            }
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Variant(inner) => inner.as_bool(),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            Value::Variant(inner) => inner.as_i32(),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) => Some(*v),
            Value::Variant(inner) => inner.as_u32(),
            _ => None,
        }
    }

    /// Borrow the string content of a string, object path or signature.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            Value::Variant(inner) => inner.as_str(),
            _ => None,
        }
    }
}

/// Pack positional arguments against an input signature.
pub fn pack_args(signature: &str, args: Vec<Value>) -> Result<Vec<Value>, ValueError> {
    let types = parse_signature(signature)?;
    if types.len() != args.len() {
        return Err(ValueError::ArgumentCount {
            signature: signature.to_string(),
            expected: types.len(),
            found: args.len(),
        });
    }
    args.into_iter()
        .zip(&types)
        .map(|(arg, ty)| arg.pack(ty))
        .collect()
}

/// The result of a method call after unpacking by its output signature.
#[derive(Debug, Clone, PartialEq)]
pub enum Unpacked {
    /// The method returned no values.
    Nothing,
    /// The method returned exactly one value.
    Single(Value),
    /// The method returned two or more values, in order.
    Group(Vec<Value>),
}

impl Unpacked {
    /// Build from a reply body checked against the output signature.
    pub fn from_body(signature: &str, body: Vec<Value>) -> Result<Unpacked, ValueError> {
        let types = parse_signature(signature)?;
        if types.len() != body.len() {
            return Err(ValueError::ArgumentCount {
                signature: signature.to_string(),
                expected: types.len(),
                found: body.len(),
            });
        }
        for (value, ty) in body.iter().zip(&types) {
            if !value.conforms(ty) {
                return Err(ValueError::mismatch(ty, value));
            }
        }
        Ok(Unpacked::from_values(body))
    }

    /// Build from an already checked list of values.
    pub fn from_values(mut values: Vec<Value>) -> Unpacked {
        match values.len() {
            0 => Unpacked::Nothing,
            1 => Unpacked::Single(values.remove(0)),
            _ => Unpacked::Group(values),
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Unpacked::Nothing)
    }

    /// Take the single returned value.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Unpacked::Single(value) => Some(value),
            _ => None,
        }
    }

    /// Take every returned value as a list (empty for `Nothing`).
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Unpacked::Nothing => Vec::new(),
            Unpacked::Single(value) => vec![value],
            Unpacked::Group(values) => values,
        }
    }

    /// Convert the single returned value into a Rust type.
    pub fn get<T: FromValue>(self) -> Result<T, ValueError> {
        match self {
            Unpacked::Single(value) => T::from_value(value),
            other => Err(ValueError::TypeMismatch {
                expected: "a single value".to_string(),
                found: format!("{} value(s)", other.into_values().len()),
            }),
        }
    }
}

/// Conversion from a Rust value into a bus value.
pub trait IntoValue {
    /// The bus type produced for this Rust type.
    fn value_type() -> Type;

    fn into_value(self) -> Value;
}

/// Conversion from a bus value into a Rust value.
///
/// Variant wrappers are stripped before conversion.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, ValueError>;
}

macro_rules! impl_basic_value {
    ($rust:ty, $variant:ident, $ty:ident) => {
        impl IntoValue for $rust {
            fn value_type() -> Type {
                Type::$ty
            }

            fn into_value(self) -> Value {
                Value::$variant(self)
            }
        }

        impl FromValue for $rust {
            fn from_value(value: Value) -> Result<Self, ValueError> {
                match value.unwrap_variant() {
                    Value::$variant(v) => Ok(v),
                    other => Err(ValueError::mismatch(&Type::$ty, &other)),
                }
            }
        }

        impl From<$rust> for Value {
            fn from(value: $rust) -> Self {
                Value::$variant(value)
            }
        }
    };
}

impl_basic_value!(bool, Bool, Bool);
impl_basic_value!(u8, Byte, Byte);
impl_basic_value!(i16, Int16, Int16);
impl_basic_value!(u16, UInt16, UInt16);
impl_basic_value!(i32, Int32, Int32);
impl_basic_value!(u32, UInt32, UInt32);
impl_basic_value!(i64, Int64, Int64);
impl_basic_value!(u64, UInt64, UInt64);
impl_basic_value!(f64, Double, Double);
impl_basic_value!(String, Str, Str);

impl IntoValue for &str {
    fn value_type() -> Type {
        Type::Str
    }

    fn into_value(self) -> Value {
        Value::Str(self.to_string())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

/// An object path, e.g. `/org/quarry/Installer/Boss`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(pub String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl IntoValue for ObjectPath {
    fn value_type() -> Type {
        Type::ObjectPath
    }

    fn into_value(self) -> Value {
        Value::ObjectPath(self.0)
    }
}

impl FromValue for ObjectPath {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value.unwrap_variant() {
            Value::ObjectPath(path) => Ok(ObjectPath(path)),
            other => Err(ValueError::mismatch(&Type::ObjectPath, &other)),
        }
    }
}

impl From<ObjectPath> for Value {
    fn from(value: ObjectPath) -> Self {
        Value::ObjectPath(value.0)
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        Ok(value)
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn value_type() -> Type {
        Type::Array(Box::new(T::value_type()))
    }

    fn into_value(self) -> Value {
        Value::Array {
            element: T::value_type(),
            items: self.into_iter().map(IntoValue::into_value).collect(),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value.unwrap_variant() {
            Value::Array { items, .. } => items.into_iter().map(T::from_value).collect(),
            other => Err(ValueError::TypeMismatch {
                expected: "an array".to_string(),
                found: other.signature(),
            }),
        }
    }
}

impl<T: IntoValue> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        value.into_value()
    }
}

impl<T: IntoValue> IntoValue for BTreeMap<String, T> {
    fn value_type() -> Type {
        Type::Dict(Box::new(Type::Str), Box::new(T::value_type()))
    }

    fn into_value(self) -> Value {
        Value::Dict {
            key: Type::Str,
            value: T::value_type(),
            entries: self
                .into_iter()
                .map(|(k, v)| (Value::Str(k), v.into_value()))
                .collect(),
        }
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value.unwrap_variant() {
            Value::Dict { entries, .. } => entries
                .into_iter()
                .map(|(k, v)| Ok((String::from_value(k)?, T::from_value(v)?)))
                .collect(),
            other => Err(ValueError::TypeMismatch {
                expected: "a dictionary".to_string(),
                found: other.signature(),
            }),
        }
    }
}

macro_rules! impl_tuple_value {
    ($len:expr; $($name:ident),+) => {
        impl<$($name: IntoValue),+> IntoValue for ($($name,)+) {
            fn value_type() -> Type {
                Type::Struct(vec![$($name::value_type()),+])
            }

            #[allow(non_snake_case)]
            fn into_value(self) -> Value {
                let ($($name,)+) = self;
                Value::Struct(vec![$($name.into_value()),+])
            }
        }

        impl<$($name: FromValue),+> FromValue for ($($name,)+) {
            #[allow(non_snake_case)]
            fn from_value(value: Value) -> Result<Self, ValueError> {
                match value.unwrap_variant() {
                    Value::Struct(fields) if fields.len() == $len => {
                        let mut fields = fields.into_iter();
                        $(
                            let $name = fields
                                .next()
                                .map($name::from_value)
                                .unwrap_or_else(|| Err(ValueError::TypeMismatch {
                                    expected: format!("a struct of {} fields", $len),
                                    found: "a shorter struct".to_string(),
                                }))?;
                        )+
                        Ok(($($name,)+))
                    }
                    other => Err(ValueError::TypeMismatch {
                        expected: format!("a struct of {} fields", $len),
                        found: other.signature(),
                    }),
                }
            }
        }
    };
}

impl_tuple_value!(2; A, B);
impl_tuple_value!(3; A, B, C);
impl_tuple_value!(4; A, B, C, D);

/// Signature of a list of values, used for signal and reply bodies.
pub fn body_signature(values: &[Value]) -> String {
    let types: Vec<Type> = values.iter().map(Value::value_type).collect();
    render_signature(&types)
}
