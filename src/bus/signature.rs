//! Type signatures
//!
//! Parses and renders the bus type grammar:
//!
//! ```text
//! basic    := b | y | n | q | i | u | x | t | d | s | o | g
//! variant  := v
//! array    := a <type>
//! struct   := ( <type>+ )
//! dict     := a{ <basic> <type> }
//! ```
//!
//! A signature string is a sequence of complete types, e.g. `"sa{sv}as"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A single complete type.
///
/// Serialized as its signature string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Type {
    Bool,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Str,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<Type>),
    Struct(Vec<Type>),
    Dict(Box<Type>, Box<Type>),
}

/// Errors produced while parsing a signature string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("unexpected end of signature {0:?}")]
    UnexpectedEnd(String),

    #[error("unknown type code {code:?} in signature {signature:?}")]
    UnknownCode { code: char, signature: String },

    #[error("empty struct in signature {0:?}")]
    EmptyStruct(String),

    #[error("dictionary key must be a basic type in signature {0:?}")]
    NonBasicKey(String),

    #[error("unbalanced brackets in signature {0:?}")]
    Unbalanced(String),

    #[error("expected a single complete type, got {0:?}")]
    NotSingle(String),
}

impl Type {
    /// Returns true for the fixed and string-like types allowed as dictionary keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Variant | Type::Array(_) | Type::Struct(_) | Type::Dict(_, _)
        )
    }

    /// Parse exactly one complete type.
    pub fn parse(signature: &str) -> Result<Type, SignatureError> {
        let mut types = parse_signature(signature)?;
        if types.len() != 1 {
            return Err(SignatureError::NotSingle(signature.to_string()));
        }
        Ok(types.remove(0))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => f.write_str("b"),
            Type::Byte => f.write_str("y"),
            Type::Int16 => f.write_str("n"),
            Type::UInt16 => f.write_str("q"),
            Type::Int32 => f.write_str("i"),
            Type::UInt32 => f.write_str("u"),
            Type::Int64 => f.write_str("x"),
            Type::UInt64 => f.write_str("t"),
            Type::Double => f.write_str("d"),
            Type::Str => f.write_str("s"),
            Type::ObjectPath => f.write_str("o"),
            Type::Signature => f.write_str("g"),
            Type::Variant => f.write_str("v"),
            Type::Array(inner) => write!(f, "a{}", inner),
            Type::Struct(fields) => {
                f.write_str("(")?;
                for field in fields {
                    write!(f, "{}", field)?;
                }
                f.write_str(")")
            }
            Type::Dict(key, value) => write!(f, "a{{{}{}}}", key, value),
        }
    }
}

impl From<Type> for String {
    fn from(value: Type) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Type {
    type Error = SignatureError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Type::parse(&value)
    }
}

/// Render a sequence of types back into a signature string.
pub fn render_signature(types: &[Type]) -> String {
    types.iter().map(|t| t.to_string()).collect()
}

/// Parse a signature string into its sequence of complete types.
///
/// The empty string is a valid signature with no types.
pub fn parse_signature(signature: &str) -> Result<Vec<Type>, SignatureError> {
    let chars: Vec<char> = signature.chars().collect();
    let mut pos = 0;
    let mut types = Vec::new();

    while pos < chars.len() {
        let (parsed, next) = parse_one(&chars, pos, signature)?;
        types.push(parsed);
        pos = next;
    }

    Ok(types)
}

fn parse_one(chars: &[char], pos: usize, sig: &str) -> Result<(Type, usize), SignatureError> {
    let Some(&code) = chars.get(pos) else {
        return Err(SignatureError::UnexpectedEnd(sig.to_string()));
    };

    let basic = match code {
        'b' => Some(Type::Bool),
        'y' => Some(Type::Byte),
        'n' => Some(Type::Int16),
        'q' => Some(Type::UInt16),
        'i' => Some(Type::Int32),
        'u' => Some(Type::UInt32),
        'x' => Some(Type::Int64),
        't' => Some(Type::UInt64),
        'd' => Some(Type::Double),
        's' => Some(Type::Str),
        'o' => Some(Type::ObjectPath),
        'g' => Some(Type::Signature),
        'v' => Some(Type::Variant),
        _ => None,
    };
    if let Some(t) = basic {
        return Ok((t, pos + 1));
    }

    match code {
        'a' => {
            if chars.get(pos + 1) == Some(&'{') {
                let (key, after_key) = parse_one(chars, pos + 2, sig)?;
                if !key.is_basic() {
                    return Err(SignatureError::NonBasicKey(sig.to_string()));
                }
                let (value, after_value) = parse_one(chars, after_key, sig)?;
                match chars.get(after_value) {
                    Some('}') => Ok((Type::Dict(Box::new(key), Box::new(value)), after_value + 1)),
                    Some(_) => Err(SignatureError::Unbalanced(sig.to_string())),
                    None => Err(SignatureError::UnexpectedEnd(sig.to_string())),
                }
            } else {
                let (inner, next) = parse_one(chars, pos + 1, sig)?;
                Ok((Type::Array(Box::new(inner)), next))
            }
        }
        '(' => {
            let mut fields = Vec::new();
            let mut cursor = pos + 1;
            loop {
                match chars.get(cursor) {
                    Some(')') => break,
                    Some(_) => {
                        let (field, next) = parse_one(chars, cursor, sig)?;
                        fields.push(field);
                        cursor = next;
                    }
                    None => return Err(SignatureError::UnexpectedEnd(sig.to_string())),
                }
            }
            if fields.is_empty() {
                return Err(SignatureError::EmptyStruct(sig.to_string()));
            }
            Ok((Type::Struct(fields), cursor + 1))
        }
        ')' | '}' | '{' => Err(SignatureError::Unbalanced(sig.to_string())),
        other => Err(SignatureError::UnknownCode {
            code: other,
            signature: sig.to_string(),
        }),
    }
}
