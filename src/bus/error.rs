//! Error types of the bus runtime.

use super::value::ValueError;
use std::any::TypeId;
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced by the bus runtime.
#[derive(Error, Debug)]
pub enum BusError {
    /// No bus address could be resolved or connected to.
    #[error("message bus is unavailable: {0}")]
    ConnectionUnavailable(String),

    /// `RequestName` did not make us the primary owner.
    #[error("the name {name} is already taken (RequestName replied {reply})")]
    NameTaken { name: String, reply: u32 },

    /// No such method, property or signal on the remote object.
    #[error("{object} has no member {member:?}")]
    MemberLookup { object: String, member: String },

    /// A synchronous call to one of our own names from the loop thread.
    #[error("cannot access {0} from the thread that serves it")]
    SelfAccessOnMainThread(String),

    /// A watched service is not available at the moment.
    #[error("service {0} is not available")]
    ServiceUnavailable(String),

    /// A readable-only property was written, or a writable-only one read.
    #[error("property {name} is not {access}")]
    PropertyAccess { name: String, access: &'static str },

    /// The remote side replied with an error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("invalid bus address {0:?}")]
    InvalidAddress(String),

    #[error("invalid object specification: {0}")]
    InvalidSpecification(String),

    #[error("an object is already published at {0}")]
    PathInUse(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no reply to {0} within the timeout")]
    Timeout(String),

    #[error("the connection is closed")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    /// The remote error, if this is one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            BusError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

/// An error reply translated back into a local error.
///
/// The translated error is reachable through [`RemoteError::downcast_ref`];
/// its display form is the original message.
#[derive(Debug)]
pub struct RemoteError {
    pub dbus_name: String,
    pub dbus_domain: String,
    pub dbus_code: u32,
    error: BoxError,
}

impl RemoteError {
    pub fn new(dbus_name: String, dbus_domain: String, dbus_code: u32, error: BoxError) -> Self {
        Self {
            dbus_name,
            dbus_domain,
            dbus_code,
            error,
        }
    }

    /// Access the translated error as a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.error.downcast_ref::<E>()
    }

    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.error.is::<E>()
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }

    /// Take the translated error.
    pub fn into_inner(self) -> BoxError {
        self.error
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl StdError for RemoteError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.error.as_ref())
    }
}

/// An error raised by a server-side method implementation.
///
/// Any error type converts into it with `?`; the concrete type is kept so
/// the error mapper can choose the bus error name.
pub struct MethodError {
    type_id: TypeId,
    type_name: &'static str,
    explicit_name: Option<String>,
    error: BoxError,
}

impl MethodError {
    pub fn new<E: StdError + Send + Sync + 'static>(error: E) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            explicit_name: None,
            error: Box::new(error),
        }
    }

    /// An error with an explicit bus error name, e.g. `InvalidArgs`.
    pub fn named(dbus_name: &str, message: impl Into<String>) -> Self {
        let mut error = Self::new(PlainError(message.into()));
        error.explicit_name = Some(dbus_name.to_string());
        error
    }

    /// A failure without a more specific type.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(PlainError(message.into()))
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Last path segment of the concrete type name.
    pub(crate) fn short_type_name(&self) -> &'static str {
        let without_generics = self.type_name.split('<').next().unwrap_or(self.type_name);
        without_generics.rsplit("::").next().unwrap_or(without_generics)
    }

    pub(crate) fn explicit_name(&self) -> Option<&str> {
        self.explicit_name.as_deref()
    }

    pub fn error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.error.as_ref()
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

impl fmt::Debug for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodError")
            .field("type", &self.type_name)
            .field("name", &self.explicit_name)
            .field("message", &self.message())
            .finish()
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<E: StdError + Send + Sync + 'static> From<E> for MethodError {
    fn from(error: E) -> Self {
        MethodError::new(error)
    }
}

/// An error that is nothing but its message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PlainError(pub String);
