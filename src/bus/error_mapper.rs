//! Error register
//!
//! Maps local error types to bus error names and back. Unregistered local
//! errors get the name `<namespace>.<TypeName>`; unrecognized bus error names
//! become [`UnknownRemoteError`] on the client.

use super::error::{BoxError, BusError, MethodError, RemoteError};
use super::names::errors;
use super::value::ValueError;
use std::any::TypeId;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// An error type that can be reconstructed from a bus error message.
pub trait MappedError: StdError + Send + Sync + 'static {
    fn from_message(message: String) -> Self
    where
        Self: Sized;
}

/// The error produced for bus error names nobody registered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct UnknownRemoteError(pub String);

impl MappedError for UnknownRemoteError {
    fn from_message(message: String) -> Self {
        Self(message)
    }
}

type Factory = Arc<dyn Fn(String) -> BoxError + Send + Sync>;

#[derive(Clone)]
struct Rule {
    name: String,
    code: u32,
    factory: Factory,
}

/// Two maps and two defaults: type to name, name to type, the namespace for
/// unregistered types, and the type for unregistered names.
#[derive(Clone)]
pub struct ErrorMapper {
    namespace: String,
    by_type: HashMap<TypeId, Rule>,
    by_name: HashMap<String, Rule>,
    default_factory: Factory,
    next_code: u32,
}

impl std::fmt::Debug for ErrorMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("ErrorMapper")
            .field("namespace", &self.namespace)
            .field("names", &names)
            .finish()
    }
}

/// Prefix some bus libraries put in front of remote error messages.
const GDBUS_ERROR_PREFIX: &str = "GDBus.Error:";

impl ErrorMapper {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            by_type: HashMap::new(),
            by_name: HashMap::new(),
            default_factory: Arc::new(|message| Box::new(UnknownRemoteError(message))),
            next_code: 1,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Map the error type `E` to `dbus_name` in both directions.
    pub fn register<E: MappedError>(&mut self, dbus_name: &str) -> &mut Self {
        let rule = Rule {
            name: dbus_name.to_string(),
            code: self.next_code,
            factory: Arc::new(|message| Box::new(E::from_message(message))),
        };
        self.next_code += 1;
        self.by_type.insert(TypeId::of::<E>(), rule.clone());
        self.by_name.insert(dbus_name.to_string(), rule);
        self
    }

    /// Map the error type `E` to `<namespace>.<name>`.
    pub fn register_in_namespace<E: MappedError>(&mut self, name: &str) -> &mut Self {
        let full = format!("{}.{}", self.namespace, name);
        self.register::<E>(&full)
    }

    /// Use `E` for every bus error name that is not registered.
    pub fn set_default<E: MappedError>(&mut self) -> &mut Self {
        self.default_factory = Arc::new(|message| Box::new(E::from_message(message)));
        self
    }

    /// The bus error name for an error raised by a method implementation.
    pub fn error_name(&self, error: &MethodError) -> String {
        if let Some(name) = error.explicit_name() {
            return name.to_string();
        }
        if let Some(rule) = self.by_type.get(&error.type_id()) {
            return rule.name.clone();
        }

        // Errors relayed from another service keep their original name.
        let inner = error.error();
        if let Some(remote) = inner.downcast_ref::<RemoteError>() {
            return remote.dbus_name.clone();
        }
        if let Some(BusError::Remote(remote)) = inner.downcast_ref::<BusError>() {
            return remote.dbus_name.clone();
        }
        if inner.is::<ValueError>() || matches!(inner.downcast_ref::<BusError>(), Some(BusError::Value(_))) {
            return errors::INVALID_ARGS.to_string();
        }

        format!("{}.{}", self.namespace, error.short_type_name())
    }

    /// Translate an error reply into a local error.
    pub fn remote_error(&self, dbus_name: &str, message: &str) -> RemoteError {
        let message = strip_remote_prefix(dbus_name, message);
        let (code, error) = match self.by_name.get(dbus_name) {
            Some(rule) => (rule.code, (rule.factory)(message)),
            None => (0, (self.default_factory)(message)),
        };
        let domain = dbus_name
            .rsplit_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or(dbus_name)
            .to_string();
        RemoteError::new(dbus_name.to_string(), domain, code, error)
    }
}

fn strip_remote_prefix(dbus_name: &str, message: &str) -> String {
    let prefix = format!("{}{}: ", GDBUS_ERROR_PREFIX, dbus_name);
    message
        .strip_prefix(prefix.as_str())
        .unwrap_or(message)
        .to_string()
}
