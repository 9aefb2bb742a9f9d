//! Error handling module for Quarry
//!
//! Every subsystem has its own error type; [`QuarryError`] gathers them for
//! callers that drive several subsystems at once. [`installer_error_mapper`]
//! builds the error register shared by the Boss and the modules.

use crate::bus::{BusError, ErrorMapper, ValueError};
use crate::constants::ERROR_NAMESPACE;
use crate::dispatch::DispatchError;
use crate::kickstart::KickstartError;
use crate::modules::ModuleError;
use crate::tasks::{InstallationError, ScriptError, TaskError};
use thiserror::Error;

/// Main error type for Quarry
#[derive(Error, Debug)]
pub enum QuarryError {
    /// Message bus errors (connection, names, remote calls)
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Values that do not fit their bus signature
    #[error(transparent)]
    Value(#[from] ValueError),

    /// Modules that did not start or vanished
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Kickstart files that cannot be split
    #[error(transparent)]
    Kickstart(#[from] KickstartError),

    /// Failed installation tasks
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Dispatcher movement and direct steps
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

// Convenient error constructors
impl QuarryError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }

    /// A required module did not come up.
    pub fn unavailable_module(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Module(ModuleError::UnavailableModule {
            name: name.into(),
            reason: reason.into(),
        })
    }
}

/// Result type alias for Quarry operations
pub type Result<T> = std::result::Result<T, QuarryError>;

/// The error register of the installer: task errors travel under
/// `org.quarry.Installer.Error.*`, unknown names become
/// [`crate::bus::UnknownRemoteError`].
pub fn installer_error_mapper() -> ErrorMapper {
    let mut mapper = ErrorMapper::new(ERROR_NAMESPACE);
    mapper
        .register_in_namespace::<ScriptError>("ScriptError")
        .register_in_namespace::<InstallationError>("InstallationError");
    mapper
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MethodError;

    #[test]
    fn test_error_display() {
        let err = QuarryError::config("timeout must be positive");
        assert_eq!(err.to_string(), "Configuration error: timeout must be positive");

        let err = QuarryError::unavailable_module("org.quarry.Installer.Modules.Storage", "no reply");
        assert_eq!(
            err.to_string(),
            "module org.quarry.Installer.Modules.Storage is unavailable: no reply"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: QuarryError = io_err.into();
        assert!(matches!(err, QuarryError::Io(_)));
    }

    #[test]
    fn test_subsystem_conversions() {
        let err: QuarryError = BusError::Disconnected.into();
        assert!(matches!(err, QuarryError::Bus(_)));

        let err: QuarryError = DispatchError::UnknownStep("nowhere".into()).into();
        assert!(matches!(err, QuarryError::Dispatch(_)));

        let err: QuarryError = TaskError::failed("copy", "disk full").into();
        assert!(matches!(err, QuarryError::Task(_)));
    }

    #[test]
    fn test_mapper_names_task_errors() {
        let mapper = installer_error_mapper();
        assert_eq!(
            mapper.error_name(&MethodError::new(ScriptError::new("%post failed"))),
            "org.quarry.Installer.Error.ScriptError"
        );

        let remote = mapper.remote_error("org.quarry.Installer.Error.InstallationError", "no space");
        assert_eq!(remote.dbus_domain, "org.quarry.Installer.Error");
        assert_eq!(remote.dbus_code, 2);
        assert_eq!(
            remote.downcast_ref::<InstallationError>(),
            Some(&InstallationError::new("no space"))
        );
    }
}
