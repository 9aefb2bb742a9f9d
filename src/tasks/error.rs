//! Errors raised by installation tasks.

use crate::bus::{BusError, MappedError, MethodError};
use crate::modules::ModuleError;
use thiserror::Error;

/// A kickstart script failed. The installation cannot go on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl MappedError for ScriptError {
    fn from_message(message: String) -> Self {
        Self { message }
    }
}

/// A failure the user may choose to ignore.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct InstallationError {
    pub message: String,
}

impl InstallationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl MappedError for InstallationError {
    fn from_message(message: String) -> Self {
        Self { message }
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    #[error("installation error: {0}")]
    Installation(#[from] InstallationError),

    #[error("task {task} failed: {message}")]
    Failed { task: String, message: String },

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Bus(BusError),
}

impl TaskError {
    pub fn failed(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            task: task.into(),
            message: message.into(),
        }
    }

    /// Script and installation errors of remote tasks become local ones
    /// again; anything else stays a bus error.
    pub fn from_bus(error: BusError) -> Self {
        if let Some(remote) = error.as_remote() {
            if let Some(script) = remote.downcast_ref::<ScriptError>() {
                return Self::Script(script.clone());
            }
            if let Some(installation) = remote.downcast_ref::<InstallationError>() {
                return Self::Installation(installation.clone());
            }
        }
        Self::Bus(error)
    }

    /// The error to answer a remote `Run` with.
    pub fn into_method_error(self) -> MethodError {
        match self {
            Self::Script(e) => MethodError::new(e),
            Self::Installation(e) => MethodError::new(e),
            Self::Bus(e) => MethodError::new(e),
            other => MethodError::new(other),
        }
    }

    pub fn is_script_error(&self) -> bool {
        matches!(self, Self::Script(_))
    }
}

impl From<BusError> for TaskError {
    fn from(error: BusError) -> Self {
        Self::from_bus(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ErrorMapper;

    fn mapper() -> ErrorMapper {
        let mut mapper = ErrorMapper::new("org.test.Error");
        mapper
            .register_in_namespace::<ScriptError>("ScriptError")
            .register_in_namespace::<InstallationError>("InstallationError");
        mapper
    }

    #[test]
    fn test_remote_script_error_is_restored() {
        let remote = mapper().remote_error("org.test.Error.ScriptError", "%post failed");
        let error = TaskError::from(BusError::Remote(remote));
        match error {
            TaskError::Script(e) => assert_eq!(e.message, "%post failed"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_other_remote_errors_stay_bus_errors() {
        let remote = mapper().remote_error("org.test.Error.Whatever", "nope");
        assert!(matches!(
            TaskError::from(BusError::Remote(remote)),
            TaskError::Bus(_)
        ));
    }

    #[test]
    fn test_method_error_names() {
        let mapper = mapper();
        let script = TaskError::from(ScriptError::new("x")).into_method_error();
        assert_eq!(mapper.error_name(&script), "org.test.Error.ScriptError");
        let failed = TaskError::failed("t", "y").into_method_error();
        assert_eq!(mapper.error_name(&failed), "org.test.Error.TaskError");
    }
}
