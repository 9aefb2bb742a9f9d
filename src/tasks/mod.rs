//! Installation tasks and task queues.

pub mod error;
pub mod error_handler;
pub mod queue;
pub mod remote;
pub mod task;

pub use error::{InstallationError, ScriptError, TaskError};
pub use error_handler::{ErrorAction, ErrorHandler, InstallErrorHandler, SCRIPT_ERROR_EXIT_CODE};
pub use queue::{QueueSignals, TaskQueue};
pub use remote::{publish_task, DBusTask};
pub use task::{FnTask, Task, TaskBase};
