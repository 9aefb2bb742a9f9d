//! What to do when a task fails.

use super::error::TaskError;
use crate::presentation::Presentation;
use log::{error, info};
use std::sync::{Arc, Mutex, PoisonError};
use strum::{Display, EnumString};

/// Exit code used when a kickstart script fails.
pub const SCRIPT_ERROR_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorAction {
    /// Propagate the error and abort the queue.
    Raise,
    /// Forget the error and go on with the next task.
    Continue,
    /// Run the failed task again.
    Retry,
}

pub trait ErrorHandler: Send + Sync {
    fn handle(&self, task: &str, error: &TaskError) -> ErrorAction;
}

type ExitFn = Box<dyn Fn(i32) + Send + Sync>;

/// The installer's policy.
///
/// A script error is recorded and ends the process. Otherwise, without a
/// user to ask, the failure is printed and raised. With a user, an
/// installation error becomes a question whose answer decides between
/// continuing and raising; any other error is shown and raised.
pub struct InstallErrorHandler {
    presentation: Option<Arc<dyn Presentation>>,
    interactive: bool,
    exit: ExitFn,
    diagnostics: Mutex<Vec<String>>,
}

impl std::fmt::Debug for InstallErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallErrorHandler")
            .field("interactive", &self.interactive)
            .field("diagnostics", &self.diagnostics())
            .finish()
    }
}

impl InstallErrorHandler {
    pub fn new(presentation: Option<Arc<dyn Presentation>>, interactive: bool) -> Self {
        Self {
            presentation,
            interactive,
            exit: Box::new(|code| std::process::exit(code)),
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    /// Replace how the process ends after a script error.
    pub fn with_exit(mut self, exit: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.exit = Box::new(exit);
        self
    }

    /// Everything recorded so far.
    pub fn diagnostics(&self) -> Vec<String> {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, line: String) {
        error!("{}", line);
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }
}

impl ErrorHandler for InstallErrorHandler {
    fn handle(&self, task: &str, error: &TaskError) -> ErrorAction {
        if let TaskError::Script(script) = error {
            self.record(format!("{}: a kickstart script failed: {}", task, script));
            (self.exit)(SCRIPT_ERROR_EXIT_CODE);
            return ErrorAction::Raise;
        }

        let presentation = match &self.presentation {
            Some(presentation) if self.interactive => presentation,
            _ => {
                eprintln!("Installation failed: {}: {}", task, error);
                self.record(format!("{}: {}", task, error));
                return ErrorAction::Raise;
            }
        };

        match error {
            TaskError::Installation(e) => {
                let question = format!(
                    "The following error occurred during the installation:\n\n{}\n\n\
                     Would you like to ignore this and continue with the installation?",
                    e
                );
                if presentation.question(&question) {
                    info!("The user chose to ignore the failure of {}", task);
                    ErrorAction::Continue
                } else {
                    ErrorAction::Raise
                }
            }
            other => {
                presentation.show_error(&format!("{}: {}", task, other));
                self.record(format!("{}: {}", task, other));
                ErrorAction::Raise
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Direction;
    use crate::tasks::error::{InstallationError, ScriptError};
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    struct Answering {
        answer: bool,
        asked: AtomicBool,
        shown: AtomicBool,
    }

    impl Answering {
        fn new(answer: bool) -> Arc<Self> {
            Arc::new(Self {
                answer,
                asked: AtomicBool::new(false),
                shown: AtomicBool::new(false),
            })
        }
    }

    impl Presentation for Answering {
        fn display_step(&self, _step: &str) -> Direction {
            Direction::Forward
        }

        fn question(&self, _message: &str) -> bool {
            self.asked.store(true, Ordering::SeqCst);
            self.answer
        }

        fn show_error(&self, _message: &str) {
            self.shown.store(true, Ordering::SeqCst);
        }

        fn shutdown(&self) {}
    }

    fn installation_error() -> TaskError {
        TaskError::from(InstallationError::new("cannot mount /boot"))
    }

    #[test]
    fn test_interactive_yes_continues() {
        let ui = Answering::new(true);
        let handler = InstallErrorHandler::new(Some(ui.clone()), true);
        assert_eq!(handler.handle("Mount", &installation_error()), ErrorAction::Continue);
        assert!(ui.asked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_interactive_no_raises() {
        let ui = Answering::new(false);
        let handler = InstallErrorHandler::new(Some(ui.clone()), true);
        assert_eq!(handler.handle("Mount", &installation_error()), ErrorAction::Raise);
    }

    #[test]
    fn test_other_errors_are_shown_and_raised() {
        let ui = Answering::new(true);
        let handler = InstallErrorHandler::new(Some(ui.clone()), true);
        let error = TaskError::failed("Copy", "disk full");
        assert_eq!(handler.handle("Copy", &error), ErrorAction::Raise);
        assert!(ui.shown.load(Ordering::SeqCst));
        assert!(!ui.asked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_non_interactive_raises_without_asking() {
        let ui = Answering::new(true);
        let handler = InstallErrorHandler::new(Some(ui.clone()), false);
        assert_eq!(handler.handle("Mount", &installation_error()), ErrorAction::Raise);
        assert!(!ui.asked.load(Ordering::SeqCst));
        assert_eq!(handler.diagnostics().len(), 1);
    }

    #[test]
    fn test_script_error_records_and_exits() {
        let code = Arc::new(AtomicI32::new(-1));
        let seen = Arc::clone(&code);
        let handler = InstallErrorHandler::new(None, true)
            .with_exit(move |c| seen.store(c, Ordering::SeqCst));

        let error = TaskError::from(ScriptError::new("%post exited with 3"));
        assert_eq!(handler.handle("Run %post", &error), ErrorAction::Raise);
        assert_eq!(code.load(Ordering::SeqCst), SCRIPT_ERROR_EXIT_CODE);
        assert!(handler.diagnostics()[0].contains("%post exited with 3"));
    }

    #[test]
    fn test_action_names() {
        assert_eq!(ErrorAction::Retry.to_string(), "retry");
        assert_eq!("continue".parse::<ErrorAction>().unwrap(), ErrorAction::Continue);
    }
}
