//! The presentation layer as the installer core sees it.
//!
//! A user interface shows the screens of indirect installation steps, asks
//! the user questions when a task fails, and is shut down when the last step
//! is done. [`ConsolePresentation`] is the plain terminal implementation used
//! by `quarry-boss run`.

use crate::dispatch::Direction;
use log::{info, warn};
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};

pub trait Presentation: Send + Sync {
    /// Show the screen of an indirect step and return where the user went.
    fn display_step(&self, step: &str) -> Direction;

    /// Ask a yes/no question.
    fn question(&self, message: &str) -> bool;

    fn show_error(&self, message: &str);

    /// Called once after the last step.
    fn shutdown(&self);
}

/// Terminal presentation. Screens are announced and immediately left
/// forward; questions read `yes`/`no` from stdin when interactive.
#[derive(Debug, Default)]
pub struct ConsolePresentation {
    interactive: bool,
    shut_down: AtomicBool,
}

impl ConsolePresentation {
    pub fn new(interactive: bool) -> Self {
        Self {
            interactive,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Presentation for ConsolePresentation {
    fn display_step(&self, step: &str) -> Direction {
        println!(":: {}", step);
        Direction::Forward
    }

    fn question(&self, message: &str) -> bool {
        if !self.interactive {
            warn!("Answering no in non-interactive mode: {}", message);
            return false;
        }

        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "{} [yes/no] ", message);
        let _ = stdout.flush();

        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }

    fn show_error(&self, message: &str) {
        eprintln!("ERROR: {}", message);
    }

    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            info!("Presentation shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_interactive_answers_no() {
        let presentation = ConsolePresentation::new(false);
        assert!(!presentation.question("Continue?"));
    }

    #[test]
    fn test_shutdown_is_recorded() {
        let presentation = ConsolePresentation::new(false);
        assert!(!presentation.is_shut_down());
        presentation.shutdown();
        presentation.shutdown();
        assert!(presentation.is_shut_down());
        assert_eq!(presentation.display_step("language"), Direction::Forward);
    }
}
