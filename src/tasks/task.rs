//! Installation tasks
//!
//! A task is a named unit of work with `started` and `completed` signals.
//! [`Task::start`] emits `started`, runs the task, records the elapsed time
//! and emits `completed`. A failing task emits nothing after `started`.

use super::error::TaskError;
use super::queue::TaskQueue;
use crate::bus::Signal;
use log::{debug, info};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// State every task carries.
#[derive(Debug)]
pub struct TaskBase {
    name: String,
    steps: u32,
    progress: Mutex<(u32, String)>,
    elapsed: OnceLock<Duration>,
    /// Emitted with the task name before the task runs.
    pub started: Signal<String>,
    /// Emitted with the task name after the task succeeded.
    pub completed: Signal<String>,
    /// Emitted with `(step, message)` whenever the task reports progress.
    pub progress_changed: Signal<(u32, String)>,
}

impl TaskBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_steps(name, 1)
    }

    pub fn with_steps(name: impl Into<String>, steps: u32) -> Self {
        Self {
            name: name.into(),
            steps,
            progress: Mutex::new((0, String::new())),
            elapsed: OnceLock::new(),
            started: Signal::new(),
            completed: Signal::new(),
            progress_changed: Signal::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// The last reported `(step, message)`.
    pub fn progress(&self) -> (u32, String) {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn report_progress(&self, step: u32, message: impl Into<String>) {
        let progress = (step, message.into());
        debug!("{}: step {} {}", self.name, progress.0, progress.1);
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = progress.clone();
        self.progress_changed.emit(&progress);
    }

    /// How long the first successful run took.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed.get().copied()
    }

    fn set_elapsed(&self, elapsed: Duration) {
        if self.elapsed.set(elapsed).is_err() {
            debug!("{} already has an elapsed time", self.name);
        }
    }
}

pub trait Task: Send + Sync {
    fn base(&self) -> &TaskBase;

    /// The work of the task.
    fn run(&self) -> Result<(), TaskError>;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn as_queue(&self) -> Option<&TaskQueue> {
        None
    }

    /// Run the task between its `started` and `completed` signals.
    fn start(&self) -> Result<(), TaskError> {
        start_task(self.base(), || self.run())
    }
}

/// The run sequence shared by tasks and queues.
pub(crate) fn start_task(
    base: &TaskBase,
    run: impl FnOnce() -> Result<(), TaskError>,
) -> Result<(), TaskError> {
    let name = base.name().to_string();
    info!("Running task {}", name);
    base.started.emit(&name);

    let begin = Instant::now();
    run()?;
    let elapsed = begin.elapsed();
    base.set_elapsed(elapsed);

    info!("Task {} finished in {:.3}s", name, elapsed.as_secs_f64());
    base.completed.emit(&name);
    Ok(())
}

type TaskFn = Box<dyn Fn(&TaskBase) -> Result<(), TaskError> + Send + Sync>;

/// A task running a closure. The closure gets the task state to report
/// progress through.
pub struct FnTask {
    base: TaskBase,
    f: TaskFn,
}

impl std::fmt::Debug for FnTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTask").field("name", &self.base.name).finish()
    }
}

impl FnTask {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(&TaskBase) -> Result<(), TaskError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            base: TaskBase::new(name),
            f: Box::new(f),
        }
    }

    pub fn with_steps(
        name: impl Into<String>,
        steps: u32,
        f: impl Fn(&TaskBase) -> Result<(), TaskError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            base: TaskBase::with_steps(name, steps),
            f: Box::new(f),
        }
    }
}

impl Task for FnTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn run(&self) -> Result<(), TaskError> {
        (self.f)(&self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_signals_surround_the_run() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&events);
        let task = FnTask::new("Write config", move |_| {
            log.lock().unwrap().push("run".to_string());
            Ok(())
        });

        let log = Arc::clone(&events);
        task.base()
            .started
            .connect(move |name| log.lock().unwrap().push(format!("started {}", name)));
        let log = Arc::clone(&events);
        task.base()
            .completed
            .connect(move |name| log.lock().unwrap().push(format!("completed {}", name)));

        assert!(task.base().elapsed().is_none());
        task.start().unwrap();
        assert!(task.base().elapsed().is_some());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["started Write config", "run", "completed Write config"]
        );
    }

    #[test]
    fn test_failed_task_does_not_complete() {
        let task = FnTask::new("Broken", |_| Err(TaskError::failed("Broken", "no disk")));
        let completed = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&completed);
        task.base().completed.connect(move |_| *flag.lock().unwrap() = true);

        assert!(task.start().is_err());
        assert!(!*completed.lock().unwrap());
        assert!(task.base().elapsed().is_none());
    }

    #[test]
    fn test_elapsed_is_set_once() {
        let task = FnTask::new("Twice", |_| Ok(()));
        task.start().unwrap();
        let first = task.base().elapsed();
        task.start().unwrap();
        assert_eq!(task.base().elapsed(), first);
    }

    #[test]
    fn test_progress_reports() {
        let task = FnTask::with_steps("Copy", 3, |base| {
            base.report_progress(1, "copying");
            base.report_progress(3, "done");
            Ok(())
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        task.base()
            .progress_changed
            .connect(move |progress| sink.lock().unwrap().push(progress.clone()));

        task.start().unwrap();
        assert_eq!(task.base().steps(), 3);
        assert_eq!(task.base().progress(), (3, "done".to_string()));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
